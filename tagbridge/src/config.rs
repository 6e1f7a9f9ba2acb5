//! Configuration for the bridge.
//!
//! Parses environment variables; everything has a default so the daemon
//! comes up on the stock carrier-board wiring with no configuration at all.

/// Bridge configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Serial port wired to the RFID reader.
    pub reader_port: String,

    /// Reader UART baud rate.
    pub reader_baud: u32,

    /// Serial port the Modbus master talks to.
    pub modbus_port: String,

    /// Modbus RTU baud rate.
    pub modbus_baud: u32,

    /// Our Modbus slave address (1-247).
    pub slave: u8,
}

impl BridgeConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TAGBRIDGE_READER_PORT`: reader UART (default: /dev/ttyS1)
    /// - `TAGBRIDGE_READER_BAUD`: reader baud rate (default: 115200)
    /// - `TAGBRIDGE_MODBUS_PORT`: Modbus UART (default: /dev/ttyS0)
    /// - `TAGBRIDGE_MODBUS_BAUD`: Modbus baud rate (default: 19200)
    /// - `TAGBRIDGE_SLAVE`: slave address (default: 1, clamped to 1-247)
    pub fn from_env() -> Self {
        let reader_port = std::env::var("TAGBRIDGE_READER_PORT")
            .unwrap_or_else(|_| "/dev/ttyS1".to_string());

        let reader_baud = std::env::var("TAGBRIDGE_READER_BAUD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(115_200);

        let modbus_port = std::env::var("TAGBRIDGE_MODBUS_PORT")
            .unwrap_or_else(|_| "/dev/ttyS0".to_string());

        let modbus_baud = std::env::var("TAGBRIDGE_MODBUS_BAUD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(19_200);

        let slave = std::env::var("TAGBRIDGE_SLAVE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1)
            .clamp(1, 247);

        Self {
            reader_port,
            reader_baud,
            modbus_port,
            modbus_baud,
            slave,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "TAGBRIDGE_READER_PORT",
            "TAGBRIDGE_READER_BAUD",
            "TAGBRIDGE_MODBUS_PORT",
            "TAGBRIDGE_MODBUS_BAUD",
            "TAGBRIDGE_SLAVE",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_nothing_set() {
        clear_env();

        let config = BridgeConfig::from_env();
        assert_eq!(config.reader_port, "/dev/ttyS1");
        assert_eq!(config.reader_baud, 115_200);
        assert_eq!(config.modbus_port, "/dev/ttyS0");
        assert_eq!(config.modbus_baud, 19_200);
        assert_eq!(config.slave, 1);
    }

    #[test]
    #[serial]
    fn test_slave_clamped_to_valid_range() {
        clear_env();

        std::env::set_var("TAGBRIDGE_SLAVE", "0");
        assert_eq!(BridgeConfig::from_env().slave, 1);

        std::env::set_var("TAGBRIDGE_SLAVE", "255");
        assert_eq!(BridgeConfig::from_env().slave, 247);

        std::env::remove_var("TAGBRIDGE_SLAVE");
    }

    #[test]
    #[serial]
    fn test_garbage_baud_falls_back_to_default() {
        clear_env();

        std::env::set_var("TAGBRIDGE_READER_BAUD", "fast");
        assert_eq!(BridgeConfig::from_env().reader_baud, 115_200);

        std::env::remove_var("TAGBRIDGE_READER_BAUD");
    }
}
