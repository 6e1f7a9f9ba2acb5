//! Modbus-facing surface.
//!
//! The outer RTU framing and CRC belong to `tokio-modbus`; this module only
//! decides which requests reach the controller and how controller faults
//! come back out as Modbus exceptions. Transaction detail never travels on
//! the exception channel, only through register 1026.

mod service;

pub use self::service::{serve, BridgeService};

use tokio_modbus::ExceptionCode;

use crate::fb::Fault;

/// Map a controller fault onto the Modbus exception the master sees.
/// Value faults read as IllegalDataValue, addressing and gating faults as
/// IllegalDataAddress, everything that died talking to the reader as
/// ServerDeviceFailure.
pub fn exception_for(fault: Fault) -> ExceptionCode {
    match fault {
        Fault::InvalidModeValue(_)
        | Fault::InvalidBlockSelect(_)
        | Fault::InvalidTunnelLength(_) => ExceptionCode::IllegalDataValue,

        Fault::IllegalRegion { .. } | Fault::ModeNotActive { .. } => {
            ExceptionCode::IllegalDataAddress
        }

        Fault::MalformedFrame
        | Fault::TransportTimeout
        | Fault::AuthenticationFailed
        | Fault::ReadFailed
        | Fault::WriteFailed
        | Fault::Internal => ExceptionCode::ServerDeviceFailure,
    }
}
