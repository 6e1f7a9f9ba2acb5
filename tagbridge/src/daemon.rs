//! Daemon lifecycle management for tagbridge.
//!
//! Wires the serial ports to the controller and the Modbus server, installs
//! signal handlers, and tears everything down on SIGINT/SIGTERM.

use tokio::signal::unix::{self, SignalKind};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::BridgeConfig;
use crate::fb::Controller;
use crate::modbus::{self, BridgeService};
use crate::tracing::prelude::*;
use crate::transport::serial::SerialReaderTransport;

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = BridgeConfig::from_env();
        info!(
            "Bridging reader {} to Modbus {} (slave {})",
            config.reader_port, config.modbus_port, config.slave
        );

        let reader = SerialReaderTransport::open(&config.reader_port, config.reader_baud)?;
        let (mut controller, handle) = Controller::new(reader);

        // Best effort; the version region just stays zeroed if the reader
        // is not up yet.
        controller.cache_reader_version().await;

        self.tracker.spawn(controller.run(self.shutdown.clone()));

        let modbus_port =
            tokio_serial::new(&config.modbus_port, config.modbus_baud).open_native_async()?;
        let service = BridgeService::new(tokio_modbus::Slave(config.slave), handle);
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                if let Err(e) = modbus::serve(modbus_port, service, shutdown).await {
                    error!("Modbus server error: {}", e);
                }
            }
        });

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=tagbridge=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Initiate shutdown
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}
