//! tagbridge: exposes a UART-attached MIFARE Classic RFID reader as a bank
//! of Modbus holding registers.

mod config;
mod daemon;
mod fb;
mod modbus;
mod reader;
mod registers;
mod tracing;
mod transport;

use crate::daemon::Daemon;
use crate::tracing::init_journald_or_stdout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_journald_or_stdout();
    Daemon::new().run().await
}
