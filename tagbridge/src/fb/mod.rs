//! Function block controller.
//!
//! The controller owns the register file and the reader link, and serializes
//! every Modbus-originated access through one task: a request runs to
//! completion (reader transaction included) before the next one is looked at.
//! Between requests the task drains unsolicited continuous-read frames into
//! the tag-info registers.

mod transaction;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::reader::{Command, CommandId};
use crate::registers::{
    outcome, BlockSelect, Mode, Region, RegisterFile, OUTCOME_INTERNAL, OUTCOME_OK,
};
use crate::tracing::prelude::*;
use crate::transport::{ReaderTransport, TransportError};

pub use self::transaction::TransferKind;

/// Why a register access was refused. Every variant maps onto a Modbus
/// exception in [`crate::modbus`]; transaction detail beyond that lives in
/// register 1026.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("register range {addr}+{count} is unmapped or access kind not allowed")]
    IllegalRegion { addr: u16, count: u16 },

    #[error("mode value {0} is not a function block")]
    InvalidModeValue(u16),

    #[error("{required:?} mode required, {active:?} active")]
    ModeNotActive { required: Mode, active: Mode },

    #[error("block selector 0x{0:04x} has reserved bits set")]
    InvalidBlockSelect(u16),

    #[error("tunnel length {0} exceeds the TX window")]
    InvalidTunnelLength(u16),

    #[error("reader produced a malformed frame")]
    MalformedFrame,

    #[error("reader did not answer in time")]
    TransportTimeout,

    #[error("authentication rejected by the reader")]
    AuthenticationFailed,

    #[error("block read rejected by the reader")]
    ReadFailed,

    #[error("block write rejected by the reader")]
    WriteFailed,

    #[error("bridge internal failure")]
    Internal,
}

enum RequestKind {
    Read { addr: u16, count: u16 },
    Write { addr: u16, values: Vec<u16> },
}

struct Request {
    kind: RequestKind,
    reply: oneshot::Sender<Result<Vec<u16>, Fault>>,
}

/// Clonable entry point for the Modbus service task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Request>,
}

impl ControllerHandle {
    pub async fn read(&self, addr: u16, count: u16) -> Result<Vec<u16>, Fault> {
        self.request(RequestKind::Read { addr, count }).await
    }

    pub async fn write(&self, addr: u16, values: Vec<u16>) -> Result<(), Fault> {
        self.request(RequestKind::Write { addr, values })
            .await
            .map(|_| ())
    }

    async fn request(&self, kind: RequestKind) -> Result<Vec<u16>, Fault> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request { kind, reply })
            .await
            .map_err(|_| Fault::Internal)?;
        response.await.map_err(|_| Fault::Internal)?
    }
}

pub struct Controller<T: ReaderTransport> {
    registers: RegisterFile,
    transport: T,
    rx: mpsc::Receiver<Request>,
}

impl<T: ReaderTransport> Controller<T> {
    pub fn new(transport: T) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                registers: RegisterFile::new(),
                transport,
                rx,
            },
            ControllerHandle { tx },
        )
    }

    /// Query the reader version once and cache it into 2030 to 2046.
    /// Failure leaves the region zeroed; the bridge still comes up.
    pub async fn cache_reader_version(&mut self) {
        match self.transport.transact(Command::GetVersion).await {
            Ok(response) if response.is_ack() => {
                debug!(
                    "Reader version: {}",
                    String::from_utf8_lossy(&response.payload)
                );
                self.registers.set_version(&response.payload);
            }
            Ok(response) => {
                warn!(
                    "Reader refused version query (exception 0x{:02x})",
                    response.status
                );
            }
            Err(err) => warn!("Reader version query failed: {}", err),
        }
    }

    /// Serve requests until cancellation or channel teardown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Function block controller running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(Request { kind, reply }) => {
                        let result = self.dispatch(kind).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                frame = self.transport.recv_unsolicited() => match frame {
                    Ok(frame) => self.handle_unsolicited(frame),
                    Err(err) => {
                        error!("Reader link lost: {}", err);
                        break;
                    }
                },
            }
        }
        info!("Function block controller stopped");
    }

    fn handle_unsolicited(&mut self, frame: crate::reader::Response) {
        let Some(report) = frame.tag_report() else {
            trace!("Ignoring unsolicited frame: {:02x?}", &frame.raw[..]);
            return;
        };
        if self.registers.mode().polls() {
            self.registers.set_tag_report(&report);
        }
    }

    async fn dispatch(&mut self, kind: RequestKind) -> Result<Vec<u16>, Fault> {
        match kind {
            RequestKind::Read { addr, count } => self.handle_read(addr, count).await,
            RequestKind::Write { addr, values } => {
                self.handle_write(addr, values).await?;
                Ok(Vec::new())
            }
        }
    }

    fn gate(&self, region: Region) -> Result<(), Fault> {
        match region.mode_gate() {
            Some(required) if self.registers.mode() != required => Err(Fault::ModeNotActive {
                required,
                active: self.registers.mode(),
            }),
            _ => Ok(()),
        }
    }

    async fn handle_read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, Fault> {
        let (region, offset) =
            Region::locate(addr, count).ok_or(Fault::IllegalRegion { addr, count })?;
        if !region.readable() {
            return Err(Fault::IllegalRegion { addr, count });
        }
        self.gate(region)?;

        // A read covering the whole block window runs the MIFARE read
        // transaction before the buffer is returned. Partial reads are
        // plain buffer access.
        if region == Region::BlockData && offset == 0 && count == region.len() {
            self.run_block_transaction(TransferKind::Read).await?;
        }

        let words = self.registers.words(region);
        Ok(words[offset..offset + count as usize].to_vec())
    }

    async fn handle_write(&mut self, addr: u16, values: Vec<u16>) -> Result<(), Fault> {
        let count = values.len() as u16;
        let (region, offset) =
            Region::locate(addr, count).ok_or(Fault::IllegalRegion { addr, count })?;
        if !region.writable() {
            return Err(Fault::IllegalRegion { addr, count });
        }
        self.gate(region)?;

        match region {
            Region::Mode => self.switch_mode(values[0]).await,
            Region::BlockSelect => {
                let word = values[0];
                BlockSelect::try_from(word).map_err(Fault::InvalidBlockSelect)?;
                self.store(region, offset, &values);
                Ok(())
            }
            Region::BlockData => {
                self.store(region, offset, &values);
                if offset == 0 && count == region.len() {
                    self.run_block_transaction(TransferKind::Write).await?;
                }
                Ok(())
            }
            Region::Led => {
                self.store(region, offset, &values);
                // Only the atomic 2-register write drives the LED; a single
                // register write is stored but inert.
                if offset == 0 && count == region.len() {
                    self.drive_led().await?;
                }
                Ok(())
            }
            Region::TunnelTx => {
                self.store(region, offset, &values);
                if offset == 0 {
                    self.run_tunnel().await?;
                }
                Ok(())
            }
            // Plain buffer regions.
            _ => {
                self.store(region, offset, &values);
                Ok(())
            }
        }
    }

    fn store(&mut self, region: Region, offset: usize, values: &[u16]) {
        // Callers have already checked writability.
        if let Some(words) = self.registers.words_mut(region) {
            words[offset..offset + values.len()].copy_from_slice(values);
        }
    }

    /// Write to 1009: quiesce polling, switch, restart polling.
    async fn switch_mode(&mut self, value: u16) -> Result<(), Fault> {
        let next = Mode::from_repr(value).ok_or(Fault::InvalidModeValue(value))?;
        let current = self.registers.mode();
        if next == current {
            return Ok(());
        }

        // A quiesce failure leaves the mode untouched; the master retries.
        if current.polls() {
            match self.transport.transact(Command::StopContinuous).await {
                Ok(response) if response.is_ack() => {}
                Ok(response) => {
                    self.registers
                        .set_outcome(outcome(response.status, CommandId::Continuous as u8));
                    return Err(Fault::Internal);
                }
                Err(err) => {
                    self.registers.set_outcome(OUTCOME_INTERNAL);
                    return Err(timeout_fault(err));
                }
            }
        }

        self.registers.set_mode(next);
        if next == Mode::Standby {
            self.registers.clear_tag_info();
        }
        info!("Function block switched: {:?} -> {:?}", current, next);

        // Best effort: the mode is already switched, a poll restart failure
        // only delays tag reports.
        if next.polls() {
            if let Err(err) = self.start_polling().await {
                warn!("Poll restart after mode switch failed: {}", err);
            }
        }
        Ok(())
    }

    async fn start_polling(&mut self) -> Result<(), TransportError> {
        let response = self.transport.transact(Command::StartContinuous).await?;
        if !response.is_ack() {
            warn!(
                "Reader refused poll start (exception 0x{:02x})",
                response.status
            );
        }
        Ok(())
    }

    /// Atomic LED pair write: registers hold `[duration:enable, colour]`.
    async fn drive_led(&mut self) -> Result<(), Fault> {
        let words = self.registers.words(Region::Led);
        let command = Command::Led {
            duration: words[0] as u8,
            enable: (words[0] >> 8) as u8,
            color: words[1] as u8,
        };
        match self.transport.transact(command).await {
            Ok(response) if response.is_ack() => {
                self.registers.set_outcome(OUTCOME_OK);
                Ok(())
            }
            Ok(response) => {
                self.registers
                    .set_outcome(outcome(response.status, CommandId::Led as u8));
                Err(Fault::WriteFailed)
            }
            Err(err) => {
                self.registers.set_outcome(OUTCOME_INTERNAL);
                Err(timeout_fault(err))
            }
        }
    }

    /// Tunnel passthrough: forward the buffered TX payload verbatim, publish
    /// whatever comes back. Succeeds unconditionally; a reader timeout just
    /// leaves an empty RX window.
    async fn run_tunnel(&mut self) -> Result<(), Fault> {
        let payload = self
            .registers
            .tunnel_tx_bytes()
            .ok_or_else(|| Fault::InvalidTunnelLength(self.registers.words(Region::TunnelTx)[0]))?;

        match self
            .transport
            .transact(Command::Raw(payload.into()))
            .await
        {
            Ok(response) => {
                self.registers.set_tunnel_rx(&response.raw);
                Ok(())
            }
            Err(TransportError::Timeout) => {
                debug!("Tunnel exchange timed out, RX window cleared");
                self.registers.set_tunnel_rx(&[]);
                Ok(())
            }
            Err(err) => {
                error!("Tunnel exchange failed: {}", err);
                Err(Fault::Internal)
            }
        }
    }
}

fn timeout_fault(err: TransportError) -> Fault {
    match err {
        TransportError::Timeout => Fault::TransportTimeout,
        _ => Fault::Internal,
    }
}
