//! UART transport to the reader.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Framed;

use super::{ReaderTransport, TransportError};
use crate::reader::{Command, CommandId, FrameCodec, Response};
use crate::tracing::prelude::*;

/// The one handle to the reader UART. Not clonable; the controller task owns
/// it for the life of the process.
pub struct SerialReaderTransport {
    framed: Framed<SerialStream, FrameCodec>,
    // Tag reports that arrived while a command exchange was in flight.
    pending: VecDeque<Response>,
}

impl SerialReaderTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = tokio_serial::new(path, baud).open_native_async()?;
        info!("Opened reader port {} at {} baud", path, baud);
        Ok(Self {
            framed: Framed::new(port, FrameCodec),
            pending: VecDeque::new(),
        })
    }

    /// Whether `frame` answers `command`, as opposed to being an unsolicited
    /// continuous-read report that happened to arrive first. Poll start/stop
    /// acknowledgements carry no payload; tag reports always do.
    fn solicited(frame: &Response, command: &Command) -> bool {
        if frame.command != command.command_byte() {
            return false;
        }
        if frame.command == CommandId::Continuous as u8 {
            !frame.is_ack() || frame.payload.is_empty()
        } else {
            true
        }
    }
}

#[async_trait]
impl ReaderTransport for SerialReaderTransport {
    async fn transact(&mut self, command: Command) -> Result<Response, TransportError> {
        let deadline = Instant::now() + command.timeout();
        self.framed.send(command.clone()).await?;

        loop {
            let frame = match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(result)) => result?,
            };

            if Self::solicited(&frame, &command) {
                return Ok(frame);
            }
            if frame.tag_report().is_some() {
                self.pending.push_back(frame);
            } else {
                warn!(
                    "Discarding unexpected frame while awaiting 0x{:02x}: {:02x?}",
                    command.command_byte(),
                    &frame.raw[..]
                );
            }
        }
    }

    async fn recv_unsolicited(&mut self) -> Result<Response, TransportError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        match self.framed.next().await {
            Some(frame) => Ok(frame?),
            None => Err(TransportError::Closed),
        }
    }
}
