//! Reader transport layer.
//!
//! One exchange in flight at a time, no retries: a timeout here is terminal
//! for the enclosing transaction. The serial implementation owns the UART
//! exclusively; continuous-read frames that arrive while no exchange is in
//! flight are surfaced through [`ReaderTransport::recv_unsolicited`] so the
//! controller can keep the tag-info registers current.

pub mod serial;

use async_trait::async_trait;
use thiserror::Error;

use crate::reader::{Command, Response};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for reader response")]
    Timeout,

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial stream closed")]
    Closed,
}

/// A reader link capable of command/response exchanges.
#[async_trait]
pub trait ReaderTransport: Send {
    /// Send one command and wait for its response, up to the command's fixed
    /// deadline. Unsolicited frames received meanwhile are queued, not lost.
    async fn transact(&mut self, command: Command) -> Result<Response, TransportError>;

    /// Wait for the next unsolicited frame. Cancel safe, so the controller
    /// can race it against its request channel.
    async fn recv_unsolicited(&mut self) -> Result<Response, TransportError>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted transport for controller tests.

    use std::collections::VecDeque;

    use async_trait::async_trait;
    use bytes::{BufMut, Bytes, BytesMut};

    use super::{ReaderTransport, TransportError};
    use crate::reader::checksum::checksum;
    use crate::reader::{Command, Response, FRAME_START};

    /// Build a response frame with the given outcome byte.
    pub fn reply(status: u8, command: u8, payload: &[u8]) -> Bytes {
        let mut f = BytesMut::new();
        f.put_u8(FRAME_START);
        f.put_u8(status);
        f.put_u8(payload.len() as u8);
        f.put_u8(command);
        f.put_slice(payload);
        f.put_u8(checksum(&f));
        f.freeze()
    }

    pub fn ack(command: u8, payload: &[u8]) -> Bytes {
        reply(0x00, command, payload)
    }

    pub fn nak(command: u8, exception: u8) -> Bytes {
        reply(exception, command, &[])
    }

    enum Step {
        Reply(Bytes),
        Timeout,
    }

    /// Transport driven by a script of expected frames and canned replies.
    /// Every frame actually sent is also logged for byte-exact assertions.
    #[derive(Default)]
    pub struct MockTransport {
        script: VecDeque<(Bytes, Step)>,
        reports: VecDeque<Bytes>,
        pub sent: Vec<Bytes>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Expect `frame` next and answer with `reply`.
        pub fn expect(mut self, frame: &[u8], reply: Bytes) -> Self {
            self.script
                .push_back((Bytes::copy_from_slice(frame), Step::Reply(reply)));
            self
        }

        /// Expect `frame` next and let its deadline expire.
        pub fn expect_timeout(mut self, frame: &[u8]) -> Self {
            self.script
                .push_back((Bytes::copy_from_slice(frame), Step::Timeout));
            self
        }

        /// Queue an unsolicited frame for `recv_unsolicited`.
        pub fn push_report(&mut self, frame: Bytes) {
            self.reports.push_back(frame);
        }

        /// Panics if scripted exchanges were left unconsumed.
        pub fn assert_done(&self) {
            assert!(
                self.script.is_empty(),
                "{} scripted exchange(s) never happened",
                self.script.len()
            );
        }
    }

    #[async_trait]
    impl ReaderTransport for MockTransport {
        async fn transact(&mut self, command: Command) -> Result<Response, TransportError> {
            let frame = command.to_frame();
            self.sent.push(frame.clone());

            let (expect, step) = self
                .script
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected exchange: {:02x?}", &frame[..]));
            assert_eq!(
                &frame[..],
                &expect[..],
                "\nFrame mismatch!\nExpected: {:02x?}\nActual:   {:02x?}",
                &expect[..],
                &frame[..]
            );

            match step {
                Step::Reply(raw) => Ok(Response::parse(raw).expect("scripted reply must parse")),
                Step::Timeout => Err(TransportError::Timeout),
            }
        }

        async fn recv_unsolicited(&mut self) -> Result<Response, TransportError> {
            match self.reports.pop_front() {
                Some(raw) => Ok(Response::parse(raw).expect("scripted report must parse")),
                None => std::future::pending().await,
            }
        }
    }
}
