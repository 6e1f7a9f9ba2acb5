//! MIFARE block transaction state machine.
//!
//! A transaction is one full reader sequence: stop polling, log in,
//! authenticate the selected block with the selected key, transfer the
//! block, restart polling. The poll restart always runs, even after a
//! failure, so the reader keeps reporting tags for the next request.
//! Register 1026 records the terminal outcome.

use super::{timeout_fault, Controller, Fault};
use crate::reader::{Command, CommandId, Response};
use crate::registers::{outcome, BlockSelect, OUTCOME_INTERNAL, OUTCOME_OK};
use crate::tracing::prelude::*;
use crate::transport::ReaderTransport;

/// Which way the block moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Read,
    Write,
}

impl TransferKind {
    fn command_id(self) -> CommandId {
        match self {
            TransferKind::Read => CommandId::ReadBlock,
            TransferKind::Write => CommandId::WriteBlock,
        }
    }

    fn failure(self) -> Fault {
        match self {
            TransferKind::Read => Fault::ReadFailed,
            TransferKind::Write => Fault::WriteFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StoppingPoll,
    LoggingIn,
    Authenticating,
    Transferring,
    RestartingPoll,
}

impl<T: ReaderTransport> Controller<T> {
    /// Run one block transaction against the reader. On success a read
    /// refreshes the block-data window; either way 1026 is rewritten.
    pub(super) async fn run_block_transaction(&mut self, kind: TransferKind) -> Result<(), Fault> {
        // The selector was validated when it was written, so this only
        // trips if the store was never initialized to a valid word
        // (the zero default parses as block 0, key A).
        let select = BlockSelect::try_from(self.registers.block_select())
            .map_err(Fault::InvalidBlockSelect)?;
        let secret = self.registers.key_bytes(select.key);

        debug!(
            "Block {:?} transaction: block {} key {:?}",
            kind, select.block, select.key
        );

        let mut verdict: Result<Option<[u8; 16]>, (Fault, u16)> = Ok(None);
        let mut state = State::StoppingPoll;

        loop {
            let command = match state {
                State::StoppingPoll => Command::StopContinuous,
                State::LoggingIn => Command::Login,
                State::Authenticating => Command::Authenticate {
                    key: select.key,
                    block: select.block,
                    secret,
                },
                State::Transferring => match kind {
                    TransferKind::Read => Command::ReadBlock {
                        block: select.block,
                    },
                    TransferKind::Write => Command::WriteBlock {
                        block: select.block,
                        data: self.registers.block_data_bytes(),
                    },
                },
                State::RestartingPoll => {
                    // Best effort, never changes the verdict.
                    if let Err(err) = self.start_polling().await {
                        warn!("Poll restart after transaction failed: {}", err);
                    }
                    break;
                }
            };

            match self.transport.transact(command).await {
                Ok(response) if response.is_ack() => match state {
                    State::StoppingPoll => state = State::LoggingIn,
                    State::LoggingIn => state = State::Authenticating,
                    State::Authenticating => state = State::Transferring,
                    State::Transferring => {
                        verdict = transfer_payload(kind, &response);
                        state = State::RestartingPoll;
                    }
                    State::RestartingPoll => unreachable!(),
                },
                Ok(response) => {
                    verdict = Err(nak_verdict(kind, state, &response));
                    state = State::RestartingPoll;
                }
                Err(err) => {
                    // Any transport failure skips straight to the poll
                    // restart with an internal outcome.
                    verdict = Err((timeout_fault(err), OUTCOME_INTERNAL));
                    state = State::RestartingPoll;
                }
            }
        }

        match verdict {
            Ok(payload) => {
                if let Some(data) = payload {
                    self.registers.set_block_data_bytes(&data);
                }
                self.registers.set_outcome(OUTCOME_OK);
                Ok(())
            }
            Err((fault, code)) => {
                self.registers.set_outcome(code);
                debug!("Block transaction failed: {} (1026 = 0x{:04x})", fault, code);
                Err(fault)
            }
        }
    }
}

fn transfer_payload(
    kind: TransferKind,
    response: &Response,
) -> Result<Option<[u8; 16]>, (Fault, u16)> {
    match kind {
        TransferKind::Write => Ok(None),
        TransferKind::Read => {
            let payload: [u8; 16] = response.payload[..]
                .try_into()
                .map_err(|_| (Fault::MalformedFrame, OUTCOME_INTERNAL))?;
            Ok(Some(payload))
        }
    }
}

fn nak_verdict(kind: TransferKind, state: State, response: &Response) -> (Fault, u16) {
    let command = match state {
        State::StoppingPoll => CommandId::Continuous,
        State::LoggingIn => CommandId::Login,
        State::Authenticating => CommandId::Authenticate,
        State::Transferring => kind.command_id(),
        State::RestartingPoll => CommandId::Continuous,
    };
    let fault = match state {
        State::Authenticating => Fault::AuthenticationFailed,
        State::StoppingPoll => Fault::Internal,
        _ => kind.failure(),
    };
    (fault, outcome(response.status, command as u8))
}
