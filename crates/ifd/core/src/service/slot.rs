use std::sync::Arc;

use bytes::Bytes;
use ecard_apdu_core::response::error::StatusError;
use ecard_apdu_core::{Command, Response, ResponseError};
use tracing::{debug, error, instrument, trace, warn};

use super::IfdService;
use crate::channel::{ContextHandle, SlaveChannel, SlotHandle};
use crate::events::IfdEvent;
use crate::scio::{ScioError, ScioErrorCode};
use crate::terminal::TerminalInfo;
use crate::{IfdError, Result};

/// INS byte of MANAGE CHANNEL
const INS_MANAGE_CHANNEL: u8 = 0x70;

/// What happens to the card when a channel is closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Leave the card untouched, other channels keep working
    #[default]
    Leave,
    /// Reset the card
    Reset,
}

/// One command of a `transmit` sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputApdu {
    /// Raw command APDU
    pub command: Bytes,
    /// Acceptable status codes. A single byte matches every trailer starting
    /// with it, an empty list accepts anything.
    pub acceptable: Vec<Bytes>,
}

impl InputApdu {
    /// Command accepting any status
    pub fn new<T: Into<Bytes>>(command: T) -> Self {
        Self {
            command: command.into(),
            acceptable: Vec::new(),
        }
    }

    /// Encode a command
    pub fn from_command(command: &Command) -> Result<Self> {
        Ok(Self::new(command.to_bytes()?))
    }

    /// Add an acceptable status code
    pub fn with_acceptable<T: Into<Bytes>>(mut self, code: T) -> Self {
        self.acceptable.push(code.into());
        self
    }

    fn is_manage_channel(&self) -> bool {
        self.command.get(1) == Some(&INS_MANAGE_CHANNEL)
    }
}

/// Output of `transmit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitResponse {
    /// Responses received, including the one that stopped the sequence
    pub responses: Vec<Bytes>,
    /// Whether every response was acceptable
    pub result: Result<()>,
}

/// Output of `control_ifd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Raw reader response
    pub response: Bytes,
    /// Evaluation of the response
    pub result: Result<()>,
}

fn connect_error(error: ScioError) -> IfdError {
    warn!(error = %error, "connect failed");
    match error.code {
        ScioErrorCode::UnknownReader => {
            IfdError::UnknownIfd("The requested terminal does not exist.".into())
        }
        ScioErrorCode::NoSmartcard | ScioErrorCode::RemovedCard => {
            IfdError::NoCard("No card available in the requested terminal.".into())
        }
        _ => IfdError::device("Unknown error in the underlying SCIO implementation."),
    }
}

fn transaction_error(error: &ScioError) -> IfdError {
    if error.code.is_vanished() {
        debug!(error = %error, "slot handle vanished");
        IfdError::slot(format!("Slot handle is not available [{:?}].", error.code))
    } else {
        warn!(error = %error, "transaction failed");
        IfdError::unknown("Unknown error in the underlying SCIO implementation.")
    }
}

fn evaluate_control_result(response: &[u8]) -> Result<()> {
    match response {
        [0x90, 0x00] => Ok(()),
        [0x64, 0x00] => Err(IfdError::Timeout("Timeout.".into())),
        _ => Err(IfdError::device("Unknown return code from terminal.")),
    }
}

// Err carries the response that stopped the sequence, if one was received
fn transmit_one(
    channel: &SlaveChannel,
    apdu: &InputApdu,
) -> std::result::Result<Bytes, (Option<Bytes>, IfdError)> {
    if apdu.is_manage_channel() {
        return Err((
            None,
            IfdError::slot("Given command contains a MANAGE CHANNEL APDU."),
        ));
    }
    let raw = channel.transmit(&apdu.command).map_err(|e| (None, e))?;
    if apdu.acceptable.is_empty() {
        return Ok(raw);
    }

    let status = match Response::from_bytes(&raw) {
        Ok(response) => response.status(),
        Err(e) => return Err((Some(raw), ecard_apdu_core::Error::from(e).into())),
    };
    if status.is_positive_response(&apdu.acceptable) {
        trace!(%status, "acceptable status");
        Ok(raw)
    } else {
        debug!(%status, "status not in the list of acceptable codes");
        let error = ResponseError::Status(StatusError { status });
        Err((Some(raw), ecard_apdu_core::Error::from(error).into()))
    }
}

impl IfdService {
    /// Open a channel to the card in a terminal, optionally inside a
    /// transaction
    #[instrument(skip_all, fields(terminal = name, exclusive = exclusive))]
    pub fn connect(&self, handle: &ContextHandle, name: &str, exclusive: bool) -> Result<SlotHandle> {
        let context = self.context(handle)?;
        let manager = &context.manager;
        manager.open_master(name).map_err(connect_error)?;
        let slave = manager.open_slave(name).map_err(connect_error)?;

        if exclusive {
            if let Err(e) = slave.begin_exclusive() {
                let error = transaction_error(&e);
                if let Err(close) = manager.close_slave(&slave.handle()) {
                    debug!(error = %close, "closing channel after failed transaction");
                }
                return Err(error);
            }
        }
        Ok(slave.handle())
    }

    /// Close a channel. Only [`DisconnectAction::Reset`] touches the card.
    #[instrument(skip_all, fields(slot = %slot, action = ?action))]
    pub fn disconnect(
        &self,
        handle: &ContextHandle,
        slot: &SlotHandle,
        action: DisconnectAction,
    ) -> Result<()> {
        let context = self.context(handle)?;
        let slave = context.manager.close_slave(slot)?;
        if action != DisconnectAction::Reset {
            return Ok(());
        }

        // a reset must not race a context teardown
        let _lifecycle = self.lifecycle.lock();
        let terminal = slave.terminal();
        match context.manager.reset_master(terminal) {
            Ok(()) => self.dispatcher.notify(IfdEvent::CardReset {
                terminal: terminal.to_owned(),
                handle: *slot,
            }),
            Err(e) => error!(terminal, error = %e, "resetting the card failed"),
        }
        Ok(())
    }

    /// Acquire the card exclusively through a channel
    #[instrument(skip_all, fields(slot = %slot))]
    pub fn begin_transaction(&self, handle: &ContextHandle, slot: &SlotHandle) -> Result<()> {
        let context = self.context(handle)?;
        let channel = context
            .manager
            .slave(slot)
            .map_err(|_| IfdError::slot("No card available in the requested terminal."))?;
        channel.begin_exclusive().map_err(|e| transaction_error(&e))
    }

    /// Release the transaction of a channel
    #[instrument(skip_all, fields(slot = %slot))]
    pub fn end_transaction(&self, handle: &ContextHandle, slot: &SlotHandle) -> Result<()> {
        let context = self.context(handle)?;
        let channel = context.manager.slave(slot).map_err(|_| {
            IfdError::slot("No card with transaction available in the requested terminal.")
        })?;
        channel.end_exclusive().map_err(|e| {
            warn!(error = %e, "ending transaction failed");
            IfdError::device("Unknown error in the underlying SCIO implementation.")
        })
    }

    /// Send APDUs in order, stopping at the first response whose status is
    /// not acceptable
    #[instrument(skip_all, fields(slot = %slot, apdus = apdus.len()))]
    pub fn transmit(
        &self,
        handle: &ContextHandle,
        slot: &SlotHandle,
        apdus: &[InputApdu],
    ) -> Result<TransmitResponse> {
        let context = self.context(handle)?;
        let channel = context.manager.slave(slot).map_err(|_| {
            IfdError::slot("No card with transaction available in the requested terminal.")
        })?;
        let invalid = apdus
            .iter()
            .flat_map(|apdu| &apdu.acceptable)
            .any(|code| code.is_empty() || code.len() > 2);
        if invalid {
            return Err(IfdError::parameter("Invalid accepted status code given."));
        }

        let mut responses = Vec::with_capacity(apdus.len());
        for apdu in apdus {
            match transmit_one(&channel, apdu) {
                Ok(response) => responses.push(response),
                Err((_, error)) if error.is_terminated() => return Err(error),
                Err((response, error)) => {
                    responses.extend(response);
                    return Ok(TransmitResponse {
                        responses,
                        result: Err(error),
                    });
                }
            }
        }
        Ok(TransmitResponse {
            responses,
            result: Ok(()),
        })
    }

    /// Send a reader control command. The first byte of `command` is the
    /// feature tag, the rest is the payload.
    #[instrument(skip_all, fields(slot = %slot))]
    pub fn control_ifd(
        &self,
        handle: &ContextHandle,
        slot: &SlotHandle,
        command: &[u8],
    ) -> Result<ControlResponse> {
        let context = self.context(handle)?;
        let Some((&tag, payload)) = command.split_first() else {
            return Err(IfdError::parameter("Missing parameter."));
        };
        let manager = context.manager.as_ref();
        let channel = manager.slave(slot).map_err(|_| {
            IfdError::UnknownIfd("The card or the terminal is not available anymore.".into())
        })?;

        let info = TerminalInfo::with_channel(manager, Arc::clone(channel.master()));
        let Some(code) = info.feature(tag) else {
            return Err(IfdError::device(
                "The terminal is not capable of performing the requested action.",
            ));
        };
        let response = channel.transmit_control(code, payload).map_err(|e| {
            warn!(error = %e, "control command failed");
            match e {
                IfdError::InvalidSlotHandle(_) => IfdError::UnknownIfd(
                    "The card or the terminal is not available anymore.".into(),
                ),
                _ => IfdError::device("Unknown error while sending transmit control command."),
            }
        })?;
        Ok(ControlResponse {
            result: evaluate_control_result(&response),
            response,
        })
    }
}
