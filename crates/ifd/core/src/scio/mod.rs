//! Provider contract for card terminals
//!
//! The IFD layer never talks to hardware directly. A provider implements
//! [`ScioTerminals`] for enumeration and connection, [`ScioCard`] for one card
//! connection and [`TerminalWatcher`] for presence tracking. Every failure is
//! reported as a [`ScioError`] so callers can match on its code.

mod error;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use derive_more::Display;

use crate::CancellationToken;
pub use error::{ScioError, ScioErrorCode};

/// Result type for provider calls
pub type ScioResult<T> = Result<T, ScioError>;

/// Transmission protocol requested when connecting to a card
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScioProtocol {
    /// Character oriented T=0
    #[display("T=0")]
    T0,
    /// Block oriented T=1
    #[display("T=1")]
    T1,
    /// Contactless T=CL
    #[display("T=CL")]
    Tcl,
    /// Whatever the reader negotiates
    #[display("ANY")]
    Any,
}

impl ScioProtocol {
    /// Order in which protocols are tried when opening a master channel
    pub const CONNECT_ORDER: [Self; 4] = [Self::T1, Self::Tcl, Self::T0, Self::Any];
}

/// Presence snapshot of one terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalState {
    /// Terminal name
    pub name: String,
    /// Whether a card is in the slot
    pub card_present: bool,
}

impl TerminalState {
    /// Create a new terminal snapshot
    pub fn new<S: Into<String>>(name: S, card_present: bool) -> Self {
        Self {
            name: name.into(),
            card_present,
        }
    }
}

/// Change reported by a [`TerminalWatcher`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateChangeEvent {
    /// A terminal was attached
    TerminalAdded(String),
    /// A terminal was detached
    TerminalRemoved(String),
    /// A card was inserted into a terminal
    CardInserted(String),
    /// A card was removed from a terminal
    CardRemoved(String),
}

impl StateChangeEvent {
    /// Name of the terminal the event refers to
    pub fn terminal(&self) -> &str {
        match self {
            Self::TerminalAdded(name)
            | Self::TerminalRemoved(name)
            | Self::CardInserted(name)
            | Self::CardRemoved(name) => name,
        }
    }
}

/// Creates the provider when a context is established
pub trait TerminalFactory: Send + Sync + fmt::Debug {
    /// Open a fresh provider instance
    fn create(&self) -> ScioResult<Arc<dyn ScioTerminals>>;
}

/// Enumeration and connection entry point of a provider
pub trait ScioTerminals: Send + Sync + fmt::Debug {
    /// All terminals currently attached
    fn list(&self) -> ScioResult<Vec<TerminalState>>;

    /// Whether the named terminal holds a card
    fn is_card_present(&self, name: &str) -> ScioResult<bool> {
        self.list()?
            .into_iter()
            .find(|t| t.name == name)
            .map(|t| t.card_present)
            .ok_or_else(|| ScioError::no_such_terminal(name))
    }

    /// Open a shared connection to the card in the named terminal
    fn connect(&self, name: &str, protocol: ScioProtocol) -> ScioResult<Box<dyn ScioCard>>;

    /// Create a presence watcher
    fn watcher(&self) -> ScioResult<Box<dyn TerminalWatcher>>;

    /// Whether the named terminal is a contactless reader
    fn is_contactless(&self, _name: &str) -> bool {
        false
    }

    /// Power up devices managed by the provider. Returns whether anything
    /// changed.
    fn prepare_devices(&self) -> ScioResult<bool> {
        Ok(false)
    }

    /// Power down devices managed by the provider. Returns whether anything
    /// changed.
    fn power_down_devices(&self) -> bool {
        false
    }
}

/// One connection to a card
pub trait ScioCard: Send + fmt::Debug {
    /// Answer to reset of the card
    fn atr(&self) -> Bytes;

    /// Protocol negotiated for this connection
    fn protocol(&self) -> ScioProtocol;

    /// Send a command APDU and return the raw response
    fn transmit(&mut self, command: &[u8]) -> ScioResult<Bytes>;

    /// Send a reader control command
    fn transmit_control(&mut self, code: u32, data: &[u8]) -> ScioResult<Bytes>;

    /// Acquire exclusive access to the card
    fn begin_exclusive(&mut self) -> ScioResult<()>;

    /// Release exclusive access to the card
    fn end_exclusive(&mut self) -> ScioResult<()>;

    /// Re-establish the connection, optionally resetting the card
    fn reconnect(&mut self, reset: bool) -> ScioResult<()>;

    /// Close the connection, optionally resetting the card
    fn disconnect(self: Box<Self>, reset: bool) -> ScioResult<()>;
}

/// Blocking presence watcher
pub trait TerminalWatcher: Send {
    /// Begin watching and return the initial terminal states
    fn start(&mut self) -> ScioResult<Vec<TerminalState>>;

    /// Wait for the next change. `Ok(None)` means the timeout expired. A
    /// cancelled token ends the wait with [`ScioErrorCode::Cancelled`].
    fn wait_for_change(
        &mut self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> ScioResult<Option<StateChangeEvent>>;
}
