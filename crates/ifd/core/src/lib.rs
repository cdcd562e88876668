//! Card terminal interface layer for eID clients
//!
//! This crate sits between a card terminal provider (PC/SC or anything else
//! implementing [`scio::ScioTerminals`]) and the protocol engine of an eID
//! client. It hands out opaque context and slot handles, tracks terminal and
//! card presence, and runs PIN verification and PACE either on the reader or
//! in software.
//!
//! ## Overview
//!
//! - [`IfdService`] is the entry point: context lifecycle, status queries,
//!   wait/cancel, connect/disconnect, transactions, APDU transmission, reader
//!   control, user verification and secure channels
//! - [`channel`] multiplexes logical slot channels over one shared card
//!   connection per terminal
//! - [`events`] publishes terminal and card events to subscribers
//! - [`pace`] and [`pin`] encode the reader side PACE and PIN verification
//!   structures
//! - [`protocol`] holds the registry of software secure channel protocols
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod channel;
pub mod config;
pub mod events;
pub mod pace;
pub mod pin;
pub mod protocol;
pub mod scio;
pub mod service;
pub mod status;
pub mod terminal;
pub mod ui;
pub mod watcher;

mod cancel;
mod error;

pub use cancel::CancellationToken;
pub use error::{ErrorKind, IfdError, Result};

pub use channel::{ContextHandle, SlotHandle};
pub use config::{IfdConfig, VerifyMessages};
pub use events::{EventDispatcher, IfdEvent};
pub use service::{
    ControlResponse, DisconnectAction, IfdService, InputApdu, TransmitResponse, WaitNotification,
    WaitRequest, WaitResponse,
};
pub use status::{IfdStatus, SlotStatus};
pub use terminal::IfdCapabilities;

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        CancellationToken, ContextHandle, DisconnectAction, IfdCapabilities, IfdConfig, IfdError,
        IfdEvent, IfdService, IfdStatus, InputApdu, Result, SlotHandle, WaitRequest, WaitResponse,
        pin::VerifyUserRequest,
        protocol::{ProtocolData, ProtocolOutput},
        scio::{ScioCard, ScioTerminals, TerminalFactory, TerminalWatcher},
        ui::UserConsent,
    };
}
