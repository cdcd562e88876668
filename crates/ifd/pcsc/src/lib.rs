//! PC/SC terminal provider for the eCard IFD layer
//!
//! This crate implements the provider contract of `ecard-ifd`
//! ([`ScioTerminals`](ecard_ifd::scio::ScioTerminals),
//! [`ScioCard`](ecard_ifd::scio::ScioCard) and
//! [`TerminalWatcher`](ecard_ifd::scio::TerminalWatcher)) on top of the
//! platform PC/SC resource manager.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ecard_ifd::IfdService;
//! use ecard_ifd_pcsc::PcscTerminalFactory;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = IfdService::new(Arc::new(PcscTerminalFactory::default()));
//! let ctx = service.establish_context()?;
//!
//! for status in service.get_status(&ctx, None)? {
//!     println!("{}: card present = {}", status.name, status.card_available());
//! }
//!
//! service.release_context(&ctx)?;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod card;
mod config;
mod error;
mod reader;
mod terminals;

pub use card::PcscCard;
pub use config::{PcscConfig, ShareMode};
pub use error::PcscError;
pub use terminals::{PcscTerminalFactory, PcscTerminals, PcscWatcher};
