//! APDU (Application Protocol Data Unit) codec for the eCard IFD layer
//!
//! This crate provides the byte-level types used when talking to smart cards
//! according to ISO/IEC 7816-4.
//!
//! ## Overview
//!
//! - [`Command`] encodes and decodes command APDUs in all seven short and
//!   extended length cases
//! - [`Response`] splits a response APDU into its data field and trailer
//! - [`StatusWord`] classifies trailers and carries the §5.1.3 message table
//! - [`template::CardCommandTemplate`] evaluates `{...}` expressions against a
//!   runtime context to build commands whose bytes are only known at runtime
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod response;
pub mod template;

mod error;
pub use error::{Error, Result, ResultExt};

pub use command::{ApduCase, Command, ExpectedLength};
pub use response::status::{StatusClass, StatusWord};
pub use response::{Response, error::ResponseError};
pub use template::{CardCommandTemplate, TemplateContext, TemplateError, TemplateValue};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        ApduCase, Bytes, BytesMut, CardCommandTemplate, Command, Error, ExpectedLength, Response,
        Result, StatusClass, StatusWord, TemplateContext, TemplateValue,
    };
}
