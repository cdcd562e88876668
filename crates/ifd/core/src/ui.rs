//! User interaction needed by PIN verification and channel establishment

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use zeroize::Zeroizing;

use crate::Result;

/// Outcome of one user interaction step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult<T> {
    /// The step completed with a value
    Ok(T),
    /// The user cancelled the step
    Cancelled,
}

/// Everything needed to render a PIN prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinPrompt {
    /// Text shown to the user
    pub message: String,
    /// Minimum number of characters
    pub min_length: usize,
    /// Maximum number of characters, if limited
    pub max_length: Option<usize>,
    /// Time allowed until the first key
    pub first_key_timeout: Duration,
    /// Time allowed between keys
    pub after_first_key_timeout: Duration,
}

/// Native verification performed by the reader while a prompt is shown
pub type NativeVerify<'a> = &'a mut dyn FnMut() -> Result<Bytes>;

/// UI collaborator
pub trait UserConsent: Send + Sync + fmt::Debug {
    /// Ask the user for a PIN
    fn capture_pin(&self, prompt: &PinPrompt) -> Result<StepResult<Zeroizing<String>>>;

    /// Show the prompt while `verify` runs the verification on the reader
    /// keypad. Returns the raw two byte result of the reader.
    fn run_native_verify(&self, prompt: &PinPrompt, verify: NativeVerify<'_>)
    -> Result<StepResult<Bytes>>;
}
