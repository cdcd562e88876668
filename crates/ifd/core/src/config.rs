//! Configuration options for the IFD service

use std::time::Duration;

/// Prompt texts used during PIN verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyMessages {
    /// Shown when asking for the secret
    pub authentication_request: String,
    /// Shown after a successful entry
    pub success: String,
    /// Shown after a failed entry
    pub authentication_failed: String,
    /// Shown when asking for the secret a second time
    pub request_confirmation: String,
    /// Shown after the user cancelled
    pub cancel: String,
}

impl Default for VerifyMessages {
    fn default() -> Self {
        Self {
            authentication_request: "Enter secret:".to_owned(),
            success: "Secret entered successfully.".to_owned(),
            authentication_failed: "Secret not entered successfully.".to_owned(),
            request_confirmation: "Enter secret again:".to_owned(),
            cancel: "Canceled secret input.".to_owned(),
        }
    }
}

/// Configuration options for the IFD service
#[derive(Debug, Clone)]
pub struct IfdConfig {
    /// Time allowed until the first key is pressed
    pub first_key_timeout: Duration,

    /// Time allowed between subsequent keys
    pub after_first_key_timeout: Duration,

    /// Default prompt texts
    pub messages: VerifyMessages,

    /// USB language id written into reader PIN structures
    pub language_id: u16,

    /// Delays applied after consecutive failures of the event manager's wait
    /// loop. The last entry repeats.
    pub event_backoff: Vec<Duration>,

    /// Prefix for the names of wait worker threads
    pub thread_name: String,
}

impl Default for IfdConfig {
    fn default() -> Self {
        Self {
            first_key_timeout: Duration::from_millis(60_000),
            after_first_key_timeout: Duration::from_millis(15_000),
            messages: VerifyMessages::default(),
            language_id: 0x0409,
            event_backoff: vec![
                Duration::from_millis(1),
                Duration::from_millis(500),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            thread_name: "ifd-wait".to_owned(),
        }
    }
}

impl IfdConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout until the first key
    pub const fn with_first_key_timeout(mut self, timeout: Duration) -> Self {
        self.first_key_timeout = timeout;
        self
    }

    /// Set the timeout after the first key
    pub const fn with_after_first_key_timeout(mut self, timeout: Duration) -> Self {
        self.after_first_key_timeout = timeout;
        self
    }

    /// Set the prompt texts
    pub fn with_messages(mut self, messages: VerifyMessages) -> Self {
        self.messages = messages;
        self
    }

    /// Set the USB language id
    pub const fn with_language_id(mut self, language_id: u16) -> Self {
        self.language_id = language_id;
        self
    }

    /// Set the event manager backoff steps
    pub fn with_event_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.event_backoff = backoff;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Backoff to apply after `failures` consecutive failures
    pub fn backoff_for(&self, failures: usize) -> Duration {
        match failures {
            0 => Duration::ZERO,
            n => self
                .event_backoff
                .get(n - 1)
                .or_else(|| self.event_backoff.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        }
    }
}
