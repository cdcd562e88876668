//! Template evaluation errors

/// Failure while expanding a [`CardCommandTemplate`](super::CardCommandTemplate)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// The expanded header is not exactly four bytes
    #[error("Template error: header has {0} bytes instead of 4")]
    HeaderLength(usize),

    /// An opening brace without a matching closing brace
    #[error("Template error: unterminated expression starting at offset {0}")]
    Unterminated(usize),

    /// `{}` without any token
    #[error("Template error: empty expression")]
    EmptyExpression,

    /// A token that is not bound in the context
    #[error("Template error: '{0}' is not defined")]
    Unresolved(String),

    /// An expression with parameters whose head is a plain value
    #[error("Template error: '{0}' is not a function")]
    NotAFunction(String),

    /// A function referenced where a value is expected
    #[error("Template error: function '{0}' used as a value")]
    FunctionAsValue(String),

    /// The expanded text is not valid hex
    #[error("Template error: invalid hex '{0}'")]
    InvalidHex(String),

    /// A function rejected its parameters
    #[error("Template error: {function}: {message}")]
    Function {
        /// Name the function was invoked under
        function: String,
        /// Reason given by the function
        message: String,
    },
}

impl TemplateError {
    /// Failure raised from inside a template function
    pub fn function<F: Into<String>, M: Into<String>>(function: F, message: M) -> Self {
        Self::Function {
            function: function.into(),
            message: message.into(),
        }
    }
}
