//! Card command templates
//!
//! A template is a pair of hex strings (header and data) that may contain
//! `{...}` expressions. Each expression is either a single name, replaced by
//! the hex form of its value, or a function call such as `{tlv 0x80 pin}`:
//! the head names a function and the remaining tokens are its parameters.
//! Parameters starting with `0x` are literal hex, anything else is looked up
//! in the [`TemplateContext`].

mod error;
pub mod functions;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::Command;
pub use error::TemplateError;

/// Signature of a template function. Returns the hex text that replaces the
/// expression.
pub type TemplateFn = Arc<dyn Fn(&[TemplateArg]) -> Result<String, TemplateError> + Send + Sync>;

/// Value bound to a name in a [`TemplateContext`]
#[derive(Clone)]
pub enum TemplateValue {
    /// Raw bytes, inserted as hex
    Bytes(Bytes),
    /// Text, inserted as the hex of its UTF-8 encoding
    Text(String),
    /// Callable, only valid as the head of an expression
    Function(TemplateFn),
}

impl fmt::Debug for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&hex::encode(b)).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<Bytes> for TemplateValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for TemplateValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Parameter handed to a template function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArg {
    /// Literal `0x..` parameter, without the prefix
    Hex(String),
    /// Bytes resolved from the context
    Bytes(Bytes),
    /// Text resolved from the context
    Text(String),
}

impl TemplateArg {
    /// Byte form of the parameter
    pub fn to_bytes(&self) -> Result<Vec<u8>, TemplateError> {
        match self {
            Self::Hex(s) => decode_hex(s),
            Self::Bytes(b) => Ok(b.to_vec()),
            Self::Text(s) => Ok(s.as_bytes().to_vec()),
        }
    }
}

/// Name bindings used while evaluating a template
#[derive(Debug, Clone)]
pub struct TemplateContext {
    values: HashMap<String, TemplateValue>,
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateContext {
    /// Context with the built-in functions registered
    pub fn new() -> Self {
        let mut ctx = Self::empty();
        ctx.insert(functions::TLV, TemplateValue::Function(Arc::new(functions::tlv)));
        ctx
    }

    /// Context without any bindings
    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Bind a value, replacing any previous binding
    pub fn insert<K: Into<String>, V: Into<TemplateValue>>(&mut self, name: K, value: V) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Builder form of [`Self::insert`]
    pub fn with<K: Into<String>, V: Into<TemplateValue>>(mut self, name: K, value: V) -> Self {
        self.insert(name, value);
        self
    }

    /// Bind a function
    pub fn insert_function<K, F>(&mut self, name: K, function: F) -> &mut Self
    where
        K: Into<String>,
        F: Fn(&[TemplateArg]) -> Result<String, TemplateError> + Send + Sync + 'static,
    {
        self.values
            .insert(name.into(), TemplateValue::Function(Arc::new(function)));
        self
    }

    /// Look up a binding
    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.values.get(name)
    }

    fn resolve(&self, token: &str) -> Result<&TemplateValue, TemplateError> {
        self.get(token)
            .ok_or_else(|| TemplateError::Unresolved(token.to_owned()))
    }

    fn argument(&self, token: &str) -> Result<TemplateArg, TemplateError> {
        if let Some(hex) = token.strip_prefix("0x") {
            return Ok(TemplateArg::Hex(hex.to_owned()));
        }
        match self.resolve(token)? {
            TemplateValue::Bytes(b) => Ok(TemplateArg::Bytes(b.clone())),
            TemplateValue::Text(s) => Ok(TemplateArg::Text(s.clone())),
            TemplateValue::Function(_) => Err(TemplateError::FunctionAsValue(token.to_owned())),
        }
    }

    fn evaluate_expression(&self, expression: &str) -> Result<String, TemplateError> {
        let mut tokens = expression.split_whitespace();
        let head = tokens.next().ok_or(TemplateError::EmptyExpression)?;
        let params: Vec<&str> = tokens.collect();
        let value = self.resolve(head)?;

        if params.is_empty() {
            return match value {
                TemplateValue::Bytes(b) => Ok(hex::encode_upper(b)),
                TemplateValue::Text(s) => Ok(hex::encode_upper(s.as_bytes())),
                TemplateValue::Function(_) => Err(TemplateError::FunctionAsValue(head.to_owned())),
            };
        }

        let TemplateValue::Function(function) = value else {
            return Err(TemplateError::NotAFunction(head.to_owned()));
        };
        let args = params
            .iter()
            .map(|token| self.argument(token))
            .collect::<Result<Vec<_>, _>>()?;
        function(&args)
    }

    /// Replace every `{...}` expression in `template` and return the result
    pub fn expand(&self, template: &str) -> Result<String, TemplateError> {
        let mut text = template.to_owned();
        while let Some(start) = text.find('{') {
            let end = text[start..]
                .find('}')
                .map(|offset| start + offset)
                .ok_or(TemplateError::Unterminated(start))?;
            let replacement = self.evaluate_expression(&text[start + 1..end])?;
            text.replace_range(start..=end, &replacement);
        }
        Ok(text)
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, TemplateError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|_| TemplateError::InvalidHex(compact))
}

/// Header and data templates for one command APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardCommandTemplate {
    header: String,
    data: String,
}

impl CardCommandTemplate {
    /// Create a template from header and data text
    pub fn new<H: Into<String>, D: Into<String>>(header: H, data: D) -> Self {
        Self {
            header: header.into(),
            data: data.into(),
        }
    }

    /// Template with an empty data field
    pub fn header_only<H: Into<String>>(header: H) -> Self {
        Self::new(header, "")
    }

    /// Header template text
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Data template text
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Expand both templates and build the command
    pub fn evaluate(&self, ctx: &TemplateContext) -> Result<Command, TemplateError> {
        let header = decode_hex(&ctx.expand(&self.header)?)?;
        let header: [u8; 4] = header
            .as_slice()
            .try_into()
            .map_err(|_| TemplateError::HeaderLength(header.len()))?;
        let data = decode_hex(&ctx.expand(&self.data)?)?;

        trace!(
            header = %hex::encode(header),
            data_len = data.len(),
            "Evaluated card command template"
        );

        Ok(Command::from_header(header).with_data(data))
    }
}
