//! Converters applied to substituted tokens after a match.
//!
//! A converter region is delimited on the path by `__convert__name` /
//! `__converted__name` markers. When the region closes, the named converter
//! runs over the substituted tokens collected inside it. Converters may
//! change both the values and the number of tokens, and their outputs are
//! typed: `ten:10!int` yields the integer 10, not the string `"10"`.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::PathError;

/// A substituted token. Converter outputs keep their scalar type so a
/// single-token entity value stays an integer/float/bool; multi-token
/// values stringify and join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenValue {
    Str(SmolStr),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl TokenValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TokenValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenValue::Str(s) => write!(f, "{s}"),
            TokenValue::Int(i) => write!(f, "{i}"),
            TokenValue::Float(x) => write!(f, "{x}"),
            TokenValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for TokenValue {
    fn from(s: &str) -> Self {
        TokenValue::Str(SmolStr::new(s))
    }
}

impl From<SmolStr> for TokenValue {
    fn from(s: SmolStr) -> Self {
        TokenValue::Str(s)
    }
}

/// A converter: takes the substituted tokens of its region plus any
/// arguments carried in the marker (`__convert__name,arg1,arg2`), returns
/// the replacement tokens or a failure message.
pub type ConverterFn =
    Box<dyn Fn(&[TokenValue], &[SmolStr]) -> Result<Vec<TokenValue>, String> + Send + Sync>;

/// Named converters available during path replay.
pub struct ConverterRegistry {
    converters: HashMap<SmolStr, ConverterFn>,
}

impl ConverterRegistry {
    /// Registry with no converters at all.
    pub fn empty() -> Self {
        ConverterRegistry { converters: HashMap::new() }
    }

    /// Registry with the built-in converters: `int`, `float`, `bool`,
    /// `lower`, `upper`.
    pub fn with_defaults() -> Self {
        let mut registry = ConverterRegistry::empty();
        registry.insert("int", |values, _args| each(values, to_int));
        registry.insert("float", |values, _args| each(values, to_float));
        registry.insert("bool", |values, _args| each(values, |v| Ok(to_bool(v))));
        registry.insert("lower", |values, _args| {
            each(values, |v| Ok(TokenValue::Str(SmolStr::new(v.to_string().to_lowercase()))))
        });
        registry.insert("upper", |values, _args| {
            each(values, |v| Ok(TokenValue::Str(SmolStr::new(v.to_string().to_uppercase()))))
        });
        registry
    }

    pub fn insert(
        &mut self,
        name: impl Into<SmolStr>,
        converter: impl Fn(&[TokenValue], &[SmolStr]) -> Result<Vec<TokenValue>, String>
            + Send
            + Sync
            + 'static,
    ) {
        self.converters.insert(name.into(), Box::new(converter));
    }

    /// Run a converter by name. Unknown names and converter failures both
    /// surface as [`PathError::ConverterFailure`].
    pub fn apply(
        &self,
        name: &str,
        args: &[SmolStr],
        values: &[TokenValue],
    ) -> Result<Vec<TokenValue>, PathError> {
        let converter = self.converters.get(name).ok_or_else(|| PathError::ConverterFailure {
            name: name.to_string(),
            message: "unknown converter".to_string(),
        })?;

        converter(values, args)
            .map_err(|message| PathError::ConverterFailure { name: name.to_string(), message })
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        ConverterRegistry::with_defaults()
    }
}

/// Shared built-in registry used when the caller supplies none.
pub(crate) static DEFAULT_CONVERTERS: Lazy<ConverterRegistry> =
    Lazy::new(ConverterRegistry::with_defaults);

fn each(
    values: &[TokenValue],
    f: impl Fn(&TokenValue) -> Result<TokenValue, String>,
) -> Result<Vec<TokenValue>, String> {
    values.iter().map(&f).collect()
}

fn to_int(value: &TokenValue) -> Result<TokenValue, String> {
    match value {
        TokenValue::Int(i) => Ok(TokenValue::Int(*i)),
        TokenValue::Float(x) => Ok(TokenValue::Int(*x as i64)),
        TokenValue::Bool(b) => Ok(TokenValue::Int(*b as i64)),
        TokenValue::Str(s) => s
            .parse::<i64>()
            .map(TokenValue::Int)
            .map_err(|_| format!("not an integer: {s:?}")),
    }
}

fn to_float(value: &TokenValue) -> Result<TokenValue, String> {
    match value {
        TokenValue::Int(i) => Ok(TokenValue::Float(*i as f64)),
        TokenValue::Float(x) => Ok(TokenValue::Float(*x)),
        TokenValue::Bool(b) => Ok(TokenValue::Float(*b as i64 as f64)),
        TokenValue::Str(s) => s
            .parse::<f64>()
            .map(TokenValue::Float)
            .map_err(|_| format!("not a number: {s:?}")),
    }
}

fn to_bool(value: &TokenValue) -> TokenValue {
    let truthy = match value {
        TokenValue::Str(s) => !s.is_empty(),
        TokenValue::Int(i) => *i != 0,
        TokenValue::Float(x) => *x != 0.0,
        TokenValue::Bool(b) => *b,
    };
    TokenValue::Bool(truthy)
}
