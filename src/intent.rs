//! Recognition result types.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::convert::TokenValue;

/// Named entity extracted from a tagged region of a recognized sentence.
///
/// Spans are character offsets into the substituted (`start`/`end`) and
/// raw (`raw_start`/`raw_end`) texts, stored inclusive on both ends (the
/// exclusive end minus one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: SmolStr,
    pub value: TokenValue,
    pub raw_value: String,
    pub start: i64,
    pub end: i64,
    pub raw_start: i64,
    pub raw_end: i64,
    pub tokens: Vec<TokenValue>,
    pub raw_tokens: Vec<SmolStr>,
}

/// Named intention with a confidence in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: SmolStr,
    pub confidence: f64,
}

/// Output of recognizing one candidate path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub intent: Intent,
    pub entities: Vec<Entity>,
    /// Substituted text.
    pub text: String,
    pub raw_text: String,
    pub tokens: Vec<TokenValue>,
    pub raw_tokens: Vec<SmolStr>,
    /// Wall-clock seconds spent in recognition.
    pub recognize_seconds: f64,
}

impl Recognition {
    /// Recognition with no intent; what an empty result collapses to.
    pub fn empty() -> Recognition {
        Recognition::default()
    }
}
