//! Error taxonomy.
//!
//! Compilation is fail-fast: the first bad template, missing reference, or
//! runaway rule expansion aborts the whole build with a [`CompileError`].
//!
//! Recognition is best-effort: a candidate path that cannot be replayed
//! (unbalanced markers, failing converter) is dropped with a [`PathError`]
//! and the remaining candidates are still returned.

use thiserror::Error;

/// Fatal errors raised while parsing grammars or compiling the graph.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed sentence template (unclosed bracket, dangling tag, ...).
    #[error("grammar parse error at line {line}: {message}")]
    GrammarParse { line: usize, message: String },

    /// Reference to a rule or slot that is not in the replacements table.
    #[error("undefined reference {name}")]
    Resolve { name: String },

    /// Rule expansion exceeded the depth guard; the definitions are recursive.
    #[error("recursive expansion while resolving {name}")]
    Recursion { name: String },
}

/// Recoverable errors raised while replaying a single candidate path.
#[derive(Debug, Error)]
pub enum PathError {
    /// Begin/end or convert/converted markers did not nest correctly.
    #[error("inconsistent path: {0}")]
    PathConsistency(String),

    /// A converter rejected its input; the candidate is dropped.
    #[error("converter {name} failed: {message}")]
    ConverterFailure { name: String, message: String },
}

impl PathError {
    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        PathError::PathConsistency(msg.into())
    }
}
