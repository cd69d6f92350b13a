use std::fmt;

use thiserror::Error;

/// Fatal engine errors. Any of these poisons the engine that raised it:
/// the failing call returns the error and all later input is accepted
/// but produces no output.
#[derive(Debug, Error)]
pub enum M4Error {
    /// A new call frame would exceed the configured nesting limit.
    #[error("nesting limit {limit} exceeded by `{name}'")]
    NestingLimit { name: String, limit: usize },

    /// Textual undiversion targets are not implemented; reaching one with
    /// extensions enabled is fatal.
    #[error("undiverting to `{target}' is not implemented")]
    UnimplementedUndivert { target: String },

    /// End of input arrived inside an unclosed argument list.
    #[error("end of input in argument list of `{name}'")]
    UnexpectedEof { name: String },

    /// A macro body failed to compile as a substitution template.
    #[error("invalid macro body: {0}")]
    InvalidBody(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Diagnostic code for a non-fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningCode {
    /// More arguments than a non-variadic macro declares; the call still
    /// proceeds, extras are unused.
    ExcessArguments,
    /// Non-numeric undivert target with extensions disabled; skipped.
    UnsupportedUndivert,
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarningCode::ExcessArguments => write!(f, "excess arguments"),
            WarningCode::UnsupportedUndivert => write!(f, "unsupported undivert target"),
        }
    }
}

/// Out-of-band notification surfaced by [`Engine::take_warnings`].
///
/// [`Engine::take_warnings`]: crate::Engine::take_warnings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub code: WarningCode,
    /// The offending macro name or argument.
    pub subject: String,
}

impl Warning {
    pub(crate) fn new(code: WarningCode, subject: impl Into<String>) -> Self {
        Self {
            code,
            subject: subject.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: `{}'", self.code, self.subject)
    }
}
