//! Parse errors for the addressing model

use thiserror::Error;

/// Error produced when a textual address, ID, or resource line is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {what} \"{input}\": {reason}")]
pub struct ParseError {
    what: &'static str,
    input: String,
    reason: String,
}

impl ParseError {
    pub(crate) fn new(what: &'static str, input: &str, reason: impl Into<String>) -> Self {
        Self {
            what,
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Kind of value that failed to parse (`"address"`, `"id"`, `"resource"`).
    #[must_use]
    pub const fn what(&self) -> &'static str {
        self.what
    }

    /// The offending input.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Why the input was rejected.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
