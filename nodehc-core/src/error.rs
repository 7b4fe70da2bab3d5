//! Error taxonomy for the check engine
//!
//! Execution-level problems (missing binary, spawn failure, unreadable
//! config) are the only conditions surfaced as `Err` values. Everything a
//! probe reports about the hardware itself (bad counters, timeouts, garbage
//! output) is carried inside normal results and classified by the evaluator.

use thiserror::Error;

/// Errors that can occur while running a check
#[derive(Debug, Error)]
pub enum CheckError {
    /// Required external binary not found on the host
    #[error("required binary not found: {0}")]
    BinaryMissing(String),

    /// Process invocation itself failed (not a tool-reported failure)
    #[error("failed to invoke {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Probe output did not match the expected format
    #[error("unable to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    /// Configuration file missing, unreadable, or malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error reading local files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckError {
    /// Build a parse error for a named payload
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        CheckError::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error means "could not determine" rather than
    /// "determined bad". Such errors map to an ERROR report, not FAIL.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            CheckError::BinaryMissing(_)
                | CheckError::Spawn { .. }
                | CheckError::Config(_)
                | CheckError::Io(_)
        )
    }
}
