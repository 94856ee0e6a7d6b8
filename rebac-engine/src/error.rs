use crate::models::Revision;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 1-based location inside schema source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

impl SourcePosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Schema compile error at {position}: {message}")]
    Compile {
        position: SourcePosition,
        message: String,
    },

    #[error("Invalid relationship write: {0}")]
    Write(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Consistency token revision {revision} is older than the oldest retained revision {oldest_retained}")]
    StaleToken {
        revision: Revision,
        oldest_retained: Revision,
    },

    #[error("Invalid consistency token: {0}")]
    InvalidToken(String),

    #[error("Maximum recursion depth of {max_depth} exceeded")]
    RecursionLimit { max_depth: u32 },

    #[error("Check cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    pub fn compile(position: SourcePosition, message: impl Into<String>) -> Self {
        Self::Compile {
            position,
            message: message.into(),
        }
    }

    /// Stale tokens are the only failure a caller can fix by retrying at a newer revision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleToken { .. })
    }

    /// Recursion limit failures point at a schema problem and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RecursionLimit { .. })
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
