use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("config file error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {step} not acknowledged after {after:?}")]
    Timeout { step: String, after: Duration },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("channel {channel} has no variant {variant:?}")]
    UnknownVariant { channel: String, variant: String },
    #[error("header nibble {nibble:#X} already used by {existing}, cannot assign to {incoming}")]
    HeaderConflict {
        nibble: u8,
        existing: String,
        incoming: String,
    },
    #[error("link closed: {0}")]
    LinkClosed(String),
}

impl DriverError {
    pub(crate) fn timeout(step: impl Into<String>, after: Duration) -> Self {
        DriverError::Timeout {
            step: step.into(),
            after,
        }
    }

    /// True for acknowledgement timeouts, which abort a session but not the process.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
