use std::time::Duration;

use thiserror::Error;

use crate::data::DataError;
use crate::workflow::posting::ProcessingState;

pub type Result<T, E = AutomationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AutomationError {
    /// The accessibility or capture backend could not complete a call.
    #[error("surface error: {0}")]
    Surface(String),
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("action failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("expected control missing: {0}")]
    ControlMissing(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid state transition {from:?} -> {to:?}")]
    Transition {
        from: ProcessingState,
        to: ProcessingState,
    },
    #[error("configuration error: {0}")]
    Config(String),
    /// Cannot start, attach to, or find the target application at all.
    #[error("environment failure: {0}")]
    Environment(String),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AutomationError {
    pub fn surface(message: impl Into<String>) -> Self {
        Self::Surface(message.into())
    }

    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Failures that stop the whole run instead of the current company or entry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Environment(_) | Self::Config(_))
    }
}
