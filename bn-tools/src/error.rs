use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ToolError {
    /// The stand-in text shown to the model in place of command output.
    pub fn to_stand_in(&self) -> String {
        match self {
            Self::Unauthorized(reason) | Self::InvalidArguments(reason) => {
                format!("[Blocked: {reason}]")
            }
            Self::Timeout(limit) => format!("[Command timed out after {limit:?}]"),
            Self::ExecutionFailed(e) | Self::Io(e) => format!("[Command error: {e}]"),
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
