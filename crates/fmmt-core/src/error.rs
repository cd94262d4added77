//! Error types for the firmware volume engine.

use thiserror::Error;

use crate::format::HeaderError;

/// Coarse error classification used to decide how far a failure propagates
/// through a mutation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameter,
    NotFound,
    Aborted,
    OutOfResources,
    SectionError,
    ToolFailure,
    Io,
    Config,
}

#[derive(Error, Debug)]
pub enum FmmtError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("Section error: {0}")]
    SectionError(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FmmtError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FmmtError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            FmmtError::NotFound(_) => ErrorKind::NotFound,
            FmmtError::Aborted(_) => ErrorKind::Aborted,
            FmmtError::OutOfResources(_) => ErrorKind::OutOfResources,
            FmmtError::SectionError(_) => ErrorKind::SectionError,
            FmmtError::ToolFailure { .. } => ErrorKind::ToolFailure,
            FmmtError::Config(_) => ErrorKind::Config,
            FmmtError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn aborted(message: impl Into<String>) -> Self {
        FmmtError::Aborted(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        FmmtError::NotFound(message.into())
    }

    pub(crate) fn section(message: impl Into<String>) -> Self {
        FmmtError::SectionError(message.into())
    }
}

impl From<HeaderError> for FmmtError {
    fn from(e: HeaderError) -> Self {
        FmmtError::Aborted(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FmmtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_error_maps_to_aborted() {
        let err: FmmtError = HeaderError::BufferTooSmall {
            expected: 24,
            actual: 3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert!(err.to_string().contains("expected 24"));
    }

    #[test]
    fn test_tool_failure_display() {
        let err = FmmtError::ToolFailure {
            tool: "GenFv".into(),
            message: "exit status 2".into(),
        };
        assert_eq!(err.to_string(), "Tool 'GenFv' failed: exit status 2");
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
    }
}
