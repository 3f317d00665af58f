//! Error types for VDC operations

use thiserror::Error;

/// Main error type for VDC operations
#[derive(Error, Debug)]
pub enum VdcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid container format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u32),

    #[error("Not in define mode: {0}")]
    NotDefineMode(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid compression parameters: {0}")]
    InvalidCompression(String),

    #[error("Invalid hyperslab: {0}")]
    InvalidHyperslab(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Thread error: {0}")]
    Thread(String),
}

/// Broad classification of a [`VdcError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse: bad definitions, bad arguments, wrong mode
    Usage,
    /// Underlying container or filesystem failure
    Storage,
    /// Worker threads could not be started or completed
    Resource,
}

impl VdcError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VdcError::Io(_)
            | VdcError::InvalidFormat(_)
            | VdcError::UnsupportedVersion(_)
            | VdcError::Compression(_)
            | VdcError::Decompression(_)
            | VdcError::Serialization(_) => ErrorKind::Storage,
            VdcError::Thread(_) => ErrorKind::Resource,
            _ => ErrorKind::Usage,
        }
    }
}

/// Specialized Result type for VDC operations
pub type Result<T> = std::result::Result<T, VdcError>;

impl From<bincode::Error> for VdcError {
    fn from(err: bincode::Error) -> Self {
        VdcError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdcError {
    fn from(err: serde_json::Error) -> Self {
        VdcError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            VdcError::NotDefineMode("x".to_string()).kind(),
            ErrorKind::Usage
        );
        assert_eq!(
            VdcError::InvalidFormat("bad magic".to_string()).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            VdcError::Thread("spawn".to_string()).kind(),
            ErrorKind::Resource
        );
    }

    #[test]
    fn test_error_message() {
        let err = VdcError::NotFound("variable temp".to_string());
        assert_eq!(err.to_string(), "Not found: variable temp");
    }
}
