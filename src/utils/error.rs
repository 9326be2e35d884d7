//! Error Handling Module
//!
//! Defines the error type shared by every part of the SegMix library.
//! Uses thiserror for ergonomic error definitions; the binary wraps these in
//! `anyhow` at the command boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for SegMix operations
#[derive(Error, Debug)]
pub enum SegMixError {
    /// Error loading or decoding an image or mask
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with dataset operations (id lists, sample lookup)
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error during a training step
    #[error("Training error: {0}")]
    Training(String),

    /// Barrier or all-reduce failure between workers
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Checkpoint write or delete failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Feature not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

/// Convenience Result type for SegMix operations
pub type Result<T> = std::result::Result<T, SegMixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SegMixError::NotImplemented("Dice criterion is not implemented".to_string());
        assert_eq!(
            format!("{}", err),
            "Not implemented: Dice criterion is not implemented"
        );
    }

    #[test]
    fn test_image_load_error() {
        let path = PathBuf::from("/data/JPEGImages/2007_000032.jpg");
        let err = SegMixError::ImageLoad(path, "file not found".to_string());
        assert!(format!("{}", err).contains("2007_000032.jpg"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: SegMixError = io.into();
        assert!(matches!(err, SegMixError::Io(_)));
    }
}
