//! Error types for the MPQ library

use std::io;
use thiserror::Error;

/// Primary error type for MPQ operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("disk full")]
    DiskFull,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("buffer too small: need {needed} bytes, have {have}")]
    InsufficientBuffer { needed: usize, have: usize },

    #[error("not an MPQ archive: {0}")]
    BadFormat(String),

    #[error("no more files")]
    NoMoreFiles,

    #[error("end of file")]
    EndOfFile,

    #[error("operation cannot be completed: {0}")]
    CannotComplete(String),

    #[error("archive is corrupt: {0}")]
    FileCorrupt(String),

    #[error("encryption key for {0} could not be determined")]
    UnknownFileKey(String),

    #[error("checksum mismatch: {0}")]
    ChecksumError(String),

    #[error("operation not allowed on internal file {0}")]
    InternalFile(String),

    #[error("base file missing for incremental patch: {0}")]
    BaseFileMissing(String),

    #[error("file is marked for deletion: {0}")]
    MarkedForDelete(String),

    #[error("file is incomplete in the local copy")]
    FileIncomplete,

    #[error("archive contains entries with unknown names")]
    UnknownFileNames,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("archive has no signature")]
    NoSignature,

    #[error("weak signature verification failed")]
    WeakSignatureError,

    #[error("strong signature verification failed")]
    StrongSignatureError,

    #[error("secure signature verification failed")]
    SecureSignatureError,

    #[error("verification failed: {0}")]
    VerifyFailed(String),
}

impl Error {
    /// Shorthand for a `BadFormat` error
    pub fn bad_format<S: Into<String>>(msg: S) -> Self {
        Error::BadFormat(msg.into())
    }

    /// Shorthand for a `FileCorrupt` error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Error::FileCorrupt(msg.into())
    }

    /// Shorthand for an `InvalidParameter` error
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Shorthand for a `Compression` error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Error::Compression(msg.into())
    }

    /// Shorthand for a `ChecksumError`
    pub fn checksum<S: Into<String>>(msg: S) -> Self {
        Error::ChecksumError(msg.into())
    }

    /// Shorthand for a `NotSupported` error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::NotSupported(msg.into())
    }
}

/// Result type for MPQ operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::NotFound("war3map.j".to_string());
        assert_eq!(err.to_string(), "file not found: war3map.j");

        let err = Error::UnknownFileKey("(unknown)".to_string());
        assert!(err.to_string().contains("(unknown)"));
    }
}
