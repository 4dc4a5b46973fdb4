//! Domain-specific error types for nzb-fetch
//!
//! Every failure is classified so that callers can tell a cooperative abort
//! apart from a real failure, and a transient network problem apart from a
//! permanent one.

use std::path::PathBuf;
use thiserror::Error;

/// NNTP response code meaning the requested article does not exist
pub const NNTP_NO_SUCH_ARTICLE: u16 = 430;

/// Top-level error type for nzb-fetch
#[derive(Error, Debug)]
pub enum Error {
    #[error("NZB error: {0}")]
    Nzb(#[from] NzbError),

    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    #[error("yEnc error: {0}")]
    Yenc(#[from] YencError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    NativeTls(#[from] native_tls::Error),
}

impl Error {
    /// True when this error is a cooperative cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Download(DownloadError::Cancelled))
    }

    /// Whether a segment download failing with this error may be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Nntp(e) => e.is_retryable(),
            Error::Download(DownloadError::Cancelled) => false,
            _ => true,
        }
    }
}

/// NZB parsing and validation errors
#[derive(Error, Debug)]
pub enum NzbError {
    #[error("Failed to parse NZB file: {0}")]
    ParseError(String),

    #[error("Can't open NZB file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No files found in NZB")]
    EmptyNzb,

    #[error("File '{0}' declares no newsgroup")]
    MissingGroup(String),
}

/// NNTP protocol and connection errors
#[derive(Error, Debug)]
pub enum NntpError {
    #[error("Connection failed to {server}:{port}: {source}")]
    ConnectionFailed {
        server: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Socket timeout after {seconds}s while {operation}")]
    Timeout { seconds: u64, operation: &'static str },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Server responded {code} {message}")]
    Response { code: u16, message: String },

    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    #[error("Connection already established")]
    AlreadyConnected,

    #[error("Connection is not established")]
    NotConnected,

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection pool is closed")]
    PoolClosed,
}

impl NntpError {
    /// The NNTP response code carried by this error, if the server sent one
    pub fn code(&self) -> Option<u16> {
        match self {
            NntpError::Response { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Every protocol failure is retryable except a missing article
    pub fn is_retryable(&self) -> bool {
        self.code() != Some(NNTP_NO_SUCH_ARTICLE)
    }
}

/// Malformed yEnc envelopes
#[derive(Error, Debug)]
pub enum YencError {
    #[error("Missing =ybegin header line")]
    MissingHeader,

    #[error("Missing =yend trailer line")]
    MissingTrailer,

    #[error("Missing =ypart line in multi-part article")]
    MissingPart,

    #[error("Invalid field '{field}' in line: {line}")]
    InvalidField { field: &'static str, line: String },
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Server not configured")]
    NoServer,

    #[error("Invalid connection count: {count} (must be 1-100)")]
    InvalidConnections { count: u16 },

    #[error("Invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Download operation errors
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Failed to load segment {message_id} of {filename} after {attempts} attempts")]
    SegmentFailed {
        message_id: String,
        filename: String,
        attempts: u32,
    },

    #[error("Download cancelled")]
    Cancelled,
}

/// Disk and external tool failures
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Not enough disk space for {name}: {needed} bytes needed, {available} available")]
    InsufficientSpace {
        name: String,
        needed: u64,
        available: u64,
    },

    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("{tool} not found, is it installed?")]
    ToolNotFound { tool: String },

    #[error("External tools are shut down")]
    ToolsShutdown,
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NntpError::Response {
            code: 430,
            message: "No such article".to_string(),
        };
        assert_eq!(err.to_string(), "Server responded 430 No such article");
    }

    #[test]
    fn test_retry_classification() {
        let missing: Error = NntpError::Response {
            code: NNTP_NO_SUCH_ARTICLE,
            message: String::new(),
        }
        .into();
        assert!(!missing.is_retryable());

        let busy: Error = NntpError::Response {
            code: 400,
            message: "busy".to_string(),
        }
        .into();
        assert!(busy.is_retryable());

        let timeout: Error = NntpError::Timeout {
            seconds: 10,
            operation: "reading",
        }
        .into();
        assert!(timeout.is_retryable());

        let cancelled: Error = DownloadError::Cancelled.into();
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_retryable());
    }
}
