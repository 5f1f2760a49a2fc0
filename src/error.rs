//! Error types.
//!
//! Every [`ConnectionError`] is fatal to the connection it came from; nothing
//! here ever crosses a connection boundary.

use crate::protocol::RecordType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A malformed or unsupported record.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid FastCGI protocol version: {0}")]
    Version(u8),

    #[error("unknown record type: {0}")]
    UnknownRecordType(u8),

    #[error("unexpected {0:?} record")]
    UnexpectedRecord(RecordType),

    #[error("FCGI_BeginRequestBody is the wrong length: {0}")]
    BeginRequestLength(u16),

    #[error("unsupported FastCGI role: {0}")]
    UnsupportedRole(u16),

    #[error("out of order {record:?} record for request {request_id}, or client is multiplexing requests")]
    OutOfOrder {
        record: RecordType,
        request_id: u16,
    },

    #[error("FCGI_PARAMS entry missing {missing}")]
    TruncatedParam { missing: &'static str },
}

/// Reason a connection is being closed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed connection")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request of {needed} bytes exceeds limit of {limit} bytes")]
    Capacity { needed: usize, limit: usize },

    #[error("response write failed")]
    OutputFailed,
}

/// Failure of a response-writing operation on a request.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("header written after response body")]
    HeaderAfterBody,

    #[error("request already ended")]
    Ended,

    #[error("response output already failed")]
    Failed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
