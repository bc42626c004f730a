//! # Client Errors
//!
//! Purpose: One error type for every layer of the client so callers can match
//! on the failure category without downcasting.
//!
//! ## Categories
//! - **Protocol**: the server sent an error reply or a malformed frame.
//! - **Connection**: the stream ended mid-read or an IO call failed.
//! - **Timeout**: the pool could not lease a connection before the deadline.
//! - **Usage**: the caller broke a connection or pool contract.

use std::time::Duration;

use crate::connection::Mode;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error reply or malformed RESP2 frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The stream reached EOF while a reply was being read.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The pool could not lease a connection within the deadline.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),
    /// A connection or pool contract was violated.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    /// Address could not be parsed into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Client configuration could not be parsed.
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns the server's message when this is an error reply.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ClientError::Protocol(ProtocolError::ErrorReply(message)) => Some(message),
            _ => None,
        }
    }

    /// Returns true when the stream is still frame-aligned after this error.
    ///
    /// Only a fully consumed error reply qualifies; everything else leaves an
    /// unknown amount of unread data on the wire.
    pub(crate) fn keeps_stream_aligned(&self) -> bool {
        matches!(self, ClientError::Protocol(ProtocolError::ErrorReply(_)))
            || matches!(self, ClientError::Usage(_))
    }
}

/// RESP2 framing and parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// `-ERR ...` reply from the server.
    #[error("{0}")]
    ErrorReply(String),
    /// Reply began with a byte that is not a RESP2 type marker.
    #[error("invalid reply type byte: {0:#04x}")]
    InvalidType(u8),
    /// Integer or length field did not parse as a signed 64-bit integer.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),
    /// Negative length other than the `-1` absent marker.
    #[error("invalid length: {0}")]
    InvalidLength(i64),
    /// Line or bulk payload was not terminated by CRLF.
    #[error("missing CRLF terminator")]
    MissingCrlf,
    /// Arrays nested deeper than the decoder accepts.
    #[error("array nesting too deep: {0}")]
    NestingTooDeep(usize),
    /// Simple string payload was not valid UTF-8.
    #[error("simple string is not valid utf-8")]
    InvalidUtf8,
}

/// Contract violations by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// A pipeline or transaction scope is already open on this connection.
    #[error("a {active:?} scope is already active on this connection")]
    ScopeActive { active: Mode },
    /// The connection is not currently leased from this pool.
    #[error("connection {id} is not leased from this pool")]
    NotLeased { id: u64 },
    /// A previous exchange failed and left the stream in an unknown state.
    #[error("connection {id} is broken and must be discarded")]
    Broken { id: u64 },
    /// Inline commands are a single line and cannot contain CR or LF.
    #[error("inline command contains a line break")]
    InvalidInline,
}
