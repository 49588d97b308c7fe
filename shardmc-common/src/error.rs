//! # Error Taxonomy
//!
//! Purpose: Give every failure the client can surface a single, matchable type.
//!
//! ## Categories
//! 1. **Validation**: `InvalidKey`, `InvalidArguments`, `InvalidConfig`. Raised
//!    before any network access.
//! 2. **Protocol**: outcomes reported by a well-formed server exchange
//!    (`ItemNotFound`, `ItemExists`, `ItemNotStored`, binary status codes).
//!    The connection stays healthy and goes back to the pool.
//! 3. **Transport**: dial/read/write failures, malformed or truncated
//!    responses, and pool exhaustion/closure. The connection is discarded.

use std::fmt;
use std::io;

/// Result type shared by the whole client.
pub type McResult<T> = Result<T, McError>;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum McError {
    /// Key longer than 250 bytes, empty, or containing space/control/non-ASCII bytes.
    #[error("invalid key, key must be at most 250 bytes and can't contain blank or control characters")]
    InvalidKey,

    /// The item does not exist (cas/delete/incr/decr on a missing key).
    #[error("item is not found")]
    ItemNotFound,

    /// The item was modified since its cas token was read.
    #[error("item exists")]
    ItemExists,

    /// The store precondition failed (add on present key, replace on absent key).
    #[error("item is not stored")]
    ItemNotStored,

    /// The command is unknown to the client's operation table or to the server.
    #[error("operation is not supported")]
    OperationNotSupported,

    /// Arguments rejected locally or by the server (e.g. non-numeric delta).
    #[error("invalid arguments")]
    InvalidArguments,

    /// A binary status code with a fixed meaning not covered by the variants above.
    #[error("server error: {0}")]
    Server(ServerStatus),

    /// A binary status code outside the known table.
    #[error("server response status code error: {0:#06x}")]
    UnknownStatus(u16),

    /// The server sent bytes the codec could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Network or IO failure while dialing, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The pool is at its active-connection ceiling and has no idle connection.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Configuration rejected (unknown protocol name, empty server list, ...).
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl McError {
    /// Returns true for transport-class failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McError::Io(_) | McError::InvalidResponse(_) | McError::PoolExhausted | McError::PoolClosed
        )
    }

    /// Returns true when the connection that produced this error must not be reused.
    ///
    /// `OperationNotSupported` is included because a text server answers an
    /// unknown command with `ERROR`, after which the stream state is unknown.
    pub fn taints_connection(&self) -> bool {
        self.is_transport() || matches!(self, McError::OperationNotSupported)
    }

    /// Shorthand for building an `InvalidResponse`.
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        McError::InvalidResponse(msg.into())
    }
}

/// Binary protocol status codes that map to `McError::Server`.
///
/// Codes with a dedicated `McError` variant (not found, exists, not stored,
/// invalid arguments) never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    ValueTooLarge,
    NonNumericValue,
    WrongVbucket,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
}

impl ServerStatus {
    /// Wire status code.
    pub fn code(self) -> u16 {
        match self {
            ServerStatus::ValueTooLarge => 0x0003,
            ServerStatus::NonNumericValue => 0x0006,
            ServerStatus::WrongVbucket => 0x0007,
            ServerStatus::AuthError => 0x0008,
            ServerStatus::AuthContinue => 0x0009,
            ServerStatus::UnknownCommand => 0x0081,
            ServerStatus::OutOfMemory => 0x0082,
            ServerStatus::NotSupported => 0x0083,
            ServerStatus::InternalError => 0x0084,
            ServerStatus::Busy => 0x0085,
            ServerStatus::TemporaryFailure => 0x0086,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ServerStatus::ValueTooLarge => "value too large",
            ServerStatus::NonNumericValue => "incr/decr on non-numeric value",
            ServerStatus::WrongVbucket => "the vbucket belongs to another server",
            ServerStatus::AuthError => "authentication error",
            ServerStatus::AuthContinue => "authentication continue",
            ServerStatus::UnknownCommand => "unknown command",
            ServerStatus::OutOfMemory => "out of memory",
            ServerStatus::NotSupported => "not supported",
            ServerStatus::InternalError => "internal error",
            ServerStatus::Busy => "busy",
            ServerStatus::TemporaryFailure => "temporary failure",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#06x})", self.as_str(), self.code())
    }
}
