//! Error types for keymend-core
//!
//! Every fallible operation in this crate returns [`KvError`]. Expected
//! per-key outcomes (key missing, key already present, CAS conflict) are
//! *not* errors; they are reported through the outcome enums in
//! [`crate::node`].

use std::io;
use thiserror::Error;

use crate::protocol::{Opcode, Status};

/// Main error type for KV operations
#[derive(Error, Debug)]
pub enum KvError {
    /// Node unreachable, connection dropped, or a request timed out
    #[error("Connection error: {0}")]
    Connection(String),

    /// SASL authentication or bucket selection was rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The cluster map cannot be used to route requests
    #[error("Inconsistent cluster config: {0}")]
    ConfigInconsistency(String),

    /// Caller supplied an out-of-range value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed or unexpected bytes on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with a status the caller does not handle
    #[error("Server returned {status} for {opcode}")]
    Server {
        /// Request opcode
        opcode: Opcode,
        /// Response status
        status: Status,
    },

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration parsing error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for KV operations
pub type Result<T> = std::result::Result<T, KvError>;

impl KvError {
    /// Returns true if this error must abort the whole run
    ///
    /// Protocol and server-status errors are scoped to the request that
    /// produced them; everything else means the cluster (or our view of
    /// it) cannot be trusted any more.
    #[cold]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KvError::Protocol(_) | KvError::Server { .. })
    }

    /// Returns true if the error originated on the network path
    pub fn is_connection(&self) -> bool {
        matches!(self, KvError::Connection(_) | KvError::Io(_))
    }
}
