//! Error types for lock acquisition and peer coordination
//!
//! Every failure a caller of the lock service can observe is a [`LockError`].
//! We use `thiserror` for `Display`/`Error`, and [`LockError::error_code`]
//! gives each kind a stable code that survives the trip through the peer
//! protocol.

use crate::path::{Path, PathParseError};
use crate::types::{LockId, Tid};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Stable error codes
pub mod codes {
    /// Queued too long
    pub const LOCK_TIMEOUT: &str = "lock_timeout";
    /// Holder kept the lock past its expiry
    pub const LOCK_EXPIRED: &str = "lock_expired";
    /// Transaction already lost a critical lock
    pub const LOCK_EXPIRED_TID: &str = "lock_expired_tid";
    /// No such lock
    pub const UNKNOWN_LOCK: &str = "unknown_lock";
    /// Peer is shutting down
    pub const PEER_EXITING: &str = "peer_exiting";
    /// Message could not be delivered
    pub const TRANSPORT: &str = "transport";
    /// Path could not be used
    pub const INVALID_PATH: &str = "invalid_path";
    /// Failure relayed from another peer
    pub const REMOTE: &str = "remote";
    /// Encoding or decoding failed
    pub const SERIALIZATION: &str = "serialization";
    /// Configuration could not be loaded
    pub const CONFIG: &str = "config";
    /// Local I/O failure
    pub const IO: &str = "io";
}

/// Errors of the lock service
#[derive(Debug, Error)]
pub enum LockError {
    /// Request stayed queued longer than its timeout
    #[error("lock on {path} for tid {tid} not granted within {waited:?}")]
    Timeout {
        /// Requested path
        path: Path,
        /// Requesting transaction
        tid: Tid,
        /// Time spent queued
        waited: Duration,
    },

    /// Lock was held past its expiry
    #[error("lock {id} on {path} for tid {tid} expired")]
    Expired {
        /// Expired lock
        id: LockId,
        /// Its path
        path: Path,
        /// Owning transaction
        tid: Tid,
    },

    /// Transaction already has an expired critical lock and must abort
    #[error("transaction {tid} has an expired lock and must abort")]
    ExpiredTid {
        /// Offending transaction
        tid: Tid,
    },

    /// Release or move referenced a lock that does not exist
    #[error("unknown lock {0}")]
    UnknownLock(LockId),

    /// Request made while the peer is shutting down
    #[error("peer is exiting")]
    PeerExiting,

    /// Message could not be delivered
    #[error("transport error: {0}")]
    Transport(String),

    /// Path could not be parsed or used for the operation
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Failure reported by another peer that has no local counterpart
    #[error("remote error ({code}): {reason}")]
    Remote {
        /// Code sent by the remote peer
        code: String,
        /// Human readable reason
        reason: String,
    },

    /// Encoding/decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    /// Stable code identifying the error kind
    pub fn error_code(&self) -> &'static str {
        match self {
            LockError::Timeout { .. } => codes::LOCK_TIMEOUT,
            LockError::Expired { .. } => codes::LOCK_EXPIRED,
            LockError::ExpiredTid { .. } => codes::LOCK_EXPIRED_TID,
            LockError::UnknownLock(_) => codes::UNKNOWN_LOCK,
            LockError::PeerExiting => codes::PEER_EXITING,
            LockError::Transport(_) => codes::TRANSPORT,
            LockError::InvalidPath(_) => codes::INVALID_PATH,
            LockError::Remote { .. } => codes::REMOTE,
            LockError::Serialization(_) => codes::SERIALIZATION,
            LockError::Config(_) => codes::CONFIG,
            LockError::Io(_) => codes::IO,
        }
    }

    /// Whether retrying the same operation may succeed
    ///
    /// Expiry, unknown locks and shutdown are final for the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. } | LockError::Transport(_))
    }

    /// Whether the owning transaction must abort
    pub fn is_fatal_to_transaction(&self) -> bool {
        matches!(
            self,
            LockError::Expired { .. } | LockError::ExpiredTid { .. } | LockError::PeerExiting
        )
    }

    /// Shorthand for [`LockError::Transport`]
    pub fn transport(msg: impl Into<String>) -> Self {
        LockError::Transport(msg.into())
    }

    /// Rebuild an error received from another peer
    ///
    /// `path`, `tid` and `id` describe the request the failure answers; they
    /// fill the fields the wire form does not carry. Unknown codes become
    /// [`LockError::Remote`].
    pub fn from_code(
        code: &str,
        reason: impl Into<String>,
        path: &Path,
        tid: &Tid,
        id: Option<LockId>,
    ) -> Self {
        let reason = reason.into();
        match (code, id) {
            (codes::LOCK_TIMEOUT, _) => LockError::Timeout {
                path: path.clone(),
                tid: tid.clone(),
                waited: Duration::ZERO,
            },
            (codes::LOCK_EXPIRED, Some(id)) => LockError::Expired {
                id,
                path: path.clone(),
                tid: tid.clone(),
            },
            (codes::LOCK_EXPIRED_TID, _) => LockError::ExpiredTid { tid: tid.clone() },
            (codes::UNKNOWN_LOCK, Some(id)) => LockError::UnknownLock(id),
            (codes::PEER_EXITING, _) => LockError::PeerExiting,
            (codes::TRANSPORT, _) => LockError::Transport(reason),
            (codes::INVALID_PATH, _) => LockError::InvalidPath(reason),
            (codes::SERIALIZATION, _) => LockError::Serialization(reason),
            (codes::CONFIG, _) => LockError::Config(reason),
            _ => LockError::Remote {
                code: code.to_string(),
                reason,
            },
        }
    }
}

impl From<PathParseError> for LockError {
    fn from(e: PathParseError) -> Self {
        LockError::InvalidPath(e.to_string())
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::Serialization(e.to_string())
    }
}
