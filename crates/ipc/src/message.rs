//! Peer protocol messages
//!
//! Every message is one JSON object:
//!
//! ```text
//! { "type": "<kebab-case>", "from": "<peer id>", "to": "<peer id>" | null, ... }
//! ```
//!
//! `to = null` is a broadcast. Request/reply pairs are correlated by a
//! per-sender `id`.

use canopy_concurrency::PathLock;
use canopy_core::{LockError, LockId, LockMode, Path, PeerId, Tid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates a request with its reply
pub type RequestId = u64;

/// Protocol envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender
    pub from: PeerId,
    /// Recipient; `None` broadcasts
    #[serde(default)]
    pub to: Option<PeerId>,
    /// Type tag and payload
    #[serde(flatten)]
    pub body: Body,
}

impl Message {
    /// Message for every other participant
    pub fn broadcast(from: PeerId, body: Body) -> Self {
        Message {
            from,
            to: None,
            body,
        }
    }

    /// Message for one participant
    pub fn unicast(from: PeerId, to: PeerId, body: Body) -> Self {
        Message {
            from,
            to: Some(to),
            body,
        }
    }

    /// Check if `peer` should process this message
    pub fn is_for(&self, peer: &PeerId) -> bool {
        self.from != *peer && self.to.as_ref().map_or(true, |to| to == peer)
    }
}

/// Message payloads, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Body {
    /// Presence announcement, also sent as a reply to an unseen peer
    Hello,
    /// Clean departure
    Bye,
    /// Periodic liveness signal
    Pulse,
    /// Worker asks the master for a lock
    LockRequest {
        /// Request id
        id: RequestId,
        /// What to lock
        data: LockRequestData,
    },
    /// Master answers a lock or move request
    LockResult(Reply<LockGrant>),
    /// Worker releases a lock held through the master
    UnlockRequest {
        /// Request id
        id: RequestId,
        /// Which lock
        data: UnlockData,
    },
    /// Master answers an unlock request
    UnlockResult(Reply<UnlockData>),
    /// Worker re-targets a lock held through the master
    MoveLockRequest {
        /// Request id
        id: RequestId,
        /// Move description
        data: MoveData,
    },
    /// Ask the recipient to relay matching change events
    Subscribe {
        /// Subscription
        data: Subscription,
    },
    /// Withdraw a subscription
    Unsubscribe {
        /// Subscription
        data: Subscription,
    },
    /// Relayed change event
    Event {
        /// The change
        data: ChangeEvent,
    },
    /// Application request
    Request {
        /// Request id
        id: RequestId,
        /// Application payload
        data: Value,
    },
    /// Application reply
    #[serde(rename = "result")]
    Reply(Reply<Value>),
    /// Application broadcast
    Notification {
        /// Application payload
        data: Value,
    },
}

impl Body {
    /// Wire `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Hello => "hello",
            Body::Bye => "bye",
            Body::Pulse => "pulse",
            Body::LockRequest { .. } => "lock-request",
            Body::LockResult(_) => "lock-result",
            Body::UnlockRequest { .. } => "unlock-request",
            Body::UnlockResult(_) => "unlock-result",
            Body::MoveLockRequest { .. } => "move-lock-request",
            Body::Subscribe { .. } => "subscribe",
            Body::Unsubscribe { .. } => "unsubscribe",
            Body::Event { .. } => "event",
            Body::Request { .. } => "request",
            Body::Reply(_) => "result",
            Body::Notification { .. } => "notification",
        }
    }

    /// Id of the request this body answers, if it is a reply
    pub fn reply_id(&self) -> Option<RequestId> {
        match self {
            Body::LockResult(r) => Some(r.id),
            Body::UnlockResult(r) => Some(r.id),
            Body::Reply(r) => Some(r.id),
            _ => None,
        }
    }
}

/// Payload of `lock-request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequestData {
    /// Requested path
    pub path: Path,
    /// Write mode
    pub write: bool,
    /// Requesting transaction
    pub tid: Tid,
    /// Diagnostic comment
    #[serde(default)]
    pub comment: String,
}

/// Payload of `unlock-request` and `unlock-result`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockData {
    /// Master's lock id
    pub id: LockId,
}

/// Where a `move-lock-request` goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveTarget {
    /// The lock's parent path
    Parent,
    /// The explicit `path`
    Path,
}

/// Payload of `move-lock-request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveData {
    /// Master's lock id
    pub id: LockId,
    /// Target kind
    pub move_to: MoveTarget,
    /// Target path when `move_to` is `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    /// Target mode; `None` keeps the current one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<bool>,
}

/// Lock as described on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    /// Master's lock id
    pub id: LockId,
    /// Locked path
    pub path: Path,
    /// Write mode
    pub write: bool,
    /// Owning transaction as known to the requester
    pub tid: Tid,
    /// Expiry as Unix epoch milliseconds
    pub expires: Option<i64>,
    /// Diagnostic comment
    #[serde(default)]
    pub comment: String,
}

impl LockGrant {
    /// Describe a manager lock, reporting `tid` as its owner
    pub fn from_lock(lock: &PathLock, tid: Tid) -> Self {
        LockGrant {
            id: lock.id,
            path: lock.path.clone(),
            write: lock.mode.is_write(),
            tid,
            expires: lock.expires_at.map(|at| at.timestamp_millis()),
            comment: lock.comment.clone(),
        }
    }

    /// Access mode
    pub fn mode(&self) -> LockMode {
        LockMode::from_write_flag(self.write)
    }
}

/// Outcome of a request
///
/// Serializes as `id, ok, reason?, code?, data?` next to the envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Reply<T> {
    /// Request id being answered
    pub id: RequestId,
    /// Whether the request succeeded
    pub ok: bool,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Stable failure code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    /// Successful reply
    pub fn success(id: RequestId, data: T) -> Self {
        Reply {
            id,
            ok: true,
            reason: None,
            code: None,
            data: Some(data),
        }
    }

    /// Failed reply carrying the error's code
    pub fn failure(id: RequestId, error: &LockError) -> Self {
        Reply {
            id,
            ok: false,
            reason: Some(error.to_string()),
            code: Some(error.error_code().to_string()),
            data: None,
        }
    }

    /// Convert into a `Result`, rebuilding remote errors with the request's
    /// context
    pub fn into_result(self, path: &Path, tid: &Tid, lock: Option<LockId>) -> canopy_core::Result<T> {
        if !self.ok {
            let reason = self.reason.unwrap_or_default();
            let code = self
                .code
                .unwrap_or_else(|| canopy_core::error::codes::REMOTE.to_string());
            return Err(LockError::from_code(&code, reason, path, tid, lock));
        }
        self.data
            .ok_or_else(|| LockError::Serialization("successful reply without data".to_string()))
    }
}

/// Subscription to change events at or below a path pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Path pattern; `*` and `$name` segments match anything
    pub path: Path,
    /// Event name, e.g. `value` or `child_added`
    pub event: String,
}

impl Subscription {
    /// New subscription
    pub fn new(path: Path, event: impl Into<String>) -> Self {
        Subscription {
            path,
            event: event.into(),
        }
    }

    /// Check if a change event should be delivered for this subscription
    pub fn covers(&self, change: &ChangeEvent) -> bool {
        if self.event != change.event || change.path.len() < self.path.len() {
            return false;
        }
        let prefix = Path::from_segments(change.path.segments()[..self.path.len()].to_vec());
        prefix.matches(&self.path)
    }
}

/// A data change produced by the storage layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Changed path
    pub path: Path,
    /// Event name
    pub event: String,
    /// New value
    #[serde(default)]
    pub val: Value,
    /// Previous value
    #[serde(default)]
    pub previous: Value,
    /// Caller context
    #[serde(default)]
    pub context: Value,
}
