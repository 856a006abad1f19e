//! Path locks
//!
//! A [`PathLock`] is one claim on a keyspace path by a transaction. The lock
//! manager owns the authoritative copy; callers receive snapshots.
//!
//! State transitions:
//! - `Pending` → `Locked` (granted)
//! - `Pending` → removed (queue timeout, critical cascade, shutdown)
//! - `Locked` → `Released` (release, or superseded by a move)
//! - `Locked` → `Expired` (held past its expiry)
//!
//! Terminal states: `Expired`, `Released`.

use chrono::{DateTime, Utc};
use canopy_core::{LockId, LockMode, Path, Tid};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Lifecycle state of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    /// Queued, waiting for admission
    Pending,
    /// Granted and held
    Locked,
    /// Held past its expiry
    Expired,
    /// Released or superseded
    Released,
}

/// What happened to a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Request entered the queue
    Requested,
    /// Request could not be admitted yet
    Queued {
        /// Blocking lock, if the policy names one
        waiting_for: Option<LockId>,
    },
    /// Lock was granted
    Granted,
    /// Same tid acquired the same path again
    Reentered {
        /// Hold count after re-entry
        holds: u32,
    },
    /// Mode raised from read to write
    Upgraded,
    /// One hold released, lock still held
    ReleasedHold {
        /// Hold count after release
        holds: u32,
    },
    /// Lock released
    Released,
    /// Lock re-targeted in place
    Moved {
        /// Previous path
        from: Path,
        /// New path
        to: Path,
        /// New mode
        mode: LockMode,
    },
    /// Lock released so a replacement could be requested with priority
    Superseded {
        /// Path requested by the replacement
        to: Path,
    },
    /// Another lock of the same tid was folded into this one
    Merged {
        /// Absorbed lock
        from: LockId,
    },
    /// Lock expired
    Expired,
}

/// One diagnostic history record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// When it happened
    pub at: DateTime<Utc>,
    /// What happened
    pub event: HistoryEvent,
    /// Caller-supplied comment
    pub comment: String,
}

/// Bounded ring buffer of history entries
///
/// Keeps the most recent `capacity` entries; older ones are counted in
/// [`LockHistory::dropped`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    dropped: usize,
}

impl LockHistory {
    /// Empty history keeping at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        LockHistory {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn push(&mut self, event: HistoryEvent, comment: impl Into<String>) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(HistoryEntry {
            at: Utc::now(),
            event,
            comment: comment.into(),
        });
    }

    /// Retained entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of evicted entries
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }
}

/// When a granted lock expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Use the manager's configured expiry
    #[default]
    Default,
    /// Never expire
    Never,
    /// Expire after a specific duration
    After(Duration),
}

/// Per-request options for `acquire`
///
/// ```
/// use canopy_concurrency::LockOptions;
/// use std::time::Duration;
///
/// let options = LockOptions::new()
///     .timeout(Duration::from_secs(5))
///     .non_critical()
///     .comment("rebuild index");
/// assert!(!options.priority);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Maximum time to wait in the queue; `None` uses the manager default
    pub timeout: Option<Duration>,
    /// Serve ahead of non-priority requests
    pub priority: bool,
    /// Expiry of the granted lock
    pub expiry: Expiry,
    /// Whether expiry cascades to the tid's queued requests; `None` uses the
    /// manager default
    pub critical: Option<bool>,
    /// Diagnostic comment
    pub comment: String,
}

impl LockOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request priority service
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// Opt out of expiry
    pub fn no_expiry(mut self) -> Self {
        self.expiry = Expiry::Never;
        self
    }

    /// Expire after `duration` instead of the manager default
    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.expiry = Expiry::After(duration);
        self
    }

    /// Expiry does not fail the rest of the transaction
    pub fn non_critical(mut self) -> Self {
        self.critical = Some(false);
        self
    }

    /// Set the diagnostic comment
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// A claim on a path by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathLock {
    /// Process-local id
    pub id: LockId,
    /// Locked path
    pub path: Path,
    /// Owning transaction
    pub tid: Tid,
    /// Access mode
    pub mode: LockMode,
    /// Served ahead of non-priority requests
    pub priority: bool,
    /// Expiry cascades to the tid's queued requests
    pub critical: bool,
    /// Lifecycle state
    pub state: LockState,
    /// Re-entrant hold count (0 while pending)
    pub holds: u32,
    /// When the request was made
    pub requested_at: DateTime<Utc>,
    /// When the lock was granted
    pub granted_at: Option<DateTime<Utc>>,
    /// When the lock expires; `None` if it never does
    pub expires_at: Option<DateTime<Utc>>,
    /// Lock currently blocking this request
    pub waiting_for: Option<LockId>,
    /// Diagnostic comment from the request
    pub comment: String,
    /// Bounded transition log
    pub history: LockHistory,
}

impl PathLock {
    /// New pending lock
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn pending(
        id: LockId,
        path: Path,
        tid: Tid,
        mode: LockMode,
        priority: bool,
        critical: bool,
        comment: String,
        history: LockHistory,
    ) -> Self {
        let mut lock = PathLock {
            id,
            path,
            tid,
            mode,
            priority,
            critical,
            state: LockState::Pending,
            holds: 0,
            requested_at: Utc::now(),
            granted_at: None,
            expires_at: None,
            waiting_for: None,
            comment,
            history,
        };
        let comment = lock.comment.clone();
        lock.history.push(HistoryEvent::Requested, comment);
        lock
    }

    /// Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    /// Check if this lock conflicts with a claim by another transaction
    ///
    /// Locks of the same tid never conflict. Otherwise the paths must share a
    /// trail and at least one side must write.
    pub fn conflicts_with(&self, path: &Path, tid: &Tid, mode: LockMode) -> bool {
        &self.tid != tid
            && (self.mode.is_write() || mode.is_write())
            && self.path.is_on_trail_of(path)
    }

    /// Record a history event
    pub(crate) fn record(&mut self, event: HistoryEvent, comment: &str) {
        self.history.push(event, comment);
    }
}
