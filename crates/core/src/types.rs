//! Identifier and mode types shared by the lock manager and the peer protocol

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Transaction identifier
///
/// Groups lock requests that cooperate: locks held by the same tid never
/// conflict with each other. Tids are opaque strings so that coordinating
/// callers (or remote processes) can supply their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(String);

impl Tid {
    /// Wrap a caller-supplied identifier
    pub fn new(id: impl Into<String>) -> Self {
        Tid(id.into())
    }

    /// The identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for Tid {
    fn from(n: u64) -> Self {
        Tid(n.to_string())
    }
}

impl From<&str> for Tid {
    fn from(s: &str) -> Self {
        Tid(s.to_string())
    }
}

impl From<String> for Tid {
    fn from(s: String) -> Self {
        Tid(s)
    }
}

/// Allocates transaction ids from a monotonically increasing counter
///
/// This is the `createTid()` service the storage layer hands out. Ids are
/// unique for the lifetime of the generator.
#[derive(Debug)]
pub struct TidGenerator {
    next: AtomicU64,
}

impl TidGenerator {
    /// Create a generator whose first id is `1`
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a generator whose first id is `first`
    pub fn starting_at(first: u64) -> Self {
        TidGenerator {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate a fresh tid
    pub fn create_tid(&self) -> Tid {
        Tid::from(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Access mode of a lock
///
/// Ordered `Read < Write`, so `a.max(b)` is the stronger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Shared access
    Read,
    /// Exclusive access
    Write,
}

impl LockMode {
    /// `Write` for true, `Read` for false (the wire protocol's `write` flag)
    pub fn from_write_flag(write: bool) -> Self {
        if write {
            LockMode::Write
        } else {
            LockMode::Read
        }
    }

    /// Check if this is write mode
    pub fn is_write(self) -> bool {
        self == LockMode::Write
    }

    /// Check if a lock held in this mode satisfies a request for `requested`
    pub fn covers(self, requested: LockMode) -> bool {
        self == LockMode::Write || requested == LockMode::Read
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Process-local lock identifier
///
/// Allocated by the lock manager from a monotonically increasing counter.
/// A worker refers to a proxied lock by the id the master assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a coordination peer
///
/// Generated locally at peer start. Ordering is lexicographic on the text
/// form; the broadcast transport elects the lowest id as master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random peer id
    pub fn generate() -> Self {
        PeerId(Uuid::new_v4().to_string())
    }

    /// Use a fixed id (tests, deterministic deployments)
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// The id text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_generator_is_monotonic() {
        let tids = TidGenerator::new();
        assert_eq!(tids.create_tid(), Tid::from(1));
        assert_eq!(tids.create_tid(), Tid::from(2));

        let resumed = TidGenerator::starting_at(100);
        assert_eq!(resumed.create_tid().as_str(), "100");
    }

    #[test]
    fn test_mode_coverage() {
        assert!(LockMode::Write.covers(LockMode::Read));
        assert!(LockMode::Write.covers(LockMode::Write));
        assert!(LockMode::Read.covers(LockMode::Read));
        assert!(!LockMode::Read.covers(LockMode::Write));
        assert_eq!(LockMode::Read.max(LockMode::Write), LockMode::Write);
        assert_eq!(LockMode::from_write_flag(false), LockMode::Read);
    }

    #[test]
    fn test_peer_ids_are_unique() {
        assert_ne!(PeerId::generate(), PeerId::generate());
        assert!(PeerId::new("a") < PeerId::new("b"));
    }

    #[test]
    fn test_serde_shapes() {
        assert_eq!(serde_json::to_string(&Tid::from(7)).unwrap(), "\"7\"");
        assert_eq!(serde_json::to_string(&LockId(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&LockMode::Write).unwrap(), "\"write\"");
    }
}
