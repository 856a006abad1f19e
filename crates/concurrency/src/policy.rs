//! Admission policies
//!
//! The lock manager asks its [`AdmissionPolicy`] whether a claim may be
//! granted given the currently Locked set. Two policies exist:
//!
//! - [`CoarsePolicy`]: the whole keyspace is one readers-writer lock. O(1)
//!   per decision, but unrelated writes anywhere in the tree serialize.
//! - [`HierarchicalPolicy`]: a claim conflicts only with locks of other
//!   transactions on the same path trail where at least one side writes.
//!   O(n) over the Locked set, but writers on disjoint subtrees proceed
//!   concurrently.
//!
//! Policies see only Locked locks; pending requests never block each other.

use crate::lock::PathLock;
use canopy_core::{LockId, LockMode, Path, PolicyKind, Tid};
use std::collections::HashMap;
use std::fmt;

/// A request to be admitted
#[derive(Debug, Clone, Copy)]
pub struct Claim<'a> {
    /// Requested path
    pub path: &'a Path,
    /// Requesting transaction
    pub tid: &'a Tid,
    /// Requested mode
    pub mode: LockMode,
    /// Lock being re-targeted by a move; its own claim is ignored
    pub replacing: Option<&'a PathLock>,
}

impl<'a> Claim<'a> {
    /// Claim for a fresh request
    pub fn new(path: &'a Path, tid: &'a Tid, mode: LockMode) -> Self {
        Claim {
            path,
            tid,
            mode,
            replacing: None,
        }
    }

    /// Claim that replaces an existing lock
    pub fn replacing(mut self, lock: &'a PathLock) -> Self {
        self.replacing = Some(lock);
        self
    }
}

/// Policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Grant now
    Admit,
    /// Keep queued
    Block {
        /// Lock responsible, when the policy can name one
        by: Option<LockId>,
    },
}

impl Admission {
    /// Check if the claim was admitted
    pub fn is_admit(&self) -> bool {
        matches!(self, Admission::Admit)
    }
}

/// Strategy deciding which claims may be granted
///
/// The manager calls [`AdmissionPolicy::on_grant`] whenever a lock enters
/// the Locked set and [`AdmissionPolicy::on_release`] whenever one leaves it
/// (release, expiry, or the old footprint of a moved/upgraded lock), so
/// policies may keep incremental state.
pub trait AdmissionPolicy: Send + fmt::Debug {
    /// Which policy this is
    fn kind(&self) -> PolicyKind;

    /// Decide on a claim
    ///
    /// `active` yields the Locked set without `claim.replacing`.
    fn check<'a>(
        &self,
        claim: &Claim<'_>,
        active: &mut dyn Iterator<Item = &'a PathLock>,
    ) -> Admission;

    /// A lock entered the Locked set
    fn on_grant(&mut self, lock: &PathLock);

    /// A lock left the Locked set
    fn on_release(&mut self, lock: &PathLock);
}

/// Build the policy selected by configuration
pub fn policy_for(kind: PolicyKind) -> Box<dyn AdmissionPolicy> {
    match kind {
        PolicyKind::Coarse => Box::new(CoarsePolicy::default()),
        PolicyKind::Hierarchical => Box::new(HierarchicalPolicy),
    }
}

/// Whole-tree readers-writer lock
///
/// Tracks the writer tid (with the number of write locks it holds) and read
/// lock counts per tid. A tid's own reads never block its write, and the
/// writer may take further reads and writes re-entrantly.
#[derive(Debug, Default)]
pub struct CoarsePolicy {
    writer: Option<(Tid, usize)>,
    readers: HashMap<Tid, usize>,
    total_readers: usize,
}

impl CoarsePolicy {
    /// Current writer, if any
    pub fn writer(&self) -> Option<&Tid> {
        self.writer.as_ref().map(|(tid, _)| tid)
    }

    /// Number of Locked read locks
    pub fn active_readers(&self) -> usize {
        self.total_readers
    }

    fn writer_excluding(&self, replacing: Option<&PathLock>) -> Option<&Tid> {
        match (&self.writer, replacing) {
            (Some((tid, 1)), Some(lock)) if lock.mode.is_write() && &lock.tid == tid => None,
            (Some((tid, _)), _) => Some(tid),
            (None, _) => None,
        }
    }

    fn foreign_readers(&self, tid: &Tid) -> usize {
        self.total_readers - self.readers.get(tid).copied().unwrap_or(0)
    }
}

impl AdmissionPolicy for CoarsePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Coarse
    }

    fn check<'a>(
        &self,
        claim: &Claim<'_>,
        _active: &mut dyn Iterator<Item = &'a PathLock>,
    ) -> Admission {
        let writer = self.writer_excluding(claim.replacing);
        let admitted = match (claim.mode, writer) {
            (_, Some(tid)) => tid == claim.tid,
            (LockMode::Read, None) => true,
            // A moving lock of the same tid never counts as a foreign reader
            (LockMode::Write, None) => self.foreign_readers(claim.tid) == 0,
        };
        if admitted {
            Admission::Admit
        } else {
            Admission::Block { by: None }
        }
    }

    fn on_grant(&mut self, lock: &PathLock) {
        match lock.mode {
            LockMode::Write => match &mut self.writer {
                Some((_, count)) => *count += 1,
                None => self.writer = Some((lock.tid.clone(), 1)),
            },
            LockMode::Read => {
                *self.readers.entry(lock.tid.clone()).or_insert(0) += 1;
                self.total_readers += 1;
            }
        }
    }

    fn on_release(&mut self, lock: &PathLock) {
        match lock.mode {
            LockMode::Write => {
                if let Some((_, count)) = &mut self.writer {
                    *count -= 1;
                    if *count == 0 {
                        self.writer = None;
                    }
                }
            }
            LockMode::Read => {
                if let Some(count) = self.readers.get_mut(&lock.tid) {
                    *count -= 1;
                    if *count == 0 {
                        self.readers.remove(&lock.tid);
                    }
                    self.total_readers -= 1;
                }
            }
        }
    }
}

/// Per-trail conflict detection
///
/// Stateless: every decision scans the Locked set.
#[derive(Debug, Default, Clone, Copy)]
pub struct HierarchicalPolicy;

impl AdmissionPolicy for HierarchicalPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Hierarchical
    }

    fn check<'a>(
        &self,
        claim: &Claim<'_>,
        active: &mut dyn Iterator<Item = &'a PathLock>,
    ) -> Admission {
        let mut blocker = None;
        for lock in active {
            if &lock.tid == claim.tid {
                // Own write lock at or above the path: nobody else can hold
                // anything below it
                if lock.mode.is_write() && lock.path.is_ancestor_of(claim.path) {
                    return Admission::Admit;
                }
                continue;
            }
            if blocker.is_none() && lock.conflicts_with(claim.path, claim.tid, claim.mode) {
                blocker = Some(lock.id);
            }
        }
        match blocker {
            Some(id) => Admission::Block { by: Some(id) },
            None => Admission::Admit,
        }
    }

    fn on_grant(&mut self, _lock: &PathLock) {}

    fn on_release(&mut self, _lock: &PathLock) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockHistory, LockState};

    fn locked(id: u64, path: &str, tid: u64, mode: LockMode) -> PathLock {
        let mut lock = PathLock::pending(
            LockId(id),
            path.parse().unwrap(),
            Tid::from(tid),
            mode,
            false,
            true,
            String::new(),
            LockHistory::with_capacity(1),
        );
        lock.state = LockState::Locked;
        lock.holds = 1;
        lock
    }

    fn check(
        policy: &dyn AdmissionPolicy,
        active: &[PathLock],
        path: &str,
        tid: u64,
        mode: LockMode,
    ) -> Admission {
        let path: Path = path.parse().unwrap();
        let tid = Tid::from(tid);
        policy.check(&Claim::new(&path, &tid, mode), &mut active.iter())
    }

    fn granted(policy: &mut dyn AdmissionPolicy, locks: &[PathLock]) {
        for lock in locks {
            policy.on_grant(lock);
        }
    }

    #[test]
    fn test_hierarchical_disjoint_writers() {
        let active = vec![locked(1, "users/1", 1, LockMode::Write)];
        let policy = HierarchicalPolicy;
        assert!(check(&policy, &active, "users/2", 2, LockMode::Write).is_admit());
        assert!(check(&policy, &active, "posts", 2, LockMode::Write).is_admit());
    }

    #[test]
    fn test_hierarchical_trail_conflicts_name_blocker() {
        let active = vec![locked(7, "users", 1, LockMode::Write)];
        let policy = HierarchicalPolicy;
        assert_eq!(
            check(&policy, &active, "users/42", 2, LockMode::Read),
            Admission::Block { by: Some(LockId(7)) }
        );
        assert_eq!(
            check(&policy, &active, "", 2, LockMode::Read),
            Admission::Block { by: Some(LockId(7)) }
        );
    }

    #[test]
    fn test_hierarchical_readers_share() {
        let active = vec![locked(1, "users", 1, LockMode::Read)];
        let policy = HierarchicalPolicy;
        assert!(check(&policy, &active, "users/42", 2, LockMode::Read).is_admit());
        assert!(!check(&policy, &active, "users/42", 2, LockMode::Write).is_admit());
    }

    #[test]
    fn test_hierarchical_own_write_admits_descent() {
        let active = vec![locked(1, "a/b", 1, LockMode::Write)];
        assert!(check(&HierarchicalPolicy, &active, "a/b/c", 1, LockMode::Write).is_admit());
        assert!(!check(&HierarchicalPolicy, &active, "a/b/c", 2, LockMode::Read).is_admit());
    }

    #[test]
    fn test_hierarchical_own_descendant_write_does_not_admit_ancestor() {
        let active = vec![
            locked(1, "a/b/c", 1, LockMode::Write),
            locked(2, "a/b/x", 2, LockMode::Write),
        ];
        assert_eq!(
            check(&HierarchicalPolicy, &active, "a/b", 1, LockMode::Write),
            Admission::Block { by: Some(LockId(2)) }
        );
    }

    #[test]
    fn test_coarse_single_writer() {
        let mut policy = CoarsePolicy::default();
        let writer = locked(1, "a", 1, LockMode::Write);
        granted(&mut policy, std::slice::from_ref(&writer));

        assert_eq!(policy.writer(), Some(&Tid::from(1)));
        assert!(!check(&policy, &[], "zzz", 2, LockMode::Write).is_admit());
        assert!(!check(&policy, &[], "zzz", 2, LockMode::Read).is_admit());
        // re-entrant for the writer
        assert!(check(&policy, &[], "b", 1, LockMode::Write).is_admit());
        assert!(check(&policy, &[], "b", 1, LockMode::Read).is_admit());

        policy.on_release(&writer);
        assert_eq!(policy.writer(), None);
        assert!(check(&policy, &[], "zzz", 2, LockMode::Write).is_admit());
    }

    #[test]
    fn test_coarse_readers_block_foreign_writer_only() {
        let mut policy = CoarsePolicy::default();
        granted(
            &mut policy,
            &[locked(1, "a", 1, LockMode::Read), locked(2, "b", 2, LockMode::Read)],
        );
        assert_eq!(policy.active_readers(), 2);
        assert!(check(&policy, &[], "c", 3, LockMode::Read).is_admit());
        assert!(!check(&policy, &[], "c", 3, LockMode::Write).is_admit());
        // tid 1 still sees tid 2's read
        assert!(!check(&policy, &[], "a", 1, LockMode::Write).is_admit());
    }

    #[test]
    fn test_coarse_own_reads_allow_upgrade() {
        let mut policy = CoarsePolicy::default();
        let read = locked(1, "a", 1, LockMode::Read);
        granted(&mut policy, std::slice::from_ref(&read));
        assert!(check(&policy, &[], "a", 1, LockMode::Write).is_admit());
    }

    #[test]
    fn test_coarse_replacing_own_write_frees_slot() {
        let mut policy = CoarsePolicy::default();
        let write = locked(1, "a/b", 1, LockMode::Write);
        granted(&mut policy, std::slice::from_ref(&write));

        let path: Path = "a".parse().unwrap();
        let tid = Tid::from(1);
        let claim = Claim::new(&path, &tid, LockMode::Read).replacing(&write);
        assert!(policy.check(&claim, &mut std::iter::empty::<&PathLock>()).is_admit());
    }

    #[test]
    fn test_policy_for_kind() {
        assert_eq!(policy_for(PolicyKind::Coarse).kind(), PolicyKind::Coarse);
        assert_eq!(
            policy_for(PolicyKind::Hierarchical).kind(),
            PolicyKind::Hierarchical
        );
    }
}
