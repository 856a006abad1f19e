//! Path lock manager
//!
//! Single-process authority that grants, queues, expires and releases
//! [`PathLock`]s according to an [`AdmissionPolicy`].
//!
//! ## Queue evaluation
//!
//! ```text
//! 1. acquire() enqueues the request (re-entrant requests short-circuit)
//! 2. process_queue() visits pending requests by (priority desc, arrival asc)
//! 3. every admissible request is granted in the same pass
//! 4. release / expiry / an in-place move run step 2 again
//! ```
//!
//! All decisions and mutations for one step happen under a single
//! `parking_lot::Mutex` that is never held across an `.await`, so a decision
//! can never be invalidated before its effect is recorded.
//!
//! ## Timers
//!
//! Expiry timers and queue timeouts use the tokio timer, so the manager must
//! be driven from within a tokio runtime.

use crate::lock::{Expiry, HistoryEvent, LockHistory, LockOptions, LockState, PathLock};
use crate::policy::{policy_for, Admission, AdmissionPolicy, Claim};
use canopy_core::{LockConfig, LockError, LockId, LockMode, Path, PolicyKind, Result, Tid};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to the lock manager
///
/// Cheap to clone; all clones share one lock table.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: LockConfig,
    state: Mutex<State>,
}

/// Queue position: priority requests first, then arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    rank: u8,
    seq: u64,
}

pub(crate) type Waiter = oneshot::Sender<Result<PathLock>>;

struct PendingRequest {
    lock: PathLock,
    expiry: Option<Duration>,
    /// Holds the lock starts with once granted
    holds: u32,
    waiter: Waiter,
}

struct ActiveLock {
    lock: PathLock,
    expiry: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl ActiveLock {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub(crate) struct State {
    policy: Box<dyn AdmissionPolicy>,
    active: BTreeMap<LockId, ActiveLock>,
    pending: BTreeMap<QueueKey, PendingRequest>,
    /// Kept until `release` of that id, `release_tid` of its tid or `release_all`
    expired: HashMap<LockId, PathLock>,
    owned: HashMap<(Tid, Path), LockId>,
    next_id: u64,
    next_seq: u64,
}

impl State {
    fn new(policy: Box<dyn AdmissionPolicy>) -> Self {
        State {
            policy,
            active: BTreeMap::new(),
            pending: BTreeMap::new(),
            expired: HashMap::new(),
            owned: HashMap::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    fn next_lock_id(&mut self) -> LockId {
        let id = LockId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn check(&self, claim: &Claim<'_>) -> Admission {
        let exclude = claim.replacing.map(|l| l.id);
        let mut active = self
            .active
            .values()
            .map(|a| &a.lock)
            .filter(|l| Some(l.id) != exclude);
        self.policy.check(claim, &mut active)
    }

    fn has_expired_critical(&self, tid: &Tid) -> bool {
        self.expired.values().any(|l| l.critical && &l.tid == tid)
    }

    fn enqueue(
        &mut self,
        lock: PathLock,
        expiry: Option<Duration>,
        holds: u32,
        waiter: Waiter,
    ) -> QueueKey {
        let key = QueueKey {
            rank: if lock.priority { 0 } else { 1 },
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.pending.insert(
            key,
            PendingRequest {
                lock,
                expiry,
                holds,
                waiter,
            },
        );
        key
    }

    /// Take a lock out of the Locked set without touching the queue
    pub(crate) fn take_active(&mut self, id: LockId) -> Option<(PathLock, Option<Duration>)> {
        let mut active = self.active.remove(&id)?;
        active.cancel_timer();
        self.owned.remove(&(active.lock.tid.clone(), active.lock.path.clone()));
        self.policy.on_release(&active.lock);
        Some((active.lock, active.expiry))
    }

    pub(crate) fn active_lock(&self, id: LockId) -> Option<&PathLock> {
        self.active.get(&id).map(|a| &a.lock)
    }

    pub(crate) fn owned_lock(&self, tid: &Tid, path: &Path) -> Option<LockId> {
        self.owned.get(&(tid.clone(), path.clone())).copied()
    }

    /// Error for an id that is not in the Locked set
    pub(crate) fn missing(&self, id: LockId) -> LockError {
        match self.expired.get(&id) {
            Some(lock) => LockError::Expired {
                id,
                path: lock.path.clone(),
                tid: lock.tid.clone(),
            },
            None => LockError::UnknownLock(id),
        }
    }

    /// Re-target a Locked lock in place, merging into an existing lock of the
    /// same tid on the target path
    pub(crate) fn relocate(
        &mut self,
        id: LockId,
        target: Path,
        mode: LockMode,
        comment: &str,
    ) -> Option<PathLock> {
        let tid = self.active_lock(id)?.tid.clone();

        if let Some(existing) = self.owned_lock(&tid, &target).filter(|e| *e != id) {
            let (moved, _) = self.take_active(id)?;
            self.upgrade(existing, mode, comment)?;
            let entry = self.active.get_mut(&existing)?;
            entry.lock.holds += moved.holds;
            entry.lock.record(HistoryEvent::Merged { from: id }, comment);
            return Some(entry.lock.clone());
        }

        let before = self.active_lock(id)?.clone();
        self.policy.on_release(&before);
        self.owned.remove(&(tid.clone(), before.path.clone()));

        let entry = self.active.get_mut(&id)?;
        entry.lock.path = target.clone();
        entry.lock.mode = mode;
        entry.lock.record(
            HistoryEvent::Moved {
                from: before.path,
                to: target.clone(),
                mode,
            },
            comment,
        );
        let lock = entry.lock.clone();
        self.policy.on_grant(&lock);
        self.owned.insert((tid, target), id);
        Some(lock)
    }

    /// Raise a Locked lock to at least `mode`
    fn upgrade(&mut self, id: LockId, mode: LockMode, comment: &str) -> Option<PathLock> {
        let entry = self.active.get(&id)?;
        if entry.lock.mode.covers(mode) {
            return Some(entry.lock.clone());
        }
        let before = entry.lock.clone();
        self.policy.on_release(&before);
        let entry = self.active.get_mut(&id)?;
        entry.lock.mode = mode;
        entry.lock.record(HistoryEvent::Upgraded, comment);
        let lock = entry.lock.clone();
        self.policy.on_grant(&lock);
        Some(lock)
    }
}

/// Lock table counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    /// Locked
    pub active: usize,
    /// Queued
    pub pending: usize,
    /// Expired copies awaiting release
    pub expired: usize,
}

impl LockManager {
    /// Create a manager with the given configuration
    pub fn new(config: LockConfig) -> Self {
        let policy = policy_for(config.policy);
        Self::with_policy(config, policy)
    }

    /// Create a manager with a custom admission policy
    pub fn with_policy(config: LockConfig, policy: Box<dyn AdmissionPolicy>) -> Self {
        LockManager {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::new(policy)),
            }),
        }
    }

    /// The configuration this manager was built with
    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Active admission policy
    pub fn policy_kind(&self) -> PolicyKind {
        self.inner.state.lock().policy.kind()
    }

    /// Acquire a lock on `path` for `tid`
    ///
    /// Resolves once the lock is granted. A tid that already holds `path` in
    /// a covering mode re-enters its existing lock immediately.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`] if not granted within the queue timeout
    /// - [`LockError::ExpiredTid`] if `tid` already lost a critical lock. The
    ///   refusal lasts until the expired lock is released or the whole tid is
    ///   dropped with [`LockManager::release_tid`]
    /// - [`LockError::Expired`] if a critical lock of `tid` expired while
    ///   this request was queued
    pub async fn acquire(
        &self,
        path: Path,
        tid: Tid,
        mode: LockMode,
        options: LockOptions,
    ) -> Result<PathLock> {
        let timeout = options.timeout.or_else(|| self.inner.config.acquire_timeout());
        let (key, rx) = {
            let mut state = self.inner.state.lock();

            if state.has_expired_critical(&tid) {
                return Err(LockError::ExpiredTid { tid });
            }

            if let Some(id) = state.owned_lock(&tid, &path) {
                if let Some(entry) = state.active.get_mut(&id) {
                    if entry.lock.mode.covers(mode) {
                        entry.lock.holds += 1;
                        let holds = entry.lock.holds;
                        entry
                            .lock
                            .record(HistoryEvent::Reentered { holds }, &options.comment);
                        debug!(target: "canopy::lock", id = %id, path = %path, tid = %tid, holds, "Lock re-entered");
                        return Ok(entry.lock.clone());
                    }
                }
            }

            let id = state.next_lock_id();
            let lock = PathLock::pending(
                id,
                path,
                tid,
                mode,
                options.priority,
                options.critical.unwrap_or(self.inner.config.critical),
                options.comment,
                LockHistory::with_capacity(self.inner.config.history_capacity),
            );
            let expiry = self.expiry_for(options.expiry);
            let (tx, rx) = oneshot::channel();
            let key = state.enqueue(lock, expiry, 1, tx);
            self.process_queue(&mut state);
            (key, rx)
        };
        self.wait_for_grant(key, rx, timeout).await
    }

    fn expiry_for(&self, expiry: Expiry) -> Option<Duration> {
        match expiry {
            Expiry::Default => Some(self.inner.config.lock_expiry()),
            Expiry::Never => None,
            Expiry::After(d) => Some(d),
        }
    }

    /// Await the outcome of a queued request
    pub(crate) async fn wait_for_grant(
        &self,
        key: QueueKey,
        mut rx: oneshot::Receiver<Result<PathLock>>,
        timeout: Option<Duration>,
    ) -> Result<PathLock> {
        let Some(limit) = timeout else {
            return rx.await.unwrap_or(Err(LockError::PeerExiting));
        };
        match tokio::time::timeout(limit, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or(Err(LockError::PeerExiting)),
            Err(_) => {
                let removed = self.inner.state.lock().pending.remove(&key);
                match removed {
                    Some(request) => {
                        debug!(
                            target: "canopy::lock",
                            id = %request.lock.id,
                            path = %request.lock.path,
                            tid = %request.lock.tid,
                            "Lock request timed out"
                        );
                        Err(LockError::Timeout {
                            path: request.lock.path,
                            tid: request.lock.tid,
                            waited: limit,
                        })
                    }
                    // Decided between the timer firing and taking the mutex
                    None => rx.try_recv().unwrap_or(Err(LockError::PeerExiting)),
                }
            }
        }
    }

    /// Enqueue the replacement of a superseded lock on behalf of a move
    ///
    /// Only the replacement is tested against the policy. The rest of the
    /// queue waits for the next release or expiry unless the replacement is
    /// granted here. The replacement keeps the superseded lock's holds.
    pub(crate) fn enqueue_replacement(
        &self,
        state: &mut State,
        mut lock: PathLock,
        expiry: Option<Duration>,
    ) -> (QueueKey, oneshot::Receiver<Result<PathLock>>) {
        let holds = lock.holds.max(1);
        lock.id = state.next_lock_id();
        lock.state = LockState::Pending;
        lock.holds = 0;
        lock.granted_at = None;
        lock.expires_at = None;
        lock.requested_at = Utc::now();
        let comment = lock.comment.clone();
        lock.record(HistoryEvent::Requested, &comment);

        let admission = state.check(&Claim::new(&lock.path, &lock.tid, lock.mode));
        if let Admission::Block { by } = admission {
            lock.waiting_for = by;
            lock.record(HistoryEvent::Queued { waiting_for: by }, &comment);
        }
        let (tx, rx) = oneshot::channel();
        let key = state.enqueue(lock, expiry, holds, tx);
        if admission.is_admit() {
            self.process_queue(state);
        }
        (key, rx)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.inner.state.lock())
    }

    /// Grant every admissible pending request, in queue order
    pub(crate) fn process_queue(&self, state: &mut State) {
        loop {
            let mut freed = false;
            let keys: Vec<QueueKey> = state.pending.keys().copied().collect();
            for key in keys {
                let Some(request) = state.pending.get(&key) else {
                    continue;
                };
                if request.waiter.is_closed() {
                    // Caller gave up (dropped the acquire future)
                    state.pending.remove(&key);
                    continue;
                }
                let admission = state.check(&Claim::new(
                    &request.lock.path,
                    &request.lock.tid,
                    request.lock.mode,
                ));
                match admission {
                    Admission::Admit => {
                        if let Some(request) = state.pending.remove(&key) {
                            freed |= self.grant(state, request);
                        }
                    }
                    Admission::Block { by } => {
                        if let Some(request) = state.pending.get_mut(&key) {
                            let fresh = request
                                .lock
                                .history
                                .last()
                                .is_some_and(|e| e.event == HistoryEvent::Requested);
                            if fresh || request.lock.waiting_for != by {
                                request.lock.waiting_for = by;
                                let comment = request.lock.comment.clone();
                                request
                                    .lock
                                    .record(HistoryEvent::Queued { waiting_for: by }, &comment);
                            }
                        }
                    }
                }
            }
            if !freed {
                break;
            }
        }
    }

    /// Grant one request; returns true if the waiter had gone away and the
    /// grant was undone, freeing capacity for another pass
    fn grant(&self, state: &mut State, request: PendingRequest) -> bool {
        let PendingRequest {
            mut lock,
            expiry,
            holds,
            waiter,
        } = request;

        // Re-entrant upgrade: fold into the tid's existing lock on this path
        if let Some(existing) = state.owned_lock(&lock.tid, &lock.path) {
            let comment = lock.comment.clone();
            if let Some(mut merged) = state.upgrade(existing, lock.mode, &comment) {
                if let Some(entry) = state.active.get_mut(&existing) {
                    entry.lock.holds += holds;
                    let holds = entry.lock.holds;
                    entry.lock.record(HistoryEvent::Reentered { holds }, &comment);
                    merged = entry.lock.clone();
                }
                if waiter.send(Ok(merged)).is_err() {
                    for _ in 0..holds {
                        self.release_hold(state, existing, "waiter dropped");
                    }
                    return true;
                }
                return false;
            }
        }

        let now = Utc::now();
        lock.state = LockState::Locked;
        lock.holds = holds;
        lock.granted_at = Some(now);
        lock.expires_at = expiry.and_then(|d| chrono::Duration::from_std(d).ok().map(|d| now + d));
        lock.waiting_for = None;
        let comment = lock.comment.clone();
        lock.record(HistoryEvent::Granted, &comment);

        debug!(
            target: "canopy::lock",
            id = %lock.id,
            path = %lock.path,
            tid = %lock.tid,
            mode = %lock.mode,
            "Lock granted"
        );

        let id = lock.id;
        state.policy.on_grant(&lock);
        state.owned.insert((lock.tid.clone(), lock.path.clone()), id);
        let timer = expiry.map(|d| self.schedule_expiry(id, d));
        state.active.insert(
            id,
            ActiveLock {
                lock: lock.clone(),
                expiry,
                timer,
            },
        );

        if waiter.send(Ok(lock)).is_err() {
            debug!(target: "canopy::lock", id = %id, "Waiter dropped, releasing granted lock");
            state.take_active(id);
            return true;
        }
        false
    }

    fn schedule_expiry(&self, id: LockId, after: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                LockManager { inner }.expire(id);
            }
        })
    }

    /// Expire a Locked lock
    fn expire(&self, id: LockId) {
        let mut state = self.inner.state.lock();
        // The timer may race with a release that already aborted it
        let Some(entry) = state.active.get_mut(&id) else {
            return;
        };
        entry.timer = None;
        let Some((mut lock, _)) = state.take_active(id) else {
            return;
        };
        lock.state = LockState::Expired;
        lock.record(HistoryEvent::Expired, "");

        warn!(
            target: "canopy::lock",
            id = %lock.id,
            path = %lock.path,
            tid = %lock.tid,
            critical = lock.critical,
            "Lock expired while held"
        );

        if lock.critical {
            let doomed: Vec<QueueKey> = state
                .pending
                .iter()
                .filter(|(_, r)| r.lock.tid == lock.tid)
                .map(|(k, _)| *k)
                .collect();
            for key in doomed {
                if let Some(request) = state.pending.remove(&key) {
                    let _ = request.waiter.send(Err(LockError::Expired {
                        id: lock.id,
                        path: lock.path.clone(),
                        tid: lock.tid.clone(),
                    }));
                }
            }
        }

        state.expired.insert(id, lock);
        self.process_queue(&mut state);
    }

    fn release_hold(&self, state: &mut State, id: LockId, comment: &str) -> bool {
        let Some(entry) = state.active.get_mut(&id) else {
            return false;
        };
        if entry.lock.holds > 1 {
            entry.lock.holds -= 1;
            let holds = entry.lock.holds;
            entry.lock.record(HistoryEvent::ReleasedHold { holds }, comment);
            return false;
        }
        if let Some((mut lock, _)) = state.take_active(id) {
            lock.state = LockState::Released;
            lock.record(HistoryEvent::Released, comment);
            debug!(target: "canopy::lock", id = %id, path = %lock.path, tid = %lock.tid, "Lock released");
        }
        true
    }

    /// Release a lock
    ///
    /// Releases one hold of a re-entered lock; the lock leaves the Locked set
    /// (and the queue is re-evaluated) when the last hold goes.
    ///
    /// # Errors
    ///
    /// - [`LockError::Expired`] if the lock expired before this call; the
    ///   expired copy is discarded
    /// - [`LockError::UnknownLock`] if no such lock exists
    pub async fn release(&self, id: LockId, comment: &str) -> Result<()> {
        self.release_now(id, comment)
    }

    /// Synchronous body of [`LockManager::release`]
    pub fn release_now(&self, id: LockId, comment: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.active.contains_key(&id) {
            if self.release_hold(&mut state, id, comment) {
                self.process_queue(&mut state);
            }
            return Ok(());
        }
        match state.expired.remove(&id) {
            Some(lock) => Err(LockError::Expired {
                id,
                path: lock.path,
                tid: lock.tid,
            }),
            None => Err(LockError::UnknownLock(id)),
        }
    }

    /// Release every lock and queued request of a transaction
    ///
    /// Used when the caller that owned the transaction went away. Queued
    /// requests are rejected with [`LockError::PeerExiting`] and expired
    /// copies of the tid are discarded. Returns the number of Locked locks
    /// released.
    pub fn release_tid(&self, tid: &Tid, comment: &str) -> usize {
        let mut state = self.inner.state.lock();
        let released = self.drain_where(&mut state, |l| &l.tid == tid, comment);
        state.expired.retain(|_, l| &l.tid != tid);
        self.process_queue(&mut state);
        released
    }

    /// Release everything, rejecting all queued requests
    ///
    /// Returns the number of Locked locks released.
    pub fn release_all(&self, comment: &str) -> usize {
        let mut state = self.inner.state.lock();
        let released = self.drain_where(&mut state, |_| true, comment);
        state.expired.clear();
        released
    }

    fn drain_where(
        &self,
        state: &mut State,
        matches: impl Fn(&PathLock) -> bool,
        comment: &str,
    ) -> usize {
        let doomed: Vec<QueueKey> = state
            .pending
            .iter()
            .filter(|(_, r)| matches(&r.lock))
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            if let Some(request) = state.pending.remove(&key) {
                let _ = request.waiter.send(Err(LockError::PeerExiting));
            }
        }

        let ids: Vec<LockId> = state
            .active
            .values()
            .filter(|a| matches(&a.lock))
            .map(|a| a.lock.id)
            .collect();
        for id in &ids {
            if let Some((mut lock, _)) = state.take_active(*id) {
                lock.state = LockState::Released;
                lock.record(HistoryEvent::Released, comment);
            }
        }
        ids.len()
    }

    /// Check whether `tid` could be granted `path` in `mode` right now
    pub fn is_allowed(&self, path: &Path, tid: &Tid, mode: LockMode) -> bool {
        let state = self.inner.state.lock();
        state.check(&Claim::new(path, tid, mode)).is_admit()
    }

    /// Snapshot of one lock (Locked, pending or expired)
    pub fn lock_info(&self, id: LockId) -> Option<PathLock> {
        let state = self.inner.state.lock();
        state
            .active_lock(id)
            .cloned()
            .or_else(|| {
                state
                    .pending
                    .values()
                    .find(|r| r.lock.id == id)
                    .map(|r| r.lock.clone())
            })
            .or_else(|| state.expired.get(&id).cloned())
    }

    /// Snapshots of all Locked locks, by id
    pub fn active_locks(&self) -> Vec<PathLock> {
        let state = self.inner.state.lock();
        state.active.values().map(|a| a.lock.clone()).collect()
    }

    /// Snapshots of all queued requests, in queue order
    pub fn pending_locks(&self) -> Vec<PathLock> {
        let state = self.inner.state.lock();
        state.pending.values().map(|r| r.lock.clone()).collect()
    }

    /// Locked locks of one transaction
    pub fn locks_for_tid(&self, tid: &Tid) -> Vec<PathLock> {
        let state = self.inner.state.lock();
        state
            .active
            .values()
            .filter(|a| &a.lock.tid == tid)
            .map(|a| a.lock.clone())
            .collect()
    }

    /// Check whether `tid` has any Locked, queued or expired lock
    pub fn tid_in_use(&self, tid: &Tid) -> bool {
        let state = self.inner.state.lock();
        state.active.values().any(|a| &a.lock.tid == tid)
            || state.pending.values().any(|r| &r.lock.tid == tid)
            || state.expired.values().any(|l| &l.tid == tid)
    }

    /// Table counts
    pub fn stats(&self) -> LockStats {
        let state = self.inner.state.lock();
        LockStats {
            active: state.active.len(),
            pending: state.pending.len(),
            expired: state.expired.len(),
        }
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.inner.config.acquire_timeout()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("LockManager")
            .field("policy", &self.inner.config.policy)
            .field("active", &stats.active)
            .field("pending", &stats.pending)
            .field("expired", &stats.expired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> Path {
        s.parse().unwrap()
    }

    fn coarse() -> LockManager {
        LockManager::new(LockConfig::default())
    }

    fn hierarchical() -> LockManager {
        LockManager::new(LockConfig::hierarchical())
    }

    async fn grab(manager: &LockManager, p: &str, tid: u64, mode: LockMode) -> PathLock {
        manager
            .acquire(path(p), Tid::from(tid), mode, LockOptions::new())
            .await
            .unwrap()
    }

    // ========================================================================
    // Grant / release
    // ========================================================================

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = coarse();
        let lock = grab(&manager, "users/1", 1, LockMode::Write).await;

        assert!(lock.is_locked());
        assert_eq!(lock.holds, 1);
        assert!(lock.granted_at.is_some());
        assert!(lock.expires_at.is_some());
        assert_eq!(manager.stats().active, 1);

        manager.release(lock.id, "done").await.unwrap();
        assert_eq!(manager.stats(), LockStats::default());
    }

    #[tokio::test]
    async fn test_release_unknown_lock() {
        let manager = coarse();
        let err = manager.release(LockId(42), "").await.unwrap_err();
        assert!(matches!(err, LockError::UnknownLock(LockId(42))));
    }

    #[tokio::test]
    async fn test_lock_ids_increase() {
        let manager = hierarchical();
        let a = grab(&manager, "a", 1, LockMode::Read).await;
        let b = grab(&manager, "b", 2, LockMode::Read).await;
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_no_expiry_option() {
        let manager = coarse();
        let lock = manager
            .acquire(path("a"), Tid::from(1), LockMode::Read, LockOptions::new().no_expiry())
            .await
            .unwrap();
        assert!(lock.expires_at.is_none());
    }

    // ========================================================================
    // Re-entrancy
    // ========================================================================

    #[tokio::test]
    async fn test_reentrant_acquire_counts_holds() {
        let manager = hierarchical();
        let first = grab(&manager, "a", 1, LockMode::Write).await;
        let second = grab(&manager, "a", 1, LockMode::Read).await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.holds, 2);
        assert_eq!(second.mode, LockMode::Write);

        manager.release(first.id, "").await.unwrap();
        assert_eq!(manager.lock_info(first.id).unwrap().holds, 1);
        manager.release(first.id, "").await.unwrap();
        assert!(manager.lock_info(first.id).is_none());
    }

    #[tokio::test]
    async fn test_reentrant_upgrade_in_place() {
        let manager = coarse();
        let read = grab(&manager, "a", 1, LockMode::Read).await;
        let write = grab(&manager, "a", 1, LockMode::Write).await;

        assert_eq!(read.id, write.id);
        assert_eq!(write.mode, LockMode::Write);
        assert_eq!(write.holds, 2);
        assert_eq!(manager.stats().active, 1);
        assert!(!manager.is_allowed(&path("b"), &Tid::from(2), LockMode::Read));
    }

    // ========================================================================
    // Policies
    // ========================================================================

    #[tokio::test]
    async fn test_coarse_write_blocks_everything() {
        let manager = coarse();
        let _w = grab(&manager, "a", 1, LockMode::Write).await;
        assert!(!manager.is_allowed(&path("zzz"), &Tid::from(2), LockMode::Read));
        assert!(manager.is_allowed(&path("zzz"), &Tid::from(1), LockMode::Write));
    }

    #[tokio::test]
    async fn test_coarse_readers_share() {
        let manager = coarse();
        let _a = grab(&manager, "a", 1, LockMode::Read).await;
        let _b = grab(&manager, "b", 2, LockMode::Read).await;
        assert!(!manager.is_allowed(&path("c"), &Tid::from(3), LockMode::Write));
        assert!(manager.is_allowed(&path("c"), &Tid::from(3), LockMode::Read));
    }

    #[tokio::test]
    async fn test_hierarchical_disjoint_writers() {
        let manager = hierarchical();
        let _a = grab(&manager, "users/1", 1, LockMode::Write).await;
        let _b = grab(&manager, "users/2", 2, LockMode::Write).await;
        assert!(!manager.is_allowed(&path("users"), &Tid::from(3), LockMode::Read));
        assert_eq!(manager.policy_kind(), PolicyKind::Hierarchical);
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_granted_on_release() {
        let manager = hierarchical();
        let held = grab(&manager, "a", 1, LockMode::Write).await;

        let mgr = manager.clone();
        let waiter = tokio::spawn(async move { grab(&mgr, "a/b", 2, LockMode::Read).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pending = manager.pending_locks();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].waiting_for, Some(held.id));

        manager.release(held.id, "").await.unwrap();
        let granted = waiter.await.unwrap();
        assert!(granted.is_locked());
        assert_eq!(manager.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let manager = coarse();
        let _held = grab(&manager, "a", 1, LockMode::Write).await;

        let err = manager
            .acquire(
                path("b"),
                Tid::from(2),
                LockMode::Read,
                LockOptions::new().timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::Timeout { waited, .. } if waited == Duration::from_millis(100)));
        assert_eq!(manager.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_served_first() {
        let manager = coarse();
        let held = grab(&manager, "a", 1, LockMode::Write).await;

        let mgr = manager.clone();
        let normal = tokio::spawn(async move { grab(&mgr, "b", 2, LockMode::Write).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let mgr = manager.clone();
        let urgent = tokio::spawn(async move {
            mgr.acquire(path("c"), Tid::from(3), LockMode::Write, LockOptions::new().priority())
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let order: Vec<Tid> = manager.pending_locks().into_iter().map(|l| l.tid).collect();
        assert_eq!(order, vec![Tid::from(3), Tid::from(2)]);

        manager.release(held.id, "").await.unwrap();
        let urgent = urgent.await.unwrap();
        assert_eq!(urgent.tid, Tid::from(3));
        assert_eq!(manager.stats().pending, 1);

        manager.release(urgent.id, "").await.unwrap();
        assert_eq!(normal.await.unwrap().tid, Tid::from(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_grants_all_admissible_in_one_pass() {
        let manager = coarse();
        let held = grab(&manager, "a", 1, LockMode::Write).await;

        let mut readers = Vec::new();
        for tid in 2..5 {
            let mgr = manager.clone();
            readers.push(tokio::spawn(async move { grab(&mgr, "r", tid, LockMode::Read).await }));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.stats().pending, 3);

        manager.release(held.id, "").await.unwrap();
        assert_eq!(manager.stats().active, 3);
        for reader in readers {
            assert!(reader.await.unwrap().is_locked());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_leak() {
        let manager = coarse();
        let held = grab(&manager, "a", 1, LockMode::Write).await;

        let mgr = manager.clone();
        let waiter = tokio::spawn(async move { grab(&mgr, "b", 2, LockMode::Write).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        waiter.abort();
        let _ = waiter.await;

        manager.release(held.id, "").await.unwrap();
        assert_eq!(manager.stats(), LockStats::default());
        assert!(manager.is_allowed(&path("c"), &Tid::from(3), LockMode::Write));
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_reports_expired_on_release() {
        let manager = coarse();
        let lock = manager
            .acquire(
                path("a"),
                Tid::from(1),
                LockMode::Write,
                LockOptions::new().expire_after(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.lock_info(lock.id).unwrap().state, LockState::Expired);
        assert_eq!(manager.stats().expired, 1);

        let err = manager.release(lock.id, "").await.unwrap_err();
        assert!(matches!(err, LockError::Expired { id, .. } if id == lock.id));
        // copy discarded
        assert!(matches!(
            manager.release(lock.id, "").await,
            Err(LockError::UnknownLock(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_expiry_cascades_to_tid_queue() {
        let manager = hierarchical();
        let _blocker = manager
            .acquire(path("b"), Tid::from(2), LockMode::Write, LockOptions::new().no_expiry())
            .await
            .unwrap();
        let doomed = manager
            .acquire(
                path("a"),
                Tid::from(1),
                LockMode::Write,
                LockOptions::new().expire_after(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let mgr = manager.clone();
        let queued = tokio::spawn(async move {
            mgr.acquire(path("b/x"), Tid::from(1), LockMode::Read, LockOptions::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Expired { id, .. } if id == doomed.id));
        assert_eq!(manager.stats().pending, 0);

        let err = manager
            .acquire(path("c"), Tid::from(1), LockMode::Read, LockOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::ExpiredTid { .. }));
        assert!(err.is_fatal_to_transaction());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_advances_queue() {
        let manager = coarse();
        let _short = manager
            .acquire(
                path("a"),
                Tid::from(1),
                LockMode::Write,
                LockOptions::new().expire_after(Duration::from_millis(50)).non_critical(),
            )
            .await
            .unwrap();

        let granted = grab(&manager, "b", 2, LockMode::Write).await;
        assert!(granted.is_locked());
        assert_eq!(manager.stats().expired, 1);
    }

    // ========================================================================
    // Bulk release
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_release_tid_drains_locks_and_queue() {
        let manager = hierarchical();
        let _a = grab(&manager, "a", 1, LockMode::Write).await;
        let _b = grab(&manager, "b", 1, LockMode::Write).await;
        let _c = grab(&manager, "c", 2, LockMode::Write).await;

        let mgr = manager.clone();
        let queued = tokio::spawn(async move {
            mgr.acquire(path("c"), Tid::from(1), LockMode::Read, LockOptions::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(manager.release_tid(&Tid::from(1), "peer left"), 2);
        assert!(matches!(queued.await.unwrap(), Err(LockError::PeerExiting)));
        assert_eq!(manager.locks_for_tid(&Tid::from(1)).len(), 0);
        assert_eq!(manager.locks_for_tid(&Tid::from(2)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tid_in_use_tracks_locks_and_queue() {
        let manager = coarse();
        let held = grab(&manager, "a", 1, LockMode::Write).await;
        assert!(manager.tid_in_use(&Tid::from(1)));
        assert!(!manager.tid_in_use(&Tid::from(2)));

        let mgr = manager.clone();
        let queued = tokio::spawn(async move { grab(&mgr, "b", 2, LockMode::Read).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(manager.tid_in_use(&Tid::from(2)));

        manager.release(held.id, "").await.unwrap();
        assert!(!manager.tid_in_use(&Tid::from(1)));
        let granted = queued.await.unwrap();
        manager.release(granted.id, "").await.unwrap();
        assert!(!manager.tid_in_use(&Tid::from(2)));
    }

    #[tokio::test]
    async fn test_release_all() {
        let manager = hierarchical();
        grab(&manager, "a", 1, LockMode::Write).await;
        grab(&manager, "b", 2, LockMode::Write).await;
        assert_eq!(manager.release_all("shutdown"), 2);
        assert_eq!(manager.stats(), LockStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_tid_lifts_expired_refusal() {
        let manager = coarse();
        let tid = Tid::from(1);
        manager
            .acquire(
                path("a"),
                tid.clone(),
                LockMode::Write,
                LockOptions::new().expire_after(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.stats().expired, 1);

        // never released by its holder
        let err = manager
            .acquire(path("b"), tid.clone(), LockMode::Read, LockOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::ExpiredTid { .. }));

        assert_eq!(manager.release_tid(&tid, "abandoned"), 0);
        assert_eq!(manager.stats(), LockStats::default());
        assert!(grab(&manager, "b", 1, LockMode::Read).await.is_locked());
    }
}
