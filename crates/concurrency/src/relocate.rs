//! Lock move operations
//!
//! Re-target a held lock to another path without dropping out of the
//! transaction. Used when an operation that started deep in the tree needs to
//! widen its claim (for example to rewrite the parent object).
//!
//! A move either happens in place (same id, history continues) or, when the
//! target is contended, the old lock is released and a priority request for
//! the target is queued carrying the old history.

use crate::lock::{HistoryEvent, LockState, PathLock};
use crate::manager::{LockManager, QueueKey};
use crate::policy::Claim;
use canopy_core::{LockError, LockId, LockMode, Path, Result};
use tokio::sync::oneshot;
use tracing::debug;

enum Relocation {
    InPlace(PathLock),
    Queued(QueueKey, oneshot::Receiver<Result<PathLock>>),
}

impl LockManager {
    /// Move a lock to its parent path, keeping its mode
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidPath`] if the lock is on the root
    /// - [`LockError::Expired`] / [`LockError::UnknownLock`] if the lock is
    ///   not Locked
    /// - Any error of [`LockManager::acquire`] if the move had to queue
    pub async fn move_to_parent(&self, id: LockId) -> Result<PathLock> {
        let (target, mode) = self.with_state(|state| -> Result<(Path, LockMode)> {
            let lock = state.active_lock(id).ok_or_else(|| state.missing(id))?;
            let parent = lock
                .path
                .parent()
                .ok_or_else(|| LockError::InvalidPath("the root has no parent".to_string()))?;
            Ok((parent, lock.mode))
        })?;
        self.move_to(id, target, mode).await
    }

    /// Move a lock to `target` in `mode`
    ///
    /// If the tid already holds `target`, the moving lock is merged into that
    /// lock and the merged lock is returned.
    pub async fn move_to(&self, id: LockId, target: Path, mode: LockMode) -> Result<PathLock> {
        let relocation = self.with_state(|state| -> Result<Relocation> {
            let lock = state
                .active_lock(id)
                .ok_or_else(|| state.missing(id))?
                .clone();
            let claim = Claim::new(&target, &lock.tid, mode).replacing(&lock);

            if state.check(&claim).is_admit() {
                let moved = state
                    .relocate(id, target.clone(), mode, "move")
                    .ok_or(LockError::UnknownLock(id))?;
                debug!(
                    target: "canopy::lock",
                    id = %moved.id,
                    from = %lock.path,
                    to = %target,
                    "Lock moved in place"
                );
                self.process_queue(state);
                return Ok(Relocation::InPlace(moved));
            }

            // Contended: give up the old lock and queue for the target ahead
            // of ordinary requests. Waiters behind the old lock stay queued.
            let (mut replacement, expiry) =
                state.take_active(id).ok_or(LockError::UnknownLock(id))?;
            replacement.record(HistoryEvent::Superseded { to: target.clone() }, "move");
            replacement.state = LockState::Released;
            debug!(
                target: "canopy::lock",
                id = %id,
                from = %replacement.path,
                to = %target,
                "Lock superseded, requesting target with priority"
            );
            replacement.path = target.clone();
            replacement.mode = mode;
            replacement.priority = true;
            replacement.waiting_for = None;
            let (key, rx) = self.enqueue_replacement(state, replacement, expiry);
            Ok(Relocation::Queued(key, rx))
        })?;

        match relocation {
            Relocation::InPlace(moved) => Ok(moved),
            Relocation::Queued(key, rx) => {
                self.wait_for_grant(key, rx, self.default_timeout()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lock::{HistoryEvent, LockOptions};
    use crate::manager::LockManager;
    use canopy_core::{LockConfig, LockError, LockMode, Path, Tid};
    use std::time::Duration;

    fn path(s: &str) -> Path {
        s.parse().unwrap()
    }

    fn hierarchical() -> LockManager {
        LockManager::new(LockConfig::hierarchical())
    }

    #[tokio::test]
    async fn test_move_to_parent_in_place() {
        let manager = hierarchical();
        let tid = Tid::from(1);
        let lock = manager
            .acquire(path("a/b"), tid.clone(), LockMode::Write, LockOptions::new())
            .await
            .unwrap();

        let moved = manager.move_to_parent(lock.id).await.unwrap();
        assert_eq!(moved.id, lock.id);
        assert_eq!(moved.path, path("a"));
        assert!(moved
            .history
            .entries()
            .any(|e| matches!(e.event, HistoryEvent::Moved { .. })));
        assert_eq!(manager.stats().active, 1);
    }

    #[tokio::test]
    async fn test_move_root_to_parent_is_invalid() {
        let manager = hierarchical();
        let lock = manager
            .acquire(Path::root(), Tid::from(1), LockMode::Read, LockOptions::new())
            .await
            .unwrap();

        let err = manager.move_to_parent(lock.id).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_move_unknown_lock() {
        let manager = hierarchical();
        let err = manager
            .move_to(canopy_core::LockId(77), path("x"), LockMode::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::UnknownLock(_)));
    }

    #[tokio::test]
    async fn test_move_merges_into_held_target() {
        let manager = hierarchical();
        let tid = Tid::from(1);
        let parent = manager
            .acquire(path("a"), tid.clone(), LockMode::Read, LockOptions::new())
            .await
            .unwrap();
        let child = manager
            .acquire(path("a/b"), tid.clone(), LockMode::Write, LockOptions::new())
            .await
            .unwrap();

        let merged = manager.move_to_parent(child.id).await.unwrap();
        assert_eq!(merged.id, parent.id);
        assert_eq!(merged.mode, LockMode::Write);
        assert_eq!(merged.holds, 2);
        assert_eq!(manager.stats().active, 1);
        assert!(manager.lock_info(child.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_move_requeues_with_priority() {
        let manager = hierarchical();
        let mover = Tid::from(1);
        let other = Tid::from(2);

        let lock = manager
            .acquire(path("a/b"), mover.clone(), LockMode::Write, LockOptions::new())
            .await
            .unwrap();
        let blocker = manager
            .acquire(path("a/c"), other.clone(), LockMode::Read, LockOptions::new())
            .await
            .unwrap();

        let mgr = manager.clone();
        let pending = tokio::spawn(async move { mgr.move_to_parent(lock.id).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // old lock is gone, replacement is queued with priority
        assert!(manager.locks_for_tid(&mover).is_empty());
        let queued = manager.pending_locks();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].priority);
        assert_eq!(queued[0].waiting_for, Some(blocker.id));

        manager.release(blocker.id, "").await.unwrap();
        let moved = pending.await.unwrap().unwrap();
        assert_ne!(moved.id, lock.id);
        assert_eq!(moved.path, path("a"));
        assert!(moved
            .history
            .entries()
            .any(|e| matches!(e.event, HistoryEvent::Superseded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_move_overtakes_queued_requests() {
        let manager = hierarchical();
        let lock = manager
            .acquire(path("a/b"), Tid::from(1), LockMode::Write, LockOptions::new())
            .await
            .unwrap();
        let blocker = manager
            .acquire(path("a/c"), Tid::from(2), LockMode::Read, LockOptions::new())
            .await
            .unwrap();

        // one waiter on the old path, one on the target
        let mgr = manager.clone();
        let on_old = tokio::spawn(async move {
            mgr.acquire(path("a/b"), Tid::from(3), LockMode::Write, LockOptions::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let mgr = manager.clone();
        let on_target = tokio::spawn(async move {
            mgr.acquire(path("a"), Tid::from(4), LockMode::Read, LockOptions::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mgr = manager.clone();
        let pending = tokio::spawn(async move { mgr.move_to_parent(lock.id).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        // nothing was granted the slot the mover gave up
        assert!(!on_old.is_finished());
        assert!(!on_target.is_finished());
        assert_eq!(manager.active_locks().len(), 1);
        let order: Vec<Tid> = manager.pending_locks().into_iter().map(|l| l.tid).collect();
        assert_eq!(order, vec![Tid::from(1), Tid::from(3), Tid::from(4)]);

        manager.release(blocker.id, "").await.unwrap();
        let moved = pending.await.unwrap().unwrap();
        assert_eq!(moved.path, path("a"));
        assert!(!on_old.is_finished());
        assert!(!on_target.is_finished());
        assert_eq!(manager.stats().pending, 2);

        manager.release(moved.id, "").await.unwrap();
        let next = on_old.await.unwrap().unwrap();
        assert_eq!(next.tid, Tid::from(3));
        manager.release(next.id, "").await.unwrap();
        assert_eq!(on_target.await.unwrap().unwrap().tid, Tid::from(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_move_keeps_holds() {
        let manager = hierarchical();
        let tid = Tid::from(1);
        let lock = manager
            .acquire(path("a/b"), tid.clone(), LockMode::Write, LockOptions::new())
            .await
            .unwrap();
        let again = manager
            .acquire(path("a/b"), tid.clone(), LockMode::Write, LockOptions::new())
            .await
            .unwrap();
        assert_eq!(again.holds, 2);
        let blocker = manager
            .acquire(path("a/c"), Tid::from(2), LockMode::Read, LockOptions::new())
            .await
            .unwrap();

        let mgr = manager.clone();
        let pending = tokio::spawn(async move { mgr.move_to_parent(lock.id).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        manager.release(blocker.id, "").await.unwrap();

        let moved = pending.await.unwrap().unwrap();
        assert_eq!(moved.holds, 2);
        manager.release(moved.id, "").await.unwrap();
        manager.release(moved.id, "").await.unwrap();
        assert!(matches!(
            manager.release(moved.id, "").await,
            Err(LockError::UnknownLock(_))
        ));
    }
}
