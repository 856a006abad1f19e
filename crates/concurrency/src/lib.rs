//! Path locking for the Canopy lock service
//!
//! This crate implements the single-process lock authority:
//! - PathLock: One claim on a keyspace path by a transaction
//! - AdmissionPolicy: Coarse (whole-tree readers-writer) and hierarchical
//!   (path-trail) conflict rules
//! - LockManager: Grants, queues, expires and releases locks
//! - Move operations: Re-target a held lock without leaving the transaction
//!
//! Locks are granted in (priority, arrival) order and every state change
//! re-evaluates the whole queue, so a release can unblock several waiters at
//! once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock;
pub mod manager;
pub mod policy;
pub mod relocate;

pub use lock::{Expiry, HistoryEntry, HistoryEvent, LockHistory, LockOptions, LockState, PathLock};
pub use manager::{LockManager, LockStats};
pub use policy::{policy_for, Admission, AdmissionPolicy, Claim, CoarsePolicy, HierarchicalPolicy};
