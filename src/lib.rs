//! Canopy - Path-aware lock service for a tree-shaped database
//!
//! Readers and writers lock paths such as `users/42/name`. Locks of one
//! transaction never conflict with each other; everything else is decided by
//! the admission policy. Several processes sharing one database file
//! coordinate through a master peer that owns the lock table.
//!
//! # Quick Start
//!
//! ```ignore
//! use canopy::{CanopyConfig, CoordinationPeer, LockMode, LockOptions, TidGenerator};
//!
//! let peer = CoordinationPeer::standalone(CanopyConfig::default()).await?;
//! let tids = TidGenerator::new();
//!
//! let lock = peer
//!     .lock("users/42".parse()?, tids.create_tid(), LockMode::Write, LockOptions::new())
//!     .await?;
//! // ... write below users/42 ...
//! lock.release().await?;
//! ```
//!
//! # Architecture
//!
//! - `canopy-core`: paths, ids, errors and configuration
//! - `canopy-concurrency`: the [`LockManager`] and its admission policies
//! - `canopy-ipc`: wire protocol, transports and the [`CoordinationPeer`]

pub use canopy_concurrency::{Expiry, LockManager, LockOptions, LockState, LockStats, PathLock};
pub use canopy_core::{
    CanopyConfig, LockConfig, LockError, LockId, LockMode, Path, PeerConfig, PeerId, PolicyKind,
    Result, Tid, TidGenerator, CONFIG_FILE_NAME,
};
#[cfg(unix)]
pub use canopy_ipc::Broker;
pub use canopy_ipc::{
    BroadcastHub, ChangeEvent, CoordinationPeer, Notification, PeerLock, PeerState, RemoteEvent,
    Subscription,
};
