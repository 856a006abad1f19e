//! Core types for the Canopy lock service
//!
//! This crate defines the foundational types used throughout the system:
//! - Path: Slash-delimited address of a node in the keyspace tree
//! - Tid: Transaction identifier grouping cooperating lock requests
//! - LockMode / LockId / PeerId: Lock and peer identities
//! - LockError: Error type with stable error codes
//! - CanopyConfig: Lock and peer configuration (`canopy.toml`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use config::{CanopyConfig, LockConfig, PeerConfig, PolicyKind, CONFIG_FILE_NAME};
pub use error::{LockError, Result};
pub use path::{Path, PathParseError, PathSegment};
pub use types::{LockId, LockMode, PeerId, Tid, TidGenerator};
