//! Lock service configuration via `canopy.toml`
//!
//! All durations are stored in milliseconds so the TOML stays flat. Every
//! field has a default; an empty file is a valid configuration.

use crate::error::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::time::Duration;

/// Conventional config file name next to the database file
pub const CONFIG_FILE_NAME: &str = "canopy.toml";

/// Admission policy used by the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Whole keyspace behaves as one readers-writer lock
    #[default]
    Coarse,
    /// Conflicts only between locks on the same path trail
    Hierarchical,
}

/// Lock manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Admission policy
    pub policy: PolicyKind,
    /// How long a granted lock may be held before it expires
    pub lock_expiry_ms: u64,
    /// Default queue timeout for `acquire`; unset waits indefinitely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
    /// Whether expiry fails the transaction's other queued requests
    pub critical: bool,
    /// Number of history entries kept per lock
    pub history_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            policy: PolicyKind::Coarse,
            lock_expiry_ms: 120_000,
            acquire_timeout_ms: None,
            critical: true,
            history_capacity: 32,
        }
    }
}

impl LockConfig {
    /// Default config with the hierarchical policy
    pub fn hierarchical() -> Self {
        LockConfig {
            policy: PolicyKind::Hierarchical,
            ..Default::default()
        }
    }

    /// Expiry duration for granted locks
    pub fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    /// Default queue timeout
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Coordination peer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Interval between presence pulses
    pub pulse_interval_ms: u64,
    /// Remove peers not heard from for this long; unset disables pruning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_timeout_ms: Option<u64>,
    /// How long a worker waits for the master at startup
    pub startup_timeout_ms: u64,
    /// How long exit waits for each proxied lock to be released
    pub drain_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            pulse_interval_ms: 5_000,
            peer_timeout_ms: None,
            startup_timeout_ms: 5_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl PeerConfig {
    /// Pulse interval
    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }

    /// Peer silence limit
    pub fn peer_timeout(&self) -> Option<Duration> {
        self.peer_timeout_ms.map(Duration::from_millis)
    }

    /// Startup wait for the master
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Per-lock drain wait on exit
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Top-level configuration loaded from `canopy.toml`
///
/// # Example
///
/// ```toml
/// [lock]
/// policy = "hierarchical"
/// lock_expiry_ms = 60000
///
/// [peer]
/// pulse_interval_ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CanopyConfig {
    /// Lock manager section
    pub lock: LockConfig,
    /// Peer section
    pub peer: PeerConfig,
}

impl CanopyConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Canopy lock service configuration

[lock]
# Admission policy: "coarse" (default) or "hierarchical"
#   "coarse"       = one writer or many readers for the whole tree
#   "hierarchical" = writers on disjoint subtrees run concurrently
policy = "coarse"
# Granted locks expire after this many milliseconds
lock_expiry_ms = 120000
# Default queue timeout for lock requests (unset = wait indefinitely)
# acquire_timeout_ms = 30000
# An expired lock fails the rest of its transaction's queued requests
critical = true
# History entries kept per lock for diagnostics
history_capacity = 32

[peer]
pulse_interval_ms = 5000
# peer_timeout_ms = 15000
startup_timeout_ms = 5000
drain_timeout_ms = 5000
"#
    }

    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LockError::Config(e.to_string()))
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &FsPath) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LockError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            LockError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &FsPath) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }
}
