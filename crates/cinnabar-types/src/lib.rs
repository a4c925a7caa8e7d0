//! # cinnabar-types: Core types for Cinnabar
//!
//! This crate contains shared types used across the Cinnabar system:
//! - Replication stream positions ([`ReplOffset`])
//! - Node roles ([`Role`])
//! - Protocol and storage size limits
//! - Wall-clock helpers ([`unix_now`])

use std::{
    fmt::Display,
    ops::{Add, AddAssign},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Size limits
// ============================================================================

/// Maximum number of arguments in a single command frame.
pub const MAX_ARGS: usize = 32;

/// Maximum length of a single command argument in bytes.
///
/// Keys and values in the live keyspace inherit this bound: anything that
/// arrives over the wire is already capped here.
pub const MAX_ARG_LEN: usize = 512;

/// Maximum key length in a snapshot record (including room for the
/// terminating NUL on disk).
pub const SNAPSHOT_MAX_KEY_LEN: usize = 256;

/// Maximum value length in a snapshot record.
pub const SNAPSHOT_MAX_VALUE_LEN: usize = 1024;

/// Hard cap on live keyspace entries enforced by the sweeper.
pub const DEFAULT_MAX_KEYS: usize = 1000;

// ============================================================================
// Replication offsets
// ============================================================================

/// Position of a byte within the replication stream.
///
/// Every byte the primary propagates has a position in a monotonically
/// increasing 64-bit stream. Keeping the arithmetic in one type prevents
/// the index/offset confusion a raw `u64` invites: backlog-internal indices
/// stay `usize`, stream positions stay `ReplOffset`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplOffset(u64);

impl ReplOffset {
    pub const ZERO: ReplOffset = ReplOffset(0);

    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the offset as a `u64`.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Distance in bytes from `earlier` to `self`.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `earlier > self`; stream positions only grow.
    pub fn distance_from(self, earlier: ReplOffset) -> u64 {
        debug_assert!(
            earlier.0 <= self.0,
            "offset {} precedes {}",
            self.0,
            earlier.0
        );
        self.0 - earlier.0
    }
}

impl Display for ReplOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReplOffset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ReplOffset> for u64 {
    fn from(offset: ReplOffset) -> Self {
        offset.0
    }
}

impl Add<u64> for ReplOffset {
    type Output = ReplOffset;

    fn add(self, rhs: u64) -> Self::Output {
        ReplOffset(self.0 + rhs)
    }
}

impl AddAssign<u64> for ReplOffset {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

// ============================================================================
// Roles
// ============================================================================

/// The replication role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Write-accepting node; propagates writes to replicas.
    Primary,
    /// Read-only follower of a primary.
    Replica,
}

impl Role {
    /// Default listening port for this role.
    pub fn default_port(self) -> u16 {
        match self {
            Role::Primary => 6379,
            Role::Replica => 6380,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Current wall-clock time as Unix seconds.
///
/// Expirations and snapshot TTLs are second-granular absolute timestamps,
/// so one helper keeps every call site on the same clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
