//! # cinnabar-repl: Primary/replica replication for Cinnabar
//!
//! The replication subsystem keeps read-only replicas consistent with a
//! write-accepting primary:
//!
//! - the [`Backlog`] is a bounded byte ring of recently propagated command
//!   frames, addressed by monotonically increasing stream offsets;
//! - [`Primary`] owns the replica registry and the backlog behind one lock,
//!   fans out writes, heartbeats replicas, and serves full and partial
//!   resyncs;
//! - [`Replica`] maintains the connection to the primary: handshake,
//!   streaming apply loop, acknowledgements, and reconnect-with-resume.
//!
//! Role state is a tagged variant ([`RoleState`]) so every access site is
//! exhaustive at compile time.

mod backlog;
mod primary;
mod replconf;
mod replica;
pub mod sync;

pub use backlog::Backlog;
pub use primary::{Primary, ReplicaDescriptor};
pub use replconf::{Capabilities, ReplConf, ReplConfError};
pub use replica::{CommandApplier, Replica, ReplicaConfig};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Default backlog capacity: 1 MiB of propagated frame bytes.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 1024 * 1024;

/// Interval between heartbeat PINGs to replicas, and between sweeper runs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A replica silent for this long is considered disconnected.
pub const REPLICA_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause before a replica retries its master connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The minimal PING frame, used for heartbeats and the replica handshake.
pub const PING_FRAME: &[u8] = b"*1\r\n$4\r\nPING\r\n";

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Replication failures.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// SYNC/PSYNC arrived at a node that is not a primary.
    #[error("not a master")]
    NotPrimary,

    /// Snapshot could not be produced or installed during sync.
    #[error("sync failed: {0}")]
    Snapshot(#[from] cinnabar_snapshot::SnapshotError),

    /// The peer broke the sync protocol.
    #[error("sync protocol error: {0}")]
    Protocol(&'static str),

    /// Handshake reply was not what the replica expected.
    #[error("handshake failed: expected {expected}, got {got:?}")]
    Handshake { expected: &'static str, got: String },
}

/// Role-specific replication state.
///
/// A node is constructed as one or the other at startup; there is no
/// runtime role change.
pub enum RoleState {
    Primary(Arc<Primary>),
    Replica(Arc<Replica>),
}

impl RoleState {
    /// The primary state, if this node is a primary.
    pub fn as_primary(&self) -> Option<&Arc<Primary>> {
        match self {
            RoleState::Primary(primary) => Some(primary),
            RoleState::Replica(_) => None,
        }
    }

    /// The replica state, if this node is a replica.
    pub fn as_replica(&self) -> Option<&Arc<Replica>> {
        match self {
            RoleState::Primary(_) => None,
            RoleState::Replica(replica) => Some(replica),
        }
    }

    pub fn role(&self) -> cinnabar_types::Role {
        match self {
            RoleState::Primary(_) => cinnabar_types::Role::Primary,
            RoleState::Replica(_) => cinnabar_types::Role::Replica,
        }
    }
}
