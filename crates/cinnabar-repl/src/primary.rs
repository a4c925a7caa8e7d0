//! Primary-side replication state: replica registry, propagation,
//! heartbeats, partial resync.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Instant;

use cinnabar_types::ReplOffset;

use crate::backlog::Backlog;
use crate::replconf::Capabilities;
use crate::{PING_FRAME, REPLICA_TIMEOUT, ReplResult};

/// One registered replica, keyed by its connection id.
#[derive(Debug)]
pub struct ReplicaDescriptor {
    /// Stable id (the accepting connection's id).
    pub id: u64,
    /// Write half used for propagation and heartbeats.
    stream: TcpStream,
    /// Last offset this replica acknowledged (or was advanced to by
    /// successful propagation writes).
    pub offset: ReplOffset,
    /// Updated on every ACK; heartbeat cleanup uses it.
    pub last_heartbeat: Instant,
    /// Suppresses live propagation while a bulk snapshot is in flight.
    pub sync_in_progress: bool,
    /// Port advertised via `REPLCONF LISTENING-PORT`.
    pub listening_port: Option<u16>,
    /// Flags advertised via `REPLCONF CAPA`.
    pub capabilities: Capabilities,
    /// Set when a write fails; the next heartbeat pass reaps it.
    failed: bool,
}

/// Registry + backlog behind the single replication lock.
///
/// Propagation appends to the backlog and fans out to replica sockets
/// inside one critical section, so every replica observes writes in the
/// same order the keyspace applied them.
#[derive(Debug)]
struct PrimaryInner {
    replicas: HashMap<u64, ReplicaDescriptor>,
    backlog: Backlog,
}

/// Primary-role replication state.
pub struct Primary {
    inner: Mutex<PrimaryInner>,
    replication_id: String,
}

impl Primary {
    /// Creates primary state with the given advertised replication id and
    /// backlog capacity in bytes.
    pub fn new(replication_id: impl Into<String>, backlog_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PrimaryInner {
                replicas: HashMap::new(),
                backlog: Backlog::new(backlog_capacity),
            }),
            replication_id: replication_id.into(),
        }
    }

    /// The replication id this primary advertises.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Current stream position (one past the newest propagated byte).
    pub fn current_offset(&self) -> ReplOffset {
        self.lock().backlog.current_offset()
    }

    /// The backlog window `[start, current]`, for diagnostics and tests.
    pub fn backlog_window(&self) -> (ReplOffset, ReplOffset) {
        let inner = self.lock();
        (inner.backlog.start_offset(), inner.backlog.current_offset())
    }

    /// Number of registered replicas.
    pub fn replica_count(&self) -> usize {
        self.lock().replicas.len()
    }

    /// Registers a replica that is about to receive a bulk sync.
    ///
    /// Live propagation to it stays suppressed until
    /// [`Self::finish_sync`].
    pub fn register(
        &self,
        id: u64,
        stream: TcpStream,
        listening_port: Option<u16>,
        capabilities: Capabilities,
    ) {
        tracing::info!(replica = id, ?listening_port, "registering replica");
        self.lock().replicas.insert(
            id,
            ReplicaDescriptor {
                id,
                stream,
                offset: ReplOffset::ZERO,
                last_heartbeat: Instant::now(),
                sync_in_progress: true,
                listening_port,
                capabilities,
                failed: false,
            },
        );
    }

    /// Marks a replica's bulk sync complete: it joins live propagation at
    /// the current backlog offset.
    pub fn finish_sync(&self, id: u64) {
        let mut inner = self.lock();
        let current = inner.backlog.current_offset();
        if let Some(replica) = inner.replicas.get_mut(&id) {
            replica.offset = current;
            replica.sync_in_progress = false;
            replica.last_heartbeat = Instant::now();
            tracing::info!(replica = id, offset = %current, "replica sync complete");
        }
    }

    /// Drops a replica (connection closed or sync failed).
    pub fn remove(&self, id: u64) {
        if self.lock().replicas.remove(&id).is_some() {
            tracing::info!(replica = id, "removed replica");
        }
    }

    /// Propagates one re-serialized command frame.
    ///
    /// Append-to-backlog and fan-out happen under the replication lock so
    /// replicas observe the same order as the keyspace mutation sequence.
    /// Write failures are non-fatal: the replica is marked and reaped by
    /// the next heartbeat pass.
    pub fn propagate(&self, frame: &[u8]) {
        let mut inner = self.lock();
        inner.backlog.append(frame);

        for replica in inner.replicas.values_mut() {
            if replica.sync_in_progress || replica.failed {
                continue;
            }
            match replica.stream.write_all(frame) {
                Ok(()) => replica.offset += frame.len() as u64,
                Err(e) => {
                    tracing::warn!(replica = replica.id, error = %e, "propagation write failed");
                    replica.failed = true;
                }
            }
        }
    }

    /// Serves a partial resync if `offset` is inside the backlog window.
    ///
    /// On success the `+CONTINUE` line and the raw suffix are written to
    /// `out` and the replica is registered live at the current offset,
    /// all under the replication lock, so no propagated frame can slip in
    /// between the suffix and live streaming. Returns `false` when the
    /// offset is out of window (caller falls back to full sync).
    pub fn try_partial_sync(
        &self,
        id: u64,
        mut out: TcpStream,
        offset: ReplOffset,
    ) -> ReplResult<bool> {
        let mut inner = self.lock();
        let Some(suffix) = inner.backlog.slice_from(offset) else {
            return Ok(false);
        };
        let current = inner.backlog.current_offset();

        out.write_all(b"+CONTINUE\r\n")?;
        out.write_all(&suffix)?;

        tracing::info!(
            replica = id,
            from = %offset,
            to = %current,
            bytes = suffix.len(),
            "served partial resync"
        );

        inner.replicas.insert(
            id,
            ReplicaDescriptor {
                id,
                stream: out,
                offset: current,
                last_heartbeat: Instant::now(),
                sync_in_progress: false,
                listening_port: None,
                capabilities: Capabilities::default(),
                failed: false,
            },
        );
        Ok(true)
    }

    /// Records an acknowledged offset. Returns `false` if the connection
    /// is not a registered replica.
    pub fn update_ack(&self, id: u64, offset: ReplOffset) -> bool {
        let mut inner = self.lock();
        match inner.replicas.get_mut(&id) {
            Some(replica) => {
                replica.offset = offset;
                replica.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Records a replica's advertised listening port.
    pub fn record_listening_port(&self, id: u64, port: u16) -> bool {
        let mut inner = self.lock();
        match inner.replicas.get_mut(&id) {
            Some(replica) => {
                replica.listening_port = Some(port);
                true
            }
            None => false,
        }
    }

    /// Records a replica's capability flags.
    pub fn record_capabilities(&self, id: u64, capabilities: Capabilities) -> bool {
        let mut inner = self.lock();
        match inner.replicas.get_mut(&id) {
            Some(replica) => {
                replica.capabilities = capabilities;
                true
            }
            None => false,
        }
    }

    /// Asks every live replica for an immediate ACK.
    pub fn request_acks(&self) {
        let frame = b"*2\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n";
        let mut inner = self.lock();
        for replica in inner.replicas.values_mut() {
            if replica.sync_in_progress || replica.failed {
                continue;
            }
            if let Err(e) = replica.stream.write_all(frame) {
                tracing::warn!(replica = replica.id, error = %e, "GETACK write failed");
                replica.failed = true;
            }
        }
    }

    /// One heartbeat pass: PING every live replica, then reap the dead
    /// (failed writes and anything silent past [`REPLICA_TIMEOUT`]).
    pub fn heartbeat_pass(&self) {
        let mut inner = self.lock();

        for replica in inner.replicas.values_mut() {
            if replica.sync_in_progress || replica.failed {
                continue;
            }
            if let Err(e) = replica.stream.write_all(PING_FRAME) {
                tracing::warn!(replica = replica.id, error = %e, "heartbeat write failed");
                replica.failed = true;
            }
        }

        let before = inner.replicas.len();
        inner.replicas.retain(|_, replica| {
            let stale =
                !replica.sync_in_progress && replica.last_heartbeat.elapsed() > REPLICA_TIMEOUT;
            if replica.failed || stale {
                tracing::info!(
                    replica = replica.id,
                    failed = replica.failed,
                    stale,
                    "dropping dead replica"
                );
                false
            } else {
                true
            }
        });
        let dropped = before - inner.replicas.len();
        if dropped > 0 {
            tracing::info!(dropped, remaining = inner.replicas.len(), "heartbeat cleanup");
        }
    }

    /// Last acknowledged offset for a replica, for diagnostics and tests.
    pub fn replica_offset(&self, id: u64) -> Option<ReplOffset> {
        self.lock().replicas.get(&id).map(|r| r.offset)
    }

    /// A copy of the backlog suffix from `offset`, without registering
    /// anything. Diagnostics and tests.
    pub fn backlog_slice(&self, offset: ReplOffset) -> Option<bytes::Bytes> {
        self.lock().backlog.slice_from(offset)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PrimaryInner> {
        self.inner.lock().expect("replication lock poisoned")
    }
}
