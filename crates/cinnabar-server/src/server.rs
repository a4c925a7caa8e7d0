//! Server lifecycle: listener, worker threads, background loops, shutdown.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use cinnabar_engine::Engine;
use cinnabar_repl::{
    CommandApplier, DEFAULT_BACKLOG_CAPACITY, HEARTBEAT_INTERVAL, Primary, Replica, ReplicaConfig,
    RoleState,
};
use cinnabar_types::DEFAULT_MAX_KEYS;
use cinnabar_wire::Command;

use crate::commands::{ConnectionCtx, ServerState};
use crate::connection;
use crate::error::{ServerError, ServerResult};

/// Pause between accept attempts while the listener is idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to listen on, e.g. `127.0.0.1:6379`. Port `0` picks an
    /// ephemeral port (tests).
    pub bind_addr: String,
    /// Path of the on-disk snapshot file.
    pub snapshot_path: PathBuf,
    /// Target of the `BACKUP` command.
    pub backup_path: PathBuf,
    /// Live keyspace cap enforced by the sweeper.
    pub max_keys: usize,
    /// Replication backlog capacity in bytes.
    pub backlog_capacity: usize,
    /// Replication id advertised when running as primary.
    pub replication_id: String,
    /// `Some((host, port))` switches this node into replica mode.
    pub replica_of: Option<(String, u16)>,
    /// Sweeper wake interval.
    pub sweep_interval: Duration,
    /// Heartbeat wake interval (primary only).
    pub heartbeat_interval: Duration,
}

impl ServerOptions {
    /// Options with the conventional defaults for the given address and
    /// snapshot path.
    pub fn new(bind_addr: impl Into<String>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            snapshot_path: snapshot_path.into(),
            backup_path: PathBuf::from("backup.rdb"),
            max_keys: DEFAULT_MAX_KEYS,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            replication_id: "primary-01".to_string(),
            replica_of: None,
            sweep_interval: Duration::from_secs(10),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Flips the process-wide shutdown flag; background loops and workers
/// observe it and wind down.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The underlying flag, for signal-handler registration.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

/// The Cinnabar TCP server.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: Arc<AtomicBool>,
    sweep_interval: Duration,
    heartbeat_interval: Duration,
}

impl Server {
    /// Binds the listener and initializes the engine and role state.
    ///
    /// Failures here (bind, snapshot initialization) are fatal: the
    /// caller exits non-zero.
    pub fn bind(opts: ServerOptions) -> ServerResult<Self> {
        let listener = TcpListener::bind(&opts.bind_addr).map_err(|e| ServerError::BindFailed {
            addr: opts.bind_addr.clone(),
            source: e,
        })?;

        let engine = Arc::new(Engine::open(&opts.snapshot_path, opts.max_keys)?);

        let role = match &opts.replica_of {
            None => RoleState::Primary(Arc::new(Primary::new(
                opts.replication_id.clone(),
                opts.backlog_capacity,
            ))),
            Some((host, port)) => RoleState::Replica(Arc::new(Replica::new(ReplicaConfig {
                master_host: host.clone(),
                master_port: *port,
                listening_port: listener.local_addr()?.port(),
            }))),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ServerState::new(
            engine,
            role,
            shutdown.clone(),
            opts.backup_path,
        ));

        Ok(Self {
            listener,
            state,
            shutdown,
            sweep_interval: opts.sweep_interval,
            heartbeat_interval: opts.heartbeat_interval,
        })
    }

    /// The bound address (useful with ephemeral ports).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle that stops the server from another thread or a signal
    /// handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
        }
    }

    /// The shared state, exposed for integration tests.
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Runs the accept loop until shutdown. Spawns the background tasks
    /// (sweeper; heartbeat or replica reader) and one worker thread per
    /// accepted connection.
    pub fn run(self) -> ServerResult<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, role = %self.state.role(), "server listening");

        self.spawn_sweeper();
        self.spawn_role_task();

        self.listener.set_nonblocking(true)?;
        let mut next_conn_id: u64 = 1;

        while !self.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _peer)) => {
                    stream.set_nonblocking(false)?;
                    let conn_id = next_conn_id;
                    next_conn_id += 1;

                    let state = self.state.clone();
                    thread::Builder::new()
                        .name(format!("conn-{conn_id}"))
                        .spawn(move || connection::serve_connection(&state, &stream, conn_id))?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        tracing::info!("server shut down");
        Ok(())
    }

    /// Background expiration + eviction pass on a fixed interval.
    fn spawn_sweeper(&self) {
        let engine = self.state.engine.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.sweep_interval;

        thread::Builder::new()
            .name("sweeper".to_string())
            .spawn(move || {
                while sleep_unless_shutdown(interval, &shutdown) {
                    engine.sweep();
                }
            })
            .expect("failed to spawn sweeper thread");
    }

    /// Primary: heartbeat loop. Replica: dedicated master-stream reader.
    fn spawn_role_task(&self) {
        match &self.state.role {
            RoleState::Primary(primary) => {
                let primary = primary.clone();
                let shutdown = self.shutdown.clone();
                let interval = self.heartbeat_interval;

                thread::Builder::new()
                    .name("heartbeat".to_string())
                    .spawn(move || {
                        while sleep_unless_shutdown(interval, &shutdown) {
                            primary.heartbeat_pass();
                        }
                    })
                    .expect("failed to spawn heartbeat thread");
            }
            RoleState::Replica(replica) => {
                let replica = replica.clone();
                let engine = self.state.engine.clone();
                let applier: Arc<dyn CommandApplier> = Arc::new(MasterApplier {
                    state: self.state.clone(),
                });
                let shutdown = self.shutdown.clone();

                thread::Builder::new()
                    .name("replica-reader".to_string())
                    .spawn(move || replica.run(&engine, &applier, &shutdown))
                    .expect("failed to spawn replica reader thread");
            }
        }
    }
}

/// Applies master-stream commands through the dispatch table with the
/// master flag set; replies are discarded.
struct MasterApplier {
    state: Arc<ServerState>,
}

impl CommandApplier for MasterApplier {
    fn apply(&self, cmd: &Command) {
        let mut ctx = ConnectionCtx::master_apply();
        let _ = self.state.execute(&mut ctx, cmd);
    }
}

/// Sleeps `total` in short ticks; returns `false` as soon as shutdown is
/// observed.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    const TICK: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let step = remaining.min(TICK);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !shutdown.load(Ordering::Acquire)
}
