//! Command dispatch: the name → handler table and all command handlers.
//!
//! Handlers share one function shape: they take the shared server state,
//! the per-connection context, and the parsed command, and return the
//! replies to write (or nothing, for replication-stream commands whose
//! replies would pollute the stream).
//!
//! The dispatcher enforces two cross-cutting rules before and after the
//! handler runs:
//!
//! - **read-only guard**: a write command from a direct client is
//!   rejected on a replica; the master stream (applied with
//!   `from_master`) bypasses the guard;
//! - **propagation**: on a primary, a write command that succeeded is
//!   re-serialized to array framing and handed to the replication path.

use std::collections::HashMap;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use cinnabar_engine::{Engine, SetOptions};
use cinnabar_repl::{Capabilities, Primary, ReplConf, RoleState, sync};
use cinnabar_types::{ReplOffset, Role};
use cinnabar_wire::{Command, Reply, encode_command};

/// What a handler produced.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Replies to encode and write back, in order.
    Replies(Vec<Reply>),
    /// Nothing goes back on the socket (SYNC streaming, REPLCONF ACK).
    NoReply,
}

impl HandlerOutcome {
    fn one(reply: Reply) -> Self {
        HandlerOutcome::Replies(vec![reply])
    }

    /// The replies, empty for [`HandlerOutcome::NoReply`].
    pub fn replies(&self) -> &[Reply] {
        match self {
            HandlerOutcome::Replies(replies) => replies,
            HandlerOutcome::NoReply => &[],
        }
    }

    /// A command "succeeded" (for propagation purposes) when it produced
    /// no error reply.
    fn is_success(&self) -> bool {
        !self
            .replies()
            .iter()
            .any(|reply| matches!(reply, Reply::Error(_)))
    }
}

/// Per-connection context handed to every handler.
pub struct ConnectionCtx<'a> {
    /// Stable connection id; doubles as the replica id after SYNC.
    pub conn_id: u64,
    /// True when the command came off the master stream on a replica.
    pub from_master: bool,
    /// The raw socket, for handlers that stream (SYNC/PSYNC). Absent for
    /// master-applied commands.
    pub stream: Option<&'a TcpStream>,
    /// `REPLCONF LISTENING-PORT` seen before this connection registered
    /// as a replica.
    pub pending_listening_port: Option<u16>,
    /// `REPLCONF CAPA` seen before registration.
    pub pending_capabilities: Capabilities,
    /// Set once SYNC/PSYNC registered this connection as a replica; the
    /// worker deregisters it on disconnect.
    pub registered_replica: bool,
}

impl<'a> ConnectionCtx<'a> {
    /// Context for a direct client connection.
    pub fn client(conn_id: u64, stream: &'a TcpStream) -> Self {
        Self {
            conn_id,
            from_master: false,
            stream: Some(stream),
            pending_listening_port: None,
            pending_capabilities: Capabilities::default(),
            registered_replica: false,
        }
    }

    /// Context for applying a command from the master stream.
    pub fn master_apply() -> ConnectionCtx<'static> {
        ConnectionCtx {
            from_master: true,
            ..ConnectionCtx::detached(0)
        }
    }

    /// Socket-less client context (tests, internal dispatch).
    pub fn detached(conn_id: u64) -> ConnectionCtx<'static> {
        ConnectionCtx {
            conn_id,
            from_master: false,
            stream: None,
            pending_listening_port: None,
            pending_capabilities: Capabilities::default(),
            registered_replica: false,
        }
    }
}

type HandlerFn = fn(&ServerState, &mut ConnectionCtx<'_>, &Command) -> HandlerOutcome;

struct CommandSpec {
    handler: HandlerFn,
    /// Drives the read-only guard and primary propagation.
    is_write: bool,
}

/// Case-insensitive name → handler mapping, populated at startup.
pub struct CommandTable {
    commands: HashMap<&'static str, CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        let mut table = Self {
            commands: HashMap::new(),
        };
        table.register("PING", cmd_ping, false);
        table.register("ECHO", cmd_echo, false);
        table.register("SET", cmd_set, true);
        table.register("GET", cmd_get, false);
        table.register("SETEX", cmd_setex, true);
        table.register("GETEX", cmd_getex, true);
        table.register("DEL", cmd_del, true);
        table.register("EXPIRE", cmd_expire, true);
        table.register("INCR", cmd_incr, true);
        table.register("MGET", cmd_mget, false);
        table.register("GETTTL", cmd_getttl, false);
        table.register("COPY", cmd_copy, true);
        table.register("AGGREGATE", cmd_aggregate, false);
        table.register("QUERY", cmd_query, false);
        table.register("STREAM", cmd_stream, false);
        table.register("HSEARCH", cmd_hsearch, false);
        table.register("SETV", cmd_setv, true);
        table.register("HISTORY", cmd_history, false);
        table.register("BULK_SET", cmd_bulk_set, true);
        table.register("BULK_GET", cmd_bulk_get, false);
        table.register("FLUSHALL", cmd_flushall, true);
        table.register("BACKUP", cmd_backup, false);
        table.register("SYNC", cmd_sync, false);
        table.register("PSYNC", cmd_psync, false);
        table.register("REPLCONF", cmd_replconf, false);
        table.register("SELECT", cmd_select, false);
        table
    }

    fn register(&mut self, name: &'static str, handler: HandlerFn, is_write: bool) {
        self.commands.insert(name, CommandSpec { handler, is_write });
    }

    fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every connection worker and background task.
pub struct ServerState {
    pub engine: Arc<Engine>,
    pub role: RoleState,
    pub shutdown: Arc<AtomicBool>,
    /// Target of the `BACKUP` convenience command.
    pub backup_path: PathBuf,
    table: CommandTable,
}

impl ServerState {
    pub fn new(
        engine: Arc<Engine>,
        role: RoleState,
        shutdown: Arc<AtomicBool>,
        backup_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            role,
            shutdown,
            backup_path,
            table: CommandTable::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    fn primary(&self) -> Option<&Arc<Primary>> {
        self.role.as_primary()
    }

    /// Dispatches one command: lookup, read-only guard, handler,
    /// propagation.
    pub fn execute(&self, ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
        if cmd.arity() == 0 {
            return HandlerOutcome::one(Reply::error("empty command"));
        }

        let name = cmd.name_upper();
        let Some(spec) = self.table.get(name.as_str()) else {
            return HandlerOutcome::one(Reply::error("unknown command"));
        };

        if spec.is_write && self.role() == Role::Replica && !ctx.from_master {
            return HandlerOutcome::one(Reply::error(
                "READONLY You can't write against a read only slave.",
            ));
        }

        let outcome = (spec.handler)(self, ctx, cmd);

        // A successful write on the primary is re-serialized exactly as a
        // client would send it and handed to the propagation path.
        if spec.is_write && outcome.is_success() && !ctx.from_master {
            if let Some(primary) = self.primary() {
                primary.propagate(&encode_command(cmd));
            }
        }

        outcome
    }
}

// ============================================================================
// Keyspace commands
// ============================================================================

fn cmd_ping(_state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    match cmd.arg(1) {
        None => HandlerOutcome::one(Reply::Simple("PONG".to_string())),
        Some(message) => HandlerOutcome::one(Reply::bulk(message.clone())),
    }
}

fn cmd_echo(_state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    match cmd.arg(1) {
        None => HandlerOutcome::one(Reply::wrong_arity("ECHO")),
        Some(message) => HandlerOutcome::one(Reply::bulk(message.clone())),
    }
}

fn cmd_set(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("SET"));
    }

    let mut opts = SetOptions::default();
    let mut i = 3;
    while i < cmd.arity() {
        if cmd.arg_eq_ignore_case(i, "EX") {
            if i + 1 >= cmd.arity() {
                return HandlerOutcome::one(Reply::error("Missing expiration time for EX"));
            }
            let Some(seconds) = cmd.arg_i64(i + 1).and_then(|s| u64::try_from(s).ok()) else {
                return HandlerOutcome::one(Reply::error("value is not an integer"));
            };
            // EX 0 means "no expiration", as it always has.
            opts.ex = (seconds > 0).then_some(seconds);
            i += 2;
        } else if cmd.arg_eq_ignore_case(i, "CAS") {
            if i + 1 >= cmd.arity() {
                return HandlerOutcome::one(Reply::error("CAS requires a value"));
            }
            let Some(expected) = cmd.arg_i64(i + 1) else {
                return HandlerOutcome::one(Reply::error("value is not an integer"));
            };
            opts.cas = Some(expected);
            i += 2;
        } else {
            // Unrecognized options pass through, as they always have.
            i += 1;
        }
    }

    let key = cmd.args()[1].clone();
    let value = cmd.args()[2].clone();
    match state.engine.set(key, value, opts) {
        Ok(()) => HandlerOutcome::one(Reply::ok()),
        Err(e) => HandlerOutcome::one(Reply::error(e.to_string())),
    }
}

fn cmd_get(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    let Some(key) = cmd.arg(1) else {
        return HandlerOutcome::one(Reply::wrong_arity("GET"));
    };
    HandlerOutcome::one(match state.engine.get(key) {
        Some(value) => Reply::Bulk(value),
        None => Reply::nil(),
    })
}

fn cmd_setex(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 4 {
        return HandlerOutcome::one(Reply::wrong_arity("SETEX"));
    }
    let Some(seconds) = cmd.arg_i64(3).and_then(|s| u64::try_from(s).ok()) else {
        return HandlerOutcome::one(Reply::error("value is not an integer"));
    };

    let key = cmd.args()[1].clone();
    let value = cmd.args()[2].clone();
    match state.engine.setex(key, value, seconds) {
        Ok(()) => HandlerOutcome::one(Reply::ok()),
        Err(e) => HandlerOutcome::one(Reply::error(e.to_string())),
    }
}

fn cmd_getex(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    let Some(key) = cmd.arg(1) else {
        return HandlerOutcome::one(Reply::wrong_arity("GETEX"));
    };
    HandlerOutcome::one(match state.engine.getex(key) {
        Some(value) => Reply::Bulk(value),
        None => Reply::nil(),
    })
}

fn cmd_del(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 2 {
        return HandlerOutcome::one(Reply::wrong_arity("DEL"));
    }
    let deleted = state.engine.del(&cmd.args()[1..]);
    HandlerOutcome::one(Reply::Integer(deleted as i64))
}

fn cmd_expire(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("EXPIRE"));
    }
    let Some(seconds) = cmd.arg_i64(2).and_then(|s| u64::try_from(s).ok()) else {
        return HandlerOutcome::one(Reply::error("value is not an integer"));
    };
    let key = &cmd.args()[1];
    match state.engine.expire(key, seconds) {
        Ok(true) => HandlerOutcome::one(Reply::Integer(1)),
        Ok(false) => HandlerOutcome::one(Reply::Integer(0)),
        Err(e) => HandlerOutcome::one(Reply::error(e.to_string())),
    }
}

fn cmd_incr(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    let Some(key) = cmd.arg(1) else {
        return HandlerOutcome::one(Reply::wrong_arity("INCR"));
    };
    match state.engine.incr(key) {
        Ok(value) => HandlerOutcome::one(Reply::Integer(value)),
        Err(e) => HandlerOutcome::one(Reply::error(e.to_string())),
    }
}

fn cmd_mget(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 2 {
        return HandlerOutcome::one(Reply::wrong_arity("MGET"));
    }
    let replies = state
        .engine
        .mget(&cmd.args()[1..])
        .into_iter()
        .map(|value| value.map_or_else(Reply::nil, Reply::Bulk))
        .collect();
    HandlerOutcome::Replies(replies)
}

fn cmd_getttl(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    let Some(key) = cmd.arg(1) else {
        return HandlerOutcome::one(Reply::wrong_arity("GETTTL"));
    };
    HandlerOutcome::Replies(match state.engine.getttl(key) {
        Some((value, ttl)) => vec![Reply::Bulk(value), Reply::Integer(ttl)],
        None => vec![Reply::nil(), Reply::Integer(-1)],
    })
}

fn cmd_copy(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("COPY"));
    }

    let mut ex = None;
    if cmd.arg_eq_ignore_case(3, "EX") {
        let Some(seconds) = cmd.arg_i64(4).and_then(|s| u64::try_from(s).ok()) else {
            return HandlerOutcome::one(Reply::error("value is not an integer"));
        };
        ex = Some(seconds);
    }

    let src = &cmd.args()[1];
    let dst = cmd.args()[2].clone();
    match state.engine.copy(src, dst, ex) {
        Ok(()) => HandlerOutcome::one(Reply::ok()),
        Err(e) => HandlerOutcome::one(Reply::error(e.to_string())),
    }
}

fn cmd_aggregate(
    state: &ServerState,
    _ctx: &mut ConnectionCtx<'_>,
    cmd: &Command,
) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("AGGREGATE"));
    }
    // args[1] names the aggregation; summation is the only one.
    match state.engine.aggregate(&cmd.args()[2..]) {
        Ok(sum) => HandlerOutcome::one(Reply::Integer(sum)),
        Err(e) => HandlerOutcome::one(Reply::error(e.to_string())),
    }
}

fn cmd_query(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("QUERY"));
    }
    HandlerOutcome::one(peek_reply(&state.engine, &cmd.args()[1]))
}

fn cmd_stream(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 4 {
        return HandlerOutcome::one(Reply::wrong_arity("STREAM"));
    }
    HandlerOutcome::one(peek_reply(&state.engine, &cmd.args()[1]))
}

fn cmd_hsearch(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("HSEARCH"));
    }
    HandlerOutcome::one(peek_reply(&state.engine, &cmd.args()[1]))
}

fn peek_reply(engine: &Engine, key: &Bytes) -> Reply {
    match engine.peek(key) {
        Some(value) => Reply::Bulk(value),
        None => Reply::nil(),
    }
}

fn cmd_setv(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 {
        return HandlerOutcome::one(Reply::wrong_arity("SETV"));
    }
    state
        .engine
        .setv(cmd.args()[1].clone(), cmd.args()[2].clone());
    HandlerOutcome::one(Reply::ok())
}

fn cmd_history(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    let Some(key) = cmd.arg(1) else {
        return HandlerOutcome::one(Reply::wrong_arity("HISTORY"));
    };
    match state.engine.history(key) {
        Some(versions) => {
            HandlerOutcome::Replies(versions.into_iter().map(Reply::Bulk).collect())
        }
        None => HandlerOutcome::one(Reply::nil()),
    }
}

fn cmd_bulk_set(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 3 || cmd.arity() % 2 != 1 {
        return HandlerOutcome::one(Reply::wrong_arity("BULK_SET"));
    }
    for pair in cmd.args()[1..].chunks_exact(2) {
        if let Err(e) = state
            .engine
            .set(pair[0].clone(), pair[1].clone(), SetOptions::default())
        {
            return HandlerOutcome::one(Reply::error(e.to_string()));
        }
    }
    HandlerOutcome::one(Reply::ok())
}

fn cmd_bulk_get(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 2 {
        return HandlerOutcome::one(Reply::wrong_arity("BULK_GET"));
    }
    let replies = state
        .engine
        .mget(&cmd.args()[1..])
        .into_iter()
        .map(|value| value.map_or_else(Reply::nil, Reply::Bulk))
        .collect();
    HandlerOutcome::Replies(replies)
}

fn cmd_flushall(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, _cmd: &Command) -> HandlerOutcome {
    state.engine.flushall();
    HandlerOutcome::one(Reply::ok())
}

fn cmd_backup(state: &ServerState, _ctx: &mut ConnectionCtx<'_>, _cmd: &Command) -> HandlerOutcome {
    match state.engine.backup(&state.backup_path) {
        Ok(entries) => {
            tracing::info!(entries, path = %state.backup_path.display(), "backup written");
            HandlerOutcome::one(Reply::Simple("Backup completed".to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "backup failed");
            HandlerOutcome::one(Reply::error("failed to open backup file"))
        }
    }
}

fn cmd_select(_state: &ServerState, _ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() < 2 {
        return HandlerOutcome::one(Reply::wrong_arity("SELECT"));
    }
    // 16 database slots exist; only slot 0 is functional.
    match cmd.arg_i64(1) {
        Some(index) if (0..16).contains(&index) => HandlerOutcome::one(Reply::ok()),
        _ => HandlerOutcome::one(Reply::error("invalid database index")),
    }
}

// ============================================================================
// Replication commands
// ============================================================================

fn cmd_sync(state: &ServerState, ctx: &mut ConnectionCtx<'_>, _cmd: &Command) -> HandlerOutcome {
    full_sync(state, ctx)
}

fn cmd_psync(state: &ServerState, ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    if cmd.arity() != 3 {
        return HandlerOutcome::one(Reply::wrong_arity("PSYNC"));
    }
    let Some(primary) = state.role.as_primary() else {
        return HandlerOutcome::one(Reply::error("not a master"));
    };

    // A parseable offset inside the backlog window gets the incremental
    // path; anything else (including the `?` placeholder) is a full sync.
    if let Some(offset) = cmd.arg_str(2).and_then(|s| s.parse::<u64>().ok()) {
        let Some(stream) = ctx.stream else {
            return HandlerOutcome::one(Reply::error("sync requires a client connection"));
        };
        let out = match stream.try_clone() {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, "could not clone replica socket");
                return HandlerOutcome::one(Reply::error("sync failed"));
            }
        };
        match primary.try_partial_sync(ctx.conn_id, out, ReplOffset::new(offset)) {
            Ok(true) => {
                ctx.registered_replica = true;
                return HandlerOutcome::NoReply;
            }
            Ok(false) => {} // fall through to full sync
            Err(e) => {
                tracing::warn!(error = %e, "partial sync failed");
                return HandlerOutcome::one(Reply::error("sync failed"));
            }
        }
    }

    full_sync(state, ctx)
}

/// SYNC (or PSYNC fallback): ship the whole snapshot, then register the
/// replica for live propagation at the current backlog offset.
fn full_sync(state: &ServerState, ctx: &mut ConnectionCtx<'_>) -> HandlerOutcome {
    let Some(primary) = state.role.as_primary() else {
        return HandlerOutcome::one(Reply::error("not a master"));
    };
    let Some(stream) = ctx.stream else {
        return HandlerOutcome::one(Reply::error("sync requires a client connection"));
    };

    let (registry_end, mut transfer_end) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return HandlerOutcome::one(Reply::error("sync failed")),
    };

    primary.register(
        ctx.conn_id,
        registry_end,
        ctx.pending_listening_port,
        ctx.pending_capabilities,
    );

    match sync::serve_full_sync(&state.engine, &mut transfer_end) {
        Ok(()) => {
            primary.finish_sync(ctx.conn_id);
            ctx.registered_replica = true;
            HandlerOutcome::NoReply
        }
        Err(e) => {
            tracing::warn!(replica = ctx.conn_id, error = %e, "full sync failed");
            primary.remove(ctx.conn_id);
            HandlerOutcome::one(Reply::error("sync failed"))
        }
    }
}

fn cmd_replconf(state: &ServerState, ctx: &mut ConnectionCtx<'_>, cmd: &Command) -> HandlerOutcome {
    let parsed = match ReplConf::parse(cmd) {
        Ok(parsed) => parsed,
        Err(e) => return HandlerOutcome::one(Reply::error(e.to_string())),
    };

    match parsed {
        // ACK is accepted silently: a reply here would interleave with
        // the propagated command stream on the same socket.
        ReplConf::Ack(offset) => match state.role.as_primary() {
            Some(primary) => {
                if primary.update_ack(ctx.conn_id, offset) {
                    HandlerOutcome::NoReply
                } else {
                    HandlerOutcome::one(Reply::error("slave not found"))
                }
            }
            None => HandlerOutcome::one(Reply::error("REPLCONF ACK only valid on master")),
        },

        ReplConf::ListeningPort(port) => {
            let recorded = state
                .role
                .as_primary()
                .is_some_and(|primary| primary.record_listening_port(ctx.conn_id, port));
            if !recorded {
                // Not registered yet: stash for the upcoming SYNC.
                ctx.pending_listening_port = Some(port);
            }
            HandlerOutcome::one(Reply::ok())
        }

        ReplConf::Capa(capabilities) => {
            let recorded = state
                .role
                .as_primary()
                .is_some_and(|primary| primary.record_capabilities(ctx.conn_id, capabilities));
            if !recorded {
                ctx.pending_capabilities = capabilities;
            }
            HandlerOutcome::one(Reply::ok())
        }

        ReplConf::GetAck => match state.role.as_primary() {
            Some(primary) => {
                primary.request_acks();
                HandlerOutcome::one(Reply::ok())
            }
            None => HandlerOutcome::one(Reply::error("REPLCONF GETACK only valid on master")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinnabar_repl::{DEFAULT_BACKLOG_CAPACITY, Replica, ReplicaConfig};
    use cinnabar_wire::{Decoded, decode_command};
    use tempfile::TempDir;

    fn primary_state(dir: &TempDir) -> ServerState {
        let engine = Arc::new(Engine::open(dir.path().join("cinnabar.cdb"), 1000).unwrap());
        ServerState::new(
            engine,
            RoleState::Primary(Arc::new(Primary::new("primary-01", DEFAULT_BACKLOG_CAPACITY))),
            Arc::new(AtomicBool::new(false)),
            dir.path().join("backup.rdb"),
        )
    }

    fn replica_state(dir: &TempDir) -> ServerState {
        let engine = Arc::new(Engine::open(dir.path().join("cinnabar.cdb"), 1000).unwrap());
        let replica = Replica::new(ReplicaConfig {
            master_host: "127.0.0.1".to_string(),
            master_port: 6379,
            listening_port: 6380,
        });
        ServerState::new(
            engine,
            RoleState::Replica(Arc::new(replica)),
            Arc::new(AtomicBool::new(false)),
            dir.path().join("backup.rdb"),
        )
    }

    fn cmd(parts: &[&str]) -> Command {
        Command::from_args(
            parts
                .iter()
                .map(|p| Bytes::copy_from_slice(p.as_bytes()))
                .collect(),
        )
    }

    fn run(state: &ServerState, parts: &[&str]) -> Vec<Reply> {
        let mut ctx = ConnectionCtx::detached(1);
        state.execute(&mut ctx, &cmd(parts)).replies().to_vec()
    }

    #[test]
    fn set_get_del_scenario() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["SET", "k1", "v1"]), vec![Reply::ok()]);
        assert_eq!(run(&state, &["GET", "k1"]), vec![Reply::bulk("v1")]);
        assert_eq!(run(&state, &["DEL", "k1"]), vec![Reply::Integer(1)]);
        assert_eq!(run(&state, &["GET", "k1"]), vec![Reply::nil()]);
    }

    #[test]
    fn incr_and_cas_scenario() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["SET", "n", "10"]), vec![Reply::ok()]);
        assert_eq!(run(&state, &["INCR", "n"]), vec![Reply::Integer(11)]);
        assert_eq!(
            run(&state, &["SET", "n", "99", "CAS", "7"]),
            vec![Reply::error("CAS failed: value does not match")]
        );
        assert_eq!(run(&state, &["SET", "n", "99", "CAS", "11"]), vec![Reply::ok()]);
        assert_eq!(run(&state, &["GET", "n"]), vec![Reply::bulk("99")]);
    }

    #[test]
    fn unknown_and_empty_commands() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["FROBNICATE"]), vec![Reply::error("unknown command")]);
        assert_eq!(run(&state, &[]), vec![Reply::error("empty command")]);
    }

    #[test]
    fn dispatch_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["set", "k", "v"]), vec![Reply::ok()]);
        assert_eq!(run(&state, &["gEt", "k"]), vec![Reply::bulk("v")]);
    }

    #[test]
    fn ping_and_echo() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["PING"]), vec![Reply::Simple("PONG".to_string())]);
        assert_eq!(run(&state, &["PING", "hey"]), vec![Reply::bulk("hey")]);
        assert_eq!(run(&state, &["ECHO", "hello"]), vec![Reply::bulk("hello")]);
        assert_eq!(run(&state, &["ECHO"]), vec![Reply::wrong_arity("ECHO")]);
    }

    #[test]
    fn mget_answers_every_key() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        run(&state, &["SET", "a", "1"]);
        run(&state, &["SET", "c", "3"]);
        assert_eq!(
            run(&state, &["MGET", "a", "b", "c"]),
            vec![Reply::bulk("1"), Reply::nil(), Reply::bulk("3")]
        );
    }

    #[test]
    fn getttl_replies_value_and_ttl() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        run(&state, &["SET", "k", "v", "EX", "100"]);
        let replies = run(&state, &["GETTTL", "k"]);
        assert_eq!(replies[0], Reply::bulk("v"));
        assert!(matches!(replies[1], Reply::Integer(ttl) if ttl > 0 && ttl <= 100));

        assert_eq!(
            run(&state, &["GETTTL", "ghost"]),
            vec![Reply::nil(), Reply::Integer(-1)]
        );
    }

    #[test]
    fn history_chain_replies() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        run(&state, &["SETV", "k", "v1"]);
        run(&state, &["SETV", "k", "v2"]);
        assert_eq!(
            run(&state, &["HISTORY", "k"]),
            vec![Reply::bulk("v2"), Reply::bulk("v1")]
        );
        assert_eq!(run(&state, &["HISTORY", "none"]), vec![Reply::nil()]);

        assert_eq!(run(&state, &["FLUSHALL"]), vec![Reply::ok()]);
        assert_eq!(run(&state, &["HISTORY", "k"]), vec![Reply::nil()]);
    }

    #[test]
    fn bulk_set_requires_pairs() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["BULK_SET", "a", "1", "b", "2"]), vec![Reply::ok()]);
        assert_eq!(
            run(&state, &["BULK_GET", "a", "b", "c"]),
            vec![Reply::bulk("1"), Reply::bulk("2"), Reply::nil()]
        );
        assert_eq!(
            run(&state, &["BULK_SET", "a", "1", "dangling"]),
            vec![Reply::wrong_arity("BULK_SET")]
        );
    }

    #[test]
    fn select_validates_slot_index() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(run(&state, &["SELECT", "0"]), vec![Reply::ok()]);
        assert_eq!(run(&state, &["SELECT", "15"]), vec![Reply::ok()]);
        assert_eq!(
            run(&state, &["SELECT", "16"]),
            vec![Reply::error("invalid database index")]
        );
        assert_eq!(
            run(&state, &["SELECT", "-1"]),
            vec![Reply::error("invalid database index")]
        );
    }

    #[test]
    fn writes_propagate_into_the_backlog() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);
        let primary = state.role.as_primary().unwrap().clone();

        run(&state, &["SET", "a", "1"]);
        run(&state, &["GET", "a"]); // reads must not propagate
        run(&state, &["SET", "b", "2"]);

        // The backlog window parses back to exactly the write sequence.
        let (start, _) = primary.backlog_window();
        let window = primary.backlog_slice(start).expect("window covers start");
        let mut buf = bytes::BytesMut::from(&window[..]);
        let mut parsed = Vec::new();
        while let Decoded::Frame(frame) = decode_command(&mut buf).unwrap() {
            parsed.push(frame);
        }
        assert_eq!(parsed, vec![cmd(&["SET", "a", "1"]), cmd(&["SET", "b", "2"])]);
    }

    #[test]
    fn failed_writes_do_not_propagate() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);
        let primary = state.role.as_primary().unwrap().clone();

        run(&state, &["INCR", "missing"]);
        assert_eq!(primary.current_offset(), ReplOffset::ZERO);
    }

    #[test]
    fn readonly_guard_rejects_client_writes_on_replica() {
        let dir = TempDir::new().unwrap();
        let state = replica_state(&dir);

        assert_eq!(
            run(&state, &["SET", "k", "v"]),
            vec![Reply::error("READONLY You can't write against a read only slave.")]
        );
        assert_eq!(run(&state, &["GET", "k"]), vec![Reply::nil()], "keyspace unchanged");
        // Reads are always allowed.
        assert_eq!(run(&state, &["PING"]), vec![Reply::Simple("PONG".to_string())]);
    }

    #[test]
    fn master_stream_bypasses_readonly_guard() {
        let dir = TempDir::new().unwrap();
        let state = replica_state(&dir);

        let mut ctx = ConnectionCtx::master_apply();
        let outcome = state.execute(&mut ctx, &cmd(&["SET", "k", "v"]));
        assert_eq!(outcome.replies(), &[Reply::ok()]);
        assert_eq!(run(&state, &["GET", "k"]), vec![Reply::bulk("v")]);
    }

    #[test]
    fn sync_on_replica_is_an_error() {
        let dir = TempDir::new().unwrap();
        let state = replica_state(&dir);
        assert_eq!(run(&state, &["SYNC"]), vec![Reply::error("not a master")]);
    }

    #[test]
    fn replconf_stashes_port_before_registration() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        let mut ctx = ConnectionCtx::detached(1);
        let outcome = state.execute(&mut ctx, &cmd(&["REPLCONF", "LISTENING-PORT", "6380"]));
        assert_eq!(outcome.replies(), &[Reply::ok()]);
        assert_eq!(ctx.pending_listening_port, Some(6380));
    }

    #[test]
    fn replconf_errors_have_exact_messages() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        assert_eq!(
            run(&state, &["REPLCONF", "BOGUS"]),
            vec![Reply::error("unknown REPLCONF subcommand")]
        );
        assert_eq!(
            run(&state, &["REPLCONF", "LISTENING-PORT", "0"]),
            vec![Reply::error("invalid port number")]
        );
        assert_eq!(
            run(&state, &["REPLCONF", "ACK", "5"]),
            vec![Reply::error("slave not found")]
        );
    }

    #[test]
    fn backup_writes_snapshot_to_backup_path() {
        let dir = TempDir::new().unwrap();
        let state = primary_state(&dir);

        run(&state, &["SET", "a", "1"]);
        assert_eq!(
            run(&state, &["BACKUP"]),
            vec![Reply::Simple("Backup completed".to_string())]
        );
        assert!(dir.path().join("backup.rdb").exists());
    }
}
