//! # cinnabar-server: Cinnabar server daemon
//!
//! The TCP server that exposes the Cinnabar engine over the wire protocol
//! defined in `cinnabar-wire`.
//!
//! ## Architecture
//!
//! The server uses plain blocking I/O with one worker thread per client
//! connection: explicit control flow, no async runtime.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      cinnabar-server                      │
//! │  ┌──────────┐   ┌─────────────┐   ┌────────────────────┐  │
//! │  │ Listener │ → │ Worker/conn │ → │ CommandTable       │  │
//! │  │  (TCP)   │   │ (blocking)  │   │  (→ Engine, Repl)  │  │
//! │  └──────────┘   └─────────────┘   └────────────────────┘  │
//! │        background: sweeper · heartbeat · replica reader   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes on a primary are propagated: after the keyspace mutation
//! succeeds, the command is re-serialized into array framing, appended to
//! the replication backlog and fanned out to every registered replica
//! inside one critical section. On a replica, write commands from direct
//! clients are rejected by the read-only guard; only the master stream
//! (applied with the master-command flag) may mutate state.

mod commands;
mod connection;
mod error;
mod server;

pub use commands::{CommandTable, ConnectionCtx, HandlerOutcome, ServerState};
pub use error::{ServerError, ServerResult};
pub use server::{Server, ServerOptions, ShutdownHandle};
