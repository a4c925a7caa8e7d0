//! Per-connection worker: read frames, dispatch, write replies.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use cinnabar_wire::{Decoded, Reply, decode_command};

use crate::commands::{ConnectionCtx, ServerState};

/// How often a blocked read wakes up to check the shutdown flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Serves one client connection until the peer hangs up or the server
/// shuts down.
///
/// Commands on a single socket are applied in arrival order and replies
/// are written in that same order. A protocol error answers `-ERR protocol
/// error` and keeps the connection open.
pub fn serve_connection(state: &Arc<ServerState>, stream: &TcpStream, conn_id: u64) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
    tracing::debug!(conn = conn_id, peer = %peer, "client connected");

    if let Err(e) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
        tracing::warn!(conn = conn_id, error = %e, "failed to configure socket");
        return;
    }

    let mut ctx = ConnectionCtx::client(conn_id, stream);
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    'conn: while !state.shutdown.load(Ordering::Acquire) {
        let read = match (&mut &*stream).read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::debug!(conn = conn_id, error = %e, "read error");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..read]);

        loop {
            match decode_command(&mut buf) {
                Ok(Decoded::Frame(cmd)) => {
                    let outcome = state.execute(&mut ctx, &cmd);
                    let mut reply_buf = BytesMut::new();
                    for reply in outcome.replies() {
                        reply.encode_into(&mut reply_buf);
                    }
                    if !reply_buf.is_empty() && (&mut &*stream).write_all(&reply_buf).is_err() {
                        break 'conn;
                    }
                }
                Ok(Decoded::Incomplete) => break,
                Err(e) => {
                    tracing::debug!(conn = conn_id, error = %e, "protocol error");
                    let protocol_error = Reply::error("protocol error").to_bytes();
                    if (&mut &*stream).write_all(&protocol_error).is_err() {
                        break 'conn;
                    }
                    // The unparseable bytes are discarded; the connection
                    // stays open for the next frame.
                    buf.clear();
                    break;
                }
            }
        }
    }

    // If SYNC/PSYNC turned this connection into a replica feed, drop its
    // descriptor now that the socket is gone.
    if ctx.registered_replica {
        if let Some(primary) = state.role.as_primary() {
            primary.remove(conn_id);
        }
    }
    tracing::debug!(conn = conn_id, peer = %peer, "client disconnected");
}
