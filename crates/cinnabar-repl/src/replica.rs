//! Replica-side replication: master connection, handshake, apply loop.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cinnabar_engine::Engine;
use cinnabar_types::ReplOffset;
use cinnabar_wire::{Command, Decoded, decode_command, encode_command};

use crate::sync::{parse_size_header, read_line, receive_full_sync};
use crate::{PING_FRAME, RECONNECT_DELAY, ReplError, ReplResult};

/// How often a blocked read wakes up to check the shutdown flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Handshake replies are expected promptly.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Applies commands streamed from the master.
///
/// The server implements this with its dispatch table: commands run with
/// the master-command flag set (so the read-only guard steps aside) and
/// their replies are discarded.
pub trait CommandApplier: Send + Sync {
    fn apply(&self, cmd: &Command);
}

/// Where to find the primary, and what to advertise to it.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub master_host: String,
    pub master_port: u16,
    /// Port this replica serves clients on, advertised via
    /// `REPLCONF LISTENING-PORT`.
    pub listening_port: u16,
}

/// Replica-role replication state.
///
/// [`Replica::run`] owns the dedicated reader loop; the atomics let
/// other threads observe progress without taking a lock.
pub struct Replica {
    config: ReplicaConfig,
    /// Bytes consumed from the master stream, ever. Advanced on every
    /// successful read, acknowledged via `REPLCONF ACK`.
    offset: AtomicU64,
    /// Whether a full sync has completed at least once.
    synced_once: AtomicBool,
    connected: AtomicBool,
}

impl Replica {
    pub fn new(config: ReplicaConfig) -> Self {
        Self {
            config,
            offset: AtomicU64::new(0),
            synced_once: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }
    }

    /// The replication offset last applied.
    pub fn offset(&self) -> ReplOffset {
        ReplOffset::new(self.offset.load(Ordering::Acquire))
    }

    /// Whether the master connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `host:port` of the primary this replica follows.
    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.config.master_host, self.config.master_port)
    }

    /// Runs the reader loop until shutdown: connect, handshake, apply the
    /// command stream, acknowledge, and reconnect with a one-second pause
    /// after any failure.
    pub fn run(
        &self,
        engine: &Arc<Engine>,
        applier: &Arc<dyn CommandApplier>,
        shutdown: &Arc<AtomicBool>,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            match self.connect_and_stream(engine, applier, shutdown) {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    self.connected.store(false, Ordering::Release);
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!(
                        master = %self.master_addr(),
                        error = %e,
                        "master connection lost, reconnecting"
                    );
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        self.connected.store(false, Ordering::Release);
    }

    /// One connection lifetime: handshake + streaming until an error or
    /// shutdown.
    fn connect_and_stream(
        &self,
        engine: &Arc<Engine>,
        applier: &Arc<dyn CommandApplier>,
        shutdown: &Arc<AtomicBool>,
    ) -> ReplResult<()> {
        let mut stream = TcpStream::connect((self.config.master_host.as_str(), self.config.master_port))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        self.handshake(&mut stream, engine)?;
        self.connected.store(true, Ordering::Release);
        tracing::info!(master = %self.master_addr(), offset = %self.offset(), "replication stream established");

        stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        self.stream_commands(&mut stream, applier, shutdown)
    }

    /// PING → REPLCONF LISTENING-PORT → REPLCONF CAPA → SYNC/PSYNC.
    fn handshake(&self, stream: &mut TcpStream, engine: &Arc<Engine>) -> ReplResult<()> {
        stream.write_all(PING_FRAME)?;
        expect_reply(stream, "+PONG")?;

        let port_cmd = command(&[
            "REPLCONF",
            "LISTENING-PORT",
            &self.config.listening_port.to_string(),
        ]);
        stream.write_all(&encode_command(&port_cmd))?;
        expect_reply(stream, "+OK")?;

        stream.write_all(&encode_command(&command(&["REPLCONF", "CAPA", "psync2"])))?;
        expect_reply(stream, "+OK")?;

        if self.synced_once.load(Ordering::Acquire) {
            // Resume: ask for the suffix from our current offset.
            let psync = command(&["PSYNC", "?", &self.offset().to_string()]);
            stream.write_all(&encode_command(&psync))?;

            let reply = read_line(stream)?;
            if reply == "+CONTINUE" {
                tracing::info!(offset = %self.offset(), "partial resync accepted");
                return Ok(());
            }
            // The primary fell back to a full sync.
            self.install_full_sync(stream, engine, &reply)
        } else {
            stream.write_all(&encode_command(&command(&["SYNC"])))?;
            let reply = read_line(stream)?;
            self.install_full_sync(stream, engine, &reply)
        }
    }

    fn install_full_sync(
        &self,
        stream: &mut TcpStream,
        engine: &Arc<Engine>,
        size_line: &str,
    ) -> ReplResult<()> {
        let payload_len = parse_size_header(size_line).ok_or(ReplError::Handshake {
            expected: "$<size> bulk header",
            got: size_line.to_string(),
        })?;
        receive_full_sync(stream, engine, payload_len)?;
        self.synced_once.store(true, Ordering::Release);
        Ok(())
    }

    /// The apply loop: read, advance the offset, drain whole frames,
    /// acknowledge.
    fn stream_commands(
        &self,
        stream: &mut TcpStream,
        applier: &Arc<dyn CommandApplier>,
        shutdown: &Arc<AtomicBool>,
    ) -> ReplResult<()> {
        let mut buf = BytesMut::with_capacity(4096);
        let mut chunk = [0u8; 4096];

        loop {
            if shutdown.load(Ordering::Acquire) {
                return Ok(());
            }

            let read = match stream.read(&mut chunk) {
                Ok(0) => return Err(ReplError::Protocol("master closed the connection")),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.offset.fetch_add(read as u64, Ordering::AcqRel);
            buf.extend_from_slice(&chunk[..read]);

            loop {
                match decode_command(&mut buf) {
                    Ok(Decoded::Frame(cmd)) => self.apply_one(stream, applier, &cmd)?,
                    Ok(Decoded::Incomplete) => break,
                    Err(e) => {
                        // A framing error means we lost stream alignment;
                        // only a resync can recover.
                        tracing::error!(error = %e, "unparseable bytes in replication stream");
                        return Err(ReplError::Protocol("bad frame in replication stream"));
                    }
                }
            }

            self.send_ack(stream)?;
        }
    }

    fn apply_one(
        &self,
        stream: &mut TcpStream,
        applier: &Arc<dyn CommandApplier>,
        cmd: &Command,
    ) -> ReplResult<()> {
        // GETACK is answered immediately rather than dispatched.
        if cmd.name_upper() == "REPLCONF" && cmd.arg_eq_ignore_case(1, "GETACK") {
            return self.send_ack(stream);
        }
        applier.apply(cmd);
        Ok(())
    }

    /// `REPLCONF ACK <offset>` back to the master.
    fn send_ack(&self, stream: &mut TcpStream) -> ReplResult<()> {
        let ack = command(&["REPLCONF", "ACK", &self.offset().to_string()]);
        stream.write_all(&encode_command(&ack))?;
        Ok(())
    }
}

fn command(parts: &[&str]) -> Command {
    Command::from_args(parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect())
}

/// Reads one handshake reply line and compares it to the expectation.
fn expect_reply(stream: &mut TcpStream, expected: &'static str) -> ReplResult<()> {
    let line = read_line(stream)?;
    if line == expected {
        Ok(())
    } else {
        Err(ReplError::Handshake { expected, got: line })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_tracks_offset_and_connection_state() {
        let replica = Replica::new(ReplicaConfig {
            master_host: "127.0.0.1".to_string(),
            master_port: 6379,
            listening_port: 6380,
        });
        assert_eq!(replica.offset(), ReplOffset::ZERO);
        assert!(!replica.is_connected());
        assert_eq!(replica.master_addr(), "127.0.0.1:6379");
    }
}
