//! Full-sync transfer: snapshot shipping and installation.
//!
//! The producer (primary) copies the current snapshot into a temp file in
//! the exact on-disk layout with a refreshed `created_at`, then streams
//! `$<n>\r\n` followed by the n raw bytes, all while holding the snapshot
//! lock. The consumer (replica) receives into a temp file, validates it,
//! and atomically renames it over the live snapshot; any failure deletes
//! the temp file and leaves the live snapshot untouched.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use cinnabar_engine::Engine;
use cinnabar_snapshot::SnapshotFile;

use crate::{ReplError, ReplResult};

const TRANSFER_CHUNK: usize = 4096;

/// Longest size-header/handshake line the sync protocol will read.
const MAX_LINE_LEN: usize = 128;

/// Streams a full snapshot copy to `out`.
///
/// Runs entirely under the snapshot lock so write-through traffic cannot
/// interleave with the copy. The caller is responsible for having
/// registered the receiving replica with `sync_in_progress` set and for
/// calling `finish_sync` afterwards.
pub fn serve_full_sync(engine: &Engine, out: &mut TcpStream) -> ReplResult<()> {
    engine.with_snapshot(|snapshot| -> ReplResult<()> {
        let entries = snapshot.read_all()?;

        let tmp_path = sibling_path(snapshot.path(), ".sync");
        let tmp = SnapshotFile::open(&tmp_path);
        tmp.write_all(&entries)?;

        let result = (|| -> ReplResult<()> {
            let payload = tmp.raw_bytes()?;
            out.write_all(format!("${}\r\n", payload.len()).as_bytes())?;
            out.write_all(&payload)?;
            tracing::info!(bytes = payload.len(), entries = entries.len(), "served full sync");
            Ok(())
        })();

        let _ = fs::remove_file(&tmp_path);
        result
    })
}

/// Receives `payload_len` snapshot bytes from the master and installs
/// them over the live snapshot.
///
/// The caller has already consumed the `$<n>\r\n` size header.
pub fn receive_full_sync(
    stream: &mut TcpStream,
    engine: &Engine,
    payload_len: usize,
) -> ReplResult<()> {
    let live_path = engine.with_snapshot(|snapshot| snapshot.path().to_path_buf());
    let tmp_path = sibling_path(&live_path, ".recv");

    let result = receive_into(stream, &tmp_path, payload_len).and_then(|()| {
        // Validate the whole structure before touching the live file.
        SnapshotFile::open(&tmp_path).validate()?;
        engine.with_snapshot(|snapshot| -> ReplResult<()> {
            fs::rename(&tmp_path, snapshot.path())?;
            Ok(())
        })?;
        tracing::info!(bytes = payload_len, "installed full sync snapshot");
        Ok(())
    });

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Reads exactly `payload_len` bytes into `path`.
fn receive_into(stream: &mut TcpStream, path: &Path, payload_len: usize) -> ReplResult<()> {
    let mut file = fs::File::create(path)?;
    let mut remaining = payload_len;
    let mut chunk = [0u8; TRANSFER_CHUNK];

    while remaining > 0 {
        let want = remaining.min(TRANSFER_CHUNK);
        let read = stream.read(&mut chunk[..want])?;
        if read == 0 {
            return Err(ReplError::Protocol("sync stream closed mid-transfer"));
        }
        file.write_all(&chunk[..read])?;
        remaining -= read;
    }
    file.sync_all()?;
    Ok(())
}

/// Reads one CRLF-terminated line byte-by-byte (no read-ahead, so the
/// bytes after the line stay in the socket for the caller).
pub fn read_line(stream: &mut TcpStream) -> ReplResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let read = stream.read(&mut byte)?;
        if read == 0 {
            return Err(ReplError::Protocol("connection closed mid-line"));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LEN {
            return Err(ReplError::Protocol("sync header line too long"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Parses a `$<n>` bulk size header.
pub fn parse_size_header(line: &str) -> Option<usize> {
    line.strip_prefix('$')?.parse().ok()
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cinnabar_engine::SetOptions;
    use cinnabar_snapshot::SnapshotRecord;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn size_header_parsing() {
        assert_eq!(parse_size_header("$144"), Some(144));
        assert_eq!(parse_size_header("$0"), Some(0));
        assert_eq!(parse_size_header("+CONTINUE"), None);
        assert_eq!(parse_size_header("$x"), None);
    }

    #[test]
    fn full_sync_ships_the_snapshot() {
        let primary_dir = TempDir::new().unwrap();
        let replica_dir = TempDir::new().unwrap();

        let primary_engine =
            Engine::open(primary_dir.path().join("cinnabar.cdb"), 1000).unwrap();
        primary_engine
            .with_snapshot(|s| {
                s.save(SnapshotRecord::new("a", "1", 0))?;
                s.save(SnapshotRecord::new("b", "2", 0))
            })
            .unwrap();

        let replica_engine =
            Engine::open(replica_dir.path().join("cinnabar.cdb"), 1000).unwrap();

        let (mut replica_end, mut primary_end) = socket_pair();
        let producer = std::thread::spawn(move || {
            serve_full_sync(&primary_engine, &mut primary_end).unwrap();
        });

        let line = read_line(&mut replica_end).unwrap();
        let len = parse_size_header(&line).unwrap();
        receive_full_sync(&mut replica_end, &replica_engine, len).unwrap();
        producer.join().unwrap();

        // The replica now serves the shipped keys via snapshot fall-back.
        assert_eq!(replica_engine.get(b"a"), Some(Bytes::from("1")));
        assert_eq!(replica_engine.get(b"b"), Some(Bytes::from("2")));
    }

    #[test]
    fn truncated_transfer_leaves_live_snapshot_untouched() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path().join("cinnabar.cdb"), 1000).unwrap();
        engine.set(Bytes::from("live"), Bytes::from("x"), SetOptions::default()).unwrap();
        let original = engine.with_snapshot(|s| s.raw_bytes()).unwrap();

        let (mut replica_end, mut primary_end) = socket_pair();
        // Claim far more bytes than will ever arrive, then hang up.
        primary_end.write_all(b"garbage").unwrap();
        drop(primary_end);

        let err = receive_full_sync(&mut replica_end, &engine, 4096);
        assert!(err.is_err());

        let after = engine.with_snapshot(|s| s.raw_bytes()).unwrap();
        assert_eq!(original, after, "live snapshot must be untouched");
        assert!(!dir.path().join("cinnabar.cdb.recv").exists(), "temp file must be deleted");
    }

    #[test]
    fn invalid_payload_is_rejected_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path().join("cinnabar.cdb"), 1000).unwrap();

        let (mut replica_end, mut primary_end) = socket_pair();
        let junk = b"this is not a snapshot file at all, not even close....";
        primary_end.write_all(junk).unwrap();

        let err = receive_full_sync(&mut replica_end, &engine, junk.len());
        assert!(err.is_err());
        assert!(!dir.path().join("cinnabar.cdb.recv").exists());
        // The live snapshot still validates.
        engine.with_snapshot(SnapshotFile::validate).unwrap();
    }
}
