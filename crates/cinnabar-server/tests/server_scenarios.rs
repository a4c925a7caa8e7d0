//! End-to-end scenarios over a real TCP connection.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use cinnabar_server::{Server, ServerOptions, ShutdownHandle};
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    _dir: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let mut opts = ServerOptions::new("127.0.0.1:0", dir.path().join("cinnabar.cdb"));
    opts.backup_path = dir.path().join("backup.rdb");
    opts.sweep_interval = Duration::from_millis(200);

    let server = Server::bind(opts).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    thread::spawn(move || server.run().unwrap());

    TestServer {
        addr,
        shutdown,
        _dir: dir,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Sends one request and asserts the exact reply bytes.
fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).unwrap();
    let mut reply = vec![0u8; expected.len()];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(
        reply,
        expected,
        "for request {:?}: got {:?}, want {:?}",
        String::from_utf8_lossy(request),
        String::from_utf8_lossy(&reply),
        String::from_utf8_lossy(expected),
    );
}

#[test]
fn set_get_del_lifecycle() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n", b"$2\r\nv1\r\n");
    roundtrip(&mut client, b"*2\r\n$3\r\nDEL\r\n$2\r\nk1\r\n", b":1\r\n");
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n", b"$3\r\nnil\r\n");
}

#[test]
fn incr_and_cas() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nn\r\n$2\r\n10\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n", b":11\r\n");
    roundtrip(
        &mut client,
        b"*5\r\n$3\r\nSET\r\n$1\r\nn\r\n$2\r\n99\r\n$3\r\nCAS\r\n$1\r\n7\r\n",
        b"-ERR CAS failed: value does not match\r\n",
    );
    roundtrip(
        &mut client,
        b"*5\r\n$3\r\nSET\r\n$1\r\nn\r\n$2\r\n99\r\n$3\r\nCAS\r\n$2\r\n11\r\n",
        b"+OK\r\n",
    );
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nn\r\n", b"$2\r\n99\r\n");
}

#[test]
fn setex_expires_with_lazy_reap() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(
        &mut client,
        b"*4\r\n$5\r\nSETEX\r\n$1\r\ns\r\n$5\r\nhello\r\n$1\r\n1\r\n",
        b"+OK\r\n",
    );
    thread::sleep(Duration::from_secs(2));
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\ns\r\n", b"$3\r\nnil\r\n");
}

#[test]
fn inline_framing_works() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"PING\r\n", b"+PONG\r\n");
    roundtrip(&mut client, b"SET a 1\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"GET a\r\n", b"$1\r\n1\r\n");
}

#[test]
fn protocol_error_keeps_connection_open() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"*x\r\n", b"-ERR protocol error\r\n");
    // Same socket still serves commands.
    roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n");
}

#[test]
fn unknown_command_reply() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"FROBNICATE\r\n", b"-ERR unknown command\r\n");
    roundtrip(&mut client, b"\r\n", b"-ERR empty command\r\n");
}

#[test]
fn mget_one_reply_per_key() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"SET a 1\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"SET c 3\r\n", b"+OK\r\n");
    roundtrip(
        &mut client,
        b"MGET a b c\r\n",
        b"$1\r\n1\r\n$3\r\nnil\r\n$1\r\n3\r\n",
    );
}

#[test]
fn pipelined_requests_answered_in_order() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(
        &mut client,
        b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n*1\r\n$4\r\nPING\r\n",
        b"+OK\r\n$1\r\n1\r\n+PONG\r\n",
    );
}

#[test]
fn concurrent_clients_see_consistent_state() {
    let server = start_server();

    let addr = server.addr;
    let writers: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let mut client = connect(addr);
                for j in 0..10 {
                    let request = format!("SET w{i}-{j} {j}\r\n");
                    roundtrip(&mut client, request.as_bytes(), b"+OK\r\n");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let mut client = connect(addr);
    for i in 0..4 {
        for j in 0..10 {
            let request = format!("GET w{i}-{j}\r\n");
            let expected = format!("${}\r\n{j}\r\n", j.to_string().len());
            roundtrip(&mut client, request.as_bytes(), expected.as_bytes());
        }
    }
}

#[test]
fn history_and_flushall_leave_keyspace_alone() {
    let server = start_server();
    let mut client = connect(server.addr);

    roundtrip(&mut client, b"SET live x\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"SETV k v1\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"SETV k v2\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"HISTORY k\r\n", b"$2\r\nv2\r\n$2\r\nv1\r\n");
    roundtrip(&mut client, b"FLUSHALL\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"HISTORY k\r\n", b"$3\r\nnil\r\n");
    roundtrip(&mut client, b"GET live\r\n", b"$1\r\nx\r\n");
}
