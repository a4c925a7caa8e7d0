//! # cinnabar-wire: Wire protocol codec for Cinnabar
//!
//! Parses client frames into [`Command`]s and encodes [`Reply`]s back to
//! bytes. Two request framings are supported:
//!
//! 1. **Array framing**: `*<argc>\r\n` followed by `argc` bulk strings,
//!    each `$<len>\r\n<bytes>\r\n`.
//! 2. **Inline framing**: any frame not starting with `*` is split on
//!    whitespace after stripping the trailing CRLF.
//!
//! Replies use the usual single-character type markers:
//!
//! ```text
//! +OK\r\n            simple string
//! $5\r\nhello\r\n    bulk string
//! :42\r\n            integer
//! -ERR message\r\n   error
//! ```
//!
//! Absent values are encoded as the literal bulk string `nil` (three ASCII
//! bytes), not the null bulk string `$-1\r\n`.
//!
//! The decoder is incremental: [`decode_command`] consumes exactly one whole
//! frame from the front of a [`BytesMut`] and reports how many bytes it
//! consumed, so a streaming reader (the replica applying its master's
//! command stream) can parse as many whole frames as are buffered and keep
//! the remainder.

mod command;
mod decode;
mod reply;

pub use command::Command;
pub use decode::{decode_command, Decoded};
pub use reply::Reply;

use thiserror::Error;

/// Result type for codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors produced while decoding a frame.
///
/// All variants are answered on the wire as `-ERR protocol error`; the
/// connection stays open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame structure is malformed (bad marker, bad length digits,
    /// missing CRLF).
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// Argument count exceeds the per-command limit.
    #[error("too many arguments: {0}")]
    TooManyArgs(usize),

    /// A single argument exceeds the length limit.
    #[error("argument too long: {0} bytes")]
    ArgTooLong(usize),
}

/// Encodes a command in array framing, byte-for-byte as a client would
/// send it.
///
/// The primary uses this to re-serialize a write before appending it to
/// the replication backlog, so the bytes replicas receive parse back to
/// the identical command.
pub fn encode_command(cmd: &Command) -> bytes::Bytes {
    use bytes::BufMut;

    let mut buf = bytes::BytesMut::with_capacity(16 + cmd.args().iter().map(|a| a.len() + 16).sum::<usize>());
    buf.put_slice(format!("*{}\r\n", cmd.args().len()).as_bytes());
    for arg in cmd.args() {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}
