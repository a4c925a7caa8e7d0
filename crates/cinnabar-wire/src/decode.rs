//! Incremental frame decoder.

use bytes::{Bytes, BytesMut};
use cinnabar_types::{MAX_ARGS, MAX_ARG_LEN};

use crate::{Command, WireError, WireResult};

/// Outcome of one decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// One whole frame was consumed from the buffer.
    Frame(Command),
    /// The buffer does not yet hold a whole frame; read more bytes.
    Incomplete,
}

/// Decodes one command frame from the front of `buf`.
///
/// On success the consumed bytes are removed from `buf`, so callers can
/// loop to drain pipelined frames. [`Decoded::Incomplete`] leaves `buf`
/// untouched. A [`WireError`] means the frame is unsalvageable; the caller
/// should reply with a protocol error and discard the buffer, keeping the
/// connection open.
pub fn decode_command(buf: &mut BytesMut) -> WireResult<Decoded> {
    if buf.is_empty() {
        return Ok(Decoded::Incomplete);
    }

    if buf[0] == b'*' {
        decode_array(buf)
    } else {
        decode_inline(buf)
    }
}

/// Array framing: `*<argc>\r\n` then `argc` bulk strings
/// `$<len>\r\n<bytes>\r\n`.
fn decode_array(buf: &mut BytesMut) -> WireResult<Decoded> {
    let Some((count_line, mut pos)) = read_line(buf, 1) else {
        return Ok(Decoded::Incomplete);
    };
    let argc = parse_decimal(count_line).ok_or(WireError::Malformed("bad argument count"))?;
    if argc > MAX_ARGS {
        return Err(WireError::TooManyArgs(argc));
    }

    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        if pos >= buf.len() {
            return Ok(Decoded::Incomplete);
        }
        if buf[pos] != b'$' {
            return Err(WireError::Malformed("expected bulk string marker"));
        }
        let Some((len_line, after_len)) = read_line(buf, pos + 1) else {
            return Ok(Decoded::Incomplete);
        };
        let len = parse_decimal(len_line).ok_or(WireError::Malformed("bad bulk length"))?;
        if len > MAX_ARG_LEN {
            return Err(WireError::ArgTooLong(len));
        }
        if buf.len() < after_len + len + 2 {
            return Ok(Decoded::Incomplete);
        }
        if &buf[after_len + len..after_len + len + 2] != b"\r\n" {
            return Err(WireError::Malformed("bulk string not CRLF-terminated"));
        }
        args.push(Bytes::copy_from_slice(&buf[after_len..after_len + len]));
        pos = after_len + len + 2;
    }

    let _ = buf.split_to(pos);
    Ok(Decoded::Frame(Command::from_args(args)))
}

/// Inline framing: whitespace-separated tokens up to the first newline,
/// trailing CRLF stripped.
fn decode_inline(buf: &mut BytesMut) -> WireResult<Decoded> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(Decoded::Incomplete);
    };

    let line = buf.split_to(newline + 1);
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }

    let mut args = Vec::new();
    for token in line[..end].split(|b| b.is_ascii_whitespace()) {
        if token.is_empty() {
            continue;
        }
        if token.len() > MAX_ARG_LEN {
            return Err(WireError::ArgTooLong(token.len()));
        }
        args.push(Bytes::copy_from_slice(token));
        if args.len() > MAX_ARGS {
            return Err(WireError::TooManyArgs(args.len()));
        }
    }

    Ok(Decoded::Frame(Command::from_args(args)))
}

/// Finds the next CRLF at or after `start`; returns the line body and the
/// position just past the CRLF.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    if start >= buf.len() {
        return None;
    }
    let rel = buf[start..].windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[start..start + rel], start + rel + 2))
}

/// Parses a non-empty all-digit decimal. Rejects signs, so negative
/// lengths (and the canonical `$-1` null bulk) are malformed here.
fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> WireResult<Decoded> {
        decode_command(&mut BytesMut::from(input))
    }

    fn args_of(result: WireResult<Decoded>) -> Vec<String> {
        match result.unwrap() {
            Decoded::Frame(cmd) => cmd
                .args()
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
            Decoded::Incomplete => panic!("expected a frame"),
        }
    }

    #[test]
    fn array_framing() {
        let args = args_of(decode(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n"));
        assert_eq!(args, ["SET", "k1", "v1"]);
    }

    #[test]
    fn inline_framing() {
        let args = args_of(decode(b"SET k1 v1\r\n"));
        assert_eq!(args, ["SET", "k1", "v1"]);
    }

    #[test]
    fn inline_collapses_repeated_whitespace() {
        let args = args_of(decode(b"GET   k1\r\n"));
        assert_eq!(args, ["GET", "k1"]);
    }

    #[test]
    fn inline_empty_line_is_zero_arg_frame() {
        // The dispatcher answers this with "empty command".
        assert_eq!(args_of(decode(b"\r\n")), Vec::<String>::new());
    }

    #[test]
    fn truncated_array_is_incomplete() {
        assert_eq!(decode(b"*2\r\n$3\r\nGET\r\n$2\r\nk").unwrap(), Decoded::Incomplete);
        assert_eq!(decode(b"*2\r\n").unwrap(), Decoded::Incomplete);
        assert_eq!(decode(b"*2").unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn bad_count_is_malformed() {
        assert!(matches!(decode(b"*x\r\n"), Err(WireError::Malformed(_))));
        assert!(matches!(decode(b"*-1\r\n"), Err(WireError::Malformed(_))));
    }

    #[test]
    fn over_limit_count_rejected() {
        assert_eq!(decode(b"*33\r\n"), Err(WireError::TooManyArgs(33)));
    }

    #[test]
    fn over_limit_bulk_rejected() {
        assert_eq!(decode(b"*1\r\n$513\r\n"), Err(WireError::ArgTooLong(513)));
    }

    #[test]
    fn missing_bulk_marker_is_malformed() {
        assert!(matches!(
            decode(b"*1\r\n#3\r\nfoo\r\n"),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn bulk_without_terminator_is_malformed() {
        assert!(matches!(
            decode(b"*1\r\n$3\r\nfooXX"),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn pipelined_frames_drain_one_at_a_time() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n"[..]);

        let Decoded::Frame(first) = decode_command(&mut buf).unwrap() else {
            panic!("expected first frame");
        };
        assert_eq!(first.name_upper(), "PING");

        let Decoded::Frame(second) = decode_command(&mut buf).unwrap() else {
            panic!("expected second frame");
        };
        assert_eq!(second.name_upper(), "ECHO");
        assert!(buf.is_empty());
    }

    #[test]
    fn binary_payload_with_embedded_crlf() {
        let args = args_of(decode(b"*2\r\n$3\r\nGET\r\n$4\r\na\r\nb\r\n"));
        assert_eq!(args[1], "a\r\nb");
    }
}
