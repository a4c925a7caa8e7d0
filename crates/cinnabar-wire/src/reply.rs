//! Reply encoding.

use bytes::{BufMut, Bytes, BytesMut};

/// A single reply to be written back to a client.
///
/// Handlers build replies; the connection worker encodes and writes them.
/// Multi-part responses (`MGET`, `HISTORY`, `GETTTL`) are sequences of
/// these, written in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<text>\r\n`
    Simple(String),
    /// `$<len>\r\n<bytes>\r\n`
    Bulk(Bytes),
    /// `:<value>\r\n`
    Integer(i64),
    /// `-ERR <message>\r\n`
    Error(String),
}

impl Reply {
    /// The canonical `+OK` reply.
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    /// The absent-value reply: the literal three-byte bulk string `nil`,
    /// not the null bulk `$-1\r\n`.
    pub fn nil() -> Self {
        Reply::Bulk(Bytes::from_static(b"nil"))
    }

    /// A bulk string reply from any byte source.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// An error reply; `ERR ` is prefixed during encoding.
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    /// The per-command arity error.
    pub fn wrong_arity(name: &str) -> Self {
        Reply::Error(format!(
            "wrong number of arguments for '{name}' command"
        ))
    }

    /// Encodes this reply onto the end of `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Reply::Simple(text) => {
                buf.put_slice(format!("+{text}\r\n").as_bytes());
            }
            Reply::Bulk(data) => {
                buf.put_slice(format!("${}\r\n", data.len()).as_bytes());
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Reply::Integer(value) => {
                buf.put_slice(format!(":{value}\r\n").as_bytes());
            }
            Reply::Error(message) => {
                buf.put_slice(format!("-ERR {message}\r\n").as_bytes());
            }
        }
    }

    /// Encodes this reply into an owned buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_string() {
        assert_eq!(&Reply::ok().to_bytes()[..], b"+OK\r\n");
    }

    #[test]
    fn bulk_string() {
        assert_eq!(&Reply::bulk("v1").to_bytes()[..], b"$2\r\nv1\r\n");
    }

    #[test]
    fn empty_bulk_string() {
        assert_eq!(&Reply::bulk("").to_bytes()[..], b"$0\r\n\r\n");
    }

    #[test]
    fn nil_is_literal_three_bytes() {
        assert_eq!(&Reply::nil().to_bytes()[..], b"$3\r\nnil\r\n");
    }

    #[test]
    fn integers() {
        assert_eq!(&Reply::Integer(11).to_bytes()[..], b":11\r\n");
        assert_eq!(&Reply::Integer(-1).to_bytes()[..], b":-1\r\n");
    }

    #[test]
    fn error_gets_err_prefix() {
        assert_eq!(
            &Reply::error("CAS failed: value does not match").to_bytes()[..],
            b"-ERR CAS failed: value does not match\r\n"
        );
    }

    #[test]
    fn arity_error_message() {
        assert_eq!(
            &Reply::wrong_arity("GET").to_bytes()[..],
            b"-ERR wrong number of arguments for 'GET' command\r\n"
        );
    }
}
