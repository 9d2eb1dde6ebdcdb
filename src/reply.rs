// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Bytes;

static CRLF: &[u8; 2] = b"\r\n";

/// A single RESP2 reply as read from the wire.
///
/// Status replies (`+OK`) carry no information a client can act on that a bulk string does not,
/// so the parser folds them into [`Reply::Bulk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// True when the reply is a status or bulk string equal to `OK`, ignoring case.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Bulk(b) if b.eq_ignore_ascii_case(b"OK"))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The reply as UTF-8 text. `None` for non-string replies or invalid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Encode the reply back into RESP2. Bulk strings are always written in their length-prefixed
    /// form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
            Reply::Error(msg) => {
                out.push(b'-');
                out.extend_from_slice(msg.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Reply::Integer(i) => {
                out.push(b':');
                out.extend_from_slice(i.to_string().as_bytes());
                out.extend_from_slice(CRLF);
            }
            Reply::Bulk(bytes) => {
                out.push(b'$');
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.extend_from_slice(CRLF);
                out.extend_from_slice(bytes);
                out.extend_from_slice(CRLF);
            }
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(CRLF);
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }
}

impl From<Reply> for Vec<u8> {
    fn from(reply: Reply) -> Self {
        reply.serialize()
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Reply::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Reply::Integer(i)
    }
}

/// Human readable rendering, the way `redis-cli` prints replies.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_indented(self, f, 0)
    }
}

fn fmt_indented(reply: &Reply, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    match reply {
        Reply::Nil => write!(f, "(nil)"),
        Reply::Error(msg) => write!(f, "(error) {}", msg),
        Reply::Integer(i) => write!(f, "(integer) {}", i),
        Reply::Bulk(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
        Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
        Reply::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    writeln!(f)?;
                    write!(f, "{:width$}", "", width = depth * 3)?;
                }
                write!(f, "{}) ", i + 1)?;
                fmt_indented(item, f, depth + 1)?;
            }
            Ok(())
        }
    }
}
