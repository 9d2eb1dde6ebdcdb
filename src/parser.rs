use bytes::Bytes;
use thiserror::Error as ThisError;

use crate::buffer::{Buffer, LimitExceeded};
use crate::reply::Reply;

#[derive(Debug, ThisError)]
pub enum ProtocolError {
    #[error("invalid reply data type: {0:#04x}")]
    InvalidDataType(u8),
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid length: {0}")]
    InvalidLength(i64),
    #[error("bulk string is not terminated by CRLF")]
    MissingTerminator,
    #[error(transparent)]
    BufferLimit(#[from] LimitExceeded),
}

/// An array whose elements are still being read.
#[derive(Debug)]
struct Frame {
    expected: usize,
    items: Vec<Reply>,
}

enum Step {
    Leaf(Reply),
    /// An array header was read and a new frame pushed.
    Nested,
    Incomplete,
}

/// Incremental RESP2 reply parser.
///
/// Bytes are [`push`](Parser::push)ed as they arrive from the socket, in chunks of any size.
/// [`parse`](Parser::parse) returns one complete top level reply at a time, or `Ok(None)` when more
/// data is needed. Partially read arrays live on an explicit stack, so nesting depth is not limited
/// by the call stack.
///
/// A protocol error means the stream is no longer aligned on reply boundaries. The parser resets
/// itself and the owner is expected to close the connection.
#[derive(Debug)]
pub struct Parser {
    buffer: Buffer,
    // Type byte of the item being read, kept across incomplete reads.
    tag: Option<u8>,
    stack: Vec<Frame>,
}

impl Parser {
    pub fn new() -> Parser {
        Parser::with_buffer(Buffer::new())
    }

    pub fn with_max_len(max_len: usize) -> Parser {
        Parser::with_buffer(Buffer::with_max_len(max_len))
    }

    fn with_buffer(buffer: Buffer) -> Parser {
        Parser {
            buffer,
            tag: None,
            stack: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.buffer.write(bytes)?;
        Ok(())
    }

    pub fn parse(&mut self) -> Result<Option<Reply>, ProtocolError> {
        let result = self.parse_reply();
        match result {
            Ok(_) => self.buffer.maybe_compact(),
            Err(_) => self.reset(),
        }
        result
    }

    /// Drops buffered bytes and any partially read reply.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.tag = None;
        self.stack.clear();
    }

    /// True when no bytes are buffered and no reply is half read.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.tag.is_none() && self.stack.is_empty()
    }

    /// Current array nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn parse_reply(&mut self) -> Result<Option<Reply>, ProtocolError> {
        'items: loop {
            let mut reply = match self.next_item()? {
                Step::Leaf(reply) => reply,
                Step::Nested => continue,
                Step::Incomplete => return Ok(None),
            };

            // Collapse every frame the new item completes.
            while let Some(mut frame) = self.stack.pop() {
                frame.items.push(reply);
                if frame.items.len() < frame.expected {
                    self.stack.push(frame);
                    continue 'items;
                }
                reply = Reply::Array(frame.items);
            }

            return Ok(Some(reply));
        }
    }

    fn next_item(&mut self) -> Result<Step, ProtocolError> {
        let tag = match self.tag {
            Some(tag) => tag,
            None => match self.buffer.read_u8() {
                Some(tag) => {
                    self.tag = Some(tag);
                    tag
                }
                None => return Ok(Step::Incomplete),
            },
        };

        let step = match tag {
            b'+' | b'-' | b':' => self.line_item(tag)?,
            b'$' => self.bulk_item()?,
            b'*' => self.array_item()?,
            other => return Err(ProtocolError::InvalidDataType(other)),
        };

        if !matches!(step, Step::Incomplete) {
            self.tag = None;
        }
        Ok(step)
    }

    fn line_item(&mut self, tag: u8) -> Result<Step, ProtocolError> {
        let Some(line) = self.take_line() else {
            return Ok(Step::Incomplete);
        };

        let reply = match tag {
            b'+' => Reply::Bulk(Bytes::from(line)),
            b'-' => Reply::Error(String::from_utf8_lossy(&line).into_owned()),
            _ => Reply::Integer(parse_integer(&line)?),
        };
        Ok(Step::Leaf(reply))
    }

    // $<length>\r\n<data>\r\n
    fn bulk_item(&mut self) -> Result<Step, ProtocolError> {
        self.buffer.mark();
        let Some(line) = self.take_line() else {
            return Ok(Step::Incomplete);
        };

        let length = parse_integer(&line)?;
        if length == -1 {
            return Ok(Step::Leaf(Reply::Nil));
        }
        if length < 0 || length as u64 > self.buffer_limit() as u64 {
            return Err(ProtocolError::InvalidLength(length));
        }

        let length = length as usize;
        if self.buffer.readable_len() < length + 2 {
            self.buffer.reset();
            return Ok(Step::Incomplete);
        }

        let readable = self.buffer.readable();
        if &readable[length..length + 2] != b"\r\n" {
            return Err(ProtocolError::MissingTerminator);
        }
        let data = Bytes::copy_from_slice(&readable[..length]);
        self.buffer.skip(length + 2);

        Ok(Step::Leaf(Reply::Bulk(data)))
    }

    // *<number-of-elements>\r\n<element-1>...<element-n>
    fn array_item(&mut self) -> Result<Step, ProtocolError> {
        let Some(line) = self.take_line() else {
            return Ok(Step::Incomplete);
        };

        let count = parse_integer(&line)?;
        if count < 0 {
            return Ok(Step::Leaf(Reply::Nil));
        }
        if count == 0 {
            return Ok(Step::Leaf(Reply::Array(Vec::new())));
        }

        let expected = count as usize;
        self.stack.push(Frame {
            expected,
            items: Vec::with_capacity(expected.min(1024)),
        });
        Ok(Step::Nested)
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.find_crlf()?;
        let line = self.buffer.readable()[..end].to_vec();
        self.buffer.skip(end + 2);
        Some(line)
    }

    fn buffer_limit(&self) -> usize {
        self.buffer.max_len()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

/// Decimal integer with an optional leading sign.
fn parse_integer(line: &[u8]) -> Result<i64, ProtocolError> {
    let (negative, digits) = match line.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, line),
    };

    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let digit = i64::from(byte - b'0');
        value = value
            .checked_mul(10)
            .and_then(|v| {
                if negative {
                    v.checked_sub(digit)
                } else {
                    v.checked_add(digit)
                }
            })
            .ok_or(ProtocolError::InvalidInteger)?;
    }

    Ok(value)
}
