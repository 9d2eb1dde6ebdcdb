use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::parser::Parser;
use crate::reply::Reply;
use crate::Error;

/// Frames a socket into replies using the incremental [`Parser`], and writes pre-encoded command
/// bytes as they are.
pub struct ReplyCodec {
    parser: Parser,
}

impl ReplyCodec {
    pub fn new() -> ReplyCodec {
        ReplyCodec {
            parser: Parser::new(),
        }
    }

    pub fn with_max_len(max_len: usize) -> ReplyCodec {
        ReplyCodec {
            parser: Parser::with_max_len(max_len),
        }
    }
}

impl Default for ReplyCodec {
    fn default() -> Self {
        ReplyCodec::new()
    }
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // The parser keeps partial replies itself, hand everything over.
        if !src.is_empty() {
            let chunk = src.split();
            self.parser.push(&chunk)?;
        }

        Ok(self.parser.parse()?)
    }
}

impl Encoder<Bytes> for ReplyCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
