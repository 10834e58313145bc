//! Newline delimited text framing.
//!
//! Every frame on the wire is a run of bytes terminated by `\n`. There is no length prefix, no
//! escaping and no maximum line length. A `\r` directly before the `\n` is dropped so telnet style
//! clients work too.
//!
//! Lines that are not valid UTF-8 are not an error: they come out of the decoder as
//! [`Frame::Malformed`] so the reader can log them and keep going.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const NEWLINE: u8 = b'\n';

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Malformed(Bytes),
}

#[derive(Debug, Default, Clone)]
pub struct LineCodec {
    /// Where to resume the newline search, so a long partial line isn't rescanned on every read.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec { next_index: 0 }
    }

    fn frame(mut raw: BytesMut) -> Frame {
        if raw.last() == Some(&b'\r') {
            raw.truncate(raw.len() - 1);
        }
        match String::from_utf8(raw.to_vec()) {
            Ok(line) => Frame::Line(line),
            Err(_) => Frame::Malformed(raw.freeze()),
        }
    }
}

/// Take in a stream of bytes, release one frame per newline.
impl Decoder for LineCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match buf[self.next_index..].iter().position(|byte| *byte == NEWLINE) {
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
            Some(offset) => {
                let idx = self.next_index + offset;
                self.next_index = 0;
                let line = buf.split_to(idx);
                buf.advance(1);
                Ok(Some(LineCodec::frame(line)))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // The peer hung up mid-line; hand out what we have.
        self.next_index = 0;
        let line = buf.split_to(buf.len());
        Ok(Some(LineCodec::frame(line)))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let line = item.as_ref();
        dst.reserve(line.len() + 1);
        dst.put(line.as_bytes());
        dst.put_u8(NEWLINE);
        Ok(())
    }
}
