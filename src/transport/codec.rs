//! Multipart message framing.
//!
//! A message is an ordered list of UTF-8 frames:
//!
//! ```text
//! +-------------+----------------+---------+----------------+---------+-----
//! | count (u32) | len #1 (u32)   | bytes   | len #2 (u32)   | bytes   | ...
//! +-------------+----------------+---------+----------------+---------+-----
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_FRAMES: usize = 16;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message has no frames")]
    EmptyMessage,

    #[error("Message has {0} frames, limit is {MAX_FRAMES}")]
    TooManyFrames(usize),

    #[error("Frame of {0} bytes exceeds limit of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCodec;

fn read_u32(src: &[u8], at: usize) -> usize {
    let mut word = [0u8; HEADER_LEN];
    word.copy_from_slice(&src[at..at + HEADER_LEN]);
    u32::from_be_bytes(word) as usize
}

impl Decoder for MultipartCodec {
    type Item = Vec<String>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let count = read_u32(src, 0);
        if count == 0 {
            return Err(CodecError::EmptyMessage);
        }
        if count > MAX_FRAMES {
            return Err(CodecError::TooManyFrames(count));
        }

        // Walk the length prefixes without consuming until the whole message is buffered.
        let mut offset = HEADER_LEN;
        for _ in 0..count {
            if src.len() < offset + HEADER_LEN {
                src.reserve(offset + HEADER_LEN - src.len());
                return Ok(None);
            }
            let len = read_u32(src, offset);
            if len > MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLarge(len));
            }
            offset += HEADER_LEN;
            if src.len() < offset + len {
                src.reserve(offset + len - src.len());
                return Ok(None);
            }
            offset += len;
        }

        let mut message = src.split_to(offset);
        message.advance(HEADER_LEN);
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = message.get_u32() as usize;
            let bytes = message.split_to(len);
            let frame = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
            frames.push(frame);
        }
        Ok(Some(frames))
    }
}

impl Encoder<Vec<String>> for MultipartCodec {
    type Error = CodecError;

    fn encode(&mut self, frames: Vec<String>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frames.is_empty() {
            return Err(CodecError::EmptyMessage);
        }
        if frames.len() > MAX_FRAMES {
            return Err(CodecError::TooManyFrames(frames.len()));
        }
        if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_LEN) {
            return Err(CodecError::FrameTooLarge(frame.len()));
        }

        let total: usize = HEADER_LEN + frames.iter().map(|f| HEADER_LEN + f.len()).sum::<usize>();
        dst.reserve(total);
        dst.put_u32(frames.len() as u32);
        for frame in &frames {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(frame.as_bytes());
        }
        Ok(())
    }
}
