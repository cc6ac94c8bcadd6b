//! On-wire record frame.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! offset 0  : u32  src_rank
//! offset 4  : u32  dst_rank
//! offset 8  : u8   name_len        (1..=255)
//! offset 9  : ...  name bytes, then a single NUL
//!             u8   payload_len     (0..=255)
//!             ...  payload bytes
//!             u16  epoch
//! ```
//!
//! Frames are self-delimiting, so an RPC batch is a plain concatenation and
//! the receive side decodes in sequence until the buffer is exhausted. Any
//! shortfall or inconsistency mid-decode means a corrupted carrier and is
//! fatal on the receiver.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, ShuffleError};
use crate::types::{Epoch, Rank, MAX_FRAME_SIZE, MAX_NAME_LEN, MAX_PAYLOAD_LEN};

/// A decoded record frame. `name` and `payload` borrow from the carrier
/// buffer; the frame never outlives the transport's receive callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub src: Rank,
    pub dst: Rank,
    pub name: &'a [u8],
    pub payload: &'a [u8],
    pub epoch: Epoch,
}

impl<'a> Frame<'a> {
    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        4 + 4 + 1 + self.name.len() + 1 + 1 + self.payload.len() + 2
    }

    /// Append the encoded frame to `buf`.
    ///
    /// Fails if the name is empty, contains a NUL, or either field exceeds
    /// its one-byte length budget.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if self.name.is_empty() {
            return Err(ShuffleError::EmptyName);
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ShuffleError::FrameTooLarge {
                field: "name",
                len: self.name.len(),
                limit: MAX_NAME_LEN,
            });
        }
        if self.name.contains(&0) {
            return Err(ShuffleError::corruption("name contains NUL"));
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ShuffleError::FrameTooLarge {
                field: "payload",
                len: self.payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }
        let total = self.wire_len();
        if total > MAX_FRAME_SIZE {
            return Err(ShuffleError::FrameTooLarge {
                field: "frame",
                len: total,
                limit: MAX_FRAME_SIZE,
            });
        }

        buf.reserve(total);
        buf.put_u32(self.src);
        buf.put_u32(self.dst);
        buf.put_u8(self.name.len() as u8);
        buf.put_slice(self.name);
        buf.put_u8(0);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(self.payload);
        buf.put_u16(self.epoch);
        Ok(())
    }

    /// Decode one frame from the front of `input`, returning the frame and
    /// the number of bytes consumed.
    pub fn decode(input: &'a [u8]) -> Result<(Frame<'a>, usize)> {
        let mut at = 0usize;

        let take = |at: &mut usize, n: usize, what: &str| -> Result<usize> {
            if input.len() - *at < n {
                return Err(ShuffleError::corruption(format!(
                    "short buffer reading {what}: {} bytes left, need {n}",
                    input.len() - *at
                )));
            }
            let start = *at;
            *at += n;
            Ok(start)
        };

        let s = take(&mut at, 4, "src rank")?;
        let src = u32::from_be_bytes(input[s..s + 4].try_into().expect("4-byte slice"));
        let s = take(&mut at, 4, "dst rank")?;
        let dst = u32::from_be_bytes(input[s..s + 4].try_into().expect("4-byte slice"));

        let s = take(&mut at, 1, "name length")?;
        let name_len = input[s] as usize;
        if name_len == 0 {
            return Err(ShuffleError::corruption("zero name length"));
        }
        let s = take(&mut at, name_len + 1, "name")?;
        let name = &input[s..s + name_len];
        if name.contains(&0) {
            return Err(ShuffleError::corruption("NUL inside name"));
        }
        if input[s + name_len] != 0 {
            return Err(ShuffleError::corruption("missing NUL after name"));
        }

        let s = take(&mut at, 1, "payload length")?;
        let payload_len = input[s] as usize;
        let s = take(&mut at, payload_len, "payload")?;
        let payload = &input[s..s + payload_len];

        let s = take(&mut at, 2, "epoch")?;
        let epoch = u16::from_be_bytes(input[s..s + 2].try_into().expect("2-byte slice"));

        Ok((
            Frame {
                src,
                dst,
                name,
                payload,
                epoch,
            },
            at,
        ))
    }
}

/// Decode a batch: a concatenation of frames filling `input` exactly.
/// Yields frames in wire order; stops with an error on the first
/// malformed frame.
pub fn decode_batch(input: &[u8]) -> BatchIter<'_> {
    BatchIter { rest: input }
}

pub struct BatchIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match Frame::decode(self.rest) {
            Ok((frame, used)) => {
                self.rest = &self.rest[used..];
                Some(Ok(frame))
            }
            Err(e) => {
                // Stop the iteration; the batch is unusable past this point.
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}
