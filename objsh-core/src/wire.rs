//! Framing: `"OS"` magic (2 bytes) + total length (u32 LE, header included) + part
//! count (u8), then per part a u32 LE length and the raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: &[u8; 2] = b"OS";
pub const HEADER_LEN: usize = 7;
const PART_LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024; // 256 MiB
const READ_CHUNK: usize = 64 * 1024;

/// Encode a message into wire segments. Parts are not copied: the result holds the
/// header and length prefixes interleaved with the original part buffers.
pub fn encode_frame(parts: &[Bytes]) -> Result<Vec<Bytes>, FrameEncodeError> {
    if parts.is_empty() || parts.len() > u8::MAX as usize {
        return Err(FrameEncodeError::PartCount(parts.len()));
    }
    let total = parts
        .iter()
        .fold(HEADER_LEN, |acc, p| acc + PART_LEN_SIZE + p.len());
    if total > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(total));
    }
    let mut out = Vec::with_capacity(parts.len() * 2);
    let mut head = BytesMut::with_capacity(HEADER_LEN + PART_LEN_SIZE);
    head.put_slice(MAGIC);
    head.put_u32_le(total as u32);
    head.put_u8(parts.len() as u8);
    for part in parts {
        head.put_u32_le(part.len() as u32);
        out.push(head.split().freeze());
        if !part.is_empty() {
            out.push(part.clone());
        }
    }
    Ok(out)
}

/// Encode into one contiguous buffer (copies; used by tests and small control messages).
pub fn encode_frame_contiguous(parts: &[Bytes]) -> Result<Vec<u8>, FrameEncodeError> {
    let segments = encode_frame(parts)?;
    let mut out = Vec::with_capacity(segments.iter().map(Bytes::len).sum());
    for s in &segments {
        out.extend_from_slice(s);
    }
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("invalid part count {0}")]
    PartCount(usize),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the parts (slices of `bytes`,
/// no copy) and the number of bytes consumed.
pub fn decode_frame(bytes: &Bytes) -> Result<(Vec<Bytes>, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    if &bytes[..2] != MAGIC {
        return Err(FrameDecodeError::BadMagic);
    }
    let mut header = &bytes[2..HEADER_LEN];
    let total = header.get_u32_le() as usize;
    let count = header.get_u8() as usize;
    if total > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(total));
    }
    if total < HEADER_LEN + count * PART_LEN_SIZE {
        return Err(FrameDecodeError::BadLength);
    }
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut parts = Vec::with_capacity(count);
    let mut ofs = HEADER_LEN;
    for _ in 0..count {
        if ofs + PART_LEN_SIZE > total {
            return Err(FrameDecodeError::BadLength);
        }
        let len = (&bytes[ofs..ofs + PART_LEN_SIZE]).get_u32_le() as usize;
        ofs += PART_LEN_SIZE;
        if ofs + len > total {
            return Err(FrameDecodeError::BadLength);
        }
        parts.push(bytes.slice(ofs..ofs + len));
        ofs += len;
    }
    if ofs != total {
        return Err(FrameDecodeError::BadLength);
    }
    Ok((parts, total))
}

/// Error decoding a frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("packet magic missing")]
    BadMagic,
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("part lengths disagree with frame length")]
    BadLength,
}

/// Per-connection reassembly buffer. Bytes read from the socket go into
/// `buffer_mut()`; complete messages come out of `next_message()`, and a partial
/// message stays buffered across reads.
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer to read into, with room for at least one read chunk.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(READ_CHUNK);
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes of an incomplete message still waiting for the rest.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, if any. On a framing error everything buffered is
    /// dropped, since the stream position is lost.
    pub fn next_message(&mut self) -> Option<Result<Vec<Bytes>, FrameDecodeError>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let total = match peek_total(&self.buf) {
            Ok(total) => total,
            Err(e) => {
                self.buf.clear();
                return Some(Err(e));
            }
        };
        if self.buf.len() < total {
            return None;
        }
        let frame = self.buf.split_to(total).freeze();
        match decode_frame(&frame) {
            Ok((parts, _)) => Some(Ok(parts)),
            Err(e) => Some(Err(e)),
        }
    }
}

fn peek_total(buf: &[u8]) -> Result<usize, FrameDecodeError> {
    if &buf[..2] != MAGIC {
        return Err(FrameDecodeError::BadMagic);
    }
    let total = (&buf[2..6]).get_u32_le() as usize;
    if total > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(total));
    }
    if total < HEADER_LEN {
        return Err(FrameDecodeError::BadLength);
    }
    Ok(total)
}
