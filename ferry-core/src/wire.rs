//! Contact-link framing. A message crosses a link as a 4-byte LE body length followed by
//! the bincode-encoded `Message`. `LinkReader` rebuilds messages from bytes that may arrive
//! split or batched across reads.

use crate::protocol::Message;

const LEN_PREFIX: usize = 4;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("frame body of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// One message as link bytes.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(msg).map_err(FrameError::Encode)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&n| n as usize <= MAX_FRAME_LEN)
        .ok_or(FrameError::TooLarge(body.len()))?;
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode the frame at the front of `bytes`: the message and the bytes it used,
/// or `None` if the frame is not complete yet.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Message, usize)>, FrameError> {
    let Some(prefix) = bytes.get(..LEN_PREFIX) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let Some(body) = bytes.get(LEN_PREFIX..LEN_PREFIX + len) else {
        return Ok(None);
    };
    let msg = bincode::deserialize(body).map_err(FrameError::Decode)?;
    Ok(Some((msg, LEN_PREFIX + len)))
}

/// Receiving end of one link: buffers bytes and yields whole messages in arrival order.
#[derive(Debug, Default)]
pub struct LinkReader {
    buf: Vec<u8>,
    bytes_read: u64,
}

impl LinkReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.bytes_read += bytes.len() as u64;
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        match decode_frame(&self.buf)? {
            Some((msg, used)) => {
                self.buf.drain(..used);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Bytes of an unfinished frame still buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}
