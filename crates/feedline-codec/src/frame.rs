use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{Reply, Request};

/// Largest accepted frame body, excluding the 4-byte length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const LEN_PREFIX: usize = 4;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version the sender speaks for this exchange.
    pub version: u32,
    /// Transaction id; a reply echoes the id of its call.
    pub xid: u32,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    Call(Request),
    Reply(Reply),
}

impl Frame {
    pub fn call(version: u32, xid: u32, request: Request) -> Self {
        Self {
            version,
            xid,
            body: FrameBody::Call(request),
        }
    }

    pub fn reply(version: u32, xid: u32, reply: Reply) -> Self {
        Self {
            version,
            xid,
            body: FrameBody::Reply(reply),
        }
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        match &self.body {
            FrameBody::Call(Request::BlkData { data, .. }) if data.is_empty() => {
                Err(CodecError::InvalidFrame("empty chunk"))
            }
            FrameBody::Call(Request::ComingSoon { chunk_size: 0, .. }) => {
                Err(CodecError::InvalidFrame("zero chunk size"))
            }
            _ => Ok(()),
        }
    }
}

/// Encodes a frame as a big-endian length prefix followed by CBOR.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    frame.validate()?;
    let mut body = Vec::new();
    ciborium::ser::into_writer(frame, &mut body).map_err(|e| CodecError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes one frame body (without the length prefix).
pub fn decode_frame(body: &[u8]) -> Result<Frame, CodecError> {
    let frame: Frame =
        ciborium::de::from_reader(body).map_err(|e| CodecError::Decode(e.to_string()))?;
    frame.validate()?;
    Ok(frame)
}

/// Incremental decoder for a length-prefixed frame stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            self.buf.reserve(LEN_PREFIX + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        let body = self.buf.split_to(len);
        decode_frame(&body).map(Some)
    }
}
