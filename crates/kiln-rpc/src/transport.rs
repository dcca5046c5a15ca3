//! Socket framing: every JSON-RPC message is one length-delimited frame.
//!
//! A frame is a 4-byte big-endian payload length followed by the UTF-8
//! JSON text. Frame handling is delegated to `LengthDelimitedCodec`; this
//! layer maps payloads to [`Message`]s and enforces the size limit both
//! ways, so an oversized frame fails the connection instead of buffering.

use bytes::BytesMut;
use std::io;
use tokio_util::codec::length_delimited::LengthDelimitedCodecError;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::Message;

/// Largest frame payload either side accepts (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest byte payload one debug message carries.
///
/// Bytes travel hex-encoded, so a chunk this size stays well inside
/// [`MAX_MESSAGE_SIZE`] once wrapped in a `stream.send` frame.
pub const MAX_DEBUG_CHUNK: usize = MAX_MESSAGE_SIZE / 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame exceeds the {limit} byte limit")]
    FrameTooLarge { limit: usize },
}

/// Frames [`Message`]s over a byte stream
#[derive(Debug)]
pub struct JsonRpcCodec {
    frames: LengthDelimitedCodec,
    limit: usize,
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }
}

impl JsonRpcCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with a custom payload limit.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(limit)
            .new_codec();
        Self { frames, limit }
    }

    fn map_io(&self, e: io::Error) -> CodecError {
        let too_large = e
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_large {
            CodecError::FrameTooLarge { limit: self.limit }
        } else {
            CodecError::Io(e)
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl Decoder for JsonRpcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.frames.decode(src) {
            Ok(Some(payload)) => Ok(Some(serde_json::from_slice(&payload)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.map_io(e)),
        }
    }
}

impl Encoder<Message> for JsonRpcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.limit {
            return Err(CodecError::FrameTooLarge { limit: self.limit });
        }
        self.frames
            .encode(bytes::Bytes::from(payload), dst)
            .map_err(|e| self.map_io(e))
    }
}
