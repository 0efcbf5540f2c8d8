//! Framed codec for the line-oriented wire protocol.
//!
//! Wraps `LinesCodec` for line framing and adds frame parsing on top.
//! Works over any AsyncRead/AsyncWrite (child stdio, pipes, sockets).
//! The codec is a plain value constructed per connection; there is no
//! shared decoder configuration.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::frame::{ERROR_PREFIX, Frame, FrameError};

/// Default cap on one encoded frame line (base64 body included).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// One decoded unit from the inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundItem {
    Frame(Frame),
    /// Out-of-band diagnostic text the peer prefixed with the error marker.
    PeerError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("frame exceeds the maximum line length")]
    LineTooLong,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Codec turning a byte stream into [`InboundItem`]s and [`Frame`]s into lines.
pub struct FrameCodec {
    inner: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn classify(line: &str) -> Result<Option<InboundItem>, FrameError> {
        if let Some(text) = line.strip_prefix(ERROR_PREFIX) {
            return Ok(Some(InboundItem::PeerError(text.trim().to_string())));
        }
        Ok(Frame::parse(line)?.map(InboundItem::Frame))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = InboundItem;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src)? {
            if let Some(item) = Self::classify(&line)? {
                return Ok(Some(item));
            }
            // Ignorable line (comment, processing instruction, blank).
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode_eof(src)? {
            if let Some(item) = Self::classify(&line)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = frame.encode();
        tracing::trace!(frame = %frame, line_bytes = line.len(), "encoding frame");
        self.inner.encode(line, dst).map_err(Into::into)
    }
}
