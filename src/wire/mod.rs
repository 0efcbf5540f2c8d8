//! Wire protocol: single-line pseudo-XML frames with base64 payloads.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH, FrameCodec, InboundItem};
pub use frame::{ERROR_PREFIX, Frame, FrameError, FrameKind, SESSION_GUID, StreamTag};
