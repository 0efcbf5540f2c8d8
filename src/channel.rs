//! Serialized frame writer over the outbound half of a connection.
//!
//! All outbound traffic for one connection funnels through a single
//! [`ChannelWriter`]; the sink mutex is the only synchronization the write
//! path needs. Once the peer is known to be gone, [`ChannelWriter::stop`]
//! turns every further write into a silent no-op so that peer-exit handling
//! cannot race an in-flight close request into an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::wire::{CodecError, Frame, FrameCodec};

pub type BoxWriteStream = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Inner>,
}

struct Inner {
    stopped: AtomicBool,
    sink: Mutex<FramedWrite<BoxWriteStream, FrameCodec>>,
}

impl ChannelWriter {
    pub fn new(stream: BoxWriteStream, codec: FrameCodec) -> Self {
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                sink: Mutex::new(FramedWrite::new(stream, codec)),
            }),
        }
    }

    /// Write one frame and flush. Serialized against concurrent senders.
    /// After [`stop`](Self::stop) this silently discards the frame.
    pub async fn send(&self, frame: Frame) -> Result<(), CodecError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            tracing::trace!(frame = %frame, "writer stopped, discarding frame");
            return Ok(());
        }
        let mut sink = self.inner.sink.lock().await;
        // Re-check under the lock: stop() may have won the race while we
        // waited for a concurrent writer.
        if self.inner.stopped.load(Ordering::Acquire) {
            tracing::trace!(frame = %frame, "writer stopped, discarding frame");
            return Ok(());
        }
        sink.send(frame).await
    }

    /// Idempotently disable all future writes.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!("channel writer stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}
