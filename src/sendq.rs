//! Pending-send queue with ack-gated, priority-aware flow control.
//!
//! Each session and each command owns one queue. The send pump pulls with
//! [`PrioritySendQueue::read_or_register`]: it either receives a chunk to
//! put on the wire right away, or leaves a callback to be invoked the moment
//! one is enqueued — never both. At most one chunk per entity is ever in
//! flight; the matching DataAck is what permits the next pull.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::wire::StreamTag;

pub type ChunkCallback = Box<dyn FnOnce(Vec<u8>, StreamTag) + Send>;

#[derive(Default)]
struct Lanes {
    /// PromptResponse outranks Default.
    prompt_response: VecDeque<Vec<u8>>,
    default: VecDeque<Vec<u8>>,
    waiting: Option<ChunkCallback>,
}

#[derive(Default)]
pub struct PrioritySendQueue {
    lanes: Mutex<Lanes>,
}

impl PrioritySendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one pre-fragmented chunk. If the pump registered a callback it
    /// is handed this chunk directly instead.
    pub fn enqueue(&self, stream: StreamTag, chunk: Vec<u8>) {
        let handoff = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(cb) = lanes.waiting.take() {
                // A callback only ever waits while both lanes are empty, so
                // handing it this chunk preserves ordering.
                Some((cb, chunk))
            } else {
                match stream {
                    StreamTag::PromptResponse => lanes.prompt_response.push_back(chunk),
                    StreamTag::Default => lanes.default.push_back(chunk),
                }
                None
            }
        };
        if let Some((cb, chunk)) = handoff {
            cb(chunk, stream);
        }
    }

    /// Pull the next chunk, or register `callback` for when one arrives.
    ///
    /// Exactly one of the two happens. Re-registering while a callback is
    /// already waiting keeps the existing one.
    pub fn read_or_register(
        &self,
        callback: ChunkCallback,
    ) -> Option<(Vec<u8>, StreamTag)> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(chunk) = lanes.prompt_response.pop_front() {
            return Some((chunk, StreamTag::PromptResponse));
        }
        if let Some(chunk) = lanes.default.pop_front() {
            return Some((chunk, StreamTag::Default));
        }
        if lanes.waiting.is_none() {
            lanes.waiting = Some(callback);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        let lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        lanes.prompt_response.is_empty() && lanes.default.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;

    #[test]
    fn read_returns_queued_chunk_without_registering() {
        let queue = PrioritySendQueue::new();
        queue.enqueue(StreamTag::Default, vec![1, 2]);

        let (tx, rx) = mpsc::channel();
        let pulled = queue.read_or_register(Box::new(move |chunk, stream| {
            tx.send((chunk, stream)).unwrap();
        }));

        assert_eq!(pulled, Some((vec![1, 2], StreamTag::Default)));
        // The callback was not kept: a later enqueue goes to the lanes.
        queue.enqueue(StreamTag::Default, vec![3]);
        assert!(rx.try_recv().is_err());
        assert!(!queue.is_empty());
    }

    #[test]
    fn register_fires_exactly_once_on_next_enqueue() {
        let queue = Arc::new(PrioritySendQueue::new());
        let (tx, rx) = mpsc::channel();

        let pulled = queue.read_or_register(Box::new(move |chunk, stream| {
            tx.send((chunk, stream)).unwrap();
        }));
        assert!(pulled.is_none());

        queue.enqueue(StreamTag::PromptResponse, vec![9]);
        assert_eq!(
            rx.recv().unwrap(),
            (vec![9], StreamTag::PromptResponse)
        );

        // Second enqueue has no callback left to invoke.
        queue.enqueue(StreamTag::Default, vec![10]);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            queue.read_or_register(Box::new(|_, _| {})),
            Some((vec![10], StreamTag::Default))
        );
    }

    #[test]
    fn prompt_response_lane_drains_first() {
        let queue = PrioritySendQueue::new();
        queue.enqueue(StreamTag::Default, vec![1]);
        queue.enqueue(StreamTag::PromptResponse, vec![2]);
        queue.enqueue(StreamTag::Default, vec![3]);

        let order: Vec<_> = std::iter::from_fn(|| queue.read_or_register(Box::new(|_, _| {})))
            .collect();
        assert_eq!(
            order,
            vec![
                (vec![2], StreamTag::PromptResponse),
                (vec![1], StreamTag::Default),
                (vec![3], StreamTag::Default),
            ]
        );
    }

    #[test]
    fn double_registration_keeps_the_first_callback() {
        let queue = PrioritySendQueue::new();
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();

        assert!(queue
            .read_or_register(Box::new(move |chunk, _| tx1.send(chunk).unwrap()))
            .is_none());
        assert!(queue
            .read_or_register(Box::new(move |chunk, _| tx2.send(chunk).unwrap()))
            .is_none());

        queue.enqueue(StreamTag::Default, vec![7]);
        assert_eq!(rx1.recv().unwrap(), vec![7]);
        assert!(rx2.try_recv().is_err());
    }
}
