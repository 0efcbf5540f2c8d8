//! Per-command transport handle.
//!
//! A command lives inside a session and carries its own correlation id, its
//! own pending-send queue, and its own ack gate. Sending stays parked until
//! the peer acknowledges the command's creation; a stop signal or close
//! freezes the queue permanently.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Operation;
use crate::sendq::PrioritySendQueue;
use crate::session::SessionShared;
use crate::wire::{Frame, StreamTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandStage {
    /// Registered locally, Command frame possibly sent, no ack yet.
    /// Enqueued data accumulates but nothing goes on the wire.
    PendingCreateAck,
    Active,
    Closed,
}

pub(crate) struct CommandShared {
    pub(crate) guid: Uuid,
    stage: StdMutex<CommandStage>,
    pub(crate) send_queue: PrioritySendQueue,
    pub(crate) ack_pending: AtomicBool,
    send_stopped: AtomicBool,
    signal_sent: AtomicBool,
    pub(crate) close_timer: CancellationToken,
    pub(crate) signal_timer: CancellationToken,
}

impl CommandShared {
    pub(crate) fn new(guid: Uuid) -> Self {
        Self {
            guid,
            stage: StdMutex::new(CommandStage::PendingCreateAck),
            send_queue: PrioritySendQueue::new(),
            ack_pending: AtomicBool::new(false),
            send_stopped: AtomicBool::new(false),
            signal_sent: AtomicBool::new(false),
            close_timer: CancellationToken::new(),
            signal_timer: CancellationToken::new(),
        }
    }

    fn stage(&self) -> CommandStage {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `PendingCreateAck → Active`. Returns false when the command had
    /// already moved on (e.g. closed before the ack arrived).
    pub(crate) fn activate(&self) -> bool {
        let mut stage = self.stage.lock().unwrap_or_else(|p| p.into_inner());
        if *stage == CommandStage::PendingCreateAck {
            *stage = CommandStage::Active;
            true
        } else {
            false
        }
    }

    /// Transition to Closed. Returns true only for the first caller.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut stage = self.stage.lock().unwrap_or_else(|p| p.into_inner());
        if *stage == CommandStage::Closed {
            false
        } else {
            *stage = CommandStage::Closed;
            true
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.stage() == CommandStage::Active
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.stage() == CommandStage::Closed
    }

    pub(crate) fn send_stopped(&self) -> bool {
        self.send_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop_sends(&self) {
        self.send_stopped.store(true, Ordering::Release);
    }
}

/// Client-side handle to one command within a session.
pub struct CommandTransport {
    session: Arc<SessionShared>,
    shared: Arc<CommandShared>,
}

impl CommandTransport {
    pub(crate) fn new(session: Arc<SessionShared>, shared: Arc<CommandShared>) -> Self {
        Self { session, shared }
    }

    pub fn guid(&self) -> Uuid {
        self.shared.guid
    }

    /// Announce the command to the peer. Data queued before the resulting
    /// CommandAck arrives stays parked until then.
    pub async fn create(&self) {
        tracing::debug!(
            session = %self.session.runspace_id,
            command = %self.shared.guid,
            "creating command"
        );
        if let Err(e) = self
            .session
            .writer
            .send(Frame::Command {
                guid: self.shared.guid,
            })
            .await
        {
            self.session
                .emit_error(e.into(), Operation::CreateCommand, self.shared.guid);
        }
    }

    /// Queue payload bytes for this command. Delivery is gated on command
    /// activation and on the peer's DataAck for the previous chunk.
    pub fn send_data(&self, stream: StreamTag, payload: Vec<u8>) {
        self.shared.send_queue.enqueue(stream, payload);
    }

    /// Ask the peer to stop the command. Idempotent; a no-op once the
    /// command is closed. Freezes outbound data immediately.
    pub async fn send_stop_signal(&self) {
        if self.shared.is_closed() {
            return;
        }
        if self.shared.signal_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stop_sends();
        tracing::debug!(
            session = %self.session.runspace_id,
            command = %self.shared.guid,
            "signalling command stop"
        );
        match self
            .session
            .writer
            .send(Frame::Signal {
                guid: self.shared.guid,
            })
            .await
        {
            Ok(()) => self.session.arm_signal_timer(&self.shared),
            Err(e) => {
                self.session
                    .emit_error(e.into(), Operation::Signal, self.shared.guid);
            }
        }
    }

    /// Close the command. Idempotent: exactly one Close frame goes out no
    /// matter how many callers race here. Completion (registry removal and
    /// the close-completed event) waits for the peer's CloseAck.
    pub async fn close(&self) {
        if !self.shared.mark_closed() {
            return;
        }
        self.shared.stop_sends();
        tracing::debug!(
            session = %self.session.runspace_id,
            command = %self.shared.guid,
            "closing command"
        );
        match self
            .session
            .writer
            .send(Frame::Close {
                guid: self.shared.guid,
            })
            .await
        {
            Ok(()) => self.session.arm_command_close_timer(&self.shared),
            Err(e) => {
                self.session
                    .emit_error(e.into(), Operation::Close, self.shared.guid);
                // The peer is unreachable; clean up locally so the session
                // close cannot hang on this command.
                self.shared.close_timer.cancel();
                self.shared.signal_timer.cancel();
                self.session.remove_command(self.shared.guid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_only_succeeds_from_pending() {
        let command = CommandShared::new(Uuid::new_v4());
        assert!(!command.is_active());
        assert!(command.activate());
        assert!(command.is_active());
        assert!(!command.activate(), "double activation");
    }

    #[test]
    fn close_wins_over_late_activation() {
        let command = CommandShared::new(Uuid::new_v4());
        assert!(command.mark_closed());
        assert!(!command.activate(), "ack after close must not reopen");
        assert!(command.is_closed());
        assert!(!command.mark_closed(), "second close is a no-op");
    }

    #[test]
    fn stop_sends_is_sticky() {
        let command = CommandShared::new(Uuid::new_v4());
        assert!(!command.send_stopped());
        command.stop_sends();
        command.stop_sends();
        assert!(command.send_stopped());
    }
}
