//! Client session transport manager.
//!
//! Owns one logical session: connection establishment, the inbound event
//! loop, ack-gated data sending, the command registry, and teardown. The
//! reader task only ever pushes decoded items onto a single-consumer queue
//! owned by the session; all registry mutation and frame dispatch runs
//! single-threaded against that queue. One coarse lock guards the
//! closed-flag together with the command registry so a command can never be
//! added to a session that is already closing.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::ChannelWriter;
use crate::command::{CommandShared, CommandTransport};
use crate::connect::ConnectionStrategy;
use crate::error::{Operation, TransportError};
use crate::reader;
use crate::sendq::PrioritySendQueue;
use crate::wire::{Frame, FrameCodec, InboundItem, SESSION_GUID, StreamTag};

/// Session lifecycle: `Created → Connecting → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Transport tuning knobs. Defaults match the protocol's 60-second
/// acknowledgement windows.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub close_timeout: Duration,
    pub signal_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(60),
            signal_timeout: Duration::from_secs(60),
            max_frame_length: crate::wire::DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl TransportOptions {
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// Everything the session surfaces outward, on one channel, in dispatch
/// order. `guid` is [`SESSION_GUID`] for session-scoped entries.
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded Data payload, for the session/command data handler.
    DataReceived {
        guid: Uuid,
        stream: StreamTag,
        payload: Vec<u8>,
    },
    /// The peer acknowledged the session close.
    CloseCompleted,
    /// The peer acknowledged a command close.
    CommandCloseCompleted { guid: Uuid },
    /// The peer acknowledged a stop signal for a still-open command.
    SignalCompleted { guid: Uuid },
    /// A fault, tagged with the operation in flight and the entity it hit.
    TransportError {
        error: TransportError,
        operation: Operation,
        guid: Uuid,
    },
}

/// Message on the session loop's single-consumer queue.
pub(crate) enum Inbound {
    Item(InboundItem),
    /// EOF on the inbound stream: peer process/connection lost.
    Disconnected,
    /// The reader hit a decode or I/O failure. Terminal.
    Fatal(TransportError),
    /// A registered send-queue callback produced the next chunk.
    ChunkReady {
        guid: Uuid,
        stream: StreamTag,
        chunk: Vec<u8>,
    },
    /// Data was enqueued while no callback was parked; run the pump.
    DataAvailable { guid: Uuid },
    CloseTimeout { guid: Uuid },
    SignalTimeout { guid: Uuid },
}

pub(crate) struct Guarded {
    pub(crate) closed: bool,
    pub(crate) commands: HashMap<Uuid, Arc<CommandShared>>,
}

pub(crate) struct SessionShared {
    pub(crate) runspace_id: Uuid,
    state: StdMutex<SessionState>,
    pub(crate) guarded: StdMutex<Guarded>,
    pub(crate) writer: ChannelWriter,
    pub(crate) inbound: mpsc::UnboundedSender<Inbound>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) options: TransportOptions,
    send_queue: PrioritySendQueue,
    session_ack_pending: AtomicBool,
    close_timer: CancellationToken,
    child: StdMutex<Option<tokio::process::Child>>,
}

/// Client-side handle to one remoting session.
pub struct SessionTransport {
    shared: Arc<SessionShared>,
}

impl SessionTransport {
    /// Resolve the connection strategy, wire the reader loop and event loop,
    /// and perform the initial proactive send. On success the session is
    /// Open; any establishment failure is returned without a transition.
    pub async fn connect(
        runspace_id: Uuid,
        strategy: &dyn ConnectionStrategy,
        options: TransportOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), TransportError> {
        tracing::debug!(session = %runspace_id, "connecting session");
        let connection = strategy.connect().await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = ChannelWriter::new(
            connection.writer,
            FrameCodec::with_max_length(options.max_frame_length),
        );

        let shared = Arc::new(SessionShared {
            runspace_id,
            state: StdMutex::new(SessionState::Connecting),
            guarded: StdMutex::new(Guarded {
                closed: false,
                commands: HashMap::new(),
            }),
            writer,
            inbound: inbound_tx.clone(),
            events: events_tx,
            options: options.clone(),
            send_queue: PrioritySendQueue::new(),
            session_ack_pending: AtomicBool::new(false),
            close_timer: CancellationToken::new(),
            child: StdMutex::new(connection.child),
        });

        // The event loop owns the send side, so it must be running before
        // the reader starts: the first outbound frame is sent proactively,
        // not in response to an ack.
        let loop_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            session_loop(loop_shared, inbound_rx).await;
        });

        reader::spawn_frame_reader(
            connection.reader,
            options.max_frame_length,
            inbound_tx.clone(),
        );
        if let Some(stderr) = connection.stderr {
            reader::spawn_error_pump(stderr, connection.filter_warnings, inbound_tx);
        }

        shared.set_state(SessionState::Open);
        tracing::debug!(session = %runspace_id, "session open");
        Ok((Self { shared }, events_rx))
    }

    pub fn runspace_id(&self) -> Uuid {
        self.shared.runspace_id
    }

    pub fn state(&self) -> SessionState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Queue session-scoped payload bytes for sending. Delivery is gated on
    /// the peer's DataAck for the previous chunk.
    pub fn send_data(&self, stream: StreamTag, payload: Vec<u8>) {
        self.shared.send_queue.enqueue(stream, payload);
    }

    /// Register a new command inside this session.
    ///
    /// Returns `None` without error when the session is already closed:
    /// command creation racing session teardown is legitimate, not a fault.
    pub fn create_command(&self, command_id: Uuid) -> Option<CommandTransport> {
        let mut guarded = self
            .shared
            .guarded
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if guarded.closed {
            tracing::debug!(
                session = %self.shared.runspace_id,
                command = %command_id,
                "session closed, declining command creation"
            );
            return None;
        }
        let command = Arc::new(CommandShared::new(command_id));
        guarded.commands.insert(command_id, Arc::clone(&command));
        Some(CommandTransport::new(Arc::clone(&self.shared), command))
    }

    /// Close the session. Idempotent: the second call is a no-op.
    ///
    /// The closed flag is set before anything else so concurrent command
    /// creation sees it and declines. If writing the Close frame fails the
    /// peer is already gone and the close completes synchronously instead
    /// of waiting for an ack that can never arrive.
    pub async fn close(&self) {
        {
            let mut guarded = self
                .shared
                .guarded
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if guarded.closed {
                return;
            }
            guarded.closed = true;
        }
        self.shared.set_state(SessionState::Closing);
        tracing::debug!(session = %self.shared.runspace_id, "closing session");

        match self.shared.writer.send(Frame::Close { guid: SESSION_GUID }).await {
            Ok(()) => {
                self.shared.spawn_timer(
                    self.shared.close_timer.clone(),
                    self.shared.options.close_timeout,
                    Inbound::CloseTimeout { guid: SESSION_GUID },
                );
            }
            Err(e) => {
                tracing::debug!(
                    session = %self.shared.runspace_id,
                    error = %e,
                    "close write failed, completing close immediately"
                );
                self.shared.set_state(SessionState::Closed);
                let _ = self.shared.events.send(SessionEvent::CloseCompleted);
                self.shared.teardown();
            }
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl SessionShared {
    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.guarded.lock().unwrap_or_else(|p| p.into_inner()).closed
    }

    pub(crate) fn command(&self, guid: Uuid) -> Option<Arc<CommandShared>> {
        self.guarded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .commands
            .get(&guid)
            .cloned()
    }

    /// Registry removal works even when the session is already closed, so
    /// a faulted command can never leave the session's close hanging.
    pub(crate) fn remove_command(&self, guid: Uuid) -> Option<Arc<CommandShared>> {
        self.guarded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .commands
            .remove(&guid)
    }

    pub(crate) fn emit_error(&self, error: TransportError, operation: Operation, guid: Uuid) {
        tracing::error!(
            session = %self.runspace_id,
            %operation,
            %guid,
            error = %error,
            "transport error"
        );
        let _ = self.events.send(SessionEvent::TransportError {
            error,
            operation,
            guid,
        });
    }

    pub(crate) fn spawn_timer(
        &self,
        token: CancellationToken,
        duration: Duration,
        message: Inbound,
    ) {
        let tx = self.inbound.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    let _ = tx.send(message);
                }
            }
        });
    }

    pub(crate) fn arm_command_close_timer(&self, command: &CommandShared) {
        self.spawn_timer(
            command.close_timer.clone(),
            self.options.close_timeout,
            Inbound::CloseTimeout { guid: command.guid },
        );
    }

    pub(crate) fn arm_signal_timer(&self, command: &CommandShared) {
        self.spawn_timer(
            command.signal_timer.clone(),
            self.options.signal_timeout,
            Inbound::SignalTimeout { guid: command.guid },
        );
    }

    /// Release connection resources: stop the writer, kill the spawned
    /// server process when this session owns one, disarm the close timer.
    fn teardown(&self) {
        self.writer.stop();
        self.close_timer.cancel();
        let child = self
            .child
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "server process already exited");
            }
        }
    }

    async fn pump_session(self: &Arc<Self>) {
        if self.session_ack_pending.load(Ordering::Acquire) {
            return;
        }
        let tx = self.inbound.clone();
        let pulled = self.send_queue.read_or_register(Box::new(move |chunk, stream| {
            let _ = tx.send(Inbound::ChunkReady {
                guid: SESSION_GUID,
                stream,
                chunk,
            });
        }));
        if let Some((chunk, stream)) = pulled {
            self.write_chunk(SESSION_GUID, stream, chunk).await;
        }
    }

    async fn pump_command(self: &Arc<Self>, command: &Arc<CommandShared>) {
        if !command.is_active()
            || command.send_stopped()
            || command.ack_pending.load(Ordering::Acquire)
        {
            return;
        }
        let tx = self.inbound.clone();
        let guid = command.guid;
        let pulled = command
            .send_queue
            .read_or_register(Box::new(move |chunk, stream| {
                let _ = tx.send(Inbound::ChunkReady { guid, stream, chunk });
            }));
        if let Some((chunk, stream)) = pulled {
            self.write_chunk(guid, stream, chunk).await;
        }
    }

    async fn write_chunk(self: &Arc<Self>, guid: Uuid, stream: StreamTag, chunk: Vec<u8>) {
        if guid == SESSION_GUID {
            self.session_ack_pending.store(true, Ordering::Release);
        } else if let Some(command) = self.command(guid) {
            if command.is_closed() || command.send_stopped() {
                return;
            }
            command.ack_pending.store(true, Ordering::Release);
        } else {
            return;
        }

        if let Err(e) = self
            .writer
            .send(Frame::Data {
                stream,
                guid,
                payload: chunk,
            })
            .await
        {
            self.emit_error(e.into(), Operation::Send, guid);
        }
    }
}

async fn session_loop(shared: Arc<SessionShared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    // Kick-start flow control: the first frame the client emits is
    // proactive, not triggered by an ack.
    shared.pump_session().await;

    while let Some(message) = inbound.recv().await {
        let keep_going = match message {
            Inbound::Item(InboundItem::Frame(frame)) => handle_frame(&shared, frame).await,
            Inbound::Item(InboundItem::PeerError(text)) => {
                shared.emit_error(
                    TransportError::PeerError(text),
                    Operation::Receive,
                    SESSION_GUID,
                );
                true
            }
            Inbound::Disconnected => {
                handle_disconnect(&shared);
                false
            }
            Inbound::Fatal(error) => {
                shared.writer.stop();
                shared.set_state(SessionState::Closed);
                shared.emit_error(error, Operation::Receive, SESSION_GUID);
                shared.teardown();
                false
            }
            Inbound::ChunkReady { guid, stream, chunk } => {
                shared.write_chunk(guid, stream, chunk).await;
                true
            }
            Inbound::DataAvailable { guid } => {
                if guid == SESSION_GUID {
                    shared.pump_session().await;
                } else if let Some(command) = shared.command(guid) {
                    shared.pump_command(&command).await;
                }
                true
            }
            Inbound::CloseTimeout { guid } => handle_close_timeout(&shared, guid),
            Inbound::SignalTimeout { guid } => {
                handle_signal_timeout(&shared, guid);
                true
            }
        };
        if !keep_going {
            break;
        }
    }
    tracing::debug!(session = %shared.runspace_id, "session loop finished");
}

async fn handle_frame(shared: &Arc<SessionShared>, frame: Frame) -> bool {
    tracing::trace!(session = %shared.runspace_id, frame = %frame, "frame received");
    match frame {
        Frame::Data {
            stream,
            guid,
            payload,
        } => {
            if guid == SESSION_GUID {
                let _ = shared.events.send(SessionEvent::DataReceived {
                    guid,
                    stream,
                    payload,
                });
                ack_data(shared, guid).await;
                return true;
            }
            match shared.command(guid) {
                Some(command) if !command.is_closed() => {
                    let _ = shared.events.send(SessionEvent::DataReceived {
                        guid,
                        stream,
                        payload,
                    });
                    ack_data(shared, guid).await;
                }
                // Already closed or already removed: the peer may not yet
                // know. Drop silently, without an ack.
                _ => tracing::trace!(%guid, "dropping data for closed command"),
            }
            true
        }

        Frame::DataAck { guid } => {
            if guid == SESSION_GUID {
                shared.session_ack_pending.store(false, Ordering::Release);
                shared.pump_session().await;
            } else if let Some(command) = shared.command(guid) {
                command.ack_pending.store(false, Ordering::Release);
                shared.pump_command(&command).await;
            } else {
                tracing::trace!(%guid, "data ack for unknown command, ignoring");
            }
            true
        }

        Frame::CommandAck { guid } => match shared.command(guid) {
            None => {
                // A command must exist when its own creation is
                // acknowledged. Unlike Data/Close acks, this one is fatal.
                shared.writer.stop();
                shared.set_state(SessionState::Closed);
                shared.emit_error(
                    TransportError::UnknownCommandAck(guid),
                    Operation::CreateCommand,
                    guid,
                );
                shared.teardown();
                false
            }
            Some(command) => {
                if shared.is_closed() {
                    tracing::debug!(%guid, "session closed, ignoring command ack");
                } else if command.activate() {
                    // Backlog queued before the ack drains first, then
                    // steady-state data, one chunk per DataAck.
                    shared.pump_command(&command).await;
                }
                true
            }
        },

        Frame::CloseAck { guid } => {
            if guid == SESSION_GUID {
                complete_session_close(shared);
                return false;
            }
            match shared.command(guid) {
                Some(command) => complete_command_close(shared, &command),
                // Cleaned up locally before the ack arrived. Benign race.
                None => tracing::trace!(%guid, "close ack for unknown command, ignoring"),
            }
            true
        }

        Frame::SignalAck { guid } => {
            match shared.command(guid) {
                Some(command) => {
                    command.signal_timer.cancel();
                    if !command.is_closed() {
                        let _ = shared.events.send(SessionEvent::SignalCompleted { guid });
                    }
                }
                None => tracing::trace!(%guid, "signal ack for unknown command, ignoring"),
            }
            true
        }

        // Only servers receive these. For a client they are unknown
        // elements, fatal to the connection.
        frame @ (Frame::Command { .. } | Frame::Close { .. } | Frame::Signal { .. }) => {
            shared.writer.stop();
            shared.set_state(SessionState::Closed);
            shared.emit_error(
                TransportError::UnexpectedFrame(frame.kind()),
                Operation::Receive,
                frame.guid(),
            );
            shared.teardown();
            false
        }
    }
}

async fn ack_data(shared: &Arc<SessionShared>, guid: Uuid) {
    if let Err(e) = shared.writer.send(Frame::DataAck { guid }).await {
        shared.emit_error(e.into(), Operation::Send, guid);
    }
}

fn complete_session_close(shared: &Arc<SessionShared>) {
    shared.close_timer.cancel();
    // Diagnostic only: commands may legitimately still be registered while
    // their own close acks are in flight.
    let remaining = shared
        .guarded
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .commands
        .len();
    tracing::debug!(
        session = %shared.runspace_id,
        remaining_commands = remaining,
        "session close acknowledged"
    );
    shared.set_state(SessionState::Closed);
    let _ = shared.events.send(SessionEvent::CloseCompleted);
    shared.teardown();
}

fn complete_command_close(shared: &Arc<SessionShared>, command: &Arc<CommandShared>) {
    command.close_timer.cancel();
    command.signal_timer.cancel();
    command.mark_closed();
    shared.remove_command(command.guid);
    // Deliberately delayed until the peer acknowledged: the server must not
    // observe a reference to the command after we report it released.
    let _ = shared.events.send(SessionEvent::CommandCloseCompleted {
        guid: command.guid,
    });
}

fn handle_disconnect(shared: &Arc<SessionShared>) {
    // Stop the writer before raising anything, so a concurrent close()
    // cannot race its Close frame into a broken pipe error.
    shared.writer.stop();
    let was_closed = shared.is_closed();
    let operation = if was_closed {
        Operation::Close
    } else {
        Operation::Unknown
    };
    shared.set_state(SessionState::Closed);
    shared.emit_error(
        TransportError::connection_lost("end of stream on inbound channel"),
        operation,
        SESSION_GUID,
    );
    shared.teardown();
}

fn handle_close_timeout(shared: &Arc<SessionShared>, guid: Uuid) -> bool {
    if guid == SESSION_GUID {
        if shared.state() == SessionState::Closed {
            // The close completed while the timer message was in flight.
            return true;
        }
        shared.set_state(SessionState::Closed);
        shared.emit_error(
            TransportError::AckTimeout {
                operation: Operation::Close,
                guid,
                timeout: shared.options.close_timeout,
            },
            Operation::Close,
            guid,
        );
        shared.teardown();
        return false;
    }

    // Still registered means the close ack never arrived.
    if let Some(command) = shared.remove_command(guid) {
        command.signal_timer.cancel();
        shared.emit_error(
            TransportError::AckTimeout {
                operation: Operation::Close,
                guid,
                timeout: shared.options.close_timeout,
            },
            Operation::Close,
            guid,
        );
        command.mark_closed();
    }
    true
}

fn handle_signal_timeout(shared: &Arc<SessionShared>, guid: Uuid) {
    match shared.command(guid) {
        Some(command) if !command.is_closed() => {
            shared.emit_error(
                TransportError::AckTimeout {
                    operation: Operation::Signal,
                    guid,
                    timeout: shared.options.signal_timeout,
                },
                Operation::Signal,
                guid,
            );
        }
        _ => {}
    }
}
