//! Server-side session mirror.
//!
//! The server end of the protocol: decode what the client sends, reply with
//! the matching acks, surface payloads and lifecycle requests as events, and
//! push server-originated data back under the same one-outstanding-chunk
//! gating. Commands are instantiated on the client's request and live in a
//! concurrent registry keyed by their correlation id.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::ChannelWriter;
use crate::connect::Connection;
use crate::error::{Operation, TransportError};
use crate::reader;
use crate::sendq::PrioritySendQueue;
use crate::session::{Inbound, TransportOptions};
use crate::wire::{Frame, FrameCodec, InboundItem, SESSION_GUID, StreamTag};

/// What the server surfaces to its host.
#[derive(Debug)]
pub enum ServerEvent {
    /// Decoded payload for the session or a prepared command.
    DataReceived {
        guid: Uuid,
        stream: StreamTag,
        payload: Vec<u8>,
    },
    /// The client registered a new command. Already acknowledged; call
    /// [`ServerSessionTransport::prepare`] once a data handler is wired.
    CommandCreated { guid: Uuid },
    /// The client asked the command to stop. Already acknowledged.
    SignalReceived { guid: Uuid },
    /// The client closed a command. Already acknowledged and deregistered.
    CommandCloseReceived { guid: Uuid },
    /// The client closed the session; the serve loop is finished.
    SessionClosed,
    TransportError {
        error: TransportError,
        operation: Operation,
        guid: Uuid,
    },
}

struct PendingDelivery {
    /// Until the host prepares the command, inbound data is buffered and
    /// its ack withheld so the chunk is never lost.
    prepared: bool,
    buffered: Vec<(StreamTag, Vec<u8>)>,
    ack_deferred: bool,
}

struct ServerCommandState {
    guid: Uuid,
    send_queue: PrioritySendQueue,
    ack_pending: AtomicBool,
    pending: StdMutex<PendingDelivery>,
}

impl ServerCommandState {
    fn new(guid: Uuid) -> Self {
        Self {
            guid,
            send_queue: PrioritySendQueue::new(),
            ack_pending: AtomicBool::new(false),
            pending: StdMutex::new(PendingDelivery {
                prepared: false,
                buffered: Vec::new(),
                ack_deferred: false,
            }),
        }
    }
}

struct ServerShared {
    writer: ChannelWriter,
    inbound: mpsc::UnboundedSender<Inbound>,
    events: mpsc::UnboundedSender<ServerEvent>,
    commands: DashMap<Uuid, Arc<ServerCommandState>>,
    send_queue: PrioritySendQueue,
    session_ack_pending: AtomicBool,
}

/// Server-side handle to one session, normally run over the process's own
/// stdio after being spawned by a client.
pub struct ServerSessionTransport {
    shared: Arc<ServerShared>,
}

impl ServerSessionTransport {
    /// Run the mirror loop over an established connection.
    pub fn serve(
        connection: Connection,
        options: TransportOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = ChannelWriter::new(
            connection.writer,
            FrameCodec::with_max_length(options.max_frame_length),
        );

        let shared = Arc::new(ServerShared {
            writer,
            inbound: inbound_tx.clone(),
            events: events_tx,
            commands: DashMap::new(),
            send_queue: PrioritySendQueue::new(),
            session_ack_pending: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            serve_loop(loop_shared, inbound_rx).await;
        });
        reader::spawn_frame_reader(connection.reader, options.max_frame_length, inbound_tx);

        (Self { shared }, events_rx)
    }

    /// Queue session-scoped payload bytes towards the client.
    pub fn send_data(&self, stream: StreamTag, payload: Vec<u8>) {
        self.shared.send_queue.enqueue(stream, payload);
        self.shared.nudge(SESSION_GUID);
    }

    /// Queue payload bytes for one command. Dropped when the command is
    /// unknown (already closed).
    pub fn send_command_data(&self, guid: Uuid, stream: StreamTag, payload: Vec<u8>) {
        if let Some(command) = self.shared.command(guid) {
            command.send_queue.enqueue(stream, payload);
            self.shared.nudge(guid);
        } else {
            tracing::trace!(%guid, "dropping outbound data for unknown command");
        }
    }

    /// Mark a command ready for delivery: flush payloads that arrived before
    /// the host wired its handler, and release the withheld ack.
    pub async fn prepare(&self, guid: Uuid) {
        let Some(command) = self.shared.command(guid) else {
            return;
        };
        let (buffered, ack_deferred) = {
            let mut pending = command.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.prepared {
                return;
            }
            pending.prepared = true;
            (
                std::mem::take(&mut pending.buffered),
                std::mem::replace(&mut pending.ack_deferred, false),
            )
        };
        for (stream, payload) in buffered {
            let _ = self.shared.events.send(ServerEvent::DataReceived {
                guid,
                stream,
                payload,
            });
        }
        if ack_deferred {
            self.shared.ack_data(guid).await;
        }
    }
}

impl ServerShared {
    fn command(&self, guid: Uuid) -> Option<Arc<ServerCommandState>> {
        self.commands.get(&guid).map(|entry| Arc::clone(&entry))
    }

    fn emit_error(&self, error: TransportError, operation: Operation, guid: Uuid) {
        tracing::error!(%operation, %guid, error = %error, "server transport error");
        let _ = self.events.send(ServerEvent::TransportError {
            error,
            operation,
            guid,
        });
    }

    async fn ack_data(&self, guid: Uuid) {
        if let Err(e) = self.writer.send(Frame::DataAck { guid }).await {
            self.emit_error(e.into(), Operation::Send, guid);
        }
    }

    /// Enqueue happened off the serve loop; bounce through the queue so the
    /// pump runs on the loop where the ack gate is managed.
    fn nudge(&self, guid: Uuid) {
        let _ = self.inbound.send(Inbound::DataAvailable { guid });
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

    async fn pump_command(self: &Arc<Self>, command: &Arc<ServerCommandState>) {
        if command.ack_pending.load(Ordering::Acquire) {
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

async fn serve_loop(shared: Arc<ServerShared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
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
                shared.writer.stop();
                shared.emit_error(
                    TransportError::connection_lost("end of stream on inbound channel"),
                    Operation::Unknown,
                    SESSION_GUID,
                );
                false
            }
            Inbound::Fatal(error) => {
                shared.writer.stop();
                shared.emit_error(error, Operation::Receive, SESSION_GUID);
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
            // Timers are a client-side concern; the server never arms one.
            Inbound::CloseTimeout { .. } | Inbound::SignalTimeout { .. } => true,
        };
        if !keep_going {
            break;
        }
    }
    tracing::debug!("serve loop finished");
}

async fn handle_frame(shared: &Arc<ServerShared>, frame: Frame) -> bool {
    tracing::trace!(frame = %frame, "frame received");
    match frame {
        Frame::Data {
            stream,
            guid,
            payload,
        } => {
            if guid == SESSION_GUID {
                let _ = shared.events.send(ServerEvent::DataReceived {
                    guid,
                    stream,
                    payload,
                });
                shared.ack_data(guid).await;
                return true;
            }
            let Some(command) = shared.command(guid) else {
                tracing::trace!(%guid, "dropping data for unknown command");
                return true;
            };
            let deliver = {
                let mut pending = command.pending.lock().unwrap_or_else(|p| p.into_inner());
                if pending.prepared {
                    Some(payload)
                } else {
                    pending.buffered.push((stream, payload));
                    pending.ack_deferred = true;
                    None
                }
            };
            if let Some(payload) = deliver {
                let _ = shared.events.send(ServerEvent::DataReceived {
                    guid,
                    stream,
                    payload,
                });
                shared.ack_data(guid).await;
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

        Frame::Command { guid } => {
            // The nil id is reserved for the session and can never name a
            // command.
            if guid == SESSION_GUID {
                tracing::debug!("ignoring command creation for the session id");
                return true;
            }
            if shared.commands.contains_key(&guid) {
                tracing::debug!(%guid, "duplicate command creation, ignoring");
                return true;
            }
            shared
                .commands
                .insert(guid, Arc::new(ServerCommandState::new(guid)));
            // The ack is what unblocks the client's first data send for
            // this command, so it goes out before the host gets involved.
            if let Err(e) = shared.writer.send(Frame::CommandAck { guid }).await {
                shared.emit_error(e.into(), Operation::CreateCommand, guid);
            }
            let _ = shared.events.send(ServerEvent::CommandCreated { guid });
            true
        }

        Frame::Close { guid } => {
            if guid == SESSION_GUID {
                let _ = shared.events.send(ServerEvent::SessionClosed);
                if let Err(e) = shared.writer.send(Frame::CloseAck { guid }).await {
                    shared.emit_error(e.into(), Operation::Close, guid);
                }
                shared.writer.stop();
                return false;
            }
            if shared.commands.remove(&guid).is_some() {
                let _ = shared
                    .events
                    .send(ServerEvent::CommandCloseReceived { guid });
            }
            // Acked even for an unknown command so the client side never
            // waits out its close timer.
            if let Err(e) = shared.writer.send(Frame::CloseAck { guid }).await {
                shared.emit_error(e.into(), Operation::Close, guid);
            }
            true
        }

        Frame::Signal { guid } => {
            if guid != SESSION_GUID && shared.commands.contains_key(&guid) {
                let _ = shared.events.send(ServerEvent::SignalReceived { guid });
            }
            if let Err(e) = shared.writer.send(Frame::SignalAck { guid }).await {
                shared.emit_error(e.into(), Operation::Signal, guid);
            }
            true
        }

        // Acks are client-bound; receiving one here means the peer is not
        // speaking the client side of the protocol.
        frame @ (Frame::CommandAck { .. } | Frame::CloseAck { .. } | Frame::SignalAck { .. }) => {
            shared.writer.stop();
            shared.emit_error(
                TransportError::UnexpectedFrame(frame.kind()),
                Operation::Receive,
                frame.guid(),
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{Connection, ConnectionStrategy};
    use crate::session::{SessionEvent, SessionTransport};
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::{ReadHalf, WriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};

    type Peer = (
        FramedRead<ReadHalf<tokio::io::DuplexStream>, FrameCodec>,
        FramedWrite<WriteHalf<tokio::io::DuplexStream>, FrameCodec>,
    );

    fn raw_peer_and_connection() -> (Peer, Connection) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (pr, pw) = tokio::io::split(near);
        let peer = (
            FramedRead::new(pr, FrameCodec::new()),
            FramedWrite::new(pw, FrameCodec::new()),
        );
        let (cr, cw) = tokio::io::split(far);
        (peer, Connection::from_streams(cr, cw))
    }

    async fn next_frame(peer: &mut Peer) -> Frame {
        match peer.0.next().await.unwrap().unwrap() {
            InboundItem::Frame(frame) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    struct TestStrategy(std::sync::Mutex<Option<Connection>>);

    #[async_trait::async_trait]
    impl ConnectionStrategy for TestStrategy {
        async fn connect(&self) -> Result<Connection, TransportError> {
            Ok(self.0.lock().unwrap().take().unwrap())
        }
    }

    #[tokio::test]
    async fn command_data_is_buffered_until_prepare() {
        let (mut peer, connection) = raw_peer_and_connection();
        let (server, mut events) =
            ServerSessionTransport::serve(connection, TransportOptions::default());

        let guid = Uuid::new_v4();
        peer.1.send(Frame::Command { guid }).await.unwrap();
        assert_eq!(next_frame(&mut peer).await, Frame::CommandAck { guid });
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::CommandCreated { guid: g } if g == guid
        ));

        peer.1
            .send(Frame::Data {
                stream: StreamTag::Default,
                guid,
                payload: vec![1, 2, 3],
            })
            .await
            .unwrap();

        // Neither the event nor the ack may appear before prepare().
        assert!(
            tokio::time::timeout(Duration::from_millis(50), events.recv())
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.0.next())
                .await
                .is_err()
        );

        server.prepare(guid).await;
        match events.recv().await.unwrap() {
            ServerEvent::DataReceived {
                guid: g,
                stream,
                payload,
            } => {
                assert_eq!(g, guid);
                assert_eq!(stream, StreamTag::Default);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(next_frame(&mut peer).await, Frame::DataAck { guid });
    }

    #[tokio::test]
    async fn server_outbound_data_waits_for_each_ack() {
        let (mut peer, connection) = raw_peer_and_connection();
        let (server, _events) =
            ServerSessionTransport::serve(connection, TransportOptions::default());

        server.send_data(StreamTag::Default, vec![1]);
        server.send_data(StreamTag::Default, vec![2]);

        assert_eq!(
            next_frame(&mut peer).await,
            Frame::Data {
                stream: StreamTag::Default,
                guid: SESSION_GUID,
                payload: vec![1],
            }
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.0.next())
                .await
                .is_err(),
            "second chunk was sent before the ack"
        );

        peer.1
            .send(Frame::DataAck { guid: SESSION_GUID })
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut peer).await,
            Frame::Data {
                stream: StreamTag::Default,
                guid: SESSION_GUID,
                payload: vec![2],
            }
        );
    }

    #[tokio::test]
    async fn command_creation_with_the_session_id_is_ignored() {
        let (mut peer, connection) = raw_peer_and_connection();
        let (_server, mut events) =
            ServerSessionTransport::serve(connection, TransportOptions::default());

        peer.1
            .send(Frame::Command { guid: SESSION_GUID })
            .await
            .unwrap();

        // No ack, no event, no registry entry.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.0.next())
                .await
                .is_err()
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_ack_frames_are_a_protocol_error_for_the_server() {
        let (mut peer, connection) = raw_peer_and_connection();
        let (_server, mut events) =
            ServerSessionTransport::serve(connection, TransportOptions::default());

        peer.1
            .send(Frame::CommandAck {
                guid: Uuid::new_v4(),
            })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ServerEvent::TransportError {
                error: TransportError::UnexpectedFrame(kind),
                operation,
                ..
            } => {
                assert_eq!(kind, crate::wire::FrameKind::CommandAck);
                assert_eq!(operation, Operation::Receive);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_close_is_acked_and_ends_the_loop() {
        let (mut peer, connection) = raw_peer_and_connection();
        let (_server, mut events) =
            ServerSessionTransport::serve(connection, TransportOptions::default());

        peer.1
            .send(Frame::Close { guid: SESSION_GUID })
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::SessionClosed
        ));
        assert_eq!(
            next_frame(&mut peer).await,
            Frame::CloseAck { guid: SESSION_GUID }
        );
        assert!(peer.0.next().await.is_none(), "writer not released");
    }

    // Full client/server exchange over an in-memory pipe: session data,
    // command lifecycle, stop signal, session close.
    #[tokio::test]
    async fn end_to_end_session_against_a_real_server() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (sr, sw) = tokio::io::split(near);
        let (server, mut server_events) = ServerSessionTransport::serve(
            Connection::from_streams(sr, sw),
            TransportOptions::default(),
        );

        let (cr, cw) = tokio::io::split(far);
        let strategy = TestStrategy(std::sync::Mutex::new(Some(Connection::from_streams(cr, cw))));
        let (client, mut client_events) = SessionTransport::connect(
            Uuid::new_v4(),
            &strategy,
            TransportOptions::default(),
        )
        .await
        .unwrap();

        // Session-scoped payload: a single zero byte ("AA==" on the wire).
        client.send_data(StreamTag::Default, vec![0]);
        match server_events.recv().await.unwrap() {
            ServerEvent::DataReceived {
                guid,
                stream,
                payload,
            } => {
                assert_eq!(guid, SESSION_GUID);
                assert_eq!(stream, StreamTag::Default);
                assert_eq!(payload, vec![0]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Command lifecycle against the real mirror.
        let command_id = Uuid::new_v4();
        let command = client.create_command(command_id).unwrap();
        command.send_data(StreamTag::Default, b"payload".to_vec());
        command.create().await;

        match server_events.recv().await.unwrap() {
            ServerEvent::CommandCreated { guid } => assert_eq!(guid, command_id),
            other => panic!("unexpected event {other:?}"),
        }
        server.prepare(command_id).await;
        match server_events.recv().await.unwrap() {
            ServerEvent::DataReceived { guid, payload, .. } => {
                assert_eq!(guid, command_id);
                assert_eq!(payload, b"payload");
            }
            other => panic!("unexpected event {other:?}"),
        }

        command.send_stop_signal().await;
        assert!(matches!(
            server_events.recv().await.unwrap(),
            ServerEvent::SignalReceived { guid } if guid == command_id
        ));
        assert!(matches!(
            client_events.recv().await.unwrap(),
            SessionEvent::SignalCompleted { guid } if guid == command_id
        ));

        command.close().await;
        assert!(matches!(
            server_events.recv().await.unwrap(),
            ServerEvent::CommandCloseReceived { guid } if guid == command_id
        ));
        assert!(matches!(
            client_events.recv().await.unwrap(),
            SessionEvent::CommandCloseCompleted { guid } if guid == command_id
        ));

        client.close().await;
        assert!(matches!(
            server_events.recv().await.unwrap(),
            ServerEvent::SessionClosed
        ));
        assert!(matches!(
            client_events.recv().await.unwrap(),
            SessionEvent::CloseCompleted
        ));
    }
}
