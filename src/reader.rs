//! Background read tasks.
//!
//! One task decodes frames off the connection's inbound half, one drains
//! the out-of-band error channel (a spawned server's stderr). Both only
//! ever push onto the session loop's queue; neither touches session state.

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::connect::BoxReadStream;
use crate::session::Inbound;
use crate::wire::{FrameCodec, InboundItem};

/// Decode frames until EOF or a fatal decode error. EOF is reported as
/// [`Inbound::Disconnected`]; a decode failure as [`Inbound::Fatal`] after
/// which no further reads are attempted.
pub(crate) fn spawn_frame_reader(
    reader: BoxReadStream,
    max_frame_length: usize,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, FrameCodec::with_max_length(max_frame_length));
        loop {
            match frames.next().await {
                Some(Ok(item)) => {
                    if tx.send(Inbound::Item(item)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Inbound::Fatal(e.into()));
                    break;
                }
                None => {
                    let _ = tx.send(Inbound::Disconnected);
                    break;
                }
            }
        }
    });
}

/// Forward error-channel lines as peer errors. EOF here is not a
/// disconnect: only the frame reader decides connection liveness.
pub(crate) fn spawn_error_pump(
    stderr: BoxReadStream,
    filter_warnings: bool,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    // ssh prints login banners and host-key warnings on
                    // stderr; those are noise, not server faults.
                    if filter_warnings && trimmed.contains("WARNING:") {
                        tracing::debug!(line = trimmed, "filtered error-channel warning");
                        continue;
                    }
                    let item = InboundItem::PeerError(trimmed.to_string());
                    if tx.send(Inbound::Item(item)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "error channel read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{DEFAULT_MAX_FRAME_LENGTH, Frame, SESSION_GUID};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frame_reader_delivers_frames_then_disconnect_on_eof() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_frame_reader(Box::new(local), DEFAULT_MAX_FRAME_LENGTH, tx);

        remote
            .write_all(b"<CloseAck PSGuid=\"00000000-0000-0000-0000-000000000000\" />\n")
            .await
            .unwrap();
        drop(remote);

        match rx.recv().await.unwrap() {
            Inbound::Item(InboundItem::Frame(frame)) => {
                assert_eq!(frame, Frame::CloseAck { guid: SESSION_GUID });
            }
            _ => panic!("expected a decoded frame"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Inbound::Disconnected));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn frame_reader_reports_decode_failures_as_fatal() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_frame_reader(Box::new(local), DEFAULT_MAX_FRAME_LENGTH, tx);

        remote.write_all(b"<Bogus PSGuid=\"x\" />\n").await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), Inbound::Fatal(_)));
        assert!(rx.recv().await.is_none(), "reader kept going after a fatal error");
    }

    #[tokio::test]
    async fn error_pump_filters_warnings_and_forwards_the_rest() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_error_pump(Box::new(local), true, tx);

        remote
            .write_all(b"WARNING: host key changed\nsomething broke\n")
            .await
            .unwrap();
        drop(remote);

        match rx.recv().await.unwrap() {
            Inbound::Item(InboundItem::PeerError(text)) => {
                assert_eq!(text, "something broke");
            }
            _ => panic!("expected a peer error"),
        }
        assert!(rx.recv().await.is_none());
    }
}
