//! Transport error taxonomy.
//!
//! Every fault is delivered to the consumer through the session's event
//! channel, tagged with the [`Operation`] that was in flight and the
//! correlation id it affects. Errors never cross into unrelated commands.

use std::time::Duration;

use uuid::Uuid;

use crate::wire::{CodecError, FrameError, FrameKind};

/// Which transport method was active when a fault surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    CreateCommand,
    Send,
    Receive,
    Close,
    Signal,
    Unknown,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::CreateCommand => "create-command",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Close => "close",
            Self::Signal => "signal",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A framing rule was violated. Fatal to the connection.
    #[error("framing violation: {0}")]
    Framing(#[from] FrameError),

    /// The inbound byte stream could not be decoded. Fatal to the connection.
    #[error("decode failure: {0}")]
    Codec(#[from] CodecError),

    /// Out-of-band diagnostic text received on the error channel.
    #[error("server reported error: {0}")]
    PeerError(String),

    /// EOF on read, peer process exited, or a write hit a dead stream.
    /// Terminal for the connection; the caller must reconnect from scratch.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No acknowledgement arrived within the configured window.
    /// Terminal for the session or command it was armed for; never retried.
    #[error("no {operation} acknowledgement for {guid} within {timeout:?}")]
    AckTimeout {
        operation: Operation,
        guid: Uuid,
        timeout: Duration,
    },

    /// A CommandAck referenced a command this side never created.
    #[error("CommandAck received for unknown command {0}")]
    UnknownCommandAck(Uuid),

    /// A frame kind this role never expects (e.g. a client receiving
    /// Command). Treated like an unknown element.
    #[error("unexpected {0} frame received for this role")]
    UnexpectedFrame(FrameKind),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn connection_lost(detail: impl Into<String>) -> Self {
        Self::ConnectionLost(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_render_for_diagnostics() {
        assert_eq!(Operation::Close.to_string(), "close");
        assert_eq!(Operation::Unknown.to_string(), "unknown");
    }

    #[test]
    fn ack_timeout_names_the_operation() {
        let err = TransportError::AckTimeout {
            operation: Operation::Signal,
            guid: Uuid::nil(),
            timeout: Duration::from_secs(60),
        };
        let text = err.to_string();
        assert!(text.contains("signal"), "{text}");
        assert!(text.contains("60"), "{text}");
    }
}
