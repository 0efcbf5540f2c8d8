//! outproc: out-of-process session transport over line-delimited frames.

mod channel;
mod reader;
mod sendq;

pub mod connect;
pub mod error;
pub mod server;
pub mod session;
pub mod wire;

mod command;

pub use command::CommandTransport;
pub use session::{SessionEvent, SessionState, SessionTransport, TransportOptions};

pub use channel::ChannelWriter;
pub use connect::{
    Connection, ConnectionInfo, ConnectionStrategy, PipeStrategy, ProcessStrategy, SshStrategy,
    VmSocketStrategy,
};
pub use error::{Operation, TransportError};
pub use sendq::PrioritySendQueue;
pub use server::{ServerEvent, ServerSessionTransport};
pub use wire::{Frame, FrameCodec, FrameKind, InboundItem, SESSION_GUID, StreamTag};
