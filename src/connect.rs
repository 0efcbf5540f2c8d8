//! Connection establishment strategies.
//!
//! Pluggable ways to obtain the duplex byte stream a session runs over:
//! spawn a server process and pipe its stdio, connect a named pipe
//! (Unix-domain socket), connect the socket a VM/container guest exposes,
//! or spawn an ssh client towards a remote server command. The session
//! transport is generic over [`ConnectionStrategy`]; the state-machine
//! logic lives once, not per transport.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::TransportError;

pub type BoxReadStream = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriteStream = Box<dyn AsyncWrite + Send + Unpin>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An established duplex connection.
///
/// `child` is the spawned server process when the strategy owns one; it is
/// killed on session teardown. `stderr` is the out-of-band error channel.
pub struct Connection {
    pub reader: BoxReadStream,
    pub writer: BoxWriteStream,
    pub stderr: Option<BoxReadStream>,
    pub child: Option<Child>,
    /// Drop error-channel lines containing `WARNING:` (ssh banners).
    pub filter_warnings: bool,
}

impl Connection {
    /// Build a connection from pre-opened stream halves. Used by the server
    /// side (stdio) and by tests (in-memory duplex pipes).
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stderr: None,
            child: None,
            filter_warnings: false,
        }
    }
}

/// Extension point for obtaining the underlying byte stream.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

fn connection_from_child(mut child: Child, filter_warnings: bool) -> Result<Connection, TransportError> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::connection_lost("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::connection_lost("child stdout not captured"))?;
    let stderr = child.stderr.take();

    Ok(Connection {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        stderr: stderr.map(|s| Box::new(s) as BoxReadStream),
        child: Some(child),
        filter_warnings,
    })
}

/// Spawn a server executable and talk over its stdio.
#[derive(Debug, Clone)]
pub struct ProcessStrategy {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessStrategy {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ConnectionStrategy for ProcessStrategy {
    async fn connect(&self) -> Result<Connection, TransportError> {
        tracing::debug!(program = %self.program.display(), "spawning server process");
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        tracing::debug!(pid = child.id(), "server process spawned");
        connection_from_child(child, false)
    }
}

/// Connect the named pipe a server host exposes, addressed by path.
///
/// On this platform named pipes are Unix-domain sockets; the conventional
/// per-process endpoint lives under the temp directory.
#[derive(Debug, Clone)]
pub struct PipeStrategy {
    pub path: PathBuf,
    pub connect_timeout: Duration,
}

impl PipeStrategy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// The conventional endpoint of the host listening for process `pid`.
    pub fn for_process_id(pid: u32) -> Self {
        Self::new(std::env::temp_dir().join(format!("outproc-{pid}.sock")))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl ConnectionStrategy for PipeStrategy {
    async fn connect(&self) -> Result<Connection, TransportError> {
        tracing::debug!(path = %self.path.display(), "connecting named pipe");
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        let (read_half, write_half) = stream.into_split();
        Ok(Connection {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
            stderr: None,
            child: None,
            filter_warnings: false,
        })
    }
}

/// Connect the socket a VM or container guest exposes, addressed by the
/// guest's target GUID under a runtime socket directory.
#[derive(Debug, Clone)]
pub struct VmSocketStrategy {
    pub vm_id: Uuid,
    pub socket_dir: PathBuf,
    pub connect_timeout: Duration,
}

impl VmSocketStrategy {
    pub fn new(vm_id: Uuid) -> Self {
        Self {
            vm_id,
            socket_dir: std::env::temp_dir(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("vm-{}.sock", self.vm_id))
    }
}

#[async_trait]
impl ConnectionStrategy for VmSocketStrategy {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let path = self.socket_path();
        tracing::debug!(vm_id = %self.vm_id, path = %path.display(), "connecting vm socket");
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        let (read_half, write_half) = stream.into_split();
        Ok(Connection {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
            stderr: None,
            child: None,
            filter_warnings: false,
        })
    }
}

/// Spawn an ssh client towards a remote server command.
///
/// ssh's stderr is the error channel; banner lines containing `WARNING:`
/// are filtered out entirely rather than surfaced as errors.
#[derive(Debug, Clone)]
pub struct SshStrategy {
    /// `user@host` or a host alias from the ssh config.
    pub destination: String,
    pub port: Option<u16>,
    pub key_file: Option<PathBuf>,
    /// The server command to run on the remote end.
    pub remote_command: String,
}

impl SshStrategy {
    pub fn new(destination: impl Into<String>, remote_command: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            port: None,
            key_file: None,
            remote_command: remote_command.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }
}

#[async_trait]
impl ConnectionStrategy for SshStrategy {
    async fn connect(&self) -> Result<Connection, TransportError> {
        tracing::debug!(destination = %self.destination, "spawning ssh client");
        let mut command = Command::new("ssh");
        command.arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(key_file) = &self.key_file {
            command.arg("-i").arg(key_file);
        }
        command
            .arg(&self.destination)
            .arg(&self.remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        connection_from_child(child, true)
    }
}

/// Serializable description of a connection target, convertible into the
/// matching strategy. This is the descriptor form that connection-info
/// objects hand across component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionInfo {
    Process {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    Pipe {
        path: PathBuf,
    },
    VmSocket {
        vm_id: Uuid,
        socket_dir: PathBuf,
    },
    Ssh {
        destination: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_file: Option<PathBuf>,
        remote_command: String,
    },
}

impl ConnectionInfo {
    pub fn into_strategy(self) -> Box<dyn ConnectionStrategy> {
        match self {
            Self::Process { program, args } => {
                Box::new(ProcessStrategy::new(program).with_args(args))
            }
            Self::Pipe { path } => Box::new(PipeStrategy::new(path)),
            Self::VmSocket { vm_id, socket_dir } => {
                Box::new(VmSocketStrategy::new(vm_id).with_socket_dir(socket_dir))
            }
            Self::Ssh {
                destination,
                port,
                key_file,
                remote_command,
            } => {
                let mut strategy = SshStrategy::new(destination, remote_command);
                strategy.port = port;
                strategy.key_file = key_file;
                Box::new(strategy)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn connection_info_roundtrips() {
        let info = ConnectionInfo::Pipe {
            path: PathBuf::from("/tmp/outproc-42.sock"),
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ConnectionInfo = serde_json::from_str(&json).unwrap();

        match parsed {
            ConnectionInfo::Pipe { path } => {
                assert_eq!(path, PathBuf::from("/tmp/outproc-42.sock"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ssh_info_roundtrips_with_optional_fields_omitted() {
        let info = ConnectionInfo::Ssh {
            destination: "user@host".to_string(),
            port: None,
            key_file: None,
            remote_command: "server --stdio".to_string(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("port"));
        assert!(!json.contains("key_file"));

        let parsed: ConnectionInfo = serde_json::from_str(&json).unwrap();
        match parsed {
            ConnectionInfo::Ssh { destination, .. } => assert_eq!(destination, "user@host"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_strategy_pipes_child_stdio() {
        let strategy = ProcessStrategy::new("/bin/cat");
        let mut conn = strategy.connect().await.unwrap();

        conn.writer.write_all(b"echo me\n").await.unwrap();
        conn.writer.flush().await.unwrap();

        let mut line = String::new();
        BufReader::new(&mut conn.reader)
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(line, "echo me\n");

        if let Some(mut child) = conn.child.take() {
            child.start_kill().ok();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_strategy_surfaces_spawn_failure() {
        let strategy = ProcessStrategy::new("/nonexistent/definitely-not-a-server");
        match strategy.connect().await {
            Err(TransportError::Io(_)) => {}
            other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_strategy_connects_a_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let strategy = PipeStrategy::new(&path);
        let (conn, accepted) = tokio::join!(strategy.connect(), listener.accept());
        let mut conn = conn.unwrap();
        let (mut server, _) = accepted.unwrap();

        server.write_all(b"hi\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut conn.reader)
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(line, "hi\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_connect_times_out_when_nobody_listens() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = PipeStrategy::new(dir.path().join("absent.sock"))
            .with_connect_timeout(Duration::from_millis(200));
        match strategy.connect().await {
            // No listener: either an immediate refusal or the timeout,
            // depending on the platform. Both are connect failures.
            Err(TransportError::Io(_)) | Err(TransportError::ConnectTimeout(_)) => {}
            other => panic!("expected connect failure, got {:?}", other.map(|_| ())),
        }
    }
}
