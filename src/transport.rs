//! Byte-stream transport to the analysis server.
//!
//! A [`Transport`] owns one reader task and one writer task over a split
//! stream:
//!
//! - the reader task decodes frames and forwards them as
//!   [`TransportEvent`]s, ending with exactly one `Closed`
//! - the writer task is the only writer, so concurrent senders never
//!   interleave partial frames
//!
//! # Example
//!
//! ```ignore
//! let endpoint = Endpoint::UnixSocket(default_socket_path());
//! let transport = Transport::connect(&endpoint, Framing::LineDelimited).await?;
//! let (sender, mut inbound, guard) = transport.into_parts();
//! ```

pub mod framing;

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ClientError;

pub use framing::{read_message, write_message, Framing, FramingError, MAX_MESSAGE_SIZE};

/// Something observed on the inbound side of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete inbound message.
    Message(String),
    /// A frame that could not be read, after which the stream is still
    /// usable.
    Malformed(String),
    /// The stream is gone. Always the last event.
    Closed(String),
}

/// Handle for queueing outbound messages on the writer task.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<String>,
}

impl MessageSender {
    /// Queue one message for writing.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the writer task has stopped.
    pub fn send(&self, text: String) -> Result<(), ClientError> {
        self.tx
            .send(text)
            .map_err(|_| ClientError::transport("Transport is closed"))
    }

    /// Whether the writer task is still accepting messages.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Program and arguments for launching a server over stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Where the analysis server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Spawn a child process and talk over its stdin/stdout.
    Process(ServerCommand),
    /// Connect to a server listening on a Unix domain socket.
    UnixSocket(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Process(command) => {
                write!(f, "process {}", command.program.display())?;
                for arg in &command.args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Endpoint::UnixSocket(path) => write!(f, "socket {}", path.display()),
        }
    }
}

/// Resolve the default socket path for the analysis server.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/analysis-server.sock` (Linux standard)
/// 2. `<cache dir>/analysis-server.sock` (e.g. `~/Library/Caches` on macOS)
/// 3. `/tmp/analysis-server.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("analysis-server.sock");
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("analysis-server.sock");
    }

    PathBuf::from("/tmp/analysis-server.sock")
}

/// Owns the background tasks (and child process, if any) behind a
/// transport. Closing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct TransportGuard {
    stop_writer: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    child: Option<Child>,
}

impl TransportGuard {
    /// Stop the writer (shutting down the write half so the peer sees
    /// EOF), stop the reader and kill the child process.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop_writer.take() {
            let _ = stop.send(());
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("Server process already gone: {}", e);
            }
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connected, running transport.
#[derive(Debug)]
pub struct Transport {
    sender: MessageSender,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    guard: TransportGuard,
}

impl Transport {
    /// Start reader and writer tasks over an already-connected stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<R, W>(reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let reader = tokio::spawn(read_loop(
            BufReader::new(reader),
            framing,
            event_tx.clone(),
        ));
        tokio::spawn(write_loop(writer, framing, outbound_rx, stop_rx, event_tx));

        Self {
            sender: MessageSender { tx: outbound_tx },
            inbound: event_rx,
            guard: TransportGuard {
                stop_writer: Some(stop_tx),
                reader: Some(reader),
                child: None,
            },
        }
    }

    /// Establish a transport to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Startup`] if the process cannot be spawned
    /// or the socket cannot be connected.
    pub async fn connect(endpoint: &Endpoint, framing: Framing) -> Result<Self, ClientError> {
        debug!("Connecting to {}", endpoint);
        match endpoint {
            Endpoint::Process(command) => Self::spawn_process(command, framing),
            Endpoint::UnixSocket(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    ClientError::Startup(format!(
                        "Failed to connect to {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let (read_half, write_half) = stream.into_split();
                Ok(Self::from_stream(read_half, write_half, framing))
            }
        }
    }

    fn spawn_process(command: &ServerCommand, framing: Framing) -> Result<Self, ClientError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClientError::Startup(format!(
                    "Failed to spawn {}: {}",
                    command.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Startup("Server stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Startup("Server stdout unavailable".to_string()))?;

        // Server diagnostics go to stderr; surface them in our log
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "analysis_client::server", "{}", line);
                }
            });
        }

        if let Some(pid) = child.id() {
            debug!("Spawned analysis server (pid {})", pid);
        }

        let mut transport = Self::from_stream(stdout, stdin, framing);
        transport.guard.child = Some(child);
        Ok(transport)
    }

    /// Split into the outbound sender, the inbound event stream and the
    /// guard that owns the background tasks.
    pub fn into_parts(
        self,
    ) -> (
        MessageSender,
        mpsc::UnboundedReceiver<TransportEvent>,
        TransportGuard,
    ) {
        (self.sender, self.inbound, self.guard)
    }
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    framing: Framing,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let event = match read_message(&mut reader, framing).await {
            Ok(text) => {
                trace!("<-- {}", text);
                TransportEvent::Message(text)
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping unreadable frame: {}", e);
                TransportEvent::Malformed(e.to_string())
            }
            Err(e) => {
                debug!("Reader stopped: {}", e);
                let _ = events.send(TransportEvent::Closed(e.to_string()));
                return;
            }
        };

        if events.send(event).is_err() {
            // Nobody is listening anymore
            return;
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    framing: Framing,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            next = outbound.recv() => {
                let Some(text) = next else { break };
                trace!("--> {}", text);
                match write_message(&mut writer, &text, framing).await {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!("Dropping unframeable outbound message: {}", e);
                    }
                    Err(e) => {
                        warn!("Write failed: {}", e);
                        let _ = events.send(TransportEvent::Closed(format!("Write failed: {}", e)));
                        break;
                    }
                }
            }
        }
    }

    // Refuse further sends, then let the peer see EOF
    outbound.close();
    if let Err(e) = writer.shutdown().await {
        debug!("Write half shutdown failed: {}", e);
    }
}
