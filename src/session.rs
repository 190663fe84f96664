//! Per-connection session actor
//!
//! A `Session` owns one accepted connection. Outbound messages go through a
//! bounded queue drained by a dedicated writer task, so writes to one socket
//! are serialized and a broadcaster never blocks on a slow peer. The read
//! loop (`run`) is started by the listener once the username is accepted and
//! reports inbound messages and its own termination through two callbacks.
//!
//! Lifecycle: `UNREGISTERED` (constructed, not started) -> `ACTIVE`
//! (`run` in progress) -> `CLOSED` (terminal).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{AppError, SendError};
use crate::message::Message;
use crate::types::SessionId;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

fn boxed_reader<R>(read_half: R) -> BoxedReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let inner: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
    BufReader::new(inner)
}

/// Outcome of one bounded line read
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// A line (possibly unterminated at end of stream) is in the buffer
    Line,
    /// End of stream with nothing buffered
    Eof,
    /// The line grew past the configured limit; nothing more was consumed
    TooLong,
}

/// Read up to and including the next `\n`, refusing lines longer than `max_len`
async fn read_line_bounded(
    reader: &mut BoxedReader,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<LineRead> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() { LineRead::Eof } else { LineRead::Line });
        }

        let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };

        if buf.len() + chunk.len() > max_len {
            return Ok(LineRead::TooLong);
        }

        let used = chunk.len();
        buf.extend_from_slice(chunk);
        reader.consume(used);

        if complete {
            return Ok(LineRead::Line);
        }
    }
}

/// Called with every message read from the connection
pub type OnReceived = Arc<dyn Fn(Message) + Send + Sync>;

/// Called once when the read loop ends
pub type OnDie = Arc<dyn Fn(&Session) + Send + Sync>;

/// Shared between the session and its writer task
struct Lifecycle {
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Lifecycle {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            connected: AtomicBool::new(true),
            closed,
        }
    }

    /// Flip to closed. Returns true only for the call that did the flip.
    fn shut(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.closed.send_replace(true);
        was_connected
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Resolves once the session has been closed
async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// One connected user
pub struct Session {
    id: SessionId,
    username: String,
    peer: Option<SocketAddr>,
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::Sender<Message>,
    max_line_len: usize,
    /// Taken exactly once, by `run` or `linger`
    reader: Mutex<Option<BoxedReader>>,
    on_received: Option<OnReceived>,
    on_die: Option<OnDie>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap an already-identified connection
    ///
    /// Spawns the writer task, so this must be called inside a tokio runtime.
    pub fn new<S>(
        io: S,
        username: impl Into<String>,
        peer: Option<SocketAddr>,
        config: &SessionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = boxed_reader(read_half);
        Self::from_parts(reader, write_half, username.into(), peer, config)
    }

    /// Build a session from a freshly accepted TCP connection
    ///
    /// Fails with `AppError::Initialization` if the connection is no longer
    /// open or the peer never sends a username.
    pub async fn accept(stream: TcpStream, config: &SessionConfig) -> Result<Self, AppError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| AppError::Initialization(format!("connection is not open: {}", e)))?;
        Self::handshake(stream, Some(peer), config).await
    }

    /// Read the username line, then wrap the connection
    pub async fn handshake<S>(
        io: S,
        peer: Option<SocketAddr>,
        config: &SessionConfig,
    ) -> Result<Self, AppError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = boxed_reader(read_half);
        let username = read_username(&mut reader, config).await?;
        Ok(Self::from_parts(reader, write_half, username, peer, config))
    }

    fn from_parts<W>(
        reader: BoxedReader,
        writer: W,
        username: String,
        peer: Option<SocketAddr>,
        config: &SessionConfig,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = SessionId::new();
        let lifecycle = Arc::new(Lifecycle::new());
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));

        tokio::spawn(write_loop(
            id,
            writer,
            outbound_rx,
            Arc::clone(&lifecycle),
            config.write_timeout,
        ));

        debug!("Session {} created for '{}'", id, username);

        Self {
            id,
            username,
            peer,
            lifecycle,
            outbound,
            max_line_len: config.max_line_len.max(1),
            reader: Mutex::new(Some(reader)),
            on_received: None,
            on_die: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Set the inbound-message callback (before the session is started)
    pub fn set_on_received<F>(&mut self, callback: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_received = Some(Arc::new(callback));
    }

    /// Set the termination callback (before the session is started)
    pub fn set_on_die<F>(&mut self, callback: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.on_die = Some(Arc::new(callback));
    }

    /// Queue a message for this connection
    ///
    /// Never fails for the caller. A stalled or broken connection is closed
    /// instead, which ends the read loop and runs the death callback.
    pub fn send_message(&self, message: &Message) {
        match self.try_send(message) {
            Ok(()) => {}
            Err(SendError::Disconnected) => {
                debug!("Skipping send to closed session {}", self.id);
            }
            Err(e) => {
                warn!("Closing session {} ({}): {}", self.id, self.username, e);
                self.close();
            }
        }
    }

    fn try_send(&self, message: &Message) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Disconnected);
        }
        self.outbound
            .try_send(message.clone())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
            })
    }

    /// Close the connection. Idempotent; returns true if this call closed it.
    pub fn close(&self) -> bool {
        let closed_now = self.lifecycle.shut();
        if closed_now {
            info!("Session {} ({}) closed", self.id, self.username);
        }
        closed_now
    }

    fn take_reader(&self) -> Option<BoxedReader> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Read loop
    ///
    /// Runs until the peer hangs up, a read fails, or the session is closed,
    /// then closes the session and invokes the death callback once.
    /// Only the first call does anything.
    pub async fn run(self: Arc<Self>) {
        let Some(mut reader) = self.take_reader() else {
            debug!("Session {} already started", self.id);
            return;
        };

        let closed = closed_signal(self.lifecycle.closed.subscribe());
        tokio::pin!(closed);

        info!("Session {} ({}) active", self.id, self.username);

        let mut line = Vec::new();
        loop {
            line.clear();
            tokio::select! {
                _ = &mut closed => {
                    debug!("Session {} closed locally", self.id);
                    break;
                }
                read = read_line_bounded(&mut reader, &mut line, self.max_line_len) => {
                    match read {
                        Ok(LineRead::Eof) => {
                            debug!("Session {} reached end of stream", self.id);
                            break;
                        }
                        Ok(LineRead::TooLong) => {
                            warn!(
                                "Session {} sent a line over {} bytes",
                                self.id, self.max_line_len
                            );
                            break;
                        }
                        Ok(LineRead::Line) => {
                            // Invalid UTF-8 is replaced, not fatal
                            let text = String::from_utf8_lossy(&line);
                            if text.trim().is_empty() {
                                continue;
                            }
                            let message = Message::inbound(&self.username, &text);
                            debug!("Session {} received {}", self.id, message);
                            if let Some(on_received) = &self.on_received {
                                on_received(message);
                            }
                        }
                        Err(e) => {
                            warn!("Read from session {} failed: {}", self.id, e);
                            break;
                        }
                    }
                }
            }
        }

        drop(reader);
        self.close();

        if let Some(on_die) = &self.on_die {
            on_die(self.as_ref());
        }
    }

    /// Hold a rejected connection open until the peer gives up
    ///
    /// Inbound data is discarded and no callback is ever invoked.
    pub async fn linger(self: Arc<Self>) {
        let Some(mut reader) = self.take_reader() else {
            return;
        };

        let closed = closed_signal(self.lifecycle.closed.subscribe());
        tokio::pin!(closed);

        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = &mut closed => break,
                read = reader.read(&mut buf) => {
                    if matches!(read, Ok(0) | Err(_)) {
                        break;
                    }
                }
            }
        }

        drop(reader);
        self.close();
    }
}

async fn read_username(
    reader: &mut BoxedReader,
    config: &SessionConfig,
) -> Result<String, AppError> {
    let mut line = Vec::new();
    let max_len = config.max_line_len.max(1);
    let read = tokio::time::timeout(
        config.handshake_timeout,
        read_line_bounded(reader, &mut line, max_len),
    )
    .await
    .map_err(|_| AppError::Initialization("timed out waiting for username".to_string()))??;

    match read {
        LineRead::Line => {}
        LineRead::Eof => {
            return Err(AppError::Initialization(
                "connection closed before username".to_string(),
            ))
        }
        LineRead::TooLong => {
            return Err(AppError::Initialization(format!(
                "username line over {} bytes",
                max_len
            )))
        }
    }

    let line = String::from_utf8_lossy(&line);
    let username = line.trim();
    if username.is_empty() {
        return Err(AppError::Initialization("empty username".to_string()));
    }

    Ok(username.to_string())
}

/// Writer task: the only place that touches the write half
async fn write_loop<W>(
    id: SessionId,
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    lifecycle: Arc<Lifecycle>,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let closed = closed_signal(lifecycle.closed.subscribe());
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            _ = &mut closed => break,
            next = outbound.recv() => {
                let Some(message) = next else { break };
                if let Err(e) = write_line(&mut writer, &message, write_timeout).await {
                    warn!("Write to session {} failed: {}", id, e);
                    lifecycle.shut();
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!("Write task ended for session {}", id);
}

async fn write_line<W>(writer: &mut W, message: &Message, limit: Duration) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = message.raw().into_bytes();
    line.push(b'\n');

    tokio::time::timeout(limit, async {
        writer.write_all(&line).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))??;

    Ok(())
}
