//! The shared serial console channel.
//!
//! A single reader task owns the read half of the socket and fans every
//! chunk out to all subscribers, so observers such as the transcript log
//! never steal bytes from the protocol. The write half is owned by the
//! session; only the protocol writes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::BootstrapError;

const CONNECT_RETRY: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 4096;

/// The single overall deadline of one protocol run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Instant,
    at: Instant,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            at: start + timeout,
        }
    }

    pub(crate) fn instant(&self) -> Instant {
        self.at
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Protocol phase of a console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsoleState {
    PreBoot,
    PromptReached,
    Transferring,
    AwaitingResult,
    Finished,
}

type Chunk = Arc<[u8]>;

#[derive(Debug, Clone, Default)]
struct Tee {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Chunk>>>>,
}

impl Tee {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Chunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn publish(&self, chunk: &[u8]) {
        let chunk: Chunk = chunk.into();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(chunk.clone()).is_ok());
    }

    /// Drop every sender so all receivers observe end of stream.
    fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Strip CR, ANSI escape sequences and other control characters.
pub(crate) fn normalize_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI: ESC [ params final-byte; otherwise drop one following char.
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            } else {
                chars.next();
            }
        } else if c == '\t' || !c.is_control() {
            out.push(c);
        }
    }
    out
}

/// Splits the console byte stream into normalized lines.
#[derive(Debug)]
pub(crate) struct LineReader {
    rx: mpsc::UnboundedReceiver<Chunk>,
    pending: Vec<u8>,
    lines: VecDeque<String>,
}

impl LineReader {
    fn new(rx: mpsc::UnboundedReceiver<Chunk>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            lines: VecDeque::new(),
        }
    }

    /// Wait for the next chunk and split it. Returns false once the channel
    /// has closed.
    pub(crate) async fn fill(&mut self) -> bool {
        let Some(chunk) = self.rx.recv().await else {
            return false;
        };
        for &b in chunk.iter() {
            if b == b'\n' {
                let raw = std::mem::take(&mut self.pending);
                let line = normalize_line(&String::from_utf8_lossy(&raw));
                trace!("console: {line}");
                self.lines.push_back(line);
            } else {
                self.pending.push(b);
            }
        }
        true
    }

    /// Pop the oldest complete line, if any.
    pub(crate) fn pop_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    /// The normalized, not yet newline-terminated tail.
    pub(crate) fn partial(&self) -> String {
        normalize_line(&String::from_utf8_lossy(&self.pending))
    }

    pub(crate) fn discard_partial(&mut self) {
        self.pending.clear();
    }

    /// Next complete line, or `None` once the channel has closed.
    pub(crate) async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pop_line() {
                return Some(line);
            }
            if !self.fill().await {
                return None;
            }
        }
    }
}

/// One VM's serial console.
pub(crate) struct ConsoleSession {
    lines: LineReader,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    tee: Tee,
    reader_task: JoinHandle<()>,
    state: ConsoleState,
}

impl std::fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ConsoleSession {
    /// Start the reader task over any duplex stream.
    pub(crate) fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rd, wr) = tokio::io::split(stream);
        let tee = Tee::default();
        let lines = LineReader::new(tee.subscribe());
        let task_tee = tee.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Console reached EOF");
                        break;
                    }
                    Ok(n) => task_tee.publish(&buf[..n]),
                    Err(e) => {
                        warn!("Console read failed: {e}");
                        break;
                    }
                }
            }
            task_tee.close();
        });
        Self {
            lines,
            writer: Box::new(wr),
            tee,
            reader_task,
            state: ConsoleState::PreBoot,
        }
    }

    /// Observe raw console bytes from now on, without affecting the protocol.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<[u8]>> {
        self.tee.subscribe()
    }

    /// Copy the raw transcript to `path` in the background.
    pub(crate) async fn tee_to_file(&self, path: &Utf8Path) -> Result<JoinHandle<()>> {
        let mut rx = self.subscribe();
        let mut f = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Creating console log {path}"))?;
        let path = path.to_owned();
        Ok(tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = f.write_all(&chunk).await {
                    warn!("Writing console log {path}: {e}");
                    return;
                }
            }
            let _ = f.flush().await;
        }))
    }

    pub(crate) fn lines(&mut self) -> &mut LineReader {
        &mut self.lines
    }

    pub(crate) fn state(&self) -> ConsoleState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConsoleState) {
        debug!("Console state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Write `text` completely and flush it.
    pub(crate) async fn send(&mut self, text: &str) -> Result<(), BootstrapError> {
        self.writer
            .write_all(text.as_bytes())
            .await
            .map_err(BootstrapError::channel)?;
        self.writer.flush().await.map_err(BootstrapError::channel)
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Bind the socket QEMU will connect to, replacing a stale one.
pub(crate) fn bind(path: &Utf8Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale console socket {path}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Removing {path}")),
    }
    UnixListener::bind(path)
        .map_err(BootstrapError::channel)
        .with_context(|| format!("Binding console socket {path}"))
}

/// Wait for the VM to connect to our socket.
pub(crate) async fn accept(
    listener: &UnixListener,
    deadline: Deadline,
    prompt: &str,
) -> Result<UnixStream, BootstrapError> {
    match tokio::time::timeout_at(deadline.instant(), listener.accept()).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(BootstrapError::channel(e)),
        Err(_) => Err(BootstrapError::BootTimeout {
            prompt: prompt.to_owned(),
            elapsed: deadline.elapsed(),
        }),
    }
}

/// Connect to an existing console socket, retrying until the deadline
/// while it does not exist yet.
pub(crate) async fn connect(
    path: &Utf8PathBuf,
    deadline: Deadline,
    prompt: &str,
) -> Result<UnixStream, BootstrapError> {
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                trace!("Console {path} not ready: {e}");
            }
            Err(e) => return Err(BootstrapError::channel(format!("{path}: {e}"))),
        }
        if deadline.is_expired() {
            return Err(BootstrapError::BootTimeout {
                prompt: prompt.to_owned(),
                elapsed: deadline.elapsed(),
            });
        }
        let next = (Instant::now() + CONNECT_RETRY).min(deadline.instant());
        tokio::time::sleep_until(next).await;
    }
}
