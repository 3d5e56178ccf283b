use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::broker::{Client, ClientSet};
use crate::metrics::Metrics;
use crate::protocol::{Envelope, OutputPayload, Status};
use crate::pty::{self, CommandSpec, Pty, PtyError};
use crate::transcript::{Direction, TranscriptEntry, TranscriptError, TranscriptWriter};

/// Environment variable carrying the session id into the child.
pub const SESSION_ID_ENV: &str = "CODEX_CONSOLE_SESSION_ID";

/// Lower bound for the SIGINT -> SIGKILL grace period.
pub const MIN_PANIC_KILL_GRACE: Duration = Duration::from_millis(500);

/// How long PTY EOF waits for the child's exit status.
const EXIT_SETTLE: Duration = Duration::from_secs(1);

/// Everything a session needs from the process configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command: CommandSpec,
    pub session_ttl: Duration,
    pub idle_timeout: Duration,
    pub panic_kill_grace: Duration,
    pub transcript_dir: PathBuf,
    pub read_buffer_size: usize,
    pub rows: u16,
    pub cols: u16,
}

/// Body of `POST /sessions`. Both fields are informational and only ever
/// land in the transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientRequested,
    IdleTimeout,
    TtlExpired,
    PanicStop,
    InternalError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientRequested => "client_requested",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::TtlExpired => "ttl_expired",
            CloseReason::PanicStop => "panic_stop",
            CloseReason::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Starting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Notified exactly once when a session finishes its close routine.
pub trait CloseListener: Send + Sync {
    fn on_session_closed(&self, session: &Session, reason: CloseReason);
}

/// Listing view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub clients: usize,
}

/// Optional collaborators wired in by the session manager.
#[derive(Default)]
pub struct SessionHooks {
    pub listener: Option<Weak<dyn CloseListener>>,
    pub slot: Option<OwnedSemaphorePermit>,
}

/// One PTY-backed child, its transcript, and the clients attached to it.
///
/// Always handled through `Arc<Session>`. Background tasks (TTL, idle
/// watcher, PTY reader, exit waiter) hold clones until the session closes.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_activity: AtomicI64,
    state: AtomicU8,
    close_started: AtomicBool,
    done: CancellationToken,
    pid: Option<u32>,
    child_exited: Arc<AtomicBool>,
    pty: Mutex<Option<Pty>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    transcript: Mutex<TranscriptWriter>,
    transcript_path: PathBuf,
    clients: Mutex<ClientSet>,
    touch_tx: mpsc::Sender<()>,
    panic_kill_grace: Duration,
    metrics: Arc<Metrics>,
    listener: Option<Weak<dyn CloseListener>>,
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl Session {
    /// Spawn the child under a PTY, open the transcript, and start the
    /// session's background tasks. Must be called inside a tokio runtime.
    ///
    /// On failure everything created so far is torn down and no task is left
    /// running; the admission slot in `hooks` is dropped with the error.
    pub fn start(
        config: &SessionConfig,
        request: &CreateRequest,
        metrics: Arc<Metrics>,
        hooks: SessionHooks,
    ) -> Result<Arc<Self>, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let expires_at = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut transcript = TranscriptWriter::open(&config.transcript_dir, &id)?;
        let transcript_path = transcript.path().to_path_buf();

        let env = vec![(SESSION_ID_ENV.to_string(), id.clone())];
        let (pty, mut child) = match Pty::spawn(&config.command, config.rows, config.cols, &env) {
            Ok(spawned) => spawned,
            Err(e) => {
                transcript.close();
                return Err(e.into());
            }
        };
        let pid = pty.pid();
        let io = pty.take_reader().and_then(|r| pty.take_writer().map(|w| (r, w)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                if let Some(pid) = pid {
                    pty::signal_group(pid, pty::SIGKILL);
                }
                let _ = child.wait();
                transcript.close();
                return Err(e.into());
            }
        };

        let (touch_tx, touch_rx) = mpsc::channel::<()>(1);
        let session = Arc::new(Session {
            id,
            created_at,
            expires_at,
            last_activity: AtomicI64::new(now_nanos()),
            state: AtomicU8::new(SessionState::Starting as u8),
            close_started: AtomicBool::new(false),
            done: CancellationToken::new(),
            pid,
            child_exited: Arc::new(AtomicBool::new(false)),
            pty: Mutex::new(Some(pty)),
            writer: Mutex::new(Some(writer)),
            transcript: Mutex::new(transcript),
            transcript_path,
            clients: Mutex::new(ClientSet::default()),
            touch_tx,
            panic_kill_grace: config.panic_kill_grace.max(MIN_PANIC_KILL_GRACE),
            metrics,
            listener: hooks.listener,
            slot: Mutex::new(hooks.slot),
        });

        let started = session.record(|at| TranscriptEntry::status(at, "started:"));
        session.broadcast(&Envelope::status(Status::Started, None, started));
        if let Some(operator) = &request.operator {
            session.record(|at| TranscriptEntry::status(at, format!("operator:{operator}")));
        }
        if let Some(metadata) = &request.metadata {
            session.record(|at| TranscriptEntry::status(at, format!("metadata:{metadata}")));
        }

        session.metrics.session_opened();
        session.state.store(SessionState::Active as u8, Ordering::Release);
        tracing::info!(session = %session.id, pid = ?session.pid, "session started");

        session.spawn_ttl_timer(config.session_ttl);
        session.spawn_idle_watcher(config.idle_timeout, touch_rx);
        session.spawn_output_streamer(reader, config.read_buffer_size.max(1));
        session.spawn_exit_waiter(child);

        Ok(session)
    }

    fn spawn_ttl_timer(self: &Arc<Self>, ttl: Duration) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    session.close(CloseReason::TtlExpired);
                }
                _ = session.done.cancelled() => {}
            }
        });
    }

    fn spawn_idle_watcher(self: &Arc<Self>, idle: Duration, mut touch_rx: mpsc::Receiver<()>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let timer = tokio::time::sleep(idle);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => {
                        session.close(CloseReason::IdleTimeout);
                        break;
                    }
                    Some(()) = touch_rx.recv() => {
                        timer.as_mut().reset(tokio::time::Instant::now() + idle);
                    }
                    _ = session.done.cancelled() => break,
                }
            }
        });
    }

    fn spawn_output_streamer(self: &Arc<Self>, reader: Box<dyn Read + Send>, buf_size: usize) {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = vec![0u8; buf_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => session.handle_output(&buf[..n]),
                    // EIO on the master once the child side is gone
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(session = %session.id, ?e, "pty read ended");
                        break;
                    }
                }
            }
            // Give the exit waiter a chance to report a failing exit status
            // before the session closes underneath it.
            let deadline = std::time::Instant::now() + EXIT_SETTLE;
            while !session.child_exited() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            session.close(CloseReason::ClientRequested);
        });
    }

    fn spawn_exit_waiter(self: &Arc<Self>, mut child: Box<dyn portable_pty::Child + Send + Sync>) {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let failure = match child.wait() {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!("exit code {}", status.exit_code())),
                Err(e) => Some(e.to_string()),
            };
            if let Some(detail) = failure {
                if !session.is_closed() {
                    tracing::info!(session = %session.id, %detail, "child exited with error");
                    let now = session.record(|at| {
                        TranscriptEntry::status(at, format!("command_exit_error:{detail}"))
                    });
                    session.broadcast(&Envelope::status(Status::CommandExitError, Some(&detail), now));
                }
            }
            session.child_exited.store(true, Ordering::Release);
            session.close(CloseReason::ClientRequested);
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.last_activity.load(Ordering::Acquire))
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once the close routine has started.
    pub fn is_closed(&self) -> bool {
        self.close_started.load(Ordering::Acquire)
    }

    pub fn child_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    pub fn transcript_path(&self) -> &std::path::Path {
        &self.transcript_path
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_activity: self.last_activity(),
            state: self.state(),
            clients: self.client_count(),
        }
    }

    /// Attach a client. Refused (returns `false`) once the session is
    /// closing, so nothing can join after the final status was sent.
    pub fn add_client(&self, client: Arc<Client>) -> bool {
        let mut clients = self.clients.lock();
        if self.is_closed() {
            return false;
        }
        tracing::debug!(session = %self.id, client = client.id(), "client attached");
        clients.insert(client);
        true
    }

    pub fn remove_client(&self, id: u64) {
        if self.clients.lock().remove(id).is_some() {
            tracing::debug!(session = %self.id, client = id, "client detached");
        }
    }

    /// Fan `env` out to every attached client. No-op once closed.
    pub fn broadcast(&self, env: &Envelope) {
        if self.is_closed() {
            return;
        }
        self.clients.lock().broadcast(env);
    }

    /// Record activity and nudge the idle watcher. Touches that land while a
    /// nudge is already pending are coalesced.
    pub fn touch(&self) {
        self.last_activity.store(now_nanos(), Ordering::Release);
        let _ = self.touch_tx.try_send(());
    }

    /// Write client bytes to the PTY. Blocks while the PTY buffer is full,
    /// so async callers should go through `spawn_blocking`.
    pub fn handle_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self.writer.lock();
        let writer = match guard.as_mut() {
            Some(w) if !self.is_closed() => w,
            _ => return Err(PtyError::Closed.into()),
        };
        let written = writer.write_all(data).and_then(|()| writer.flush());
        // close() skips the writer while a write is in flight; the writer
        // goes away here instead.
        if self.is_closed() {
            guard.take();
            return Err(PtyError::Closed.into());
        }
        drop(guard);
        written.map_err(PtyError::from)?;

        self.touch();
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.record(|at| TranscriptEntry::bytes(Direction::Stdin, at, encoded));
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let pty = self.pty.lock();
        let pty = pty.as_ref().ok_or(PtyError::Closed)?;
        pty.resize(rows, cols)?;
        Ok(())
    }

    fn handle_output(&self, data: &[u8]) {
        if data.is_empty() || self.is_closed() {
            return;
        }
        self.touch();
        {
            // Stamped and broadcast under the transcript lock, so transcript
            // lines stay in timestamp order and every client queue sees PTY
            // read order.
            let mut transcript = self.transcript.lock();
            if self.is_closed() {
                return;
            }
            let payload = OutputPayload::stdout(data, Utc::now());
            transcript.append(&TranscriptEntry {
                timestamp: payload.timestamp.clone(),
                direction: Direction::Stdout,
                encoding: Some(payload.encoding.clone()),
                data: Some(payload.data.clone()),
                message: None,
            });
            self.broadcast(&Envelope::output(payload));
        }
    }

    /// Append an entry stamped while the transcript lock is held. Returns
    /// the stamp. Nothing is written once the session is closed.
    fn record(&self, entry: impl FnOnce(DateTime<Utc>) -> TranscriptEntry) -> DateTime<Utc> {
        let mut transcript = self.transcript.lock();
        let at = Utc::now();
        if !self.is_closed() {
            transcript.append(&entry(at));
        }
        at
    }

    /// Shut the session down. Only the first call does anything; it returns
    /// `true`, every later or concurrent call returns `false`.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(SessionState::Closing as u8, Ordering::Release);
        self.done.cancel();
        tracing::info!(session = %self.id, %reason, "closing session");

        // Signal first: a blocked handle_input holds the writer lock until
        // the child stops or dies.
        self.terminate_child();
        if let Some(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let final_status = {
            let mut transcript = self.transcript.lock();
            let now = Utc::now();
            transcript.append(&TranscriptEntry::status(now, format!("closed:{reason}")));
            Envelope::status(Status::Closed, Some(reason.as_str()), now)
        };
        {
            let mut clients = self.clients.lock();
            clients.broadcast(&final_status);
            clients.close_all();
        }
        self.transcript.lock().close();
        self.pty.lock().take();

        self.metrics.session_closed(reason);
        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            listener.on_session_closed(self, reason);
        }
        self.slot.lock().take();
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        true
    }

    /// SIGINT now, SIGKILL after the grace period if the child is still
    /// around.
    fn terminate_child(&self) {
        let Some(pid) = self.pid else { return };
        if self.child_exited() {
            return;
        }
        pty::signal_group(pid, pty::SIGINT);

        let exited = Arc::clone(&self.child_exited);
        let grace = self.panic_kill_grace;
        let id = self.id.clone();
        let escalate = move || {
            if !exited.load(Ordering::Acquire) {
                tracing::warn!(session = %id, pid, "child ignored SIGINT, sending SIGKILL");
                pty::signal_group(pid, pty::SIGKILL);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    escalate();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(grace);
                    escalate();
                });
            }
        }
    }
}
