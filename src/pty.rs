use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty is closed")]
    Closed,

    #[error("pty write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// The program a session runs under its PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn build(&self, env: &[(String, String)]) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd
    }
}

/// Master side of a pseudo-terminal with a child attached to the slave.
///
/// The slave handle is dropped right after the spawn so that a read on the
/// master reports EOF (or EIO) once the child and its descendants exit.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    pid: Option<u32>,
}

impl Pty {
    /// Open a PTY pair and spawn `command` on its slave side.
    ///
    /// `env` is applied after `TERM`, so callers can override it.
    pub fn spawn(
        command: &CommandSpec,
        rows: u16,
        cols: u16,
        env: &[(String, String)],
    ) -> Result<(Self, Box<dyn Child + Send + Sync>), PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(rows, cols))
            .map_err(PtyError::OpenPty)?;

        let child = pair
            .slave
            .spawn_command(command.build(env))
            .map_err(PtyError::SpawnCommand)?;
        drop(pair.slave);

        let pid = child.process_id();
        Ok((
            Self {
                master: pair.master,
                pid,
            },
            child,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(rows, cols))
            .map_err(PtyError::Resize)
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// portable_pty calls setsid() for the child, so the child leads its own
/// group and the shell's descendants are signalled too.
pub fn signal_group(pid: u32, signal: i32) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
    #[cfg(not(unix))]
    let _ = signal;
}

#[cfg(unix)]
pub const SIGINT: i32 = libc::SIGINT;
#[cfg(unix)]
pub const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub const SIGINT: i32 = 2;
#[cfg(not(unix))]
pub const SIGKILL: i32 = 9;
