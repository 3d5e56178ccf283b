use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::pty::CommandSpec;
use crate::session::{SessionConfig, MIN_PANIC_KILL_GRACE};

pub const MIN_READ_BUFFER: usize = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("panic kill grace must be at least {}ms, got {}ms", MIN_PANIC_KILL_GRACE.as_millis(), .0.as_millis())]
    GraceTooShort(Duration),
    #[error("read buffer must be at least {MIN_READ_BUFFER} bytes, got {0}")]
    ReadBufferTooSmall(usize),
}

/// Process configuration. Every option can come from a flag or from the
/// matching `CODEX_CONSOLE_*` environment variable.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "CODEX_CONSOLE_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Executable to run under each session's PTY
    #[arg(long, env = "CODEX_CONSOLE_COMMAND", default_value = "codex")]
    pub command: String,

    /// Arguments passed to the executable
    #[arg(long = "arg", env = "CODEX_CONSOLE_ARGS", value_delimiter = ' ', allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Hard lifetime of a session (e.g. 90s, 30m, 1h)
    #[arg(long, env = "CODEX_CONSOLE_SESSION_TTL", default_value = "1h", value_parser = parse_duration)]
    pub session_ttl: Duration,

    /// Close a session after this long without PTY I/O or heartbeats
    #[arg(long, env = "CODEX_CONSOLE_IDLE_TIMEOUT", default_value = "15m", value_parser = parse_duration)]
    pub idle_timeout: Duration,

    /// Directory holding session-<id>.ndjson transcripts
    #[arg(long, env = "CODEX_CONSOLE_TRANSCRIPT_DIR", default_value = "./transcripts")]
    pub transcript_dir: PathBuf,

    /// Reject requests that lack X-Forwarded-For / X-Forwarded-Proto
    #[arg(long, env = "CODEX_CONSOLE_REQUIRE_PROXY", default_value_t = false)]
    pub require_proxy: bool,

    /// Maximum number of live sessions
    #[arg(long, env = "CODEX_CONSOLE_MAX_CONCURRENT", default_value_t = 4)]
    pub max_concurrent: usize,

    /// Delay between SIGINT and SIGKILL when a session closes
    #[arg(long, env = "CODEX_CONSOLE_PANIC_KILL_GRACE", default_value = "2s", value_parser = parse_duration)]
    pub panic_kill_grace: Duration,

    /// PTY read buffer size in bytes
    #[arg(long, env = "CODEX_CONSOLE_READ_BUFFER", default_value_t = 4096)]
    pub read_buffer_size: usize,

    /// Initial terminal width
    #[arg(long, env = "CODEX_CONSOLE_COLS", default_value_t = 120)]
    pub cols: u16,

    /// Initial terminal height
    #[arg(long, env = "CODEX_CONSOLE_ROWS", default_value_t = 40)]
    pub rows: u16,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Empty("command"));
        }
        if self.transcript_dir.as_os_str().is_empty() {
            return Err(ConfigError::Empty("transcript dir"));
        }
        if self.session_ttl.is_zero() {
            return Err(ConfigError::Zero("session ttl"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Zero("idle timeout"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Zero("max concurrent"));
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(ConfigError::Zero("terminal size"));
        }
        if self.panic_kill_grace < MIN_PANIC_KILL_GRACE {
            return Err(ConfigError::GraceTooShort(self.panic_kill_grace));
        }
        if self.read_buffer_size < MIN_READ_BUFFER {
            return Err(ConfigError::ReadBufferTooSmall(self.read_buffer_size));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command: CommandSpec::new(self.command.clone())
                .with_args(self.args.iter().filter(|a| !a.is_empty()).cloned()),
            session_ttl: self.session_ttl,
            idle_timeout: self.idle_timeout,
            panic_kill_grace: self.panic_kill_grace,
            transcript_dir: self.transcript_dir.clone(),
            read_buffer_size: self.read_buffer_size,
            rows: self.rows,
            cols: self.cols,
        }
    }
}

/// Parse `250ms`, `30s`, `15m`, `2h`; a bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };
    Ok(duration)
}
