use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::session::CloseReason;

/// Process-wide session counters.
///
/// The server shares one instance behind an `Arc`; tests build their own.
#[derive(Debug, Default)]
pub struct Metrics {
    active_sessions: AtomicI64,
    total_sessions: AtomicU64,
    panic_stops: AtomicU64,
    idle_timeouts: AtomicU64,
    ttl_expirations: AtomicU64,
    failed_upgrades: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub active_sessions: i64,
    pub total_sessions: u64,
    pub panic_stops: u64,
    pub idle_timeouts: u64,
    pub ttl_expirations: u64,
    pub failed_upgrades: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
        self.total_sessions.fetch_add(1, Ordering::AcqRel);
    }

    /// Account for one session close. `client_requested` and
    /// `internal_error` only move the gauge.
    pub fn session_closed(&self, reason: CloseReason) {
        self.active_sessions.fetch_sub(1, Ordering::AcqRel);
        let counter = match reason {
            CloseReason::PanicStop => &self.panic_stops,
            CloseReason::IdleTimeout => &self.idle_timeouts,
            CloseReason::TtlExpired => &self.ttl_expirations,
            CloseReason::ClientRequested | CloseReason::InternalError => return,
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn upgrade_failed(&self) {
        self.failed_upgrades.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Acquire),
            total_sessions: self.total_sessions.load(Ordering::Acquire),
            panic_stops: self.panic_stops.load(Ordering::Acquire),
            idle_timeouts: self.idle_timeouts.load(Ordering::Acquire),
            ttl_expirations: self.ttl_expirations.load(Ordering::Acquire),
            failed_upgrades: self.failed_upgrades.load(Ordering::Acquire),
        }
    }

    /// Prometheus text exposition format, version 0.0.4.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let rows: [(&str, &str, &str, String); 6] = [
            (
                "codex_console_active_sessions",
                "gauge",
                "Number of live console sessions.",
                s.active_sessions.to_string(),
            ),
            (
                "codex_console_total_sessions",
                "counter",
                "Sessions created since process start.",
                s.total_sessions.to_string(),
            ),
            (
                "codex_console_panic_stops",
                "counter",
                "Sessions terminated by an operator panic stop.",
                s.panic_stops.to_string(),
            ),
            (
                "codex_console_idle_timeouts",
                "counter",
                "Sessions closed after the idle timeout.",
                s.idle_timeouts.to_string(),
            ),
            (
                "codex_console_ttl_expirations",
                "counter",
                "Sessions closed when their TTL elapsed.",
                s.ttl_expirations.to_string(),
            ),
            (
                "codex_console_failed_upgrades",
                "counter",
                "WebSocket upgrades that failed.",
                s.failed_upgrades.to_string(),
            ),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in rows {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}
