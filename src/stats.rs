//! Transfer statistics and the reporting seam.
//!
//! Sessions run inside the pool, so their final numbers are handed to a
//! [`Reporter`] instead of being returned to whoever accepted them. Clients
//! return their [`TransferStats`] directly.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::SessionError;

const MIB: f64 = 1024.0 * 1024.0;

/// Bytes moved over one connection and how long it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Throughput in bytes per second, or `None` for a zero-length interval.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let secs = self.elapsed_secs();
        (secs > 0.0).then(|| self.bytes as f64 / secs)
    }

    /// Throughput in MiB per second (0 for a zero-length interval).
    pub fn mib_per_sec(&self) -> f64 {
        self.bytes_per_sec().map_or(0.0, |b| b / MIB)
    }
}

/// Running byte counter with a wall clock started on creation.
#[derive(Debug)]
pub(crate) struct Meter {
    bytes: u64,
    started: Instant,
}

impl Meter {
    pub(crate) fn start() -> Self {
        Self {
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn add(&mut self, n: usize) {
        self.bytes += n as u64;
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn finish(&self) -> TransferStats {
        TransferStats::new(self.bytes, self.started.elapsed())
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The peer closed the stream.
    Completed,
    /// The server cancelled the session during shutdown.
    Cancelled,
    /// Malformed header or stream failure.
    Failed(SessionError),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }
}

/// Final record of one server-side session.
#[derive(Debug)]
pub struct SessionReport {
    pub peer: SocketAddr,
    /// Payload length announced by the header, if one was read.
    pub declared: Option<u32>,
    pub stats: TransferStats,
    pub outcome: SessionOutcome,
}

/// Consumer of finished-session reports.
///
/// Called exactly once per session, from the session's own task.
pub trait Reporter: Send + Sync + 'static {
    fn session_finished(&self, report: SessionReport);
}

/// Reporter that writes each session as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn session_finished(&self, report: SessionReport) {
        let stats = &report.stats;
        match &report.outcome {
            SessionOutcome::Failed(e) => warn!(
                peer = %report.peer,
                bytes = stats.bytes,
                seconds = stats.elapsed_secs(),
                error = %e,
                "Session failed"
            ),
            outcome => info!(
                peer = %report.peer,
                declared = ?report.declared,
                bytes = stats.bytes,
                seconds = stats.elapsed_secs(),
                mib_per_sec = stats.mib_per_sec(),
                cancelled = matches!(outcome, SessionOutcome::Cancelled),
                "Session finished"
            ),
        }
    }
}

/// Reporter that forwards every report over a channel.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<SessionReport>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn session_finished(&self, report: SessionReport) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(report);
    }
}
