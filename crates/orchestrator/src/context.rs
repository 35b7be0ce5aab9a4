//! Per-run context shared by every component of a relay run.
//!
//! A [`RunContext`] is built once per run and passed explicitly to the
//! source reader, the completion watcher and the run itself. It owns the
//! message relay, the timing settings, the latched exit status and the
//! external shutdown token.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use events::{Message, MessageRelay};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SENTINEL_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_LINGER: Duration = Duration::from_secs(2);
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Timing knobs for a run
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Interval for every polling loop (source appearance, sentinel, idle reads)
    pub poll_interval: Duration,
    /// How long to wait for the tailed file to appear
    pub file_timeout: Duration,
    /// Extra wait for the sentinel after the reader ends on its own
    pub sentinel_grace: Duration,
    /// How long the session stays open after the final status
    pub linger: Duration,
    /// Time between SIGTERM and SIGKILL when tearing down a process
    pub terminate_grace: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            file_timeout: DEFAULT_FILE_TIMEOUT,
            sentinel_grace: DEFAULT_SENTINEL_GRACE,
            linger: DEFAULT_LINGER,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

/// Exit status of the watched process, set at most once per run
#[derive(Debug, Clone, Default)]
pub struct ExitLatch(Arc<OnceLock<i32>>);

impl ExitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the exit status. Returns false if one was already recorded.
    pub fn resolve(&self, code: i32) -> bool {
        self.0.set(code).is_ok()
    }

    pub fn get(&self) -> Option<i32> {
        self.0.get().copied()
    }
}

/// Result of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit status to propagate from the relay process
    pub exit_code: i32,
    /// Output units (lines or chunks) emitted
    pub units_sent: usize,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub relay: MessageRelay,
    pub settings: RunSettings,
    pub exit: ExitLatch,
    pub shutdown: CancellationToken,
}

impl RunContext {
    pub fn new(relay: MessageRelay, settings: RunSettings) -> Self {
        Self {
            relay,
            settings,
            exit: ExitLatch::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token (e.g. cancelled on SIGINT)
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Block until an observer is admitted or the run is shut down
    pub(crate) async fn await_observer(&self) -> Result<()> {
        tokio::select! {
            _ = self.relay.wait_for_observer() => Ok(()),
            _ = self.shutdown.cancelled() => Err(RelayError::Interrupted),
        }
    }

    /// Send the closing status, keep the session open briefly so it is
    /// flushed, then close the session.
    pub(crate) async fn complete(&self, final_status: Message) {
        self.relay.emit(final_status).await;

        if self.relay.is_connected() {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.linger) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        self.relay.close().await;
    }
}
