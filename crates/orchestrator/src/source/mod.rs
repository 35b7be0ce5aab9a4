//! Source readers: "read the next chunk of process output".
//!
//! Two strategies share the [`OutputSource`] contract:
//!
//! - [`FileTailSource`] follows a file from offset 0, tolerating truncation
//!   and partial writes, and frames output as lines or raw blocks.
//! - [`PtySource`] drains a pseudo-terminal master, emitting byte blocks so
//!   terminal control sequences survive unbroken.
//!
//! [`pump`] drives either one and forwards every chunk through the relay.

mod file_tail;
mod pty;

pub use file_tail::{Cursor, FileTailSource, Framing, StartPosition};
pub use pty::{PtyReader, PtySource};

use std::time::Duration;

use async_trait::async_trait;
use events::MessageRelay;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Result of one read attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// A unit of output
    Data(T),
    /// Nothing available right now
    Idle,
    /// The source is exhausted and will never produce more
    Finished,
}

#[async_trait]
pub trait OutputSource: Send {
    /// Attempt to read the next unit of output
    async fn read_chunk(&mut self) -> Result<ReadOutcome<String>>;

    /// Wait before the next attempt after an idle read
    async fn idle(&mut self, interval: Duration) {
        tokio::time::sleep(interval).await
    }

    /// Output held back waiting for a delimiter or the rest of a character
    fn flush(&mut self) -> Option<String>;

    /// Whether reading should stop once nobody is watching
    fn requires_observer(&self) -> bool {
        false
    }
}

/// Forward every chunk of `source` through `relay` until it ends.
///
/// The loop ends when the source finishes, when the source requires an
/// observer and none is admitted, or when `stop` fires. After `stop` the
/// source is drained up to the first idle read so output written just
/// before the stop signal is not lost. Returns the number of units emitted.
pub async fn pump<S>(
    source: &mut S,
    relay: &MessageRelay,
    stop: &CancellationToken,
    interval: Duration,
) -> Result<usize>
where
    S: OutputSource + ?Sized,
{
    let mut sent = 0usize;
    let mut draining = false;

    loop {
        match source.read_chunk().await? {
            ReadOutcome::Data(text) => {
                relay.output(text).await;
                sent += 1;
            }
            ReadOutcome::Finished => break,
            ReadOutcome::Idle => {
                if draining || stop.is_cancelled() {
                    break;
                }
                if source.requires_observer() && !relay.is_connected() {
                    tracing::info!(units_sent = sent, "Client disconnected, stopping output streaming");
                    break;
                }
                tokio::select! {
                    _ = source.idle(interval) => {}
                    _ = stop.cancelled() => draining = true,
                }
            }
        }
    }

    if let Some(rest) = source.flush() {
        relay.output(rest).await;
        sent += 1;
    }

    Ok(sent)
}
