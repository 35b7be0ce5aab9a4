//! Echo of an auxiliary log file to stderr while a PTY run is active.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::source::{FileTailSource, Framing, OutputSource, ReadOutcome, StartPosition};

/// Follows a log file from its end, writing `[<file name>] <line>` per line
#[derive(Debug, Clone)]
pub struct SideLogEcho {
    path: PathBuf,
    poll_interval: Duration,
}

impl SideLogEcho {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    fn prefix(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        format!("[{}]", name)
    }

    /// Echo to stderr on a background task until `stop` fires
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stderr = tokio::io::stderr();
            if let Err(e) = self.run(&mut stderr, &stop).await {
                tracing::error!(path = %self.path.display(), error = %e, "Error tailing side log");
            }
        })
    }

    /// Echo into `out` until `stop` fires. Returns the number of lines written.
    pub async fn run<W>(&self, out: &mut W, stop: &CancellationToken) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        while !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.cancelled() => return Ok(0),
            }
        }

        tracing::debug!(path = %self.path.display(), "Tailing side log");
        let mut source = FileTailSource::open_at(&self.path, Framing::Lines, StartPosition::End)
            .await?
            .without_observer();
        let prefix = self.prefix();
        let mut written = 0usize;

        loop {
            match source.read_chunk().await? {
                ReadOutcome::Data(line) => {
                    out.write_all(format!("{} {}\n", prefix, line).as_bytes())
                        .await?;
                    out.flush().await?;
                    written += 1;
                }
                ReadOutcome::Finished => break,
                ReadOutcome::Idle => {
                    if stop.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = stop.cancelled() => {}
                    }
                }
            }
        }

        Ok(written)
    }
}
