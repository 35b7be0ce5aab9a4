//! Sentinel-file completion detection for file-tail runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Exit code assumed when the sentinel exists but cannot be read or parsed
pub const DEFAULT_EXIT_CODE: i32 = 0;

/// Polls for a sentinel file holding the producer's exit code
#[derive(Debug, Clone)]
pub struct CompletionWatcher {
    path: PathBuf,
    poll_interval: Duration,
}

impl CompletionWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the sentinel and return the exit code it carries.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn watch(&self, cancel: &CancellationToken) -> Option<i32> {
        loop {
            if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return None,
            }
        }

        // Give the writer a beat to finish.
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = cancel.cancelled() => return None,
        }

        let code = self.read_exit_code().await;
        tracing::info!(path = %self.path.display(), exit_code = code, "Exit code file detected");
        Some(code)
    }

    async fn read_exit_code(&self) -> i32 {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_exit_code(&contents).unwrap_or_else(|| {
                tracing::warn!(
                    path = %self.path.display(),
                    contents = %contents.trim(),
                    "Could not parse exit code, assuming {}",
                    DEFAULT_EXIT_CODE
                );
                DEFAULT_EXIT_CODE
            }),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not read exit code file, assuming {}",
                    DEFAULT_EXIT_CODE
                );
                DEFAULT_EXIT_CODE
            }
        }
    }
}

pub fn parse_exit_code(contents: &str) -> Option<i32> {
    contents.trim().parse().ok()
}

/// Poll until `path` exists or `timeout` elapses. Returns whether it appeared.
pub async fn wait_for_path(path: &Path, timeout: Duration, poll_interval: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAST: Duration = Duration::from_millis(5);

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code("7"), Some(7));
        assert_eq!(parse_exit_code(" 1\n"), Some(1));
        assert_eq!(parse_exit_code("-2"), Some(-2));
        assert_eq!(parse_exit_code("not-a-number"), None);
        assert_eq!(parse_exit_code(""), None);
    }

    #[tokio::test]
    async fn test_watch_reads_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exit_code");
        let watcher = CompletionWatcher::new(&path, FAST);

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tokio::fs::write(&path, "7\n").await.unwrap();
            })
        };

        let code = watcher.watch(&CancellationToken::new()).await;
        writer.await.unwrap();
        assert_eq!(code, Some(7));
    }

    #[tokio::test]
    async fn test_unparseable_sentinel_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exit_code");
        std::fs::write(&path, "not-a-number").unwrap();

        let watcher = CompletionWatcher::new(&path, FAST);
        assert_eq!(watcher.watch(&CancellationToken::new()).await, Some(0));
    }

    #[tokio::test]
    async fn test_cancel_stops_watching() {
        let dir = TempDir::new().unwrap();
        let watcher = CompletionWatcher::new(dir.path().join("never"), FAST);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.watch(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_for_path_times_out() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nextflow.out");
        assert!(!wait_for_path(&missing, Duration::from_millis(30), FAST).await);

        std::fs::write(&missing, "").unwrap();
        assert!(wait_for_path(&missing, Duration::from_millis(30), FAST).await);
    }
}
