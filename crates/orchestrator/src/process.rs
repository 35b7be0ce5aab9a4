//! Child process attached to a pseudo-terminal.

use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::pty::openpty;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result, EXIT_FAILURE};

/// A spawned child together with the master side of its terminal.
///
/// The child runs in its own process group so teardown reaches anything it
/// forks. [`ProcessHandle::release`] closes the master and reaps the child;
/// dropping the handle without releasing kills the child.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    command: String,
    master: Option<OwnedFd>,
    status: Option<i32>,
    released: bool,
}

impl ProcessHandle {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let pty = openpty(None, None)?;
        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let mut std_command = std::process::Command::new(program);
        std_command
            .args(args)
            .stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave))
            .process_group(0);
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RelayError::spawn(program, e))?;
        // Drops our copies of the slave so the master sees EOF when the child exits.
        drop(command);

        let pid = child.id().unwrap_or_default();
        tracing::info!(pid, command = %command_line, "Process started");

        Ok(Self {
            child,
            pid,
            command: command_line,
            master: Some(pty.master),
            status: None,
            released: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command
    }

    /// A second descriptor for the master, for the output reader
    pub fn reader_fd(&self) -> Result<OwnedFd> {
        match &self.master {
            Some(master) => Ok(master.try_clone()?),
            None => Err(RelayError::TaskFailed("terminal already released".to_string())),
        }
    }

    /// Wait for the child to exit and return its exit status
    pub async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.status {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        let code = exit_code(status);
        self.status = Some(code);
        tracing::info!(pid = self.pid, exit_code = code, "Process exited");
        Ok(code)
    }

    /// Close the master and make sure the child is gone.
    ///
    /// A child still running gets SIGTERM on its process group, then SIGKILL
    /// after `grace`. Safe to call more than once.
    pub async fn release(&mut self, grace: Duration) {
        if self.released {
            return;
        }
        self.released = true;
        self.master.take();

        if self.status.is_some() || matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }

        let group = Pid::from_raw(self.pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            tracing::debug!(pid = self.pid, error = %e, "Failed to signal process group");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = self.pid, exit_code = exit_code(status), "Process terminated");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to reap process");
            }
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_secs = grace.as_secs_f64(),
                    "Process did not exit in time, killing"
                );
                let _ = killpg(group, Signal::SIGKILL);
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(pid = self.pid, error = %e, "Failed to kill process");
                }
            }
        }
    }
}

/// Wait for `handle` to exit while `output` drains its terminal.
///
/// `exited` is cancelled once the child is gone so the reader can finish its
/// last drain. A failing output task ends the wait at once with its error;
/// the caller still owns the release. On `shutdown` the child is released
/// with `grace` and the result is [`RelayError::Interrupted`]. Returns the
/// exit code and the number of chunks the output task handled.
pub(crate) async fn wait_with_output(
    handle: &mut ProcessHandle,
    mut output: JoinHandle<Result<usize>>,
    exited: &CancellationToken,
    shutdown: &CancellationToken,
    grace: Duration,
) -> Result<(i32, usize)> {
    let mut drained = None;
    let waited = loop {
        tokio::select! {
            status = handle.wait() => break Some(status),
            _ = shutdown.cancelled() => break None,
            joined = &mut output, if drained.is_none() => match flatten(joined) {
                Ok(chunks) => drained = Some(chunks),
                Err(e) => {
                    tracing::error!(pid = handle.pid(), error = %e, "Output reader failed");
                    return Err(e);
                }
            },
        }
    };

    if waited.is_none() {
        tracing::info!(pid = handle.pid(), "Interrupted, terminating command");
        handle.release(grace).await;
    }
    exited.cancel();

    let chunks = match drained {
        Some(chunks) => chunks,
        None => flatten(output.await)?,
    };
    match waited {
        Some(status) => Ok((status?, chunks)),
        None => Err(RelayError::Interrupted),
    }
}

fn flatten(joined: std::result::Result<Result<usize>, tokio::task::JoinError>) -> Result<usize> {
    joined.map_err(|e| RelayError::TaskFailed(e.to_string()))?
}

/// Shell-style exit status: the exit code, or 128 + signal number
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND};
    use crate::source::{pump, OutputSource, ReadOutcome};
    use async_trait::async_trait;
    use events::testing::MemorySink;
    use events::MessageRelay;
    use std::os::unix::fs::PermissionsExt;

    /// Emits one chunk, then fails like a broken descriptor
    struct BrokenSource {
        emitted: bool,
    }

    #[async_trait]
    impl OutputSource for BrokenSource {
        async fn read_chunk(&mut self) -> Result<ReadOutcome<String>> {
            if self.emitted {
                return Err(RelayError::Io(std::io::Error::other("bad descriptor")));
            }
            self.emitted = true;
            Ok(ReadOutcome::Data("before failure".to_string()))
        }

        fn flush(&mut self) -> Option<String> {
            None
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_wait_returns_exit_code() {
        let mut handle = ProcessHandle::spawn("sh", &args(&["-c", "exit 3"])).unwrap();
        assert!(handle.pid() > 0);
        assert_eq!(handle.command_line(), "sh -c exit 3");
        assert_eq!(handle.wait().await.unwrap(), 3);
        handle.release(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_signal_exit_maps_to_128_plus_signal() {
        let mut handle = ProcessHandle::spawn("sh", &args(&["-c", "kill -9 $$"])).unwrap();
        assert_eq!(handle.wait().await.unwrap(), 137);
    }

    #[tokio::test]
    async fn test_missing_command_maps_to_127() {
        let err = ProcessHandle::spawn("definitely-not-a-real-command-4821", &[])
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), EXIT_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_non_executable_maps_to_126() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = ProcessHandle::spawn(script.to_str().unwrap(), &[])
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), EXIT_NOT_EXECUTABLE);
    }

    #[tokio::test]
    async fn test_release_terminates_running_child() {
        let mut handle = ProcessHandle::spawn("sleep", &args(&["30"])).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.release(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(handle.reader_fd().is_err());
        // Second release is a no-op.
        handle.release(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_output_failure_ends_wait_while_child_runs() {
        let sink = MemorySink::connected();
        let relay = MessageRelay::new(sink.clone());
        let mut handle = ProcessHandle::spawn("sleep", &args(&["30"])).unwrap();

        let exited = CancellationToken::new();
        let output = {
            let stop = exited.clone();
            tokio::spawn(async move {
                let mut source = BrokenSource { emitted: false };
                pump(&mut source, &relay, &stop, Duration::from_millis(5)).await
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_with_output(
                &mut handle,
                output,
                &exited,
                &CancellationToken::new(),
                Duration::from_secs(1),
            ),
        )
        .await
        .expect("output failure should not wait for the child");

        assert!(matches!(result, Err(RelayError::Io(_))));
        assert_eq!(sink.outputs(), vec!["before failure"]);
        handle.release(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_child_and_interrupts() {
        let mut handle = ProcessHandle::spawn("sleep", &args(&["30"])).unwrap();
        let exited = CancellationToken::new();
        let output = {
            let exited = exited.clone();
            tokio::spawn(async move {
                exited.cancelled().await;
                Ok::<usize, RelayError>(0)
            })
        };
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_with_output(&mut handle, output, &exited, &shutdown, Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(RelayError::Interrupted)));
        assert!(exited.is_cancelled());
        assert!(handle.reader_fd().is_err());
    }
}
