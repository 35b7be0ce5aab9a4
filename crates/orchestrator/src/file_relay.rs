//! Relay run that tails a producer's output file.

use std::path::PathBuf;

use events::{Message, RunStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::completion::{wait_for_path, CompletionWatcher};
use crate::context::{RunContext, RunOutcome};
use crate::error::{RelayError, Result};
use crate::source::{pump, FileTailSource, Framing};
use crate::state_machine::{RunState, RunStateMachine};

#[derive(Debug, Clone)]
pub struct FileRelayOptions {
    /// Output file written by the producer
    pub log_file: PathBuf,
    /// Sentinel holding the producer's exit code
    pub exit_code_file: Option<PathBuf>,
    pub framing: Framing,
}

pub struct FileRelay {
    options: FileRelayOptions,
    ctx: RunContext,
    machine: RunStateMachine,
}

impl FileRelay {
    pub fn new(options: FileRelayOptions, ctx: RunContext) -> Self {
        Self {
            options,
            ctx,
            machine: RunStateMachine::new(RunState::AwaitingSource),
        }
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    /// Run to completion and return the exit status to propagate
    pub async fn run(mut self) -> RunOutcome {
        let outcome = match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "File relay failed");
                RunOutcome {
                    exit_code: e.exit_code(),
                    units_sent: 0,
                }
            }
        };
        self.machine.advance(RunState::Completed);
        outcome
    }

    async fn execute(&mut self) -> Result<RunOutcome> {
        let source_ready = self.await_source().await?;

        self.machine.advance(RunState::AwaitingClient);
        tracing::info!("Waiting for client connection");
        self.ctx.await_observer().await?;
        self.ctx.relay.status(RunStatus::Connected).await;

        // The file may have shown up after the timeout while no client was here.
        let source_ready =
            source_ready || tokio::fs::try_exists(&self.options.log_file).await.unwrap_or(false);
        let streamed = if source_ready {
            self.stream().await
        } else {
            Err(RelayError::SourceTimeout {
                path: self.options.log_file.clone(),
                secs: self.ctx.settings.file_timeout.as_secs(),
            })
        };

        match streamed {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(error = %e, "Streaming failed");
                self.ctx.relay.error(e.to_string(), e.code()).await;
                let exit_code = e.exit_code();
                self.ctx
                    .complete(
                        Message::status(RunStatus::Error)
                            .with("exit_code", exit_code)
                            .with("error", e.to_string()),
                    )
                    .await;
                Ok(RunOutcome {
                    exit_code,
                    units_sent: 0,
                })
            }
        }
    }

    /// Wait for the log file. Returns false on timeout.
    async fn await_source(&self) -> Result<bool> {
        let path = &self.options.log_file;
        let settings = &self.ctx.settings;

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(true);
        }

        tracing::info!(path = %path.display(), "Waiting for log file");
        self.ctx
            .relay
            .emit(Message::status(RunStatus::Waiting).with("file", path.display().to_string()))
            .await;

        tokio::select! {
            found = wait_for_path(path, settings.file_timeout, settings.poll_interval) => {
                if !found {
                    tracing::error!(
                        path = %path.display(),
                        timeout_secs = settings.file_timeout.as_secs(),
                        "Timeout waiting for log file"
                    );
                }
                Ok(found)
            }
            _ = self.ctx.shutdown.cancelled() => Err(RelayError::Interrupted),
        }
    }

    async fn stream(&mut self) -> Result<RunOutcome> {
        let ctx = self.ctx.clone();
        let path = &self.options.log_file;
        let mut source = FileTailSource::open(path, self.options.framing).await?;

        self.machine.advance(RunState::Streaming);
        tracing::info!(path = %path.display(), "Started streaming");
        ctx.relay
            .emit(Message::status(RunStatus::Started).with("file", path.display().to_string()))
            .await;

        let stop = ctx.shutdown.child_token();
        let watch_cancel = CancellationToken::new();
        let watcher = self.spawn_watcher(&stop, &watch_cancel);

        let pumped = pump(&mut source, &ctx.relay, &stop, ctx.settings.poll_interval).await;

        if let Some(task) = watcher {
            self.finish_watcher(task, &watch_cancel).await;
        }

        let lines_sent = pumped?;
        if ctx.shutdown.is_cancelled() {
            return Err(RelayError::Interrupted);
        }

        let exit_code = ctx.exit.get().unwrap_or_default();
        tracing::info!(lines_sent, exit_code, "Streaming completed");
        ctx.complete(
            Message::status(RunStatus::Completed)
                .with("exit_code", exit_code)
                .with("lines_sent", lines_sent),
        )
        .await;

        Ok(RunOutcome {
            exit_code,
            units_sent: lines_sent,
        })
    }

    /// Stop the watcher once the reader is done.
    ///
    /// A reader stopped because the client left does not end the run: the
    /// producer may still be going, so its exit code is awaited until it
    /// appears or shutdown fires. Any other early reader exit only gets a
    /// short grace period.
    async fn finish_watcher(&self, mut task: JoinHandle<()>, cancel: &CancellationToken) {
        let ctx = &self.ctx;
        if ctx.exit.get().is_none() && !ctx.shutdown.is_cancelled() {
            if !ctx.relay.is_connected() {
                tracing::info!("Client gone, waiting for the producer's exit code");
                tokio::select! {
                    joined = &mut task => return log_join(joined),
                    _ = ctx.shutdown.cancelled() => {}
                }
            } else {
                tracing::debug!("Reader ended before the exit code, waiting briefly");
                match tokio::time::timeout(ctx.settings.sentinel_grace, &mut task).await {
                    Ok(joined) => return log_join(joined),
                    Err(_) => tracing::debug!("No exit code within grace period"),
                }
            }
        }
        cancel.cancel();
        log_join(task.await);
    }

    /// Start the sentinel watcher, which stops the reader once the exit code is known
    fn spawn_watcher(
        &self,
        stop: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let path = self.options.exit_code_file.clone()?;
        let watcher = CompletionWatcher::new(path, self.ctx.settings.poll_interval);
        let exit = self.ctx.exit.clone();
        let stop = stop.clone();
        let cancel = cancel.clone();

        Some(tokio::spawn(async move {
            if let Some(code) = watcher.watch(&cancel).await {
                exit.resolve(code);
                stop.cancel();
            }
        }))
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::warn!(error = %e, "Completion watcher task failed");
    }
}
