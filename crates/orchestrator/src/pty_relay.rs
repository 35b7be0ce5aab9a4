//! Relay run that spawns a command in a pseudo-terminal and streams its output.

use std::path::PathBuf;

use events::{Message, RunStatus};
use tokio_util::sync::CancellationToken;

use crate::context::{RunContext, RunOutcome};
use crate::error::{RelayError, Result};
use crate::process::{wait_with_output, ProcessHandle};
use crate::side_log::SideLogEcho;
use crate::source::{pump, PtyReader, PtySource};
use crate::state_machine::{RunState, RunStateMachine};

#[derive(Debug, Clone)]
pub struct PtyRelayOptions {
    pub program: String,
    pub args: Vec<String>,
    /// Auxiliary log echoed to stderr while the command runs
    pub side_log: Option<PathBuf>,
}

impl PtyRelayOptions {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct PtyRelay {
    options: PtyRelayOptions,
    ctx: RunContext,
    machine: RunStateMachine,
}

impl PtyRelay {
    pub fn new(options: PtyRelayOptions, ctx: RunContext) -> Self {
        Self {
            options,
            ctx,
            machine: RunStateMachine::new(RunState::AwaitingClient),
        }
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    pub async fn run(mut self) -> RunOutcome {
        let outcome = match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "PTY relay failed");
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
        if self.options.program.is_empty() {
            return Err(RelayError::EmptyCommand);
        }

        tracing::info!("Waiting for client connection before starting the command");
        self.ctx.await_observer().await?;
        self.ctx.relay.status(RunStatus::Connected).await;

        match self.start_and_stream().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(error = %e, "Error running command");
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

    async fn start_and_stream(&mut self) -> Result<RunOutcome> {
        let command_line = self.options.command_line();
        self.machine.advance(RunState::Starting);
        tracing::info!(command = %command_line, "Executing");
        self.ctx
            .relay
            .emit(Message::status(RunStatus::Starting).with("command", command_line))
            .await;

        let mut handle = ProcessHandle::spawn(&self.options.program, &self.options.args)?;

        let side_stop = CancellationToken::new();
        let side_task = self
            .options
            .side_log
            .clone()
            .map(|path| SideLogEcho::new(path, self.ctx.settings.poll_interval).spawn(side_stop.clone()));

        let result = self.stream(&mut handle).await;

        handle.release(self.ctx.settings.terminate_grace).await;
        side_stop.cancel();
        if let Some(task) = side_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Side log task failed");
            }
        }

        let outcome = result?;
        tracing::info!(exit_code = outcome.exit_code, "Command completed");
        self.ctx
            .complete(Message::status(RunStatus::Completed).with("exit_code", outcome.exit_code))
            .await;
        Ok(outcome)
    }

    /// Pump terminal output until the child exits and the terminal runs dry
    async fn stream(&mut self, handle: &mut ProcessHandle) -> Result<RunOutcome> {
        let ctx = self.ctx.clone();
        self.machine.advance(RunState::Running);
        ctx.relay
            .emit(Message::status(RunStatus::Started).with("pid", handle.pid()))
            .await;

        let exited = CancellationToken::new();
        let reader = PtyReader::new(handle.reader_fd()?, exited.clone(), ctx.settings.poll_interval)?;
        let pump_task = {
            let relay = ctx.relay.clone();
            let stop = exited.clone();
            let interval = ctx.settings.poll_interval;
            tokio::spawn(async move {
                let mut source = PtySource::new(reader);
                pump(&mut source, &relay, &stop, interval).await
            })
        };

        let (exit_code, chunks) = wait_with_output(
            handle,
            pump_task,
            &exited,
            &ctx.shutdown,
            ctx.settings.terminate_grace,
        )
        .await?;
        tracing::debug!(chunks, "Terminal drained");
        ctx.exit.resolve(exit_code);

        Ok(RunOutcome {
            exit_code,
            units_sent: chunks,
        })
    }
}
