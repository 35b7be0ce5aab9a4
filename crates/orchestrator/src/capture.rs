//! Producer side of a file-tail deployment.
//!
//! Runs a command in a pseudo-terminal, copies everything it prints into an
//! output file and finally publishes the exit code through a sentinel file,
//! so a [`FileRelay`](crate::FileRelay) elsewhere can stream both.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::context::{RunOutcome, RunSettings};
use crate::decode::Utf8Decoder;
use crate::error::{RelayError, Result};
use crate::process::{wait_with_output, ProcessHandle};
use crate::side_log::SideLogEcho;
use crate::source::{PtyReader, ReadOutcome};

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub program: String,
    pub args: Vec<String>,
    /// File receiving the terminal output, truncated at start
    pub output: PathBuf,
    pub exit_code_file: Option<PathBuf>,
    /// Decode output lossily before writing instead of copying raw bytes
    pub text: bool,
    pub side_log: Option<PathBuf>,
}

pub struct CaptureRun {
    options: CaptureOptions,
    settings: RunSettings,
    shutdown: CancellationToken,
}

impl CaptureRun {
    pub fn new(options: CaptureOptions, settings: RunSettings) -> Self {
        Self {
            options,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the command and publish its exit code.
    ///
    /// The sentinel is written on every path, including spawn failures, so a
    /// watching relay never waits forever.
    pub async fn run(self) -> RunOutcome {
        let (exit_code, units_sent) = match self.capture().await {
            Ok(captured) => captured,
            Err(e) => {
                tracing::error!(error = %e, "Capture failed");
                (e.exit_code(), 0)
            }
        };

        if let Some(path) = &self.options.exit_code_file {
            match write_exit_code(path, exit_code).await {
                Ok(()) => tracing::info!(path = %path.display(), exit_code, "Exit code written"),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to write exit code"),
            }
        }

        RunOutcome {
            exit_code,
            units_sent,
        }
    }

    async fn capture(&self) -> Result<(i32, usize)> {
        if self.options.program.is_empty() {
            return Err(RelayError::EmptyCommand);
        }

        let output = File::create(&self.options.output).await?;
        let mut handle = ProcessHandle::spawn(&self.options.program, &self.options.args)?;

        let side_stop = CancellationToken::new();
        let side_task = self
            .options
            .side_log
            .clone()
            .map(|path| SideLogEcho::new(path, self.settings.poll_interval).spawn(side_stop.clone()));

        let result = self.copy_until_exit(&mut handle, output).await;

        handle.release(self.settings.terminate_grace).await;
        side_stop.cancel();
        if let Some(task) = side_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Side log task failed");
            }
        }

        result
    }

    async fn copy_until_exit(&self, handle: &mut ProcessHandle, output: File) -> Result<(i32, usize)> {
        let exited = CancellationToken::new();
        let reader = PtyReader::new(handle.reader_fd()?, exited.clone(), self.settings.poll_interval)?;
        let copy_task = tokio::spawn(copy_output(reader, output, self.options.text));

        wait_with_output(
            handle,
            copy_task,
            &exited,
            &self.shutdown,
            self.settings.terminate_grace,
        )
        .await
    }
}

/// Append every chunk from `reader` to `output`, flushing after each
async fn copy_output(mut reader: PtyReader, mut output: File, text: bool) -> Result<usize> {
    let mut decoder = text.then(Utf8Decoder::new);
    let mut chunks = 0usize;

    loop {
        match reader.read_bytes().await? {
            ReadOutcome::Data(bytes) => {
                match decoder.as_mut() {
                    Some(decoder) => output.write_all(decoder.decode(&bytes).as_bytes()).await?,
                    None => output.write_all(&bytes).await?,
                }
                output.flush().await?;
                chunks += 1;
            }
            ReadOutcome::Idle => continue,
            ReadOutcome::Finished => break,
        }
    }

    if let Some(rest) = decoder.as_mut().and_then(Utf8Decoder::finish) {
        output.write_all(rest.as_bytes()).await?;
    }
    output.flush().await?;
    Ok(chunks)
}

/// Write `code` to `path` through a temporary file and a rename
pub async fn write_exit_code(path: &Path, code: i32) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp, code.to_string()).await?;
    tokio::fs::rename(&tmp, path).await
}
