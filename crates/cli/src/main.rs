use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use events::MessageRelay;
use orchestrator::error::EXIT_FAILURE;
use orchestrator::{
    CaptureOptions, CaptureRun, FileRelay, FileRelayOptions, Framing, PtyRelay, PtyRelayOptions,
    RunContext, RunOutcome, RunSettings,
};
use server::config::RelayConfig;
use server::{create_router, state::AppState};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pipeline-relay")]
#[command(about = "Stream a pipeline's output to a single WebSocket observer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Address to bind the WebSocket server to [default: 0.0.0.0]
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind the WebSocket server to [default: 8765]
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// TOML file with [server] and [timing] settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail an output file written by another process
    Tail {
        /// Output file to stream
        #[arg(short, long)]
        file: PathBuf,

        /// Sentinel file the producer writes its exit code to
        #[arg(short, long)]
        exit_code_file: Option<PathBuf>,

        /// Stream raw blocks instead of lines
        #[arg(long)]
        raw: bool,

        /// Seconds to wait for the output file to appear
        #[arg(long)]
        file_timeout: Option<u64>,
    },
    /// Run a command in a pseudo-terminal and stream its output
    Pty {
        /// Auxiliary log file to echo to stderr while the command runs
        #[arg(long)]
        side_log: Option<PathBuf>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Run a command in a pseudo-terminal and copy its output to a file
    Capture {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long)]
        exit_code_file: Option<PathBuf>,

        /// Decode output as text before writing
        #[arg(long)]
        text: bool,

        #[arg(long)]
        side_log: Option<PathBuf>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = RelayConfig::load_or_default(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    let mut settings = config.run_settings();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let outcome = match cli.command {
        Commands::Tail {
            file,
            exit_code_file,
            raw,
            file_timeout,
        } => {
            if let Some(secs) = file_timeout {
                settings.file_timeout = Duration::from_secs(secs);
            }
            let options = FileRelayOptions {
                log_file: file,
                exit_code_file,
                framing: if raw { Framing::Blocks } else { Framing::Lines },
            };
            tracing::info!(
                path = %options.log_file.display(),
                exit_code_file = ?options.exit_code_file,
                "Relaying output file"
            );
            serve_while(&config, |relay| {
                let ctx = run_context(relay, settings, &shutdown);
                FileRelay::new(options, ctx).run()
            })
            .await?
        }
        Commands::Pty { side_log, command } => {
            let (program, args) = split_command(command);
            let options = PtyRelayOptions {
                program,
                args,
                side_log,
            };
            serve_while(&config, |relay| {
                let ctx = run_context(relay, settings, &shutdown);
                PtyRelay::new(options, ctx).run()
            })
            .await?
        }
        Commands::Capture {
            output,
            exit_code_file,
            text,
            side_log,
            command,
        } => {
            let (program, args) = split_command(command);
            let options = CaptureOptions {
                program,
                args,
                output,
                exit_code_file,
                text,
                side_log,
            };
            CaptureRun::new(options, settings)
                .with_shutdown(shutdown.clone())
                .run()
                .await
        }
    };

    tracing::info!(exit_code = outcome.exit_code, "Exiting");
    Ok(exit_status(outcome.exit_code))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pipeline_relay=info,server=info,websocket=info,orchestrator=info,tower_http=info"
                    .into()
            }),
        )
        .init();
}

fn run_context(relay: MessageRelay, settings: RunSettings, shutdown: &CancellationToken) -> RunContext {
    RunContext::new(relay, settings).with_shutdown(shutdown.clone())
}

/// Serve `/ws` and `/healthz` for as long as the run takes
async fn serve_while<F, Fut>(config: &RelayConfig, run: F) -> Result<RunOutcome>
where
    F: FnOnce(MessageRelay) -> Fut,
    Fut: Future<Output = RunOutcome>,
{
    let state = AppState::new();
    let app = create_router(state.clone());

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local_addr = listener.local_addr()?;

    eprintln!();
    eprintln!("Pipeline relay");
    eprintln!("════════════════════════════════════════");
    eprintln!();
    eprintln!("  WebSocket:  ws://{}/ws", local_addr);
    eprintln!("  Health:     http://{}/healthz", local_addr);
    eprintln!();
    tracing::info!("Server listening on {}", local_addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    let outcome = run(state.relay()).await;
    server.abort();
    Ok(outcome)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

fn split_command(mut command: Vec<String>) -> (String, Vec<String>) {
    if command.is_empty() {
        return (String::new(), Vec::new());
    }
    let program = command.remove(0);
    (program, command)
}

fn exit_status(code: i32) -> ExitCode {
    ExitCode::from(exit_byte(code))
}

/// Exit codes outside 0..=255 collapse to a generic failure
fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE as u8)
}
