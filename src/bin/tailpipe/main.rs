// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use tailpipe::bounded_channel::{self, BoundedSender};
use tailpipe::event::LogEvent;
use tailpipe::inputs::{
    FileInput, FileInputConfig, GelfInput, GelfInputConfig, RedisQueueInput,
    RedisQueueInputConfig, TcpInput, TcpInputConfig,
};
use tailpipe::outputs::{RedisQueueOutput, RedisQueueOutputConfig, StdoutOutput};
use tailpipe::topology::Pipeline;

const PIPELINE_QUEUE_SIZE: usize = 1_000;

const INPUT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the pipeline
    Start(Box<StartArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "tailpipe")]
#[command(bin_name = "tailpipe")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "TAILPIPE_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Debug, Args, Clone)]
struct StartArgs {
    /// Files to tail (repeatable)
    #[arg(long = "file", env = "TAILPIPE_FILES", value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Type tag for file events
    #[arg(long, env = "TAILPIPE_FILE_TYPE")]
    file_type: Option<String>,

    /// Starting byte offset; omit to tail from the current end
    #[arg(long, env = "TAILPIPE_FILE_START_OFFSET")]
    file_start_offset: Option<u64>,

    /// Use the poll-based follower instead of filesystem notifications
    #[arg(long, env = "TAILPIPE_FILE_USE_TAIL", default_value = "false")]
    file_use_tail: bool,

    /// Max bytes per incremental read
    #[arg(long, env = "TAILPIPE_FILE_BUFFER_SIZE")]
    file_buffer_size: Option<usize>,

    /// Text encoding of tailed files
    #[arg(long, env = "TAILPIPE_FILE_BUFFER_ENCODING")]
    file_buffer_encoding: Option<String>,

    /// Rotation quiescence delay in milliseconds; 0 resolves immediately
    #[arg(long, env = "TAILPIPE_FILE_WAIT_DELAY_AFTER_RENAMING_MS")]
    file_wait_delay_after_renaming_ms: Option<u64>,

    /// GELF UDP listen address
    #[arg(long, env = "TAILPIPE_GELF_ENDPOINT")]
    gelf_endpoint: Option<SocketAddr>,

    /// Type tag for GELF events
    #[arg(long, env = "TAILPIPE_GELF_TYPE")]
    gelf_type: Option<String>,

    /// Pull socket listen address (newline-framed JSON envelopes)
    #[arg(long, env = "TAILPIPE_TCP_ENDPOINT")]
    tcp_endpoint: Option<SocketAddr>,

    /// Redis URL to pop events from
    #[arg(long, env = "TAILPIPE_REDIS_INPUT_URL")]
    redis_input_url: Option<String>,

    /// Redis list key to pop from
    #[arg(long, env = "TAILPIPE_REDIS_INPUT_KEY", default_value = "logs")]
    redis_input_key: String,

    /// Type tag override for queued events
    #[arg(long, env = "TAILPIPE_REDIS_INPUT_TYPE")]
    redis_input_type: Option<String>,

    /// Redis URL to push events to
    #[arg(long, env = "TAILPIPE_REDIS_OUTPUT_URL")]
    redis_output_url: Option<String>,

    /// Redis list key pattern to push to; #{field} references resolve per event
    #[arg(long, env = "TAILPIPE_REDIS_OUTPUT_KEY", default_value = "logs")]
    redis_output_key: String,

    /// Write envelopes to stdout
    #[arg(long, env = "TAILPIPE_STDOUT_OUTPUT", default_value = "false")]
    stdout_output: bool,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(args)) => {
            if let Err(e) = setup_logging(&opt.log_format) {
                eprintln!("ERROR: failed to setup logging: {}", e);
                return ExitCode::from(1);
            }

            match run_pipeline(args) {
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Failed to run pipeline.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_pipeline(args: Box<StartArgs>) -> Result<(), BoxError> {
    let has_input = !args.files.is_empty()
        || args.gelf_endpoint.is_some()
        || args.tcp_endpoint.is_some()
        || args.redis_input_url.is_some();
    if !has_input {
        return Err("no inputs configured; pass --file, --gelf-endpoint, --tcp-endpoint or --redis-input-url".into());
    }

    let (events_tx, events_rx) = bounded_channel::bounded::<LogEvent>(PIPELINE_QUEUE_SIZE);

    let input_cancel = CancellationToken::new();
    let drain_cancel = CancellationToken::new();

    let mut inputs: JoinSet<Result<(), BoxError>> = JoinSet::new();
    spawn_inputs(&args, &mut inputs, &events_tx, &input_cancel);
    // keep no sender here: the pipeline drains out once every input is done
    drop(events_tx);

    let mut output_senders: Vec<BoundedSender<LogEvent>> = Vec::new();
    let mut outputs: JoinSet<Result<(), BoxError>> = JoinSet::new();

    if args.stdout_output || (args.redis_output_url.is_none()) {
        // always have at least one sink so events go somewhere visible
        let (tx, rx) = bounded_channel::bounded(PIPELINE_QUEUE_SIZE);
        output_senders.push(tx);
        let token = drain_cancel.clone();
        outputs.spawn(async move {
            StdoutOutput::new(rx).start(token).await;
            Ok(())
        });
    }
    if let Some(url) = &args.redis_output_url {
        let (tx, rx) = bounded_channel::bounded(PIPELINE_QUEUE_SIZE);
        output_senders.push(tx);
        let config = RedisQueueOutputConfig::new(url.clone(), args.redis_output_key.clone());
        let token = drain_cancel.clone();
        outputs.spawn(async move { RedisQueueOutput::new(config, rx).start(token).await });
    }

    let pipeline_token = drain_cancel.clone();
    let pipeline_handle = tokio::spawn(async move {
        let mut pipeline = Pipeline::new(events_rx, output_senders);
        pipeline.start(pipeline_token).await
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        select! {
            _ = sigint.recv() => {
                info!("Shutdown signal received.");
                break;
            },
            _ = sigterm.recv() => {
                info!("Shutdown signal received.");
                break;
            },
            joined = inputs.join_next() => match joined {
                Some(Ok(Ok(()))) => {},
                Some(Ok(Err(e))) => {
                    error!(error = %e, "Input failed, shutting down.");
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Input task panicked, shutting down.");
                    break;
                }
                None => {
                    warn!("All inputs finished, shutting down.");
                    break;
                }
            },
        }
    }

    input_cancel.cancel();
    if timeout(INPUT_SHUTDOWN_TIMEOUT, async {
        while let Some(joined) = inputs.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "input exited with error during shutdown");
            }
        }
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for inputs; aborting them");
        inputs.shutdown().await;
    }

    // with every input sender gone the pipeline and outputs drain naturally;
    // the cancel token is the backstop
    let drained = timeout(DRAIN_TIMEOUT, async {
        let _ = pipeline_handle.await;
        while outputs.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("timed out draining pipeline; cancelling");
        drain_cancel.cancel();
    }

    info!("Shutdown complete.");
    Ok(())
}

fn spawn_inputs(
    args: &StartArgs,
    inputs: &mut JoinSet<Result<(), BoxError>>,
    events_tx: &BoundedSender<LogEvent>,
    cancel: &CancellationToken,
) {
    for path in &args.files {
        let mut config = FileInputConfig::new(path);
        config.kind = args.file_type.clone();
        config.start_offset = args.file_start_offset;
        config.use_tail = args.file_use_tail;
        config.buffer_size = args.file_buffer_size;
        config.buffer_encoding = args.file_buffer_encoding.clone();
        config.wait_delay_after_renaming = args
            .file_wait_delay_after_renaming_ms
            .map(Duration::from_millis);

        let out = events_tx.clone();
        let token = cancel.child_token();
        inputs.spawn(async move { FileInput::new(config).start(out, token).await });
    }

    if let Some(address) = args.gelf_endpoint {
        let config = GelfInputConfig {
            address,
            kind: args.gelf_type.clone(),
        };
        let out = events_tx.clone();
        let token = cancel.child_token();
        inputs.spawn(async move { GelfInput::new(config).start(out, token).await });
    }

    if let Some(address) = args.tcp_endpoint {
        let config = TcpInputConfig { address };
        let out = events_tx.clone();
        let token = cancel.child_token();
        inputs.spawn(async move { TcpInput::new(config).start(out, token).await });
    }

    if let Some(url) = &args.redis_input_url {
        let mut config = RedisQueueInputConfig::new(url.clone(), args.redis_input_key.clone());
        config.kind = args.redis_input_type.clone();
        let out = events_tx.clone();
        let token = cancel.child_token();
        inputs.spawn(async move { RedisQueueInput::new(config).start(out, token).await });
    }
}

fn setup_logging(log_format: &LogFormatArg) -> Result<(), BoxError> {
    LogTracer::init()?;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, std::io::stdout);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}
