// main.rs

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use shared_utils::types::SequenceCounter;
use tokio::{net::{TcpListener, UdpSocket}, runtime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, Layer};

mod config;
mod handlers;
mod ingress;
mod router;
mod services;
mod types;

use config::{BackendConfig, StreamingBackend};
use handlers::control::{ControlError, ControlHandler};
use services::session_registry::{run_expiry_sweeper, SessionRegistry};
use services::transcoder::FfmpegTranscoder;
use services::whitelist::Whitelist;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
enum LogLevel {
    Trace = 0, // Designates very fine-grained informational events, extremely verbose.
    Debug = 1, // Designates fine-grained informational events.
    Info = 2, // Designates informational messages.
    Warn = 3, // Designates hazardous situations.
    Error = 4, // Designates very serious errors.
}

#[derive(Parser, Debug)]
#[command(author, version, about = "dash-server")]
struct Args {
    // HTTP port serving manifests, segments and the session list
    #[arg(short, long, default_value = "3001")]
    port: u16,
    /// UDP port of the dynamic-session control channel
    #[arg(short, long, default_value_t = 5000)]
    control_port: u16,
    // Set the log level (possible values: error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
    /// Directory the transcoders write into, also served over HTTP
    #[arg(short, long, default_value = "./media")]
    media_base: PathBuf,
    /// Media list file; its stream names are the only ones sessions can be started for
    #[arg(long, default_value = "./media_list.txt")]
    media_list: PathBuf,
    /// Source backend for live streams
    #[arg(short, long)]
    streaming: Option<StreamingBackend>,
    #[arg(long, default_value = "127.0.0.1")]
    rtmp_publish_ip: String,
    #[arg(long, default_value_t = 1940)]
    rtmp_publish_port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    http_target_ip: String,
    #[arg(long, default_value_t = 5858)]
    http_target_port: u16,
    /// Transcoder executable
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
    /// Maximum number of live sessions
    #[arg(long, default_value_t = 64)]
    max_sessions: usize,
    /// Seconds between two expiry sweeps
    #[arg(long, default_value_t = 1)]
    sweep_interval: u64,
}

#[instrument(skip_all)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let args = Args::parse();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(match args.log_level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        });
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{:?}", args);

    let runtime = runtime::Builder::new_multi_thread()
        .thread_name_fn(|| {
            static ATOMIC_WORKER_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
            let id = ATOMIC_WORKER_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("MAIN_R w-{}", id)
        })
        .enable_all()
        .build()?;

    match runtime.block_on(run(args)) {
        Err(ServerError::Control(e)) => {
            error!("{}. Shutting down.", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

#[derive(Error, Debug)]
enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Control(#[from] ControlError),
}

async fn run(args: Args) -> Result<(), ServerError> {
    let whitelist = Whitelist::load(&args.media_list)?;
    info!("{} stream name(s) in {}", whitelist.len(), args.media_list.display());

    let backend = BackendConfig {
        streaming: args.streaming,
        rtmp_publish_ip: args.rtmp_publish_ip,
        rtmp_publish_port: args.rtmp_publish_port,
        http_target_ip: args.http_target_ip,
        http_target_port: args.http_target_port,
    };
    match backend.network_path() {
        Some(path) => info!("Streaming backend: {}", path),
        None => info!("No streaming backend configured, start requests will be answered with NOT_FOUND"),
    }

    let registry = Arc::new(SessionRegistry::new(args.max_sessions));
    let handler = Arc::new(ControlHandler::new(
        registry.clone(),
        whitelist,
        backend,
        args.media_base.clone(),
        Arc::new(FfmpegTranscoder::new(args.ffmpeg)),
        Arc::new(SequenceCounter::new(1)),
    ));
    let shutdown = CancellationToken::new();

    tokio::spawn(run_expiry_sweeper(
        registry.clone(),
        Duration::from_secs(args.sweep_interval.max(1)),
        shutdown.clone(),
    ));

    let app = router::create_router(registry.clone(), &args.media_base);
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("HTTP listening on {:?}", listener.local_addr());
    let http_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await
        {
            error!("HTTP server failed: {}", e);
        }
    });

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            ctrl_c.cancel();
        }
    });

    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", args.control_port)).await?);
    let result = ingress::udp::run_control_loop(socket, handler, shutdown.clone()).await;

    shutdown.cancel();
    info!("Stopping {} live session(s)", registry.len());
    registry.delete_all().await;

    Ok(result?)
}
