use std::sync::Arc;
use std::time::Duration;

use dash_client::DashPlayer;
use dash_receiver::args::{get_log_level_filter, parse_args, Args};
use shared_utils::control_client::ControlClient;
use shared_utils::types::SequenceCounter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    // Build the FmtSubscriber layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(get_log_level_filter(&args));
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting receiver client (headless)");
    info!("{:?}", args);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let control = match args.control_server {
        Some(server) => {
            let client = ControlClient::connect(
                server,
                Arc::new(SequenceCounter::new(1)),
                Duration::from_secs(args.control_timeout),
            )
            .await?;
            let response = client.start_streaming(&args.source_ip, &args.uri, args.expires).await?;
            if !response.is_success() {
                error!(
                    "Server refused {} ({} {}). Shutting down.",
                    args.uri, response.status_code, response.reason
                );
                std::process::exit(1);
            }
            info!("Registered {} with {}", args.uri, server);
            Some(client)
        }
        None => None,
    };

    let session_id = args.session_id();
    let player = DashPlayer::new(args.retry_limit)?;
    let session = player.start(&session_id, &args.manifest_url, args.target_dir.clone())?;

    tokio::select! {
        _ = session.cancelled() => {
            warn!("({}) Session ended on its own", session_id);
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, stopping {}", session_id);
            player.stop(&session_id);
        }
    }

    if let Some(client) = control {
        match client.stop_streaming(&args.source_ip, &args.uri).await {
            Ok(response) if response.is_success() => info!("Deregistered {}", args.uri),
            Ok(response) => warn!("Deregistering {} failed: {} {}", args.uri, response.status_code, response.reason),
            Err(e) => warn!("Deregistering {} failed: {}", args.uri, e),
        }
    }

    Ok(())
}
