use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hls_relay::domain::{Quality, ResolutionTier, SessionState, StreamSettings, StreamSource};
use hls_relay::logging::init_logging;
use hls_relay::session::SessionEvent;
use hls_relay::{RelayConfig, SessionRegistry};

/// Relay one RTSP source into an HLS playlist until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream id; output goes to `<streams-dir>/<stream-id>/`
    stream_id: String,

    /// RTSP source URL
    url: String,

    /// Output resolution (480p, 720p, 1080p)
    #[arg(short, long, default_value = "720p", value_parser = parse_resolution)]
    resolution: ResolutionTier,

    /// Encoder quality (low, medium, high)
    #[arg(short, long, default_value = "medium", value_parser = parse_quality)]
    quality: Quality,

    /// Output frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Video bitrate such as 1500k or 2M
    #[arg(short, long)]
    bitrate: Option<String>,

    /// Output root directory
    #[arg(long, env = "STREAMS_DIR")]
    streams_dir: Option<PathBuf>,

    /// Path to the ffmpeg executable
    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg_path: Option<String>,

    /// Seconds to wait for the first playlist
    #[arg(long, env = "STREAM_TIMEOUT")]
    stream_timeout: Option<u64>,

    /// Also write daily rolling logs to this directory
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Print session snapshots as JSON
    #[clap(long)]
    json: bool,
}

fn parse_resolution(s: &str) -> Result<ResolutionTier, String> {
    ResolutionTier::parse(s).ok_or_else(|| format!("unknown resolution '{s}'"))
}

fn parse_quality(s: &str) -> Result<Quality, String> {
    [Quality::Low, Quality::Medium, Quality::High]
        .into_iter()
        .find(|q| q.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown quality '{s}'"))
}

fn print_status(status: &hls_relay::SessionStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
    } else {
        println!(
            "{} [{}] {} -> {}",
            status.stream_id, status.state, status.source_url, status.output_locator
        );
        if let Some(failure) = &status.last_error {
            println!("  error: {failure}");
        }
        for line in &status.stderr_tail {
            println!("  | {line}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (logging, _guard) = init_logging(args.log_dir.as_deref())?;

    let mut config = RelayConfig::from_env().context("Failed to load configuration")?;
    if let Some(dir) = args.streams_dir {
        config.streams_dir = dir;
    }
    if let Some(path) = args.ffmpeg_path {
        config.ffmpeg_path = path;
    }
    if let Some(secs) = args.stream_timeout {
        config.stream_timeout_secs = secs;
    }
    config.validate().context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let registry = Arc::new(SessionRegistry::from_relay_config(&config).await);
    let sweeper = registry.start_sweeper(shutdown.clone());
    let mut events = registry.subscribe();

    let source = StreamSource::new(&args.stream_id, &args.url).with_settings(StreamSettings {
        quality: args.quality,
        resolution: args.resolution,
        fps: args.fps,
        bitrate: args.bitrate,
        ..Default::default()
    });

    let status = registry
        .start_session(source)
        .await
        .with_context(|| format!("Failed to start stream {}", args.stream_id))?;
    print_status(&status, args.json)?;

    let mut failure = None;
    if status.state == SessionState::Error {
        failure = status.last_error;
    } else {
        info!(
            stream_id = %args.stream_id,
            "Relaying into {}; press Ctrl-C to stop",
            config.streams_dir.join(&args.stream_id).display()
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    if let Err(e) = result {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                    info!("Shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::StateChanged { stream_id, to: SessionState::Error, failure: f, .. })
                        if stream_id == args.stream_id =>
                    {
                        if let Some(status) = registry.get_status(&stream_id) {
                            print_status(&status, args.json)?;
                        }
                        failure = f;
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} session event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    shutdown.cancel();
    for status in registry.stop_all().await {
        print_status(&status, args.json)?;
    }
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }

    match failure {
        Some(failure) => anyhow::bail!("Relay for {} failed: {}", args.stream_id, failure),
        None => Ok(()),
    }
}
