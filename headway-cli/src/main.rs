mod error;
mod status;

use std::process;

use clap::{Parser, ValueEnum};
use crossterm::tty::IsTty;
use headway_engine::adapter::{LoadOutcome, LoadRequest};
use headway_engine::playlist::resolve_url;
use headway_engine::{
    HttpConfig, PrefetchConfig, PrefetchError, PrefetchSession, RetryPolicy, SegmentPlaylist,
    WindowConfig,
};
use m3u8_rs::{MediaPlaylist, Playlist};
use reqwest::Client;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "headway",
    version,
    about = "Sliding-window HLS segment prefetcher",
    long_about = "Downloads the segments of an HLS playlist through a bounded prefetch window, \
                  keeping several transfers in flight ahead of the write position."
)]
struct Args {
    /// Playlist URL, master or media
    url: String,

    /// Output path for the concatenated segments, `-` for stdout
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Concurrent prefetch depth
    #[arg(long, default_value_t = 6)]
    window_size: usize,

    /// Slow-connection retry policy
    #[arg(long, value_enum, default_value = "off")]
    retry_policy: PolicyArg,

    /// Total bandwidth budget in mbit/s, split across the window by the
    /// fixed policy
    #[arg(long, default_value_t = 12.0)]
    bandwidth_budget: f64,

    /// Probe the `-muted` variant of a segment that returns 404
    #[arg(long)]
    advanced_segment_search: bool,

    /// Force this file extension on every segment request
    #[arg(long)]
    extension: Option<String>,

    /// Let intermediaries answer from cache instead of forcing revalidation
    #[arg(long)]
    allow_cache: bool,

    /// Attempt ceiling shared by error and slowness retries
    #[arg(long, default_value_t = 8)]
    max_retries: u32,

    /// First segment index to fetch
    #[arg(long, default_value_t = 0)]
    start_index: u64,

    /// Disable the in-place status report
    #[arg(long)]
    no_status: bool,

    /// Increase log verbosity
    #[arg(short, long)]
    verbose: bool,

    /// Log errors only
    #[arg(short, long)]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyArg {
    /// Never retry on slowness
    Off,
    /// Retry transfers under half the window's average speed
    Relative,
    /// Retry transfers under their share of a fixed bandwidth budget
    Fixed,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(error) = run(args).await {
        error!("{error}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Logs share stderr with the status display; stdout carries media bytes
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

async fn run(args: Args) -> Result<()> {
    let playlist_url: Url = args
        .url
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("bad playlist URL: {e}")))?;

    let config = build_config(&args)?;
    let session = PrefetchSession::start(config)?;

    let (media, media_url) = resolve_media_playlist(session.client(), playlist_url).await?;
    let segments = SegmentPlaylist::from_media_playlist(&media, &media_url)?;
    let total = segments.len() as u64;
    if total == 0 {
        return Err(PrefetchError::playlist("media playlist has no segments").into());
    }
    if args.start_index >= total {
        return Err(AppError::InvalidInput(format!(
            "start index {} past the last segment {}",
            args.start_index,
            total - 1
        )));
    }
    info!(segments = total, url = %media_url, "media playlist resolved");

    session.handle().playlist_ready(segments).await?;

    let status_token = CancellationToken::new();
    let status_task = if args.no_status || args.quiet || !std::io::stderr().is_tty() {
        None
    } else {
        let snapshots = session.handle().watch_snapshots();
        Some(tokio::spawn(status::run_status_display(
            snapshots,
            status_token.clone(),
        )))
    };

    let mut sink = open_sink(&args.output).await?;
    let loader = session.loader();
    let mut delivered = 0u64;
    let mut written = 0u64;
    let mut interrupted = false;
    let mut failure: Option<AppError> = None;

    for index in args.start_index..total {
        let outcome = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, aborting in-flight transfers");
                loader.abort().await;
                interrupted = true;
                break;
            }
            outcome = loader.load(LoadRequest::Fragment { index }) => outcome,
        };

        match outcome {
            LoadOutcome::Loaded(bytes) => {
                if let Err(e) = sink.write_all(&bytes).await {
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        info!("consumer closed the pipe, stopping");
                        interrupted = true;
                        break;
                    }
                    failure = Some(AppError::Io(e));
                    break;
                }
                delivered += 1;
                written += bytes.len() as u64;
            }
            LoadOutcome::Aborted => {
                info!(index, "load aborted, stopping");
                interrupted = true;
                break;
            }
            LoadOutcome::Failed(load_error) => {
                failure = Some(AppError::SegmentLoad {
                    index,
                    error: load_error,
                });
                break;
            }
        }
    }

    let _ = sink.flush().await;
    status_token.cancel();
    if let Some(task) = status_task {
        let _ = task.await;
    }
    session.shutdown();

    if let Some(error) = failure {
        return Err(error);
    }
    if interrupted {
        info!(segments = delivered, bytes = written, "stopped early");
    } else {
        info!(segments = delivered, bytes = written, "playlist drained");
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<PrefetchConfig> {
    if args.window_size == 0 {
        return Err(AppError::InvalidInput(
            "window size must be at least 1".to_string(),
        ));
    }
    let retry_policy = match args.retry_policy {
        PolicyArg::Off => RetryPolicy::Off,
        PolicyArg::Relative => RetryPolicy::Relative,
        PolicyArg::Fixed => {
            if args.bandwidth_budget <= 0.0 {
                return Err(AppError::InvalidInput(
                    "bandwidth budget must be positive".to_string(),
                ));
            }
            RetryPolicy::Fixed {
                budget_mbit: args.bandwidth_budget,
            }
        }
    };

    Ok(PrefetchConfig {
        window: WindowConfig {
            window_size: args.window_size,
            retry_policy,
            advanced_segment_search: args.advanced_segment_search,
            url_extension_override: args.extension.clone(),
            suppress_cache: !args.allow_cache,
            max_retries: args.max_retries,
            ..WindowConfig::default()
        },
        http: HttpConfig::default(),
    })
}

/// Fetch the playlist at `url`, following one master-to-variant hop by
/// highest bandwidth. Returns the media playlist and the URL it was fetched
/// from; segment URIs resolve against the latter.
async fn resolve_media_playlist(client: &Client, url: Url) -> Result<(MediaPlaylist, Url)> {
    match fetch_playlist(client, &url).await? {
        Playlist::MediaPlaylist(media) => Ok((media, url)),
        Playlist::MasterPlaylist(master) => {
            let base_url = url
                .join(".")
                .map_err(|e| PrefetchError::playlist(format!("bad master playlist URL: {e}")))?;
            let variant = master
                .variants
                .iter()
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| PrefetchError::playlist("master playlist has no variants"))?;
            let variant_url = resolve_url(&variant.uri, &base_url)?;
            info!(
                bandwidth = variant.bandwidth,
                url = %variant_url,
                "selected highest-bandwidth variant"
            );
            match fetch_playlist(client, &variant_url).await? {
                Playlist::MediaPlaylist(media) => Ok((media, variant_url)),
                Playlist::MasterPlaylist(_) => Err(PrefetchError::playlist(
                    "variant resolved to another master playlist",
                )
                .into()),
            }
        }
    }
}

async fn fetch_playlist(client: &Client, url: &Url) -> Result<Playlist> {
    info!(url = %url, "downloading playlist");
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(PrefetchError::from)?;
    let status = response.status();
    if !status.is_success() {
        return Err(PrefetchError::http_status(status, url.as_str()).into());
    }
    let body = response.bytes().await.map_err(PrefetchError::from)?;
    let (_, playlist) = m3u8_rs::parse_playlist(&body)
        .map_err(|e| PrefetchError::playlist(format!("failed to parse playlist: {e}")))?;
    Ok(playlist)
}

async fn open_sink(path: &str) -> Result<Box<dyn AsyncWrite + Unpin>> {
    if path == "-" {
        Ok(Box::new(tokio::io::stdout()))
    } else {
        let file = tokio::fs::File::create(path).await?;
        info!(path, "writing segments to file");
        Ok(Box::new(file))
    }
}

// --- Unit Tests ---

#[cfg(test)]
mod tests {
    use super::*;

    fn args(overrides: impl FnOnce(&mut Args)) -> Args {
        let mut args = Args::parse_from(["headway", "http://example.com/live.m3u8"]);
        overrides(&mut args);
        args
    }

    #[test]
    fn test_default_config_matches_engine_defaults() {
        let config = build_config(&args(|_| {})).expect("config");
        assert_eq!(config.window.window_size, 6);
        assert_eq!(config.window.retry_policy, RetryPolicy::Off);
        assert!(config.window.suppress_cache);
        assert_eq!(config.window.max_retries, 8);
    }

    #[test]
    fn test_fixed_policy_carries_budget() {
        let config = build_config(&args(|a| {
            a.retry_policy = PolicyArg::Fixed;
            a.bandwidth_budget = 24.0;
        }))
        .expect("config");
        assert_eq!(
            config.window.retry_policy,
            RetryPolicy::Fixed { budget_mbit: 24.0 }
        );
    }

    #[test]
    fn test_allow_cache_disables_suppression() {
        let config = build_config(&args(|a| a.allow_cache = true)).expect("config");
        assert!(!config.window.suppress_cache);
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = build_config(&args(|a| a.window_size = 0));
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_nonpositive_budget_rejected() {
        let result = build_config(&args(|a| {
            a.retry_policy = PolicyArg::Fixed;
            a.bandwidth_budget = 0.0;
        }));
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}
