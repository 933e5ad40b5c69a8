//! Sliding-window HTTP prefetcher for sequentially consumed media segments.
//!
//! The engine keeps a bounded window of segment downloads running ahead of a
//! sequential consumer. Each request slides the window around the asked-for
//! index, completed payloads are served as independent copies, and
//! per-transfer throughput feeds a retry policy that reissues connections
//! stuck below the window's pace.
//!
//! ## Component Overview
//!
//! - `window`: manager task owning every transfer and the window slide
//! - `transfer`: per-segment download runner with backoff and 404 probing
//! - `policy`: health classification and the slow-connection retry policies
//! - `playlist`: ordered segment index to URL mapping
//! - `adapter`: loader-shaped shim for host media runtimes
//! - `stats`: aggregate speed tracking and the status report
//! - `client`: shared HTTP client construction

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod playlist;
pub mod policy;
pub mod stats;
pub mod transfer;
pub mod window;

pub use adapter::{LoadError, LoadOutcome, LoadRequest, SegmentLoader};
pub use client::create_client;
pub use config::{HttpConfig, PrefetchConfig, WindowConfig};
pub use error::PrefetchError;
pub use playlist::{SegmentDescriptor, SegmentPlaylist};
pub use policy::{Health, RetryPolicy};
pub use stats::{SegmentRow, WindowSnapshot, WindowStats};
pub use transfer::{HttpSegmentDownloader, SegmentDownloader};
pub use window::{WindowHandle, WindowManager};

/// One playback session's worth of prefetch machinery, wired together.
///
/// Builds the HTTP client, spawns the window manager and hands out handles
/// bound to it. Dropping the session does not stop the window; call
/// [`PrefetchSession::shutdown`].
pub struct PrefetchSession {
    handle: WindowHandle,
    client: Client,
    token: CancellationToken,
}

impl PrefetchSession {
    pub fn start(config: PrefetchConfig) -> Result<Self, PrefetchError> {
        if config.window.window_size == 0 {
            return Err(PrefetchError::configuration("window_size must be at least 1"));
        }
        let client = client::create_client(&config.http)?;
        let downloader = Arc::new(HttpSegmentDownloader::new(client.clone()));
        let token = CancellationToken::new();
        let handle = WindowManager::spawn(config.window, downloader, token.clone());
        Ok(Self {
            handle,
            client,
            token,
        })
    }

    pub fn handle(&self) -> &WindowHandle {
        &self.handle
    }

    /// The session's shared HTTP client, for playlist fetches and other
    /// requests that bypass the window.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Loader-shaped adapter bound to this session's window.
    pub fn loader(&self) -> SegmentLoader {
        SegmentLoader::new(self.handle.clone(), self.client.clone())
    }

    /// Tear down the window and abort every transfer.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
