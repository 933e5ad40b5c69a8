// Loader-shaped adapter: the host runtime speaks load/abort and this shim
// translates both onto the window manager it was constructed with. Fragment
// loads go through the window; playlist loads pass straight through to the
// HTTP client.

use std::fmt;

use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::error::PrefetchError;
use crate::window::WindowHandle;

/// What the host runtime is asking for.
#[derive(Debug, Clone)]
pub enum LoadRequest {
    /// One media segment, identified by playlist position.
    Fragment { index: u64 },
    /// A playlist document, fetched outside the window.
    Playlist { url: Url },
}

/// Structured failure reported across the adapter boundary instead of a raw
/// transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    /// HTTP status when the failure carried one
    pub code: Option<u16>,
    pub text: String,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "HTTP {code}: {text}", text = self.text),
            None => write!(f, "{}", self.text),
        }
    }
}

impl From<PrefetchError> for LoadError {
    fn from(error: PrefetchError) -> Self {
        let code = match &error {
            PrefetchError::HttpStatus { status, .. } => Some(status.as_u16()),
            _ => None,
        };
        Self {
            code,
            text: error.to_string(),
        }
    }
}

/// Result of one `load` call.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(Bytes),
    /// Cancelled on purpose; hosts suppress error reporting for these
    Aborted,
    Failed(LoadError),
}

/// Shim between a host media runtime and the prefetch window. One instance
/// per playback session, bound to its window at construction.
#[derive(Debug, Clone)]
pub struct SegmentLoader {
    window: WindowHandle,
    client: Client,
}

impl SegmentLoader {
    pub fn new(window: WindowHandle, client: Client) -> Self {
        Self { window, client }
    }

    pub async fn load(&self, request: LoadRequest) -> LoadOutcome {
        match request {
            LoadRequest::Fragment { index } => self.load_fragment(index).await,
            LoadRequest::Playlist { url } => self.load_playlist(url).await,
        }
    }

    /// Abort whatever the host is currently waiting on. The window refills
    /// behind the aborted transfers on its own.
    pub async fn abort(&self) {
        let _ = self.window.release_requested().await;
    }

    async fn load_fragment(&self, index: u64) -> LoadOutcome {
        match self.window.request(index).await {
            Ok(bytes) => {
                // Consumed; drop it so the window never re-serves it
                let _ = self.window.release(index).await;
                LoadOutcome::Loaded(bytes)
            }
            Err(error) if error.is_abort() => LoadOutcome::Aborted,
            Err(error) => {
                warn!(index, error = %error, "fragment load failed");
                LoadOutcome::Failed(LoadError::from(error))
            }
        }
    }

    async fn load_playlist(&self, url: Url) -> LoadOutcome {
        debug!(url = %url, "passing playlist request through");
        let result = async {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(PrefetchError::http_status(status, url.as_str()));
            }
            Ok(response.bytes().await?)
        }
        .await;

        match result {
            Ok(bytes) => LoadOutcome::Loaded(bytes),
            Err(error) => {
                warn!(url = %url, error = %error, "playlist load failed");
                LoadOutcome::Failed(LoadError::from(error))
            }
        }
    }
}

// --- Unit Tests ---
