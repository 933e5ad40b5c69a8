use std::time::Duration;

use crate::policy::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

// --- Window Configuration ---

/// Configuration for the sliding prefetch window.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Number of concurrent transfers held ahead of the consumer
    pub window_size: usize,
    /// Slow-connection retry policy
    pub retry_policy: RetryPolicy,
    /// Time a transfer may warm up before its health is judged
    pub grace_period: Duration,
    /// Delay before reissuing a request after a transport error
    pub error_backoff: Duration,
    /// Per-transfer attempt ceiling shared by error and slowness retries
    pub max_retries: u32,
    /// Enable 404 extension-fallback probing (single rewrite per transfer)
    pub advanced_segment_search: bool,
    /// Force a specific file extension on every segment request
    pub url_extension_override: Option<String>,
    /// Attach no-cache directives to segment requests
    pub suppress_cache: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 6,
            retry_policy: RetryPolicy::default(),
            grace_period: Duration::from_secs(8),
            error_backoff: Duration::from_secs(5),
            max_retries: 8,
            advanced_segment_search: false,
            url_extension_override: None,
            suppress_cache: true,
        }
    }
}

// --- HTTP Configuration ---

/// Configuration for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Overall request timeout. Zero disables it; segment transfers are
    /// paced by the retry policy, not a wall clock.
    pub timeout: Duration,
    pub follow_redirects: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::ZERO,
            follow_redirects: true,
        }
    }
}

// --- Top-Level Configuration ---

#[derive(Debug, Clone, Default)]
pub struct PrefetchConfig {
    pub window: WindowConfig,
    pub http: HttpConfig,
}
