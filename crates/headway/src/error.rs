use reqwest::StatusCode;

/// Error taxonomy for the prefetch engine.
///
/// `Clone` so one terminal failure can be fanned out to every waiter of a
/// de-duplicated request; the transport source is flattened to its message
/// for that reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrefetchError {
    #[error("transfer aborted")]
    Aborted,

    #[error("HTTP request failed: {reason}")]
    Network { reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("transfer for segment {index} gave up after {attempts} attempts: {reason}")]
    RetriesExhausted {
        index: u64,
        attempts: u32,
        reason: String,
    },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("playlist not available")]
    PlaylistUnavailable,

    #[error("window invariant violated: {detail}")]
    ContractViolation { detail: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("prefetch engine stopped while waiting on {context}")]
    ChannelClosed { context: &'static str },
}

impl PrefetchError {
    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn retries_exhausted(index: u64, attempts: u32, reason: impl Into<String>) -> Self {
        Self::RetriesExhausted {
            index,
            attempts,
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn contract_violation(detail: impl Into<String>) -> Self {
        Self::ContractViolation {
            detail: detail.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Caller-initiated cancellation, as opposed to a network failure.
    ///
    /// Hosts use this to suppress user-visible error reporting when the
    /// cancellation was intentional (seek, teardown).
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Fatal invariant breach inside the window manager itself.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Aborted
            | Self::InvalidUrl { .. }
            | Self::PlaylistUnavailable
            | Self::ContractViolation { .. }
            | Self::Configuration { .. }
            | Self::ChannelClosed { .. }
            | Self::RetriesExhausted { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { .. } | Self::Playlist { .. } => true,
        }
    }
}

impl From<reqwest::Error> for PrefetchError {
    fn from(source: reqwest::Error) -> Self {
        Self::Network {
            reason: source.to_string(),
        }
    }
}
