// Segment transfer runner: drives every fetch attempt for one windowed
// segment and reports upward through an event channel. Runners never touch
// shared state; the window manager owns all bookkeeping and serializes
// events before observing them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, EXPIRES, HeaderMap, HeaderValue, PRAGMA};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::PrefetchError;

/// Everything a runner needs to drive one segment transfer. The URL already
/// carries any configured extension override.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub index: u64,
    /// Spawn generation; distinguishes this runner from any earlier one
    /// the manager started at the same index.
    pub generation: u64,
    pub url: Url,
    pub advanced_segment_search: bool,
    pub suppress_cache: bool,
    pub error_backoff: Duration,
    pub max_retries: u32,
}

/// Notifications flowing from runners to the window manager. Every event
/// echoes the spawn generation of its runner; the manager drops events
/// whose generation no longer matches its record at that index, so an
/// evicted runner's leftovers can never be charged to a replacement
/// transfer.
#[derive(Debug)]
pub enum TransferEvent {
    /// A GET was issued. Sent once per attempt; the manager resets the
    /// transfer's measurement state when it sees this.
    Started {
        index: u64,
        generation: u64,
        attempt: u32,
    },
    /// Body chunk received. `first_byte_at` is the timestamp of the current
    /// attempt's first chunk, so elapsed-time math excludes connection setup.
    Progress {
        index: u64,
        generation: u64,
        loaded: u64,
        total: Option<u64>,
        first_byte_at: Instant,
    },
    /// The 404 fallback probe rewrote the transfer's URL.
    UrlRewritten {
        index: u64,
        generation: u64,
        url: Url,
    },
    Completed {
        index: u64,
        generation: u64,
        bytes: Bytes,
    },
    /// An attempt failed. When `fatal` is false the runner backs off and
    /// reissues the request on its own.
    Failed {
        index: u64,
        generation: u64,
        attempts: u32,
        error: PrefetchError,
        fatal: bool,
    },
    /// Cancellation observed. Distinct from `Failed` so teardown never
    /// races a spurious retry.
    Aborted { index: u64, generation: u64 },
}

impl TransferEvent {
    /// Index of the transfer the event belongs to.
    pub fn index(&self) -> u64 {
        match self {
            TransferEvent::Started { index, .. }
            | TransferEvent::Progress { index, .. }
            | TransferEvent::UrlRewritten { index, .. }
            | TransferEvent::Completed { index, .. }
            | TransferEvent::Failed { index, .. }
            | TransferEvent::Aborted { index, .. } => *index,
        }
    }

    /// Spawn generation of the runner that emitted the event.
    pub fn generation(&self) -> u64 {
        match self {
            TransferEvent::Started { generation, .. }
            | TransferEvent::Progress { generation, .. }
            | TransferEvent::UrlRewritten { generation, .. }
            | TransferEvent::Completed { generation, .. }
            | TransferEvent::Failed { generation, .. }
            | TransferEvent::Aborted { generation, .. } => *generation,
        }
    }
}

/// Manager-to-runner control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCommand {
    /// Drop the in-flight request and reissue it immediately.
    Retry,
}

/// Outcome of a single fetch attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Full payload received
    Completed(Bytes),
    /// Response arrived with a non-success status
    Status(StatusCode),
    /// Connection or mid-stream failure
    Failed(PrefetchError),
}

/// One GET issued by a runner.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub index: u64,
    /// Spawn generation of the issuing runner, echoed on progress events.
    pub generation: u64,
    pub url: Url,
    pub suppress_cache: bool,
}

/// Transport seam between the runner loop and real HTTP. Implementations
/// execute exactly one attempt and stream progress through `events`.
#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    async fn download(
        &self,
        request: &AttemptRequest,
        events: &mpsc::Sender<TransferEvent>,
    ) -> AttemptOutcome;
}

/// Manager-side handle to a spawned runner.
#[derive(Debug)]
pub struct TransferHandle {
    pub commands: mpsc::Sender<TransferCommand>,
    token: CancellationToken,
    /// Joined by the manager at teardown; eviction paths drop the handle
    /// and let the cancelled runner wind down on its own.
    pub task: tokio::task::JoinHandle<()>,
}

impl TransferHandle {
    /// Request cooperative cancellation. The runner still emits its
    /// `Aborted` event through the channel.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Ask the runner to drop the in-flight request and reissue it. Best
    /// effort; a runner that already finished simply never reads it.
    pub fn request_retry(&self) {
        let _ = self.commands.try_send(TransferCommand::Retry);
    }
}

/// Spawn the runner task for one segment transfer.
pub fn spawn_transfer(
    downloader: Arc<dyn SegmentDownloader>,
    spec: TransferSpec,
    events: mpsc::Sender<TransferEvent>,
    parent: &CancellationToken,
) -> TransferHandle {
    let token = parent.child_token();
    let (command_tx, command_rx) = mpsc::channel(4);
    let task = tokio::spawn(run_transfer(
        downloader,
        spec,
        events,
        command_rx,
        token.clone(),
    ));
    TransferHandle {
        commands: command_tx,
        token,
        task,
    }
}

/// What the runner should do with a finished attempt's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptAction {
    RewriteAndRetry,
    RetryAfterBackoff,
    Fail,
}

fn classify_status(status: StatusCode, advanced_search: bool, rewritten: bool) -> AttemptAction {
    if status == StatusCode::NOT_FOUND {
        if advanced_search && !rewritten {
            AttemptAction::RewriteAndRetry
        } else if rewritten {
            // A second miss after the probe is a hard failure, never a
            // further transform.
            AttemptAction::Fail
        } else {
            AttemptAction::RetryAfterBackoff
        }
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptAction::RetryAfterBackoff
    } else {
        // Remaining client errors: a retry will not change the answer
        AttemptAction::Fail
    }
}

async fn run_transfer(
    downloader: Arc<dyn SegmentDownloader>,
    spec: TransferSpec,
    events: mpsc::Sender<TransferEvent>,
    mut commands: mpsc::Receiver<TransferCommand>,
    token: CancellationToken,
) {
    let index = spec.index;
    let generation = spec.generation;
    let mut url = spec.url.clone();
    let mut attempt: u32 = 0;
    let mut rewritten = false;

    loop {
        if events
            .send(TransferEvent::Started {
                index,
                generation,
                attempt,
            })
            .await
            .is_err()
        {
            // Manager already gone
            return;
        }

        let request = AttemptRequest {
            index,
            generation,
            url: url.clone(),
            suppress_cache: spec.suppress_cache,
        };

        let outcome = {
            let fetch = downloader.download(&request, &events);
            tokio::pin!(fetch);
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let _ = events.send(TransferEvent::Aborted { index, generation }).await;
                    return;
                }
                command = commands.recv() => {
                    match command {
                        Some(TransferCommand::Retry) => {
                            debug!(index, attempt, "dropping slow attempt for retry");
                            attempt += 1;
                            continue;
                        }
                        None => {
                            let _ = events.send(TransferEvent::Aborted { index, generation }).await;
                            return;
                        }
                    }
                }
                outcome = &mut fetch => outcome,
            }
        };

        match outcome {
            AttemptOutcome::Completed(bytes) => {
                debug!(index, size = bytes.len(), "transfer completed");
                let _ = events
                    .send(TransferEvent::Completed {
                        index,
                        generation,
                        bytes,
                    })
                    .await;
                return;
            }
            AttemptOutcome::Status(status) => {
                match classify_status(status, spec.advanced_segment_search, rewritten) {
                    AttemptAction::RewriteAndRetry => {
                        if let Some(next) = toggle_muted_suffix(&url) {
                            warn!(index, from = %url, to = %next, "segment missing, probing muted variant");
                            rewritten = true;
                            attempt += 1;
                            url = next.clone();
                            let _ = events
                                .send(TransferEvent::UrlRewritten {
                                    index,
                                    generation,
                                    url: next,
                                })
                                .await;
                            continue;
                        }
                        // Nothing to rewrite; fall through to a hard failure
                        let _ = events
                            .send(TransferEvent::Failed {
                                index,
                                generation,
                                attempts: attempt + 1,
                                error: PrefetchError::http_status(status, url.as_str()),
                                fatal: true,
                            })
                            .await;
                        return;
                    }
                    AttemptAction::Fail => {
                        let _ = events
                            .send(TransferEvent::Failed {
                                index,
                                generation,
                                attempts: attempt + 1,
                                error: PrefetchError::http_status(status, url.as_str()),
                                fatal: true,
                            })
                            .await;
                        return;
                    }
                    AttemptAction::RetryAfterBackoff => {
                        if attempt >= spec.max_retries {
                            let _ = events
                                .send(TransferEvent::Failed {
                                    index,
                                    generation,
                                    attempts: attempt + 1,
                                    error: PrefetchError::retries_exhausted(
                                        index,
                                        attempt + 1,
                                        format!("HTTP {status} from {url}"),
                                    ),
                                    fatal: true,
                                })
                                .await;
                            return;
                        }
                        let _ = events
                            .send(TransferEvent::Failed {
                                index,
                                generation,
                                attempts: attempt + 1,
                                error: PrefetchError::http_status(status, url.as_str()),
                                fatal: false,
                            })
                            .await;
                        if !wait_backoff(
                            &token,
                            &mut commands,
                            spec.error_backoff,
                            index,
                            generation,
                            &events,
                        )
                        .await
                        {
                            return;
                        }
                        attempt += 1;
                    }
                }
            }
            AttemptOutcome::Failed(error) => {
                if error.is_retryable() && attempt < spec.max_retries {
                    let _ = events
                        .send(TransferEvent::Failed {
                            index,
                            generation,
                            attempts: attempt + 1,
                            error,
                            fatal: false,
                        })
                        .await;
                    if !wait_backoff(
                        &token,
                        &mut commands,
                        spec.error_backoff,
                        index,
                        generation,
                        &events,
                    )
                    .await
                    {
                        return;
                    }
                    attempt += 1;
                } else {
                    let error = if error.is_retryable() {
                        PrefetchError::retries_exhausted(index, attempt + 1, error.to_string())
                    } else {
                        error
                    };
                    let _ = events
                        .send(TransferEvent::Failed {
                            index,
                            generation,
                            attempts: attempt + 1,
                            error,
                            fatal: true,
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

/// Sleep out the error backoff. Returns false when the transfer was
/// cancelled instead; a retry command cuts the wait short.
async fn wait_backoff(
    token: &CancellationToken,
    commands: &mut mpsc::Receiver<TransferCommand>,
    delay: Duration,
    index: u64,
    generation: u64,
    events: &mpsc::Sender<TransferEvent>,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            let _ = events.send(TransferEvent::Aborted { index, generation }).await;
            false
        }
        command = commands.recv() => {
            match command {
                Some(TransferCommand::Retry) => true,
                None => {
                    let _ = events.send(TransferEvent::Aborted { index, generation }).await;
                    false
                }
            }
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

// --- HTTP transport ---

/// Production transport backed by the shared reqwest client.
pub struct HttpSegmentDownloader {
    client: Client,
}

impl HttpSegmentDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentDownloader for HttpSegmentDownloader {
    async fn download(
        &self,
        request: &AttemptRequest,
        events: &mpsc::Sender<TransferEvent>,
    ) -> AttemptOutcome {
        let mut builder = self.client.get(request.url.clone());
        if request.suppress_cache {
            builder = builder.headers(no_cache_headers());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::Failed(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            return AttemptOutcome::Status(status);
        }

        let total = response.content_length();
        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        let mut first_byte_at: Option<Instant> = None;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    let first = *first_byte_at.get_or_insert_with(Instant::now);
                    buffer.extend_from_slice(&chunk);
                    if events
                        .send(TransferEvent::Progress {
                            index: request.index,
                            generation: request.generation,
                            loaded: buffer.len() as u64,
                            total,
                            first_byte_at: first,
                        })
                        .await
                        .is_err()
                    {
                        // Manager gone; the runner will be cancelled shortly
                        return AttemptOutcome::Failed(PrefetchError::Aborted);
                    }
                }
                Err(e) => return AttemptOutcome::Failed(e.into()),
            }
        }

        AttemptOutcome::Completed(buffer.freeze())
    }
}

/// Request headers forcing revalidation on every hop.
fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, max-age=0"),
    );
    headers.insert(
        EXPIRES,
        HeaderValue::from_static("Thu, 1 Jan 1970 00:00:00 GMT"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

// --- URL helpers ---

fn rewrite_last_segment(url: &Url, rename: impl FnOnce(&str) -> String) -> Option<Url> {
    let last = url.path_segments()?.next_back()?.to_string();
    if last.is_empty() {
        return None;
    }
    let renamed = rename(&last);

    let mut rewritten = url.clone();
    {
        let mut path = rewritten.path_segments_mut().ok()?;
        path.pop();
        path.push(&renamed);
    }
    Some(rewritten)
}

/// Toggle the `-muted` stem suffix convention some origins use for muted
/// segment variants. Query parameters are preserved.
pub fn toggle_muted_suffix(url: &Url) -> Option<Url> {
    rewrite_last_segment(url, |name| {
        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, ext)) => (stem, Some(ext)),
            None => (name, None),
        };
        let toggled = match stem.strip_suffix("-muted") {
            Some(base) => base.to_string(),
            None => format!("{stem}-muted"),
        };
        match extension {
            Some(ext) => format!("{toggled}.{ext}"),
            None => toggled,
        }
    })
}

/// Force `extension` onto the URL's final path segment.
pub fn override_extension(url: &Url, extension: &str) -> Url {
    let extension = extension.trim_start_matches('.');
    rewrite_last_segment(url, |name| {
        let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
        format!("{stem}.{extension}")
    })
    .unwrap_or_else(|| url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    // --- Unit Tests ---

    #[test]
    fn test_classify_404_with_advanced_search() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, true, false),
            AttemptAction::RewriteAndRetry
        );
        // Second miss after the probe
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, true, true),
            AttemptAction::Fail
        );
    }

    #[test]
    fn test_classify_404_without_advanced_search() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, false, false),
            AttemptAction::RetryAfterBackoff
        );
    }

    #[test]
    fn test_classify_server_errors_retry() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, false, false),
            AttemptAction::RetryAfterBackoff
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, true, false),
            AttemptAction::RetryAfterBackoff
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false, false),
            AttemptAction::RetryAfterBackoff
        );
    }

    #[test]
    fn test_classify_client_errors_fail() {
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, true, false),
            AttemptAction::Fail
        );
        assert_eq!(
            classify_status(StatusCode::GONE, false, false),
            AttemptAction::Fail
        );
    }

    #[test]
    fn test_toggle_muted_suffix_roundtrip() {
        let original = url("https://cdn.example.com/vod/chunk-3.ts");
        let muted = toggle_muted_suffix(&original).unwrap();
        assert_eq!(muted.as_str(), "https://cdn.example.com/vod/chunk-3-muted.ts");

        let back = toggle_muted_suffix(&muted).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_toggle_muted_suffix_preserves_query() {
        let original = url("https://cdn.example.com/vod/7.ts?token=abc");
        let muted = toggle_muted_suffix(&original).unwrap();
        assert_eq!(muted.as_str(), "https://cdn.example.com/vod/7-muted.ts?token=abc");
    }

    #[test]
    fn test_toggle_muted_suffix_without_extension() {
        let original = url("https://cdn.example.com/vod/7");
        let muted = toggle_muted_suffix(&original).unwrap();
        assert_eq!(muted.as_str(), "https://cdn.example.com/vod/7-muted");
    }

    #[test]
    fn test_toggle_muted_suffix_no_file_component() {
        assert!(toggle_muted_suffix(&url("https://cdn.example.com/")).is_none());
    }

    #[test]
    fn test_override_extension() {
        let original = url("https://cdn.example.com/vod/chunk-3.ts?sig=1");
        let forced = override_extension(&original, "mp4");
        assert_eq!(forced.as_str(), "https://cdn.example.com/vod/chunk-3.mp4?sig=1");

        let forced = override_extension(&url("https://cdn.example.com/vod/chunk"), ".aac");
        assert_eq!(forced.as_str(), "https://cdn.example.com/vod/chunk.aac");
    }

    #[test]
    fn test_no_cache_headers() {
        let headers = no_cache_headers();
        assert_eq!(
            headers.get(CACHE_CONTROL).unwrap(),
            "no-cache, no-store, max-age=0"
        );
        assert_eq!(headers.get(PRAGMA).unwrap(), "no-cache");
        assert!(headers.contains_key(EXPIRES));
    }

    // --- Runner Tests ---

    enum ScriptStep {
        Outcome(AttemptOutcome),
        Hang,
    }

    struct ScriptedDownloader {
        steps: Mutex<VecDeque<ScriptStep>>,
    }

    impl ScriptedDownloader {
        fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
            })
        }
    }

    #[async_trait]
    impl SegmentDownloader for ScriptedDownloader {
        async fn download(
            &self,
            _request: &AttemptRequest,
            _events: &mpsc::Sender<TransferEvent>,
        ) -> AttemptOutcome {
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(ScriptStep::Outcome(outcome)) => outcome,
                Some(ScriptStep::Hang) | None => futures::future::pending().await,
            }
        }
    }

    fn spec(url_str: &str) -> TransferSpec {
        TransferSpec {
            index: 4,
            generation: 7,
            url: url(url_str),
            advanced_segment_search: true,
            suppress_cache: true,
            error_backoff: Duration::from_secs(5),
            max_retries: 2,
        }
    }

    async fn recv(events: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
        // Hang guard only; must exceed the 5s error_backoff in `spec()` so a
        // paused-clock auto-advance fires the runner's backoff timer first.
        tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for transfer event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_runner_completes_and_reports() {
        let downloader = ScriptedDownloader::new(vec![ScriptStep::Outcome(
            AttemptOutcome::Completed(Bytes::from_static(b"payload")),
        )]);
        let (tx, mut rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let handle = spawn_transfer(downloader, spec("https://cdn.example.com/4.ts"), tx, &root);

        assert!(matches!(
            recv(&mut rx).await,
            TransferEvent::Started {
                index: 4,
                generation: 7,
                attempt: 0
            }
        ));
        match recv(&mut rx).await {
            TransferEvent::Completed {
                index,
                generation,
                bytes,
            } => {
                assert_eq!(index, 4);
                assert_eq!(generation, 7);
                assert_eq!(bytes.as_ref(), b"payload");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_runner_rewrites_once_then_fails_hard() {
        let downloader = ScriptedDownloader::new(vec![
            ScriptStep::Outcome(AttemptOutcome::Status(StatusCode::NOT_FOUND)),
            ScriptStep::Outcome(AttemptOutcome::Status(StatusCode::NOT_FOUND)),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let handle = spawn_transfer(downloader, spec("https://cdn.example.com/4.ts"), tx, &root);

        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { attempt: 0, .. }));
        match recv(&mut rx).await {
            TransferEvent::UrlRewritten { url, .. } => {
                assert_eq!(url.as_str(), "https://cdn.example.com/4-muted.ts");
            }
            other => panic!("expected rewrite, got {other:?}"),
        }
        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { attempt: 1, .. }));
        match recv(&mut rx).await {
            TransferEvent::Failed { fatal, error, .. } => {
                assert!(fatal, "second miss must not retry");
                assert!(matches!(error, PrefetchError::HttpStatus { .. }));
            }
            other => panic!("expected hard failure, got {other:?}"),
        }
        handle.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_backs_off_on_server_error() {
        let downloader = ScriptedDownloader::new(vec![
            ScriptStep::Outcome(AttemptOutcome::Status(StatusCode::BAD_GATEWAY)),
            ScriptStep::Outcome(AttemptOutcome::Completed(Bytes::from_static(b"x"))),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let handle = spawn_transfer(downloader, spec("https://cdn.example.com/4.ts"), tx, &root);

        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { attempt: 0, .. }));
        assert!(matches!(
            recv(&mut rx).await,
            TransferEvent::Failed { fatal: false, .. }
        ));
        // Paused clock jumps over the 5s backoff once the runner sleeps
        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { attempt: 1, .. }));
        assert!(matches!(recv(&mut rx).await, TransferEvent::Completed { .. }));
        handle.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_exhausts_retries() {
        let downloader = ScriptedDownloader::new(vec![
            ScriptStep::Outcome(AttemptOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR)),
            ScriptStep::Outcome(AttemptOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR)),
            ScriptStep::Outcome(AttemptOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR)),
        ]);
        let (tx, mut rx) = mpsc::channel(32);
        let root = CancellationToken::new();
        // max_retries = 2 allows attempts 0, 1 and 2
        let handle = spawn_transfer(downloader, spec("https://cdn.example.com/4.ts"), tx, &root);

        let mut fatal_error = None;
        while let Some(event) = rx.recv().await {
            if let TransferEvent::Failed { fatal: true, error, attempts, .. } = event {
                assert_eq!(attempts, 3);
                fatal_error = Some(error);
                break;
            }
        }
        assert!(matches!(
            fatal_error,
            Some(PrefetchError::RetriesExhausted { index: 4, .. })
        ));
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_runner_abort_reports_aborted_not_failed() {
        let downloader = ScriptedDownloader::new(vec![ScriptStep::Hang]);
        let (tx, mut rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let handle = spawn_transfer(downloader, spec("https://cdn.example.com/4.ts"), tx, &root);

        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { .. }));
        handle.abort();
        assert!(matches!(
            recv(&mut rx).await,
            TransferEvent::Aborted {
                index: 4,
                generation: 7
            }
        ));
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_runner_retry_command_reissues_request() {
        let downloader = ScriptedDownloader::new(vec![
            ScriptStep::Hang,
            ScriptStep::Outcome(AttemptOutcome::Completed(Bytes::from_static(b"y"))),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let handle = spawn_transfer(downloader, spec("https://cdn.example.com/4.ts"), tx, &root);

        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { attempt: 0, .. }));
        handle.request_retry();
        assert!(matches!(recv(&mut rx).await, TransferEvent::Started { attempt: 1, .. }));
        assert!(matches!(recv(&mut rx).await, TransferEvent::Completed { .. }));
        handle.task.await.unwrap();
    }
}
