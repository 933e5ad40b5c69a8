// Sliding-window manager: owns every in-flight segment transfer, slides the
// window around the consumer's requests and serves completed payloads. All
// window state lives behind one task, so request de-duplication and the
// served-from-cache check never race transfer completion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::WindowConfig;
use crate::error::PrefetchError;
use crate::playlist::SegmentPlaylist;
use crate::policy::{Health, bytes_per_sec_to_mbit, evaluate_health};
use crate::stats::{SegmentRow, WindowSnapshot, WindowStats};
use crate::transfer::{
    SegmentDownloader, TransferEvent, TransferHandle, TransferSpec, override_extension,
    spawn_transfer,
};

const COMMAND_CHANNEL_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 64;

/// Commands accepted by the window manager task.
#[derive(Debug)]
enum WindowCommand {
    /// Serve one segment to the consumer, sliding the window around it.
    Request {
        index: u64,
        reply: oneshot::Sender<Result<Bytes, PrefetchError>>,
    },
    /// Deliver the resolved playlist, waking any parked requests.
    PlaylistReady { playlist: SegmentPlaylist },
    /// Drop a consumed segment from the window.
    Release { index: u64 },
    /// Abort every transfer the consumer is waiting on.
    ReleaseRequested,
}

/// Cloneable client handle to a running window manager.
#[derive(Debug, Clone)]
pub struct WindowHandle {
    commands: mpsc::Sender<WindowCommand>,
    snapshots: watch::Receiver<WindowSnapshot>,
    token: CancellationToken,
}

impl WindowHandle {
    /// Serve one segment, waiting until its transfer completes.
    ///
    /// Slides the window to `[index, index + window_size)`, aborting
    /// transfers that fell outside and starting the missing ones. Returns an
    /// independent copy of the payload; concurrent requests for the same
    /// index share a single underlying transfer.
    pub async fn request(&self, index: u64) -> Result<Bytes, PrefetchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(WindowCommand::Request {
                index,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PrefetchError::ChannelClosed {
                context: "segment request",
            })?;
        reply_rx.await.map_err(|_| PrefetchError::ChannelClosed {
            context: "segment reply",
        })?
    }

    /// Supply the segment playlist. Requests issued before this resolve are
    /// parked and replayed once the playlist arrives.
    pub async fn playlist_ready(&self, playlist: SegmentPlaylist) -> Result<(), PrefetchError> {
        self.commands
            .send(WindowCommand::PlaylistReady { playlist })
            .await
            .map_err(|_| PrefetchError::ChannelClosed {
                context: "playlist delivery",
            })
    }

    /// Drop a consumed segment so the window never re-serves it.
    pub async fn release(&self, index: u64) -> Result<(), PrefetchError> {
        self.commands
            .send(WindowCommand::Release { index })
            .await
            .map_err(|_| PrefetchError::ChannelClosed {
                context: "segment release",
            })
    }

    /// Abort every transfer the consumer is currently waiting on and start
    /// replacements past the window edge. Waiters observe
    /// [`PrefetchError::Aborted`].
    pub async fn release_requested(&self) -> Result<(), PrefetchError> {
        self.commands
            .send(WindowCommand::ReleaseRequested)
            .await
            .map_err(|_| PrefetchError::ChannelClosed {
                context: "window release",
            })
    }

    /// Latest published window snapshot.
    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Live snapshot feed for status displays.
    pub fn watch_snapshots(&self) -> watch::Receiver<WindowSnapshot> {
        self.snapshots.clone()
    }

    /// Tear the window down. Every transfer is aborted and in-flight
    /// requests resolve with an error.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Pending,
    Running,
    /// Between a failed attempt and its backed-off reissue
    Failed,
    Completed,
}

/// Manager-side record of one windowed transfer.
struct SegmentTransfer {
    index: u64,
    /// Spawn generation of the owning runner. Events stamped with an older
    /// generation belong to an evicted runner and are dropped.
    generation: u64,
    url: Url,
    handle: TransferHandle,
    state: TransferState,
    bytes_received: u64,
    bytes_total: Option<u64>,
    first_byte_at: Option<Instant>,
    /// bytes/sec over the current attempt, zero until measurable
    speed: f64,
    health: Health,
    /// The consumer is waiting on this segment
    requested: bool,
    retries: u32,
    /// Set between a slowness retry command and the runner's next start;
    /// progress from the dying attempt is ignored while set, so one slow
    /// episode triggers exactly one retry.
    awaiting_retry: bool,
    response: Option<Bytes>,
    waiters: Vec<oneshot::Sender<Result<Bytes, PrefetchError>>>,
}

impl SegmentTransfer {
    fn new(index: u64, generation: u64, url: Url, handle: TransferHandle) -> Self {
        Self {
            index,
            generation,
            url,
            handle,
            state: TransferState::Pending,
            bytes_received: 0,
            bytes_total: None,
            first_byte_at: None,
            speed: 0.0,
            health: Health::Wait,
            requested: false,
            retries: 0,
            awaiting_retry: false,
            response: None,
            waiters: Vec::new(),
        }
    }

    fn reset_measurement(&mut self) {
        self.bytes_received = 0;
        self.bytes_total = None;
        self.first_byte_at = None;
        self.speed = 0.0;
        self.health = Health::Wait;
    }

    /// Hand out an independent copy of the completed payload. The window
    /// keeps its own buffer, so one caller can never observe another's
    /// slice.
    fn copy_response(&self) -> Result<Bytes, PrefetchError> {
        if self.state != TransferState::Completed {
            return Err(PrefetchError::contract_violation(format!(
                "segment {} served before completion",
                self.index
            )));
        }
        match self.response.as_ref() {
            Some(bytes) if !bytes.is_empty() => Ok(Bytes::copy_from_slice(bytes)),
            Some(_) => Err(PrefetchError::contract_violation(format!(
                "segment {} completed with an empty payload",
                self.index
            ))),
            None => Err(PrefetchError::contract_violation(format!(
                "segment {} completed without a payload",
                self.index
            ))),
        }
    }

    fn progress(&self) -> Option<f64> {
        if self.state == TransferState::Completed {
            return Some(1.0);
        }
        match self.bytes_total {
            Some(total) if total > 0 => Some(self.bytes_received as f64 / total as f64),
            _ => None,
        }
    }
}

/// Cancel a transfer's runner and fail its waiters. Returns the runner
/// task so teardown can wait it out; eviction paths drop the handle and
/// let the runner wind down on its own.
fn abort_transfer(transfer: SegmentTransfer) -> JoinHandle<()> {
    transfer.handle.abort();
    for waiter in transfer.waiters {
        let _ = waiter.send(Err(PrefetchError::Aborted));
    }
    transfer.handle.task
}

/// The window manager task. Spawn with [`WindowManager::spawn`] and drive it
/// through the returned [`WindowHandle`].
pub struct WindowManager {
    config: WindowConfig,
    downloader: Arc<dyn SegmentDownloader>,
    playlist: Option<Arc<SegmentPlaylist>>,
    segments: BTreeMap<u64, SegmentTransfer>,
    /// Monotonic spawn counter stamped onto every transfer and its events.
    next_generation: u64,
    stats: WindowStats,
    requested_index: Option<u64>,
    parked: Vec<(u64, oneshot::Sender<Result<Bytes, PrefetchError>>)>,
    command_rx: mpsc::Receiver<WindowCommand>,
    event_tx: mpsc::Sender<TransferEvent>,
    event_rx: mpsc::Receiver<TransferEvent>,
    snapshot_tx: watch::Sender<WindowSnapshot>,
    token: CancellationToken,
    started_at: Instant,
}

impl WindowManager {
    /// Spawn the manager task and return its handle. Cancelling `token`
    /// tears the whole window down; transfers run on child tokens.
    pub fn spawn(
        config: WindowConfig,
        downloader: Arc<dyn SegmentDownloader>,
        token: CancellationToken,
    ) -> WindowHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (snapshot_tx, snapshots) = watch::channel(WindowSnapshot::default());

        let manager = Self {
            config,
            downloader,
            playlist: None,
            segments: BTreeMap::new(),
            next_generation: 0,
            stats: WindowStats::default(),
            requested_index: None,
            parked: Vec::new(),
            command_rx,
            event_tx,
            event_rx,
            snapshot_tx,
            token: token.clone(),
            started_at: Instant::now(),
        };
        tokio::spawn(manager.run());

        WindowHandle {
            commands: command_tx,
            snapshots,
            token,
        }
    }

    async fn run(mut self) {
        info!(
            window_size = self.config.window_size,
            policy = ?self.config.retry_policy,
            "window manager started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.teardown().await;
                    break;
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                    self.publish_snapshot();
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            self.handle_command(command);
                            self.publish_snapshot();
                        }
                        None => {
                            // Every handle dropped
                            self.teardown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("window manager stopped");
    }

    fn handle_command(&mut self, command: WindowCommand) {
        match command {
            WindowCommand::Request { index, reply } => self.handle_request(index, reply),
            WindowCommand::PlaylistReady { playlist } => {
                if self.playlist.is_some() {
                    warn!("playlist already delivered, keeping the original");
                    return;
                }
                info!(segments = playlist.len(), "playlist ready");
                self.playlist = Some(Arc::new(playlist));
                for (index, reply) in std::mem::take(&mut self.parked) {
                    self.handle_request(index, reply);
                }
            }
            WindowCommand::Release { index } => self.release(index),
            WindowCommand::ReleaseRequested => self.release_requested(),
        }
    }

    fn handle_request(&mut self, index: u64, reply: oneshot::Sender<Result<Bytes, PrefetchError>>) {
        self.requested_index = Some(index);

        let Some(playlist) = self.playlist.clone() else {
            debug!(index, "request parked until the playlist arrives");
            self.parked.push((index, reply));
            return;
        };
        if !playlist.contains(index) {
            let _ = reply.send(Err(PrefetchError::playlist(format!(
                "segment {index} is beyond the playlist end ({} segments)",
                playlist.len()
            ))));
            self.requested_index = None;
            return;
        }

        self.slide_and_fill(index, &playlist);

        let served = {
            let Some(transfer) = self.segments.get_mut(&index) else {
                let _ = reply.send(Err(PrefetchError::contract_violation(format!(
                    "segment {index} missing from the window after fill"
                ))));
                return;
            };
            transfer.requested = true;
            if transfer.state == TransferState::Completed {
                let _ = reply.send(transfer.copy_response());
                true
            } else {
                transfer.waiters.push(reply);
                false
            }
        };

        if served {
            trace!(index, "request served from the window");
            self.requested_index = None;
            self.schedule_successor(&playlist);
        }
    }

    /// Abort transfers outside `[index, index + window_size)` and start the
    /// in-range ones that are missing, clamped at the playlist end.
    fn slide_and_fill(&mut self, index: u64, playlist: &SegmentPlaylist) {
        let window_end = index.saturating_add(self.config.window_size as u64);

        let evicted: Vec<u64> = self
            .segments
            .keys()
            .copied()
            .filter(|k| *k < index || *k >= window_end)
            .collect();
        for old in evicted {
            if let Some(transfer) = self.segments.remove(&old) {
                trace!(index = old, "window slid past transfer");
                let _ = abort_transfer(transfer);
            }
        }

        for missing in index..window_end {
            if self.segments.contains_key(&missing) {
                continue;
            }
            let Some(descriptor) = playlist.get(missing) else {
                break;
            };
            let url = descriptor.url.clone();
            self.create_transfer(missing, &url);
        }

        self.recompute_stats();
    }

    /// Start one transfer past the window's maximum index, keeping the
    /// pipeline full while the consumer drains in order.
    fn schedule_successor(&mut self, playlist: &SegmentPlaylist) {
        let Some(max_index) = self.segments.keys().next_back().copied() else {
            return;
        };
        let next = max_index + 1;
        if let Some(descriptor) = playlist.get(next) {
            trace!(index = next, "prefetching past the window edge");
            let url = descriptor.url.clone();
            self.create_transfer(next, &url);
        }
    }

    fn create_transfer(&mut self, index: u64, url: &Url) {
        let url = match self.config.url_extension_override.as_deref() {
            Some(extension) => override_extension(url, extension),
            None => url.clone(),
        };
        let generation = self.next_generation;
        self.next_generation += 1;
        debug!(index, url = %url, "starting transfer");
        let spec = TransferSpec {
            index,
            generation,
            url: url.clone(),
            advanced_segment_search: self.config.advanced_segment_search,
            suppress_cache: self.config.suppress_cache,
            error_backoff: self.config.error_backoff,
            max_retries: self.config.max_retries,
        };
        let handle = spawn_transfer(
            Arc::clone(&self.downloader),
            spec,
            self.event_tx.clone(),
            &self.token,
        );
        self.segments
            .insert(index, SegmentTransfer::new(index, generation, url, handle));
    }

    fn release(&mut self, index: u64) {
        if let Some(transfer) = self.segments.remove(&index) {
            trace!(index, "segment released");
            let _ = abort_transfer(transfer);
            self.recompute_stats();
        }
    }

    fn release_requested(&mut self) {
        for (index, reply) in std::mem::take(&mut self.parked) {
            debug!(index, "aborting parked request");
            let _ = reply.send(Err(PrefetchError::Aborted));
        }

        let playlist = self.playlist.clone();
        let requested: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, transfer)| transfer.requested)
            .map(|(index, _)| *index)
            .collect();
        if !requested.is_empty() {
            info!(count = requested.len(), "aborting requested transfers");
            for index in requested {
                if let Some(transfer) = self.segments.remove(&index) {
                    let _ = abort_transfer(transfer);
                    if let Some(playlist) = &playlist {
                        self.schedule_successor(playlist);
                    }
                }
            }
        }
        self.requested_index = None;
        self.recompute_stats();
    }

    fn handle_event(&mut self, event: TransferEvent) {
        // The manager always removes a record before cancelling its runner,
        // so a live record at the event's index with another generation
        // belongs to a replacement spawn. The evicted runner's leftovers
        // must not touch it.
        if let Some(transfer) = self.segments.get(&event.index()) {
            if transfer.generation != event.generation() {
                trace!(
                    index = event.index(),
                    "dropping event from a superseded runner"
                );
                return;
            }
        }

        match event {
            TransferEvent::Started { index, attempt, .. } => {
                if let Some(transfer) = self.segments.get_mut(&index) {
                    transfer.state = TransferState::Running;
                    transfer.retries = attempt;
                    transfer.awaiting_retry = false;
                    transfer.reset_measurement();
                    self.recompute_stats();
                }
            }
            TransferEvent::Progress {
                index,
                loaded,
                total,
                first_byte_at,
                ..
            } => self.on_progress(index, loaded, total, first_byte_at),
            TransferEvent::UrlRewritten { index, url, .. } => {
                if let Some(transfer) = self.segments.get_mut(&index) {
                    transfer.url = url;
                }
            }
            TransferEvent::Completed { index, bytes, .. } => self.on_completed(index, bytes),
            TransferEvent::Failed {
                index,
                attempts,
                error,
                fatal,
                ..
            } => self.on_failed(index, attempts, error, fatal),
            TransferEvent::Aborted { index, .. } => {
                if let Some(transfer) = self.segments.remove(&index) {
                    // A runner cancelled without the manager removing it
                    // first; resolve its waiters so nobody hangs
                    for waiter in transfer.waiters {
                        let _ = waiter.send(Err(PrefetchError::Aborted));
                    }
                    self.recompute_stats();
                } else {
                    trace!(index, "abort acknowledged");
                }
            }
        }
    }

    fn on_progress(&mut self, index: u64, loaded: u64, total: Option<u64>, first_byte_at: Instant) {
        {
            let Some(transfer) = self.segments.get_mut(&index) else {
                return;
            };
            if transfer.awaiting_retry || transfer.state != TransferState::Running {
                // Stale chunk from an attempt we already asked to drop
                return;
            }
            transfer.bytes_received = loaded;
            transfer.bytes_total = total;
            transfer.first_byte_at = Some(first_byte_at);
            let elapsed = first_byte_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                transfer.speed = loaded as f64 / elapsed;
            }
        }
        self.recompute_stats();
        self.apply_retry_policy(index);
    }

    /// Judge one running transfer against the retry policy and reissue it
    /// when it falls below the threshold. The health is reset to `Wait`
    /// alongside the retry command, so a slow episode fires a single retry
    /// and the fresh attempt warms up under a new grace period.
    fn apply_retry_policy(&mut self, index: u64) {
        if !self.config.retry_policy.is_active() {
            return;
        }
        let average = self.stats.average_speed;
        let Some(transfer) = self.segments.get_mut(&index) else {
            return;
        };
        if transfer.state != TransferState::Running || transfer.awaiting_retry {
            return;
        }

        let elapsed = transfer.first_byte_at.map(|at| at.elapsed());
        transfer.health = evaluate_health(
            &self.config.retry_policy,
            elapsed,
            self.config.grace_period,
            transfer.speed,
            average,
            self.config.window_size,
        );
        if transfer.health != Health::Bad {
            return;
        }
        if transfer.retries >= self.config.max_retries {
            debug!(
                index,
                retries = transfer.retries,
                "slow transfer at the attempt ceiling, letting it run"
            );
            return;
        }

        warn!(
            index,
            speed_mbit = %format!("{:.2}", bytes_per_sec_to_mbit(transfer.speed)),
            "transfer below the policy threshold, reissuing"
        );
        transfer.awaiting_retry = true;
        transfer.reset_measurement();
        transfer.handle.request_retry();
        self.recompute_stats();
    }

    fn on_completed(&mut self, index: u64, bytes: Bytes) {
        let playlist = self.playlist.clone();
        let served = {
            let Some(transfer) = self.segments.get_mut(&index) else {
                trace!(index, "completion for an evicted transfer dropped");
                return;
            };
            debug!(index, size = bytes.len(), "segment completed");
            transfer.state = TransferState::Completed;
            transfer.awaiting_retry = false;
            transfer.bytes_received = bytes.len() as u64;
            transfer.bytes_total = Some(bytes.len() as u64);
            transfer.response = Some(bytes);
            let waiters = std::mem::take(&mut transfer.waiters);
            let served = !waiters.is_empty();
            for waiter in waiters {
                let _ = waiter.send(transfer.copy_response());
            }
            served
        };

        if served {
            if self.requested_index == Some(index) {
                self.requested_index = None;
            }
            if let Some(playlist) = &playlist {
                self.schedule_successor(playlist);
            }
        }
        self.recompute_stats();
    }

    fn on_failed(&mut self, index: u64, attempts: u32, error: PrefetchError, fatal: bool) {
        if !fatal {
            if let Some(transfer) = self.segments.get_mut(&index) {
                debug!(index, attempts, error = %error, "attempt failed, backing off");
                transfer.state = TransferState::Failed;
                transfer.retries = attempts;
                transfer.reset_measurement();
                self.recompute_stats();
            }
            return;
        }

        let Some(transfer) = self.segments.remove(&index) else {
            return;
        };
        warn!(index, attempts, url = %transfer.url, error = %error, "transfer failed");
        for waiter in transfer.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        if self.requested_index == Some(index) {
            self.requested_index = None;
        }
        self.recompute_stats();
    }

    async fn teardown(&mut self) {
        if !self.segments.is_empty() || !self.parked.is_empty() {
            debug!(
                transfers = self.segments.len(),
                parked = self.parked.len(),
                "tearing down the window"
            );
        }
        let runners: Vec<JoinHandle<()>> = std::mem::take(&mut self.segments)
            .into_values()
            .map(abort_transfer)
            .collect();
        for (_, reply) in self.parked.drain(..) {
            let _ = reply.send(Err(PrefetchError::PlaylistUnavailable));
        }
        self.requested_index = None;
        self.recompute_stats();
        self.publish_snapshot();

        // Wait the cancelled runners out so the manager never outlives its
        // own children. Events are drained alongside; a runner blocked on a
        // full event channel could otherwise never exit.
        for mut runner in runners {
            loop {
                tokio::select! {
                    _ = &mut runner => break,
                    Some(_) = self.event_rx.recv() => {}
                }
            }
        }
    }

    fn recompute_stats(&mut self) {
        self.stats = WindowStats::from_speeds(self.segments.values().map(|t| t.speed));
    }

    fn publish_snapshot(&self) {
        let rows = self
            .segments
            .values()
            .map(|transfer| SegmentRow {
                index: transfer.index,
                speed: transfer.speed,
                speed_ratio: self.stats.speed_ratio(transfer.speed),
                health: transfer.health,
                requested: transfer.requested,
                loaded: transfer.state == TransferState::Completed,
                progress: transfer.progress(),
                retries: transfer.retries,
            })
            .collect();
        let _ = self.snapshot_tx.send(WindowSnapshot {
            rows,
            stats: self.stats,
            requested_index: self.requested_index,
            elapsed: self.started_at.elapsed(),
        });
    }
}
