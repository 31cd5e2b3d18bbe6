//! Playback buffer scheduler: the per-segment control loop.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::algorithms::{SelectionAlgorithm, SelectionContext};
use crate::buffer::{BufferState, PlaybackPhase};
use crate::config::{PlayerConfig, SourceRotation};
use crate::crosslayer::{CrossLayerAccountant, SegmentStart};
use crate::error::{PlayerError, PlayerResult};
use crate::history::{calculate_throughput, ThroughputHistory};
use crate::mpd::{Manifest, TrackKind, TrackManifest};
use crate::segment::{SegmentFetcher, SegmentRequest};
use crate::{PlayerEvent, SegmentDownloadRecord};

pub type PlayerCallback = Arc<dyn Fn(PlayerEvent) + Send + Sync>;

/// Totals over one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub segments: usize,
    pub stalls: usize,
    pub total_stall_ms: u64,
    pub switches: usize,
    pub predicted_stalls: usize,
    pub cancelled_fetches: usize,
    /// Mean of the per-segment throughput samples.
    pub average_throughput_bps: Option<f64>,
    /// Packet-level session average from the cross-layer accountant.
    pub crosslayer_throughput_bps: Option<f64>,
    /// Same as above over the last packets of the session only.
    pub recent_crosslayer_throughput_bps: Option<f64>,
}

/// Scheduler state of one track, owned by [`AbrPlayer::run`].
#[derive(Debug)]
struct TrackSession {
    kind: TrackKind,
    source: usize,
    algorithm: Box<dyn SelectionAlgorithm>,
    history: ThroughputHistory,
    buffer: BufferState,
    representation_index: usize,
    segment_number: u64,
    /// Media downloaded so far, in ms.
    downloaded_ms: u64,
    /// When the buffer was last brought up to date.
    last_mark: Instant,
    last_bandwidth: Option<u64>,
    init_fetched: HashSet<String>,
    finished: bool,
}

impl TrackSession {
    fn new(track: &TrackManifest, config: &PlayerConfig, now: Instant) -> Self {
        Self {
            kind: track.kind,
            source: 0,
            algorithm: config.algorithm.build(&config.tuning),
            history: ThroughputHistory::default(),
            buffer: BufferState::new(config.max_buffer_ms, config.init_buffer_segments),
            representation_index: track.ladder.lowest_index(),
            segment_number: track.start_number,
            downloaded_ms: 0,
            last_mark: now,
            last_bandwidth: None,
            init_fetched: HashSet::new(),
            finished: false,
        }
    }
}

pub struct AbrPlayer {
    config: PlayerConfig,
    sources: Vec<Manifest>,
    fetcher: Arc<dyn SegmentFetcher>,
    callback: Option<PlayerCallback>,
    accountant: Option<Arc<CrossLayerAccountant>>,
}

impl AbrPlayer {
    /// Validates the configuration and the manifests. `sources` are
    /// manifests of the same content; the first one starts the session.
    pub fn new(config: PlayerConfig, mut sources: Vec<Manifest>, fetcher: Arc<dyn SegmentFetcher>) -> PlayerResult<Self> {
        config.validate()?;
        if sources.is_empty() {
            return Err(PlayerError::config("at least one manifest is required"));
        }
        if let Some(empty) = sources.iter().find(|m| m.tracks.is_empty()) {
            return Err(PlayerError::config(format!("manifest {} has no tracks", empty.url)));
        }
        if let Some(max_height) = config.max_height {
            for track in sources.iter_mut().flat_map(|m| m.tracks.iter_mut()) {
                track.ladder = track.ladder.clone().limit_height(max_height);
            }
        }

        Ok(Self {
            config,
            sources,
            fetcher,
            callback: None,
            accountant: None,
        })
    }

    pub fn with_callback(mut self, callback: PlayerCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Attaches the cross-layer accountant. Stall prediction runs when the
    /// accountant was built with a predictor.
    pub fn with_accountant(mut self, accountant: Arc<CrossLayerAccountant>) -> Self {
        self.accountant = Some(accountant);
        self
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    fn emit(&self, event: PlayerEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    /// Streams every track round-robin, one segment per track per pass,
    /// until each track has downloaded the configured stream duration or run
    /// out of segments.
    #[instrument(skip_all, fields(algorithm = %self.config.algorithm))]
    pub async fn run(&self) -> PlayerResult<SessionSummary> {
        let session_start = Instant::now();
        let mut tracks: Vec<TrackSession> = self.sources[0]
            .tracks
            .iter()
            .map(|t| TrackSession::new(t, &self.config, session_start))
            .collect();
        let mut summary = SessionSummary::default();

        info!(
            max_buffer_ms = self.config.max_buffer_ms,
            init_buffer_segments = self.config.init_buffer_segments,
            stream_duration_ms = self.config.stream_duration_ms,
            tracks = tracks.len(),
            predict_stalls = self.accountant.as_ref().is_some_and(|a| a.predicts_stalls()),
            "Starting stream"
        );

        loop {
            for track in tracks.iter_mut().filter(|t| !t.finished) {
                self.step(track, session_start, &mut summary).await?;
            }
            if tracks.iter().all(|t| t.finished) {
                break;
            }
            if self.config.source_rotation == SourceRotation::Aligned {
                self.rotate_sources(&mut tracks);
            }
        }

        let samples: Vec<u64> = tracks
            .iter()
            .flat_map(|t| t.history.samples().iter().copied())
            .collect();
        if !samples.is_empty() {
            summary.average_throughput_bps =
                Some(samples.iter().map(|s| *s as f64).sum::<f64>() / samples.len() as f64);
        }
        if let Some(accountant) = &self.accountant {
            summary.crosslayer_throughput_bps = accountant.average_throughput().await;
            summary.recent_crosslayer_throughput_bps = accountant.recent_average_throughput().await;
            accountant.set_tracking(false);
        }

        info!(
            segments = summary.segments,
            stalls = summary.stalls,
            total_stall_ms = summary.total_stall_ms,
            switches = summary.switches,
            "Stream finished"
        );
        self.emit(PlayerEvent::Info("Stream finished".to_string()));
        Ok(summary)
    }

    async fn step(&self, track: &mut TrackSession, session_start: Instant, summary: &mut SessionSummary) -> PlayerResult<()> {
        let Some(manifest) = self.sources[track.source].track(track.kind) else {
            warn!(track = %track.kind, source = track.source, "Source has no such track");
            track.finished = true;
            return Ok(());
        };
        let segment_ms = manifest.segment_duration_ms;
        if segment_ms == 0 {
            return Err(PlayerError::manifest(format!("{} track has a zero segment duration", track.kind)));
        }
        if track.downloaded_ms + segment_ms > self.config.stream_duration_ms || !manifest.has_segment(track.segment_number) {
            debug!(
                track = %track.kind,
                downloaded_ms = track.downloaded_ms,
                segment = track.segment_number,
                "All segments downloaded"
            );
            track.finished = true;
            return Ok(());
        }

        let index = manifest.ladder.clamp(track.representation_index);
        track.representation_index = index;
        let Some(representation) = manifest.ladder.get(index) else {
            return Err(PlayerError::manifest(format!("{} ladder has no index {index}", track.kind)));
        };

        self.fetch_init(track, manifest, index).await?;

        let location = manifest.segment_location(index, track.segment_number).ok_or_else(|| {
            PlayerError::manifest(format!("no URL for {} segment {}", track.kind, track.segment_number))
        })?;

        let cancel = CancellationToken::new();
        if let Some(accountant) = &self.accountant {
            let elapsed_ms = track.last_mark.elapsed().as_millis() as u64;
            accountant
                .segment_start(SegmentStart {
                    track: track.kind,
                    segment_number: track.segment_number,
                    buffer_level_ms: track.buffer.projected_level_ms(elapsed_ms),
                    representation_kbps: representation.bandwidth / 1000,
                    segment_duration_ms: segment_ms,
                    cancel: cancel.clone(),
                })
                .await;
        }

        let request = SegmentRequest {
            url: location.url.clone(),
            byte_range: location.byte_range,
            representation_index: index,
            segment_number: track.segment_number,
            track: track.kind,
            segment_duration_ms: segment_ms,
        };
        let outcome = match self.fetcher.fetch(&request, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit(PlayerEvent::Warning(format!("Failed to fetch {}: {e}", location.url)));
                return Err(e.into_player_error(&location.url));
            }
        };
        if let Some(accountant) = &self.accountant {
            accountant.stop_timing().await;
        }
        let delivery_ms = outcome.delivery.as_millis() as u64;

        if let Some(accountant) = &self.accountant {
            if let Some(prediction) = accountant.take_stall_prediction().await {
                summary.predicted_stalls += 1;
                self.emit(PlayerEvent::StallPredicted {
                    track: prediction.track,
                    segment_number: prediction.segment_number,
                    estimated_finish_ms: prediction.estimated_finish_ms,
                    buffer_ms: prediction.buffer_ms,
                });
            }
        }
        if outcome.cancelled {
            summary.cancelled_fetches += 1;
            info!(
                track = %track.kind,
                segment = track.segment_number,
                bytes = outcome.size_bytes,
                "Download cancelled, continuing with partial data"
            );
        }

        let elapsed_ms = track.last_mark.elapsed().as_millis() as u64;
        let update = track.buffer.on_segment(elapsed_ms, segment_ms);
        if update.stall_ms > 0 {
            summary.stalls += 1;
            summary.total_stall_ms += update.stall_ms;
            info!(track = %track.kind, segment = track.segment_number, stall_ms = update.stall_ms, "Playback stalled");
        }
        if update.sleep_ms > 0 {
            debug!(track = %track.kind, sleep_ms = update.sleep_ms, "Buffer full, waiting");
            sleep(Duration::from_millis(update.sleep_ms)).await;
            track.buffer.apply_sleep(update.sleep_ms);
        }
        track.last_mark = Instant::now();

        let throughput = calculate_throughput(outcome.size_bytes, delivery_ms);
        track.history.push(throughput);

        if track.last_bandwidth.is_some_and(|bw| bw != representation.bandwidth) {
            summary.switches += 1;
        }
        track.last_bandwidth = Some(representation.bandwidth);
        summary.segments += 1;

        self.emit(PlayerEvent::Segment(SegmentDownloadRecord {
            track: track.kind,
            segment_number: track.segment_number,
            arrival_time_ms: session_start.elapsed().as_millis() as u64,
            delivery_time_ms: delivery_ms,
            stall_ms: update.stall_ms,
            representation_index: index,
            representation_bandwidth: representation.bandwidth,
            throughput_bps: throughput,
            actual_rate_bps: outcome.size_bytes * 8 * 1000 / segment_ms,
            segment_size_bytes: outcome.size_bytes,
            segment_duration_ms: segment_ms,
            buffer_level_ms: track.buffer.level_ms,
            rtt_ms: outcome.rtt.as_secs_f64() * 1000.0,
            protocol: outcome.protocol,
            header_estimate_kbps: outcome.header_estimate_kbps,
            source_index: track.source,
            cancelled: outcome.cancelled,
            phase: update.phase,
        }));

        track.downloaded_ms += segment_ms;
        track.segment_number += 1;

        let next_bits = manifest.segment_bits(track.segment_number);
        let crosslayer_throughput_bps = match &self.accountant {
            Some(accountant) => accountant.average_throughput().await,
            None => None,
        };
        let ctx = SelectionContext {
            history: &track.history,
            buffer: &track.buffer,
            ladder: &manifest.ladder,
            current_index: index,
            segment_duration_ms: segment_ms,
            delivery_time_ms: delivery_ms,
            next_segment_bits: next_bits.as_deref(),
            crosslayer_throughput_bps,
        };
        let next = manifest.ladder.clamp(track.algorithm.select(&ctx));
        debug!(
            track = %track.kind,
            algorithm = %track.algorithm.kind(),
            index = next,
            bandwidth = manifest.ladder.bandwidth(next),
            buffer_ms = track.buffer.level_ms,
            playing = track.buffer.phase() == PlaybackPhase::Playing,
            "Representation chosen"
        );
        track.representation_index = next;
        Ok(())
    }

    async fn fetch_init(&self, track: &mut TrackSession, manifest: &TrackManifest, index: usize) -> PlayerResult<()> {
        let Some(init) = manifest.init_location(index) else {
            return Ok(());
        };
        let key = match init.byte_range {
            Some(range) => format!("{}::{}", init.url, range.header_value()),
            None => init.url.clone(),
        };
        if track.init_fetched.contains(&key) {
            return Ok(());
        }

        let request = SegmentRequest {
            url: init.url.clone(),
            byte_range: init.byte_range,
            representation_index: index,
            segment_number: 0,
            track: track.kind,
            segment_duration_ms: manifest.segment_duration_ms,
        };
        let outcome = self
            .fetcher
            .fetch(&request, &CancellationToken::new())
            .await
            .map_err(|e| e.into_player_error(&init.url))?;
        debug!(track = %track.kind, url = %init.url, bytes = outcome.size_bytes, "Initialization segment fetched");
        track.init_fetched.insert(key);
        Ok(())
    }

    /// Moves every track to the next source whose segment duration divides
    /// what each track downloaded so far. The first candidate after the
    /// current source wins; the current source is the last resort.
    fn rotate_sources(&self, tracks: &mut [TrackSession]) {
        let Some(current) = tracks.first().map(|t| t.source) else {
            return;
        };
        let count = self.sources.len();
        if count < 2 {
            return;
        }

        let aligned = |candidate: usize| {
            tracks.iter().filter(|t| !t.finished).all(|t| {
                self.sources[candidate]
                    .track(t.kind)
                    .is_some_and(|m| m.segment_duration_ms > 0 && t.downloaded_ms % m.segment_duration_ms == 0)
            })
        };
        let Some(next) = (1..=count).map(|offset| (current + offset) % count).find(|c| aligned(*c)) else {
            return;
        };
        if next == current {
            return;
        }

        for track in tracks.iter_mut().filter(|t| !t.finished) {
            let Some(manifest) = self.sources[next].track(track.kind) else {
                continue;
            };
            let carried = track.representation_index;
            track.source = next;
            track.segment_number = track.downloaded_ms / manifest.segment_duration_ms + manifest.start_number;
            track.representation_index = manifest.ladder.clamp(carried);
            debug!(
                track = %track.kind,
                source = next,
                segment = track.segment_number,
                index = track.representation_index,
                "Switched manifest source"
            );
        }
        self.emit(PlayerEvent::Info(format!("Switched to manifest {}", self.sources[next].url)));
    }
}

impl std::fmt::Debug for AbrPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbrPlayer")
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("accountant", &self.accountant.is_some())
            .finish()
    }
}
