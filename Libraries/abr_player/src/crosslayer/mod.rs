//! Cross-layer accountant: taps transport-layer packet events to measure
//! throughput below the HTTP layer and, optionally, to cancel a download
//! predicted to stall playback.
//!
//! One listener task drains the event channel for the whole session. All
//! packet lists live behind a single lock shared with the scheduler.

pub mod predictor;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::mpd::TrackKind;
use predictor::{predict, Prediction, PredictionInput};

/// Packets kept for [`CrossLayerAccountant::recent_average_throughput`].
pub const RECENT_PACKETS: usize = 3000;

/// Transport-layer event, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    PacketReceived { length: u64 },
    PacketSent { length: u64 },
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

/// Snapshot taken by the scheduler before each fetch.
#[derive(Debug, Clone)]
pub struct SegmentStart {
    pub track: TrackKind,
    pub segment_number: u64,
    pub buffer_level_ms: u64,
    pub representation_kbps: u64,
    pub segment_duration_ms: u64,
    /// Cancelled by the predictor when a stall is expected.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallPrediction {
    pub track: TrackKind,
    pub segment_number: u64,
    pub estimated_finish_ms: f64,
    pub buffer_ms: f64,
}

#[derive(Debug)]
struct ActiveSegment {
    start: SegmentStart,
    started_at: Instant,
    prediction: Option<StallPrediction>,
}

#[derive(Debug, Default)]
struct Stopwatch {
    running_since: Option<Instant>,
    total: Duration,
}

impl Stopwatch {
    fn total_with_running(&self, now: Instant) -> Duration {
        match self.running_since {
            Some(since) => self.total + now.saturating_duration_since(since),
            None => self.total,
        }
    }
}

#[derive(Debug, Default)]
struct AccountantState {
    // per segment, reset by `segment_start`
    samples: Vec<u64>,
    arrivals: Vec<Instant>,
    // session lifetime
    lifetime_bytes: u64,
    recent: VecDeque<u64>,
    recent_bytes: u64,
    stopwatch: Stopwatch,
    segment: Option<ActiveSegment>,
}

impl AccountantState {
    fn record(&mut self, length: u64, now: Instant) {
        self.samples.push(length);
        self.arrivals.push(now);
        self.lifetime_bytes += length;
        self.recent.push_back(length);
        self.recent_bytes += length;
        if self.recent.len() > RECENT_PACKETS {
            if let Some(old) = self.recent.pop_front() {
                self.recent_bytes -= old;
            }
        }
    }
}

#[derive(Debug)]
pub struct CrossLayerAccountant {
    state: Mutex<AccountantState>,
    prediction_window: Option<usize>,
    tracking: AtomicBool,
}

impl Default for CrossLayerAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossLayerAccountant {
    /// Accountant without stall prediction.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AccountantState::default()),
            prediction_window: None,
            tracking: AtomicBool::new(true),
        }
    }

    /// Accountant predicting stalls over the last `window` packets.
    pub fn with_predictor(window: usize) -> Self {
        info!(window, "Stall prediction enabled");
        Self {
            prediction_window: Some(window),
            ..Self::new()
        }
    }

    pub fn predicts_stalls(&self) -> bool {
        self.prediction_window.is_some()
    }

    /// Events are dropped while tracking is off.
    pub fn set_tracking(&self, tracking: bool) {
        self.tracking.store(tracking, Ordering::Relaxed);
    }

    /// Spawns the listener task. It ends when every sender is dropped.
    pub fn listen(self: &Arc<Self>, mut events: TransportReceiver) -> JoinHandle<()> {
        let accountant = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                accountant.on_event(event).await;
            }
            debug!("Transport event source closed");
        })
    }

    pub async fn on_event(&self, event: TransportEvent) {
        if !self.tracking.load(Ordering::Relaxed) {
            return;
        }
        match event {
            TransportEvent::PacketReceived { length } => {
                let now = Instant::now();
                let mut state = self.state.lock().await;
                state.record(length, now);
                if let Some(window) = self.prediction_window {
                    run_predictor(&mut state, window, now);
                }
            }
            TransportEvent::PacketSent { length } => trace!(length, "Packet sent"),
        }
    }

    /// Clears the per-segment packet window, captures the predictor inputs
    /// and starts the stopwatch.
    pub async fn segment_start(&self, start: SegmentStart) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.samples.clear();
        state.arrivals.clear();
        state.stopwatch.running_since = Some(now);
        state.segment = Some(ActiveSegment {
            start,
            started_at: now,
            prediction: None,
        });
    }

    pub async fn start_timing(&self) {
        self.state.lock().await.stopwatch.running_since = Some(Instant::now());
    }

    /// Elapsed time of the running stopwatch, added to the session total.
    /// Stopping a stopwatch that is not running warns and returns zero.
    pub async fn stop_timing(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.stopwatch.running_since.take() {
            Some(since) => {
                let elapsed = now.saturating_duration_since(since);
                state.stopwatch.total += elapsed;
                elapsed
            }
            None => {
                warn!("Stopping timer while timer is not running");
                Duration::ZERO
            }
        }
    }

    /// Total timed duration, including a stopwatch that is still running.
    pub async fn total_time(&self) -> Duration {
        self.state.lock().await.stopwatch.total_with_running(Instant::now())
    }

    /// Session-lifetime bytes over the session-lifetime timed duration, in
    /// bits per second. `None` before any time was measured.
    pub async fn average_throughput(&self) -> Option<f64> {
        let state = self.state.lock().await;
        bits_per_second(state.lifetime_bytes, state.stopwatch.total_with_running(Instant::now()))
    }

    /// Like [`Self::average_throughput`] over the last [`RECENT_PACKETS`] packets only.
    pub async fn recent_average_throughput(&self) -> Option<f64> {
        let state = self.state.lock().await;
        bits_per_second(state.recent_bytes, state.stopwatch.total_with_running(Instant::now()))
    }

    pub async fn lifetime_bytes(&self) -> u64 {
        self.state.lock().await.lifetime_bytes
    }

    /// Packets counted for the current segment.
    pub async fn segment_packets(&self) -> usize {
        self.state.lock().await.samples.len()
    }

    /// The stall predicted during the current segment, if any. Taking it
    /// clears it.
    pub async fn take_stall_prediction(&self) -> Option<StallPrediction> {
        self.state
            .lock()
            .await
            .segment
            .as_mut()
            .and_then(|segment| segment.prediction.take())
    }
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.0).then(|| bytes as f64 * 8.0 / secs)
}

fn run_predictor(state: &mut AccountantState, window: usize, now: Instant) {
    let Some(segment) = state.segment.as_ref() else {
        return;
    };
    if segment.start.cancel.is_cancelled() {
        return;
    }

    let prediction = predict(&PredictionInput {
        samples: &state.samples,
        arrivals: &state.arrivals,
        window,
        now,
        representation_kbps: segment.start.representation_kbps,
        segment_duration_ms: segment.start.segment_duration_ms,
        buffer_at_start_ms: segment.start.buffer_level_ms,
        elapsed_since_start_ms: now.saturating_duration_since(segment.started_at).as_millis() as u64,
    });

    match prediction {
        Prediction::Stall {
            estimated_finish_ms,
            buffer_ms,
        } => {
            info!(
                track = %segment.start.track,
                segment = segment.start.segment_number,
                estimated_finish_ms,
                buffer_ms,
                "Stall predicted, cancelling download"
            );
            let stall = StallPrediction {
                track: segment.start.track,
                segment_number: segment.start.segment_number,
                estimated_finish_ms,
                buffer_ms,
            };
            segment.start.cancel.cancel();
            if let Some(segment) = state.segment.as_mut() {
                segment.prediction = Some(stall);
            }
        }
        Prediction::NoStall {
            estimated_finish_ms,
            buffer_ms,
        } => trace!(estimated_finish_ms, buffer_ms, "No stall"),
        Prediction::OnTrack | Prediction::Skipped => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;
    use tracing::Level;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;

    fn start(buffer_level_ms: u64, representation_kbps: u64, cancel: &CancellationToken) -> SegmentStart {
        SegmentStart {
            track: TrackKind::Video,
            segment_number: 1,
            buffer_level_ms,
            representation_kbps,
            segment_duration_ms: 1000,
            cancel: cancel.clone(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn high_rate_packets_do_not_cancel() {
        let accountant = Arc::new(CrossLayerAccountant::with_predictor(100));
        let cancel = CancellationToken::new();
        accountant.segment_start(start(0, 8000, &cancel)).await;

        for _ in 0..150 {
            accountant.on_event(TransportEvent::PacketReceived { length: 1000 }).await;
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        assert!(!cancel.is_cancelled());
        assert!(accountant.take_stall_prediction().await.is_none());
        assert_eq!(accountant.segment_packets().await, 150);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_packets_against_thin_buffer_cancel_the_fetch() {
        let accountant = Arc::new(CrossLayerAccountant::with_predictor(10));
        let cancel = CancellationToken::new();
        accountant.segment_start(start(50, 8_000_000, &cancel)).await;

        for _ in 0..20 {
            accountant.on_event(TransportEvent::PacketReceived { length: 10 }).await;
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        assert!(cancel.is_cancelled());
        let stall = accountant.take_stall_prediction().await.unwrap();
        assert_eq!(stall.track, TrackKind::Video);
        assert!(stall.estimated_finish_ms > stall.buffer_ms);
        assert!(accountant.take_stall_prediction().await.is_none());
    }

    /// Counts WARN events seen by the thread-local subscriber.
    #[derive(Clone, Default)]
    struct WarningCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarningCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_timing_twice_warns_and_returns_zero_the_second_time() {
        let warnings = WarningCounter::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let accountant = CrossLayerAccountant::new();
        accountant.start_timing().await;
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(accountant.stop_timing().await, Duration::from_millis(250));
        assert_eq!(warnings.0.load(Ordering::SeqCst), 0);

        assert_eq!(accountant.stop_timing().await, Duration::ZERO);
        assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
        assert_eq!(accountant.total_time().await, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_right_after_start_returns_zero_and_only_the_repeat_warns() {
        let warnings = WarningCounter::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let accountant = CrossLayerAccountant::new();
        accountant.start_timing().await;
        assert_eq!(accountant.stop_timing().await, Duration::ZERO);
        assert_eq!(accountant.stop_timing().await, Duration::ZERO);
        assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn averages_survive_segment_resets() {
        let accountant = CrossLayerAccountant::new();
        assert_eq!(accountant.average_throughput().await, None);

        for _ in 0..2 {
            let cancel = CancellationToken::new();
            accountant.segment_start(start(0, 1000, &cancel)).await;
            for _ in 0..10 {
                accountant.on_event(TransportEvent::PacketReceived { length: 125 }).await;
            }
            tokio::time::advance(Duration::from_millis(500)).await;
            accountant.stop_timing().await;
        }

        // 2500 bytes over one second
        assert_eq!(accountant.lifetime_bytes().await, 2500);
        assert_eq!(accountant.segment_packets().await, 10);
        assert_eq!(accountant.average_throughput().await, Some(20_000.0));
        assert_eq!(accountant.recent_average_throughput().await, Some(20_000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_average_only_reads_the_last_packets() {
        let accountant = CrossLayerAccountant::new();
        accountant.start_timing().await;
        for _ in 0..RECENT_PACKETS {
            accountant.on_event(TransportEvent::PacketReceived { length: 1 }).await;
        }
        for _ in 0..RECENT_PACKETS {
            accountant.on_event(TransportEvent::PacketReceived { length: 2 }).await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        accountant.stop_timing().await;

        assert_eq!(accountant.average_throughput().await, Some(9.0 * RECENT_PACKETS as f64 * 8.0 / 3.0));
        assert_eq!(accountant.recent_average_throughput().await, Some(2.0 * RECENT_PACKETS as f64 * 8.0));
    }

    #[tokio::test(start_paused = true)]
    async fn listener_drains_the_channel_until_closed() {
        let accountant = Arc::new(CrossLayerAccountant::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = accountant.listen(rx);

        tx.send(TransportEvent::PacketSent { length: 40 }).unwrap();
        for _ in 0..5 {
            tx.send(TransportEvent::PacketReceived { length: 100 }).unwrap();
        }
        drop(tx);
        listener.await.unwrap();

        assert_eq!(accountant.lifetime_bytes().await, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_off_drops_events() {
        let accountant = CrossLayerAccountant::new();
        accountant.set_tracking(false);
        accountant.on_event(TransportEvent::PacketReceived { length: 100 }).await;
        assert_eq!(accountant.lifetime_bytes().await, 0);
    }
}
