pub mod algorithms;
pub mod buffer;
pub mod config;
pub mod crosslayer;
pub mod error;
pub mod history;
pub mod ladder;
pub mod mpd;
pub mod player;
pub mod segment;

use serde::Serialize;

use crate::buffer::PlaybackPhase;
use crate::mpd::TrackKind;

/// Events emitted by the player
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// One segment finished (or was cut short by the stall predictor).
    Segment(SegmentDownloadRecord),
    /// The cross-layer predictor cancelled the in-flight download.
    StallPredicted {
        track: TrackKind,
        segment_number: u64,
        estimated_finish_ms: f64,
        buffer_ms: f64,
    },
    Info(String),
    Warning(String),
}

/// Everything the player knows about one downloaded segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentDownloadRecord {
    pub track: TrackKind,
    pub segment_number: u64,
    /// Milliseconds since the session started.
    pub arrival_time_ms: u64,
    pub delivery_time_ms: u64,
    /// How long playback was frozen before this segment arrived.
    pub stall_ms: u64,
    pub representation_index: usize,
    pub representation_bandwidth: u64,
    /// Measured delivery rate in bits per second.
    pub throughput_bps: u64,
    /// Encoded rate of the segment in bits per second.
    pub actual_rate_bps: u64,
    pub segment_size_bytes: u64,
    pub segment_duration_ms: u64,
    pub buffer_level_ms: u64,
    pub rtt_ms: f64,
    pub protocol: String,
    pub header_estimate_kbps: Option<f64>,
    pub source_index: usize,
    pub cancelled: bool,
    pub phase: PlaybackPhase,
}

pub use player::{AbrPlayer, PlayerCallback, SessionSummary};
