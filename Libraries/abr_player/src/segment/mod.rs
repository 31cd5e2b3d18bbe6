pub mod fetcher;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::mpd::{ByteRange, TrackKind};

pub use fetcher::HttpFetcher;

/// One segment (or init segment) to download.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub representation_index: usize,
    /// 0 for init segments.
    pub segment_number: u64,
    pub track: TrackKind,
    pub segment_duration_ms: u64,
}

/// What a fetcher reports about one download.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub data: Bytes,
    pub size_bytes: u64,
    /// Request sent to response headers.
    pub rtt: Duration,
    /// Request sent to last byte, or to cancellation.
    pub delivery: Duration,
    pub protocol: String,
    /// `content-length` over the segment duration, in kbps.
    pub header_estimate_kbps: Option<f64>,
    /// The cancellation token fired before the body completed; `data` holds
    /// whatever arrived until then.
    pub cancelled: bool,
}

/// Fetch collaborator. Blocks until the segment is complete or the token is
/// cancelled; cancellation is reported through [`FetchOutcome::cancelled`],
/// never as an error.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(&self, request: &SegmentRequest, cancel: &CancellationToken) -> Result<FetchOutcome, FetchError>;
}
