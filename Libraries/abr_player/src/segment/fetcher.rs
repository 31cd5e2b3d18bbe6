use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{FetchOutcome, SegmentFetcher, SegmentRequest};
use crate::crosslayer::{TransportEvent, TransportSender};
use crate::error::FetchError;

/// reqwest-backed fetcher. The body is streamed chunk by chunk; every chunk
/// is reported to the cross-layer accountant as a received packet.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    events: Option<TransportSender>,
    max_retries: usize,
    base_delay: Duration,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            events: None,
            max_retries: 0,
            base_delay: Duration::from_millis(500),
        }
    }

    /// Reports body chunks on `events`.
    pub fn with_transport_events(mut self, events: TransportSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Retries failed requests with exponential backoff.
    ///
    /// Chunks of a failed attempt were already reported as received packets
    /// and stay in the accountant's totals: they did cross the link inside
    /// the timed interval.
    pub fn with_retries(mut self, max_retries: usize, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    fn emit(&self, length: usize) {
        if let Some(events) = &self.events {
            // the accountant may already be gone at shutdown
            let _ = events.send(TransportEvent::PacketReceived { length: length as u64 });
        }
    }

    async fn fetch_once(&self, request: &SegmentRequest, cancel: &CancellationToken) -> Result<FetchOutcome, FetchError> {
        let start = Instant::now();
        let mut builder = self.client.get(&request.url);
        if let Some(range) = request.byte_range {
            builder = builder.header(RANGE, range.header_value());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                let elapsed = start.elapsed();
                return Ok(FetchOutcome {
                    data: Default::default(),
                    size_bytes: 0,
                    rtt: elapsed,
                    delivery: elapsed,
                    protocol: String::new(),
                    header_estimate_kbps: None,
                    cancelled: true,
                });
            }
            response = builder.send() => response?,
        };
        let rtt = start.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let protocol = format!("{:?}", response.version());
        let header_estimate_kbps = response
            .content_length()
            .filter(|_| request.segment_duration_ms > 0)
            .map(|length| length as f64 * 8.0 / request.segment_duration_ms as f64);

        let (data, cancelled) = self.read_body(response, cancel).await?;
        Ok(FetchOutcome {
            size_bytes: data.len() as u64,
            data: data.freeze(),
            rtt,
            delivery: start.elapsed(),
            protocol,
            header_estimate_kbps,
            cancelled,
        })
    }

    async fn read_body(&self, mut response: Response, cancel: &CancellationToken) -> Result<(BytesMut, bool), FetchError> {
        let mut body = BytesMut::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok((body, true)),
                chunk = response.chunk() => {
                    match chunk.map_err(|e| FetchError::Body(e.to_string()))? {
                        Some(chunk) => {
                            self.emit(chunk.len());
                            body.extend_from_slice(&chunk);
                        }
                        None => return Ok((body, false)),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    async fn fetch(&self, request: &SegmentRequest, cancel: &CancellationToken) -> Result<FetchOutcome, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(request, cancel).await {
                Ok(outcome) => {
                    debug!(
                        url = %request.url,
                        bytes = outcome.size_bytes,
                        cancelled = outcome.cancelled,
                        "Segment fetched"
                    );
                    return Ok(outcome);
                }
                Err(e @ FetchError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                    // 404: don't retry
                    return Err(e);
                }
                Err(e) if attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    error!("Fetch failed (attempt {}): {}", attempt + 1, e);
                    let delay = self.base_delay * 2u32.saturating_pow(attempt as u32);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
