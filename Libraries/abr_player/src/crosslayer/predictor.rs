//! Packet-window stall prediction.

use tokio::time::Instant;

/// Everything one prediction round needs, captured under the accountant lock.
#[derive(Debug, Clone, Copy)]
pub struct PredictionInput<'a> {
    /// Byte counts of the packets received for the current segment.
    pub samples: &'a [u64],
    /// Arrival instants matching `samples`.
    pub arrivals: &'a [Instant],
    pub window: usize,
    pub now: Instant,
    pub representation_kbps: u64,
    pub segment_duration_ms: u64,
    pub buffer_at_start_ms: u64,
    pub elapsed_since_start_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// Window not full yet, or it spans no time.
    Skipped,
    /// The window already holds at least the expected bits.
    OnTrack,
    NoStall { estimated_finish_ms: f64, buffer_ms: f64 },
    Stall { estimated_finish_ms: f64, buffer_ms: f64 },
}

impl Prediction {
    pub fn is_stall(&self) -> bool {
        matches!(self, Self::Stall { .. })
    }
}

/// Bits expected per millisecond of segment, reading kbps as bits per ms.
pub fn expected_bits(representation_kbps: u64, segment_duration_ms: u64) -> f64 {
    if segment_duration_ms == 0 {
        return 0.0;
    }
    representation_kbps as f64 / segment_duration_ms as f64
}

/// Time to fetch the remaining bits at the rate observed over the window.
/// `None` when the window carried no bits or spans no time.
pub fn estimate_time_to_finish_ms(window_bits: f64, window_duration_ms: f64, expected_bits: f64) -> Option<f64> {
    if window_bits <= 0.0 || window_duration_ms <= 0.0 {
        return None;
    }
    let window_bitrate = window_bits / window_duration_ms;
    Some((expected_bits - window_bits).max(0.0) / window_bitrate)
}

/// Buffer left at `elapsed_ms` into the segment, floored at zero.
pub fn current_buffer_ms(buffer_at_start_ms: u64, elapsed_ms: u64) -> u64 {
    buffer_at_start_ms.saturating_sub(elapsed_ms)
}

pub fn predict(input: &PredictionInput<'_>) -> Prediction {
    let window = input.window;
    let len = input.samples.len().min(input.arrivals.len());
    if window == 0 || len <= window {
        return Prediction::Skipped;
    }

    let window_bytes: u64 = input.samples[len - window..len].iter().sum();
    let window_bits = window_bytes as f64 * 8.0;
    let window_start = input.arrivals[len - window];
    let window_duration_ms = input.now.saturating_duration_since(window_start).as_secs_f64() * 1000.0;
    if window_duration_ms <= 0.0 {
        return Prediction::Skipped;
    }

    let expected = expected_bits(input.representation_kbps, input.segment_duration_ms);
    if window_bits >= expected {
        return Prediction::OnTrack;
    }
    let Some(estimated_finish_ms) = estimate_time_to_finish_ms(window_bits, window_duration_ms, expected) else {
        return Prediction::Skipped;
    };

    let buffer_ms = current_buffer_ms(input.buffer_at_start_ms, input.elapsed_since_start_ms) as f64;
    if estimated_finish_ms > buffer_ms {
        Prediction::Stall {
            estimated_finish_ms,
            buffer_ms,
        }
    } else {
        Prediction::NoStall {
            estimated_finish_ms,
            buffer_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    fn packets(count: usize, bytes: u64, spacing_ms: u64) -> (Vec<u64>, Vec<Instant>, Instant) {
        let base = Instant::now();
        let arrivals: Vec<Instant> = (0..count)
            .map(|i| base + Duration::from_millis(i as u64 * spacing_ms))
            .collect();
        let now = base + Duration::from_millis(count as u64 * spacing_ms);
        (vec![bytes; count], arrivals, now)
    }

    #[test]
    fn full_window_at_high_rate_is_on_track() {
        let (samples, arrivals, now) = packets(150, 1000, 1);
        let input = PredictionInput {
            samples: &samples,
            arrivals: &arrivals,
            window: 100,
            now,
            representation_kbps: 8000,
            segment_duration_ms: 1000,
            buffer_at_start_ms: 0,
            elapsed_since_start_ms: 150,
        };
        assert_eq!(predict(&input), Prediction::OnTrack);
    }

    #[rstest]
    #[case(50)]
    #[case(100)]
    fn window_not_full_is_skipped(#[case] count: usize) {
        let (samples, arrivals, now) = packets(count, 10, 1);
        let input = PredictionInput {
            samples: &samples,
            arrivals: &arrivals,
            window: 100,
            now,
            representation_kbps: u64::MAX / 2,
            segment_duration_ms: 1,
            buffer_at_start_ms: 0,
            elapsed_since_start_ms: 0,
        };
        assert_eq!(predict(&input), Prediction::Skipped);
    }

    #[test]
    fn window_without_duration_is_skipped() {
        let (samples, arrivals, _) = packets(20, 10, 0);
        let input = PredictionInput {
            samples: &samples,
            arrivals: &arrivals,
            window: 10,
            now: arrivals[10],
            representation_kbps: 8_000_000,
            segment_duration_ms: 1000,
            buffer_at_start_ms: 0,
            elapsed_since_start_ms: 0,
        };
        assert_eq!(predict(&input), Prediction::Skipped);
    }

    #[test]
    fn slow_window_against_thin_buffer_predicts_stall() {
        // 10 packets of 10 bytes over 10 ms: 800 bits at 80 bits/ms
        let (samples, arrivals, now) = packets(11, 10, 1);
        let input = PredictionInput {
            samples: &samples,
            arrivals: &arrivals,
            window: 10,
            now,
            representation_kbps: 8_000_000,
            segment_duration_ms: 1000,
            buffer_at_start_ms: 100,
            elapsed_since_start_ms: 40,
        };
        // (8000 - 800) / 80 = 90 ms > 60 ms of buffer
        match predict(&input) {
            Prediction::Stall {
                estimated_finish_ms,
                buffer_ms,
            } => {
                assert!((estimated_finish_ms - 90.0).abs() < 1e-9);
                assert_eq!(buffer_ms, 60.0);
            }
            other => panic!("expected a stall, got {other:?}"),
        }

        let relaxed = PredictionInput {
            buffer_at_start_ms: 1_000,
            ..input
        };
        assert!(matches!(predict(&relaxed), Prediction::NoStall { .. }));
    }

    #[test]
    fn estimate_is_reproducible() {
        assert_eq!(estimate_time_to_finish_ms(800.0, 10.0, 8000.0), Some(90.0));
        assert_eq!(estimate_time_to_finish_ms(800.0, 0.0, 8000.0), None);
        assert_eq!(expected_bits(8000, 1000), 8.0);
        assert_eq!(expected_bits(8000, 0), 0.0);
        assert_eq!(current_buffer_ms(100, 250), 0);
    }
}
