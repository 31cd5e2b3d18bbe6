/// Per-segment throughput samples in bits per second, oldest first.
///
/// Append-only for the life of a session; algorithms read trailing windows.
#[derive(Debug, Clone, Default)]
pub struct ThroughputHistory {
    samples: Vec<u64>,
}

impl ThroughputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, throughput_bps: u64) {
        self.samples.push(throughput_bps);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<u64> {
        self.samples.last().copied()
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    /// The last `n` samples (or all of them when fewer exist).
    pub fn trailing(&self, n: usize) -> &[u64] {
        &self.samples[self.samples.len().saturating_sub(n)..]
    }
}

impl From<Vec<u64>> for ThroughputHistory {
    fn from(samples: Vec<u64>) -> Self {
        Self { samples }
    }
}

/// Delivery rate in bits per second. Sub-millisecond deliveries count as 1 ms.
pub fn calculate_throughput(size_bytes: u64, delivery_ms: u64) -> u64 {
    size_bytes.saturating_mul(8).saturating_mul(1000) / delivery_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_window() {
        let history = ThroughputHistory::from(vec![1, 2, 3, 4]);
        assert_eq!(history.trailing(2), &[3, 4]);
        assert_eq!(history.trailing(10), &[1, 2, 3, 4]);
        assert_eq!(history.latest(), Some(4));
    }

    #[test]
    fn throughput_in_bits_per_second() {
        assert_eq!(calculate_throughput(125_000, 1000), 1_000_000);
        assert_eq!(calculate_throughput(1000, 0), 8_000_000);
        assert_eq!(calculate_throughput(0, 250), 0);
    }
}
