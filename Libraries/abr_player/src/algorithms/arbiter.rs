use serde::Deserialize;
use tracing::debug;

use super::{AlgorithmKind, Conventional, SelectionAlgorithm, SelectionContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbiterOptions {
    /// Trailing samples in the weighted estimate.
    pub window: usize,
    /// Per-step decay of the sample weights, newest sample weighs 1.
    pub decay: f64,
    /// How strongly throughput variability discounts the estimate.
    pub variance_weight: f64,
    /// Largest discount applied for variability.
    pub max_discount: f64,
    /// Buffer share kept in reserve when budgeting the next download.
    pub reservoir_ratio: f64,
    /// Most rungs an up-switch may climb at once.
    pub max_step_up: usize,
}

impl Default for ArbiterOptions {
    fn default() -> Self {
        Self {
            window: 10,
            decay: 0.7,
            variance_weight: 1.0,
            max_discount: 0.5,
            reservoir_ratio: 0.1,
            max_step_up: 2,
        }
    }
}

/// Combines a variance-discounted throughput estimate with the size of the
/// next segment: the highest representation whose download fits in the
/// buffer above its reserve wins.
#[derive(Debug, Clone)]
pub struct Arbiter {
    options: ArbiterOptions,
}

impl Arbiter {
    pub fn new(options: ArbiterOptions) -> Self {
        Self { options }
    }

    /// Exponentially weighted mean and coefficient of variation.
    pub fn weighted_statistics(&self, samples: &[u64]) -> (f64, f64) {
        let decay = self.options.decay.clamp(0.0, 1.0);
        let n = samples.len();
        let weights: Vec<f64> = (0..n).map(|i| decay.powi((n - 1 - i) as i32)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return (0.0, 0.0);
        }

        let mean = samples
            .iter()
            .zip(&weights)
            .map(|(s, w)| *s as f64 * w)
            .sum::<f64>()
            / total;
        let variance = samples
            .iter()
            .zip(&weights)
            .map(|(s, w)| w * (*s as f64 - mean).powi(2))
            .sum::<f64>()
            / total;
        let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };
        (mean, cv)
    }

    pub fn estimate(&self, samples: &[u64]) -> f64 {
        let (mean, cv) = self.weighted_statistics(samples);
        let discount = (cv * self.options.variance_weight).clamp(0.0, self.options.max_discount);
        mean * (1.0 - discount)
    }
}

impl SelectionAlgorithm for Arbiter {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Arbiter
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        if ctx.history.len() < 2 {
            return Conventional.select(ctx);
        }
        let Some(samples) = ctx.window(self.options.window.max(2)) else {
            return ctx.lowest();
        };
        let estimate = self.estimate(samples);
        if estimate <= 0.0 {
            return ctx.lowest();
        }

        let reserve_ms = self.options.reservoir_ratio * ctx.buffer.max_ms as f64;
        let budget_ms = (ctx.buffer.level_ms as f64 - reserve_ms).max(ctx.segment_duration_ms as f64);

        let fits = ctx
            .ladder
            .representations()
            .iter()
            .rev()
            .find(|rep| {
                let bits = ctx
                    .next_segment_bits
                    .and_then(|sizes| sizes.get(rep.index).copied())
                    .filter(|bits| *bits > 0)
                    .unwrap_or(rep.bandwidth * ctx.segment_duration_ms / 1000);
                bits as f64 / estimate * 1000.0 <= budget_ms
            })
            .map(|rep| rep.index)
            .unwrap_or_else(|| ctx.lowest());

        let ceiling = ctx
            .ladder
            .clamp(ctx.current_index.saturating_add(self.options.max_step_up));
        debug!(estimate, budget_ms, fits, ceiling, "Arbiter decision");
        fits.min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::BufferState;
    use crate::history::ThroughputHistory;

    use super::super::test_support::{decide, ladder};
    use super::*;

    #[test]
    fn steady_throughput_is_not_discounted() {
        let arbiter = Arbiter::new(ArbiterOptions::default());
        let (mean, cv) = arbiter.weighted_statistics(&[2000, 2000, 2000]);
        assert!((mean - 2000.0).abs() < 1e-9);
        assert_eq!(cv, 0.0);
        assert!((arbiter.estimate(&[2000, 2000, 2000]) - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn variability_lowers_the_estimate() {
        let arbiter = Arbiter::new(ArbiterOptions::default());
        let steady = arbiter.estimate(&[2000, 2000, 2000, 2000]);
        let noisy = arbiter.estimate(&[500, 3500, 500, 3500]);
        assert!(noisy < steady, "{noisy} >= {steady}");
    }

    #[test]
    fn thin_buffer_budgets_one_segment() {
        // 2000 bps over a 2 s budget fits the 2000 rung, the step cap holds it at 1500
        let mut arbiter = Arbiter::new(ArbiterOptions::default());
        assert_eq!(decide(&mut arbiter, &[2000, 2000], 0, &ladder()), 2);
    }

    #[test]
    fn deep_buffer_allows_larger_segments() {
        let options = ArbiterOptions {
            max_step_up: 10,
            ..ArbiterOptions::default()
        };
        let mut arbiter = Arbiter::new(options);
        assert_eq!(decide(&mut arbiter, &[1000, 1000], 0, &ladder()), 1);
        // 9 s of budget fit the 3000 rung at 1000 bps
        assert_eq!(decide(&mut arbiter, &[1000, 1000], 10_000, &ladder()), 4);
    }

    #[test]
    fn manifest_segment_sizes_override_the_nominal_rate() {
        let ladder = ladder();
        let history = ThroughputHistory::from(vec![2000, 2000]);
        let mut buffer = BufferState::new(10_000, 0);
        buffer.level_ms = 0;
        let sizes = [1000, 2000, 3000, 3900, 20_000];
        let mut arbiter = Arbiter::new(ArbiterOptions {
            max_step_up: 10,
            ..ArbiterOptions::default()
        });
        let ctx = SelectionContext {
            history: &history,
            buffer: &buffer,
            ladder: &ladder,
            current_index: 0,
            segment_duration_ms: 2_000,
            delivery_time_ms: 1_000,
            next_segment_bits: Some(&sizes),
            crosslayer_throughput_bps: None,
        };
        assert_eq!(arbiter.select(&ctx), 3);
    }
}
