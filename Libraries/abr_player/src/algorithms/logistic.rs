use serde::Deserialize;
use tracing::debug;

use super::{harmonic_mean, AlgorithmKind, SelectionAlgorithm, SelectionContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogisticOptions {
    /// Samples in the harmonic-mean throughput estimate.
    pub window: usize,
    /// Slope of the logistic curve over the buffer fill ratio.
    pub steepness: f64,
    /// Fill ratio at which the curve is halfway.
    pub midpoint: f64,
    /// Throughput multiplier on an empty buffer.
    pub min_factor: f64,
    /// Throughput multiplier on a full buffer.
    pub max_factor: f64,
    /// Most rungs an up-switch may climb at once.
    pub max_step_up: usize,
    /// Buffer share below which the lowest rung is forced.
    pub reservoir_ratio: f64,
}

impl Default for LogisticOptions {
    fn default() -> Self {
        Self {
            window: 5,
            steepness: 10.0,
            midpoint: 0.5,
            min_factor: 0.5,
            max_factor: 1.2,
            max_step_up: 1,
            reservoir_ratio: 0.1,
        }
    }
}

/// Scales the throughput estimate by a logistic function of the buffer fill:
/// a thin buffer makes the choice conservative, a full one lets it reach
/// above the estimate. Up-switches climb at most `max_step_up` rungs.
#[derive(Debug, Clone)]
pub struct Logistic {
    options: LogisticOptions,
}

impl Logistic {
    pub fn new(options: LogisticOptions) -> Self {
        Self { options }
    }

    /// Throughput multiplier for a fill ratio in `[0, 1]`.
    pub fn factor(&self, fill_ratio: f64) -> f64 {
        let o = &self.options;
        let weight = 1.0 / (1.0 + (-o.steepness * (fill_ratio - o.midpoint)).exp());
        o.min_factor + (o.max_factor - o.min_factor) * weight
    }
}

impl SelectionAlgorithm for Logistic {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Logistic
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        let Some(samples) = ctx.window(self.options.window.max(1)) else {
            return ctx.lowest();
        };
        let max_ms = ctx.buffer.max_ms as f64;
        let level_ms = ctx.buffer.level_ms as f64;
        if max_ms <= 0.0 || level_ms <= self.options.reservoir_ratio * max_ms {
            return ctx.lowest();
        }

        let estimate = harmonic_mean(samples);
        let factor = self.factor((level_ms / max_ms).clamp(0.0, 1.0));
        let candidate = ctx.map(estimate * factor);
        let ceiling = ctx
            .ladder
            .clamp(ctx.current_index.saturating_add(self.options.max_step_up));

        debug!(estimate, factor, candidate, ceiling, "Logistic decision");
        candidate.min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{decide, ladder};
    use super::*;

    #[test]
    fn factor_spans_the_configured_range() {
        let logistic = Logistic::new(LogisticOptions::default());
        assert!((logistic.factor(0.5) - 0.85).abs() < 1e-9);
        assert!(logistic.factor(0.0) < 0.51);
        assert!(logistic.factor(1.0) > 1.19);
        assert!(logistic.factor(0.3) < logistic.factor(0.7));
    }

    #[test]
    fn thin_buffer_forces_lowest() {
        let mut logistic = Logistic::new(LogisticOptions::default());
        assert_eq!(decide(&mut logistic, &[10_000, 10_000], 900, &ladder()), 0);
    }

    #[test]
    fn up_switch_is_one_rung_at_a_time() {
        let mut logistic = Logistic::new(LogisticOptions::default());
        assert_eq!(decide(&mut logistic, &[10_000, 10_000], 9_000, &ladder()), 1);
    }

    #[test]
    fn half_full_buffer_discounts_the_estimate() {
        let options = LogisticOptions {
            max_step_up: 10,
            ..LogisticOptions::default()
        };
        let mut logistic = Logistic::new(options);
        // 2000 * 0.85 = 1700 -> the 1500 rung
        assert_eq!(decide(&mut logistic, &[2000, 2000], 5_000, &ladder()), 2);
    }
}
