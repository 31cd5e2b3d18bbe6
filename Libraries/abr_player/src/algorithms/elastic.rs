use serde::Deserialize;
use tracing::debug;

use super::{harmonic_mean, AlgorithmKind, Conventional, SelectionAlgorithm, SelectionContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElasticOptions {
    pub k_p: f64,
    pub k_i: f64,
    /// Samples in the harmonic-mean throughput estimate.
    pub window: usize,
    /// Desired buffer occupancy as a share of the maximum buffer.
    pub target_buffer_ratio: f64,
    /// Bound on the accumulated error, in seconds squared.
    pub integral_limit: f64,
    /// The target stays within `estimate / band ..= estimate * band`.
    pub band: f64,
}

impl Default for ElasticOptions {
    fn default() -> Self {
        Self {
            k_p: 0.01,
            k_i: 0.001,
            window: 5,
            target_buffer_ratio: 0.5,
            integral_limit: 500.0,
            band: 2.0,
        }
    }
}

/// Proportional-integral controller on the buffer level (ELASTIC).
///
/// Each decision scales the previous target by `1 + kP * e + kI * ∫e`, where
/// `e` is the distance in seconds between the buffer level and its target.
/// The first target is the harmonic mean `h` of recent throughput, and every
/// target is kept inside a band around `h` so a stale target cannot drift
/// away from what the network delivers.
#[derive(Debug, Clone)]
pub struct Elastic {
    options: ElasticOptions,
    integral: f64,
    previous_target_bps: Option<f64>,
}

impl Elastic {
    pub fn new(options: ElasticOptions) -> Self {
        Self {
            options,
            integral: 0.0,
            previous_target_bps: None,
        }
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn previous_target_bps(&self) -> Option<f64> {
        self.previous_target_bps
    }
}

impl SelectionAlgorithm for Elastic {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Elastic
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        if ctx.history.len() < 2 {
            return Conventional.select(ctx);
        }
        let Some(samples) = ctx.window(self.options.window.max(1)) else {
            return ctx.lowest();
        };
        let estimate = harmonic_mean(samples);

        let level_s = ctx.buffer.level_ms as f64 / 1000.0;
        let target_s = ctx.buffer.max_ms as f64 * self.options.target_buffer_ratio / 1000.0;
        let error = level_s - target_s;
        let delivery_s = ctx.delivery_time_ms as f64 / 1000.0;

        let limit = self.options.integral_limit.abs();
        self.integral = (self.integral + delivery_s * error).clamp(-limit, limit);

        let output = self.options.k_p * error + self.options.k_i * self.integral;
        let previous = self.previous_target_bps.unwrap_or(estimate);
        let band = self.options.band.max(1.0);
        let target_bps = (previous * (1.0 + output)).clamp(estimate / band, estimate * band);

        debug!(
            estimate,
            error,
            integral = self.integral,
            previous,
            target_bps,
            "Elastic controller"
        );
        self.previous_target_bps = Some(target_bps);
        ctx.map(target_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{decide, ladder};
    use super::*;

    fn proportional(k_p: f64) -> Elastic {
        Elastic::new(ElasticOptions {
            k_p,
            k_i: 0.0,
            ..ElasticOptions::default()
        })
    }

    #[test]
    fn buffer_at_target_follows_the_estimate() {
        let mut elastic = Elastic::new(ElasticOptions::default());
        // harmonic mean of 1600 and 1600 is 1600, no correction at a half-full buffer
        assert_eq!(decide(&mut elastic, &[1600, 1600], 5_000, &ladder()), 2);
        assert_eq!(elastic.integral(), 0.0);
        assert_eq!(elastic.previous_target_bps(), Some(1600.0));
    }

    #[test]
    fn full_buffer_pushes_the_rate_up() {
        let options = ElasticOptions {
            k_p: 0.1,
            ..ElasticOptions::default()
        };
        let mut elastic = Elastic::new(options);
        // error +5 s: 1600 * (1 + 0.5 + 0.005) = 2408
        assert_eq!(decide(&mut elastic, &[1600, 1600], 10_000, &ladder()), 3);
        assert!(elastic.integral() > 0.0);
    }

    #[test]
    fn empty_buffer_pulls_the_rate_down() {
        let options = ElasticOptions {
            k_p: 0.1,
            ..ElasticOptions::default()
        };
        let mut elastic = Elastic::new(options);
        // error -5 s: 1600 * 0.495 = 792, held at the band floor of 800
        assert_eq!(decide(&mut elastic, &[1600, 1600], 0, &ladder()), 0);
        assert_eq!(elastic.previous_target_bps(), Some(800.0));
        assert!(elastic.integral() < 0.0);
    }

    #[test]
    fn consecutive_decisions_compound_through_the_previous_target() {
        let mut elastic = proportional(0.02);
        // +10 % per decision: 1760, 1936, 2129.6
        assert_eq!(decide(&mut elastic, &[1600, 1600], 10_000, &ladder()), 2);
        assert_eq!(decide(&mut elastic, &[1600, 1600], 10_000, &ladder()), 2);
        assert_eq!(decide(&mut elastic, &[1600, 1600], 10_000, &ladder()), 3);
        let target = elastic.previous_target_bps().unwrap();
        assert!((target - 2129.6).abs() < 1e-6);
    }

    #[test]
    fn target_stays_inside_the_band() {
        let mut elastic = proportional(0.1);
        assert_eq!(decide(&mut elastic, &[1600, 1600], 10_000, &ladder()), 3);
        // 2400 * 1.5 = 3600 is above 2 * 1600
        assert_eq!(decide(&mut elastic, &[1600, 1600], 10_000, &ladder()), 4);
        assert_eq!(elastic.previous_target_bps(), Some(3200.0));
    }

    #[test]
    fn integral_is_bounded() {
        let options = ElasticOptions {
            integral_limit: 2.0,
            ..ElasticOptions::default()
        };
        let mut elastic = Elastic::new(options);
        for _ in 0..50 {
            decide(&mut elastic, &[1600, 1600], 10_000, &ladder());
        }
        assert_eq!(elastic.integral(), 2.0);
    }
}
