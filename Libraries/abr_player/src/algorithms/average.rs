use tracing::debug;

use super::{AlgorithmKind, SelectionAlgorithm, SelectionContext};

/// Follows the most recent throughput sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conventional;

impl SelectionAlgorithm for Conventional {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Conventional
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        match ctx.latest_throughput() {
            Some(thr) => ctx.map(thr),
            None => ctx.lowest(),
        }
    }
}

/// Shared shape of the averaging algorithms: with fewer than two samples they
/// behave like [`Conventional`], otherwise they map `average(window)`.
fn select_with_average(
    ctx: &SelectionContext<'_>,
    window: usize,
    average: impl Fn(&[u64]) -> f64,
) -> usize {
    if ctx.history.len() < 2 {
        return Conventional.select(ctx);
    }
    match ctx.window(window) {
        Some(samples) => ctx.map(average(samples)),
        None => ctx.lowest(),
    }
}

/// Arithmetic mean of the history (or a trailing window of it).
#[derive(Debug, Clone, Default)]
pub struct MeanAverage {
    window: Option<usize>,
}

impl MeanAverage {
    pub fn new(window: Option<usize>) -> Self {
        Self { window }
    }
}

impl SelectionAlgorithm for MeanAverage {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::MeanAverage
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        let window = self.window.unwrap_or(usize::MAX);
        select_with_average(ctx, window, |samples| {
            let average = samples.iter().map(|s| *s as f64).sum::<f64>() / samples.len() as f64;
            if let Some(xl) = ctx.crosslayer_throughput_bps {
                debug!(average, crosslayer = xl, "Mean average next to cross-layer average");
            }
            average
        })
    }
}

/// Geometric mean, computed in log space so long histories do not overflow.
#[derive(Debug, Clone, Default)]
pub struct GeometricAverage {
    window: Option<usize>,
}

impl GeometricAverage {
    pub fn new(window: Option<usize>) -> Self {
        Self { window }
    }
}

impl SelectionAlgorithm for GeometricAverage {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::GeometricAverage
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        let window = self.window.unwrap_or(usize::MAX);
        select_with_average(ctx, window, geometric_mean)
    }
}

pub(crate) fn geometric_mean(samples: &[u64]) -> f64 {
    let log_sum: f64 = samples.iter().map(|s| (*s as f64).ln()).sum();
    (log_sum / samples.len() as f64).exp()
}

/// Exponentially weighted moving average over the last `window` samples,
/// oldest first; `ratio` is the weight given to each newer sample.
#[derive(Debug, Clone)]
pub struct ExponentialAverage {
    ratio: f64,
    window: usize,
}

impl ExponentialAverage {
    pub fn new(ratio: f64, window: usize) -> Self {
        Self {
            ratio: ratio.clamp(f64::EPSILON, 1.0),
            window: window.max(2),
        }
    }
}

impl SelectionAlgorithm for ExponentialAverage {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::ExponentialAverage
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        let ratio = self.ratio;
        select_with_average(ctx, self.window, |samples| {
            samples[1..]
                .iter()
                .fold(samples[0] as f64, |ewma, s| ratio * *s as f64 + (1.0 - ratio) * ewma)
        })
    }
}
