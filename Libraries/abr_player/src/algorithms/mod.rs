//! Representation selection: maps throughput history and buffer occupancy
//! to the representation index of the next segment.
//!
//! Every algorithm shares [`select_index_for_bitrate`] and falls back to the
//! lowest usable index when its inputs are missing or non-positive.

mod arbiter;
mod average;
mod bba;
mod elastic;
mod logistic;

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::buffer::BufferState;
use crate::error::PlayerError;
use crate::history::ThroughputHistory;
use crate::ladder::{select_index_for_bitrate, RepresentationLadder};

pub use arbiter::{Arbiter, ArbiterOptions};
pub use average::{Conventional, ExponentialAverage, GeometricAverage, MeanAverage};
pub use bba::{bba_zone, Bba, BbaZone};
pub use elastic::{Elastic, ElasticOptions};
pub use logistic::{Logistic, LogisticOptions};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum AlgorithmKind {
    #[default]
    Conventional,
    MeanAverage,
    GeometricAverage,
    ExponentialAverage,
    Elastic,
    Bba,
    Logistic,
    Arbiter,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 8] = [
        Self::Conventional,
        Self::MeanAverage,
        Self::GeometricAverage,
        Self::ExponentialAverage,
        Self::Elastic,
        Self::Bba,
        Self::Logistic,
        Self::Arbiter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Conventional => "conventional",
            Self::MeanAverage => "average",
            Self::GeometricAverage => "geometric",
            Self::ExponentialAverage => "exponential",
            Self::Elastic => "elastic",
            Self::Bba => "bba",
            Self::Logistic => "logistic",
            Self::Arbiter => "arbiter",
        }
    }

    /// Creates a fresh algorithm instance with its own state.
    pub fn build(&self, options: &AlgorithmOptions) -> Box<dyn SelectionAlgorithm> {
        match self {
            Self::Conventional => Box::new(Conventional),
            Self::MeanAverage => Box::new(MeanAverage::new(options.average_window)),
            Self::GeometricAverage => Box::new(GeometricAverage::new(options.average_window)),
            Self::ExponentialAverage => Box::new(ExponentialAverage::new(
                options.exponential_ratio,
                options.exponential_window,
            )),
            Self::Elastic => Box::new(Elastic::new(options.elastic.clone())),
            Self::Bba => Box::new(Bba::default()),
            Self::Logistic => Box::new(Logistic::new(options.logistic.clone())),
            Self::Arbiter => Box::new(Arbiter::new(options.arbiter.clone())),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conventional" => Ok(Self::Conventional),
            "average" | "mean" | "meanaverage" => Ok(Self::MeanAverage),
            "geometric" | "geom" | "geomaverage" => Ok(Self::GeometricAverage),
            "exponential" | "ewma" | "emwa" => Ok(Self::ExponentialAverage),
            "elastic" => Ok(Self::Elastic),
            "bba" => Ok(Self::Bba),
            "logistic" => Ok(Self::Logistic),
            "arbiter" => Ok(Self::Arbiter),
            other => Err(PlayerError::config(format!(
                "unknown adaptation algorithm '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for AlgorithmKind {
    type Error = PlayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Tunables for the algorithms that have any.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlgorithmOptions {
    /// Trailing window for the mean and geometric averages; `None` uses the whole history.
    pub average_window: Option<usize>,
    /// Weight of the newest sample in the exponential average, in (0, 1].
    pub exponential_ratio: f64,
    pub exponential_window: usize,
    pub elastic: ElasticOptions,
    pub logistic: LogisticOptions,
    pub arbiter: ArbiterOptions,
}

impl Default for AlgorithmOptions {
    fn default() -> Self {
        Self {
            average_window: None,
            exponential_ratio: 0.6,
            exponential_window: 3,
            elastic: ElasticOptions::default(),
            logistic: LogisticOptions::default(),
            arbiter: ArbiterOptions::default(),
        }
    }
}

/// Inputs for one decision, gathered by the scheduler after a segment completed.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub history: &'a ThroughputHistory,
    pub buffer: &'a BufferState,
    pub ladder: &'a RepresentationLadder,
    /// Index used for the segment that just completed.
    pub current_index: usize,
    pub segment_duration_ms: u64,
    pub delivery_time_ms: u64,
    /// Forecast size in bits of the next segment per representation, when the
    /// manifest provides one.
    pub next_segment_bits: Option<&'a [u64]>,
    /// Session-wide packet-level throughput from the cross-layer accountant.
    pub crosslayer_throughput_bps: Option<f64>,
}

impl SelectionContext<'_> {
    /// The newest sample as a rate, or `None` when it cannot be used.
    pub fn latest_throughput(&self) -> Option<f64> {
        self.history
            .latest()
            .filter(|thr| *thr > 0)
            .map(|thr| thr as f64)
    }

    /// A trailing window of samples, or `None` when any of them is zero.
    pub fn window(&self, n: usize) -> Option<&[u64]> {
        let window = self.history.trailing(n);
        (!window.is_empty() && window.iter().all(|thr| *thr > 0)).then_some(window)
    }

    pub fn lowest(&self) -> usize {
        self.ladder.lowest_index()
    }

    pub fn map(&self, target_bps: f64) -> usize {
        select_index_for_bitrate(target_bps, self.ladder)
    }
}

/// One adaptation strategy. Implementations keep whatever state they need
/// between segments and must never panic on degenerate inputs.
pub trait SelectionAlgorithm: Send {
    fn kind(&self) -> AlgorithmKind;

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize;
}

impl fmt::Debug for dyn SelectionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SelectionAlgorithm({})", self.kind())
    }
}

pub(crate) fn harmonic_mean(samples: &[u64]) -> f64 {
    let reciprocal_sum: f64 = samples.iter().map(|s| 1.0 / *s as f64).sum();
    samples.len() as f64 / reciprocal_sum
}
