//! Session configuration, loadable from JSON and overridable from the CLI.

use serde::Deserialize;

use crate::algorithms::{AlgorithmKind, AlgorithmOptions};
use crate::error::{PlayerError, PlayerResult};

/// Packets in the stall-predictor window when none is configured.
pub const DEFAULT_PREDICTION_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub window: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_PREDICTION_WINDOW,
        }
    }
}

/// How the player moves between manifest sources of the same content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRotation {
    /// Stay on the first manifest.
    #[default]
    Fixed,
    /// Switch to the next manifest whose segment duration lines up with the
    /// media downloaded so far.
    Aligned,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub algorithm: AlgorithmKind,
    pub max_buffer_ms: u64,
    /// Segments downloaded before playback starts.
    pub init_buffer_segments: u32,
    /// Media to download per track; the session ends once the next segment
    /// would go past it.
    pub stream_duration_ms: u64,
    /// Representations taller than this are never selected.
    pub max_height: Option<u32>,
    /// Stall prediction, off when absent.
    pub predictor: Option<PredictorConfig>,
    pub source_rotation: SourceRotation,
    /// Algorithm tunables, flattened so `exponential_ratio` or `elastic`
    /// sit at the top level of the JSON.
    #[serde(flatten)]
    pub tuning: AlgorithmOptions,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::default(),
            max_buffer_ms: 60_000,
            init_buffer_segments: 2,
            stream_duration_ms: 40_000,
            max_height: None,
            predictor: None,
            source_rotation: SourceRotation::default(),
            tuning: AlgorithmOptions::default(),
        }
    }
}

impl PlayerConfig {
    pub fn from_json(text: &str) -> PlayerResult<Self> {
        serde_json::from_str(text).map_err(|e| PlayerError::config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> PlayerResult<()> {
        if self.max_buffer_ms == 0 {
            return Err(PlayerError::config("max buffer must be greater than zero"));
        }
        if self.stream_duration_ms == 0 {
            return Err(PlayerError::config("stream duration must be greater than zero"));
        }
        let ratio = self.tuning.exponential_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return Err(PlayerError::config(format!(
                "exponential ratio {ratio} is outside (0, 1]"
            )));
        }
        if self.tuning.average_window == Some(0) {
            return Err(PlayerError::config("average window must hold at least one sample"));
        }
        if self.tuning.exponential_window == 0 {
            return Err(PlayerError::config("exponential window must hold at least one sample"));
        }
        if let Some(predictor) = &self.predictor {
            if predictor.window == 0 {
                return Err(PlayerError::config("prediction window must hold at least one packet"));
            }
        }
        Ok(())
    }
}
