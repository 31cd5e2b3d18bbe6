// File: args.rs
use std::path::PathBuf;

use abr_player::algorithms::AlgorithmKind;
use abr_player::config::{PlayerConfig, PredictorConfig, SourceRotation};
use abr_player::error::PlayerResult;
use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogLevel {
    Trace = 0, // Designates very fine-grained informational events, extremely verbose.
    Debug = 1, // Designates fine-grained informational events.
    Info = 2, // Designates informational messages.
    Warn = 3, // Designates hazardous situations.
    Error = 4, // Designates very serious errors.
}

#[derive(Parser, Debug)]
#[command(version, about, long_about="A headless adaptive bitrate DASH client.")]
pub struct Args {
    /// Manifest URLs of the same content. Several are only useful with --aligned.
    #[arg(short, long = "url", num_args = 1.., required = true)]
    pub urls: Vec<String>,
    /// Adaptation algorithm (conventional, average, geometric, exponential, elastic, bba, logistic, arbiter)
    #[arg(short, long)]
    pub adapt: Option<String>,
    /// Maximum buffer level in seconds
    #[arg(long)]
    pub max_buffer: Option<u64>,
    /// Segments downloaded before playback starts
    #[arg(long)]
    pub init_buffer: Option<u32>,
    /// Seconds of media to download
    #[arg(long)]
    pub stream_duration: Option<u64>,
    #[arg(long)]
    pub exponential_ratio: Option<f64>,
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    pub predict_stall: bool,
    /// Packets in the stall prediction window; implies --predict-stall
    #[arg(long)]
    pub prediction_window: Option<usize>,
    #[arg(long)]
    pub max_height: Option<u32>,
    /// Rotate between manifests whose segment durations line up
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub aligned: bool,
    /// Retries per failed segment request
    #[arg(long, default_value = "0")]
    pub retries: usize,
    /// JSON configuration file, applied before the flags above
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Per-segment log, one JSON object per line
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Args {
    /// Overrides `config` with every flag that was given.
    pub fn apply(&self, config: &mut PlayerConfig) -> PlayerResult<()> {
        if let Some(adapt) = &self.adapt {
            config.algorithm = adapt.parse::<AlgorithmKind>()?;
        }
        if let Some(seconds) = self.max_buffer {
            config.max_buffer_ms = seconds * 1000;
        }
        if let Some(segments) = self.init_buffer {
            config.init_buffer_segments = segments;
        }
        if let Some(seconds) = self.stream_duration {
            config.stream_duration_ms = seconds * 1000;
        }
        if let Some(ratio) = self.exponential_ratio {
            config.tuning.exponential_ratio = ratio;
        }
        if self.predict_stall || self.prediction_window.is_some() {
            let mut predictor = config.predictor.unwrap_or_default();
            if let Some(window) = self.prediction_window {
                predictor.window = window;
            }
            config.predictor = Some(predictor);
        }
        if self.max_height.is_some() {
            config.max_height = self.max_height;
        }
        if self.aligned {
            config.source_rotation = SourceRotation::Aligned;
        }
        Ok(())
    }
}

pub fn parse_args() -> Args {
    Args::parse()
}

pub fn get_log_level_filter(args: &Args) -> LevelFilter {
    // Map the LogLevel enum to the LevelFilter enum
    match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use abr_player::error::PlayerError;
    use rstest::rstest;

    use super::*;

    fn parse(flags: &[&str]) -> Args {
        let mut argv = vec!["abr-client", "--url", "http://cdn/a.mpd"];
        argv.extend_from_slice(flags);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn url_is_required() {
        assert!(Args::try_parse_from(["abr-client"]).is_err());
    }

    #[test]
    fn accepts_several_urls() {
        let args = Args::try_parse_from(["abr-client", "--url", "http://a/a.mpd", "http://b/b.mpd", "--aligned"]).unwrap();
        assert_eq!(args.urls.len(), 2);
        assert!(args.aligned);
    }

    #[test]
    fn no_flags_leave_the_config_alone() {
        let mut config = PlayerConfig::from_json(r#"{"algorithm": "bba", "max_buffer_ms": 30000}"#).unwrap();
        parse(&[]).apply(&mut config).unwrap();
        assert_eq!(config.algorithm, AlgorithmKind::Bba);
        assert_eq!(config.max_buffer_ms, 30_000);
        assert!(config.predictor.is_none());
    }

    #[test]
    fn flags_override_the_config() {
        let mut config = PlayerConfig::from_json(r#"{"algorithm": "bba", "exponential_ratio": 0.3}"#).unwrap();
        parse(&[
            "--adapt",
            "exponential",
            "--max-buffer",
            "20",
            "--stream-duration",
            "90",
            "--exponential-ratio",
            "0.8",
            "--aligned",
        ])
        .apply(&mut config)
        .unwrap();

        assert_eq!(config.algorithm, AlgorithmKind::ExponentialAverage);
        assert_eq!(config.max_buffer_ms, 20_000);
        assert_eq!(config.stream_duration_ms, 90_000);
        assert_eq!(config.tuning.exponential_ratio, 0.8);
        assert_eq!(config.source_rotation, SourceRotation::Aligned);
    }

    #[rstest]
    #[case(&["--predict-stall"], 100)]
    #[case(&["--prediction-window", "40"], 40)]
    #[case(&["--predict-stall", "--prediction-window", "7"], 7)]
    fn prediction_flags_enable_the_predictor(#[case] flags: &[&str], #[case] window: usize) {
        let mut config = PlayerConfig::default();
        parse(flags).apply(&mut config).unwrap();
        assert_eq!(config.predictor, Some(PredictorConfig { window }));
    }

    #[test]
    fn unknown_algorithm_is_a_configuration_error() {
        let mut config = PlayerConfig::default();
        let err = parse(&["--adapt", "fastest"]).apply(&mut config).unwrap_err();
        assert!(matches!(err, PlayerError::Configuration(_)));
    }

    #[rstest]
    #[case(LogLevel::Trace, LevelFilter::TRACE)]
    #[case(LogLevel::Warn, LevelFilter::WARN)]
    fn log_level_maps_to_filter(#[case] level: LogLevel, #[case] filter: LevelFilter) {
        let mut args = parse(&[]);
        args.log_level = level;
        assert_eq!(get_log_level_filter(&args), filter);
    }
}
