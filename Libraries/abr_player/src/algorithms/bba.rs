use tracing::{debug, warn};

use super::{AlgorithmKind, SelectionAlgorithm, SelectionContext};

/// Share of the maximum buffer used for each static reservoir.
const RESERVOIR_RATIO: f64 = 0.1;

/// Where the buffer level falls in the reservoir model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BbaZone {
    LowerReservoir,
    UpperReservoir,
    Cushion { percentage: f64, desired_bitrate: f64 },
}

/// Buffer-based adaptation: the choice depends on buffer occupancy only.
#[derive(Debug, Clone, Default)]
pub struct Bba {
    warned_small_reservoir: bool,
}

/// Maps a buffer level onto the reservoir model. Inside the cushion the rate
/// moves linearly from `lowest_bitrate` at the lower reservoir to
/// `highest_bitrate` at the upper one.
pub fn bba_zone(level_ms: f64, max_ms: f64, lowest_bitrate: f64, highest_bitrate: f64) -> BbaZone {
    let reservoir_lower = RESERVOIR_RATIO * max_ms;
    let reservoir_upper = reservoir_lower;
    let cushion = max_ms - reservoir_lower - reservoir_upper;

    if level_ms <= reservoir_lower || cushion <= 0.0 {
        return BbaZone::LowerReservoir;
    }
    if level_ms >= max_ms - reservoir_upper {
        return BbaZone::UpperReservoir;
    }

    let percentage = (level_ms - reservoir_lower) / cushion;
    BbaZone::Cushion {
        percentage,
        desired_bitrate: lowest_bitrate + percentage * (highest_bitrate - lowest_bitrate),
    }
}

impl SelectionAlgorithm for Bba {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Bba
    }

    fn select(&mut self, ctx: &SelectionContext<'_>) -> usize {
        let max_ms = ctx.buffer.max_ms as f64;
        let reservoir_lower = RESERVOIR_RATIO * max_ms;
        if !self.warned_small_reservoir && ctx.segment_duration_ms as f64 > reservoir_lower / 2.0 {
            warn!(
                segment_duration_ms = ctx.segment_duration_ms,
                reservoir_lower,
                "The buffer is relatively small for the current segment duration"
            );
            self.warned_small_reservoir = true;
        }

        let zone = bba_zone(
            ctx.buffer.level_ms as f64,
            max_ms,
            ctx.ladder.lowest_bitrate() as f64,
            ctx.ladder.highest_bitrate() as f64,
        );
        debug!(?zone, level_ms = ctx.buffer.level_ms, "BBA zone");

        match zone {
            BbaZone::LowerReservoir => ctx.ladder.lowest_index(),
            BbaZone::UpperReservoir => ctx.ladder.highest_index(),
            BbaZone::Cushion { desired_bitrate, .. } => ctx.map(desired_bitrate),
        }
    }
}
