//! Simulated playback buffer of one track.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    /// Fewer than `init_threshold` segments downloaded, playback not started.
    Prebuffering,
    Playing,
    /// The buffer went over its maximum and the loop had to idle.
    Capped,
}

/// Result of crediting one segment to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUpdate {
    /// Deficit clamped away when the buffer ran dry, 0 when playback was smooth.
    pub stall_ms: u64,
    /// How long the scheduler must idle before the next fetch.
    pub sleep_ms: u64,
    pub phase: PlaybackPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferState {
    /// Buffered, undecoded media in milliseconds. Never negative.
    pub level_ms: u64,
    pub max_ms: u64,
    /// Segments to download before playback starts.
    pub init_threshold: u32,
    prebuffered: u32,
}

impl BufferState {
    pub fn new(max_ms: u64, init_threshold: u32) -> Self {
        Self {
            level_ms: 0,
            max_ms,
            init_threshold,
            prebuffered: 0,
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        if self.prebuffered < self.init_threshold {
            PlaybackPhase::Prebuffering
        } else {
            PlaybackPhase::Playing
        }
    }

    /// Buffer left after `elapsed_ms` of playback, without mutating the state.
    pub fn projected_level_ms(&self, elapsed_ms: u64) -> u64 {
        match self.phase() {
            PlaybackPhase::Prebuffering => self.level_ms,
            _ => self.level_ms.saturating_sub(elapsed_ms),
        }
    }

    /// Drains `elapsed_ms` of playback (once playing) and credits the new
    /// segment. The returned `sleep_ms` must be passed to [`Self::apply_sleep`]
    /// after the scheduler has idled.
    pub fn on_segment(&mut self, elapsed_ms: u64, segment_ms: u64) -> BufferUpdate {
        let mut stall_ms = 0;
        let mut phase = self.phase();

        if phase == PlaybackPhase::Prebuffering {
            self.level_ms += segment_ms;
        } else {
            let current = self.level_ms as i64 - elapsed_ms as i64;
            if current < 0 {
                stall_ms = current.unsigned_abs();
            }
            self.level_ms = current.max(0) as u64 + segment_ms;
        }
        self.prebuffered = self.prebuffered.saturating_add(1);

        let sleep_ms = self.level_ms.saturating_sub(self.max_ms);
        if sleep_ms > 0 {
            phase = PlaybackPhase::Capped;
        }

        BufferUpdate {
            stall_ms,
            sleep_ms,
            phase,
        }
    }

    /// Playback drained the buffer while the scheduler idled.
    pub fn apply_sleep(&mut self, sleep_ms: u64) {
        self.level_ms = self.level_ms.saturating_sub(sleep_ms);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn prebuffering_does_not_consume_time() {
        let mut buffer = BufferState::new(10_000, 2);
        let first = buffer.on_segment(5_000, 2_000);
        assert_eq!(first.phase, PlaybackPhase::Prebuffering);
        assert_eq!(first.stall_ms, 0);
        buffer.on_segment(5_000, 2_000);
        assert_eq!(buffer.level_ms, 4_000);
        assert_eq!(buffer.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn stall_is_clamped_and_reported() {
        let mut buffer = BufferState::new(10_000, 0);
        buffer.level_ms = 1_000;
        let update = buffer.on_segment(3_500, 2_000);
        assert_eq!(update.stall_ms, 2_500);
        assert_eq!(buffer.level_ms, 2_000);
        assert_eq!(update.phase, PlaybackPhase::Playing);
    }

    #[test]
    fn overflow_sleeps_back_to_max() {
        let mut buffer = BufferState::new(10_000, 0);
        buffer.level_ms = 9_500;
        let update = buffer.on_segment(200, 2_000);
        assert_eq!(update.sleep_ms, 1_300);
        assert_eq!(update.phase, PlaybackPhase::Capped);
        buffer.apply_sleep(update.sleep_ms);
        assert_eq!(buffer.level_ms, buffer.max_ms);
    }

    #[rstest]
    #[case(&[(0, 1000), (50_000, 1000), (10, 4000), (999_999, 1)])]
    #[case(&[(4000, 4000), (4001, 4000), (0, 0), (12_000, 2000)])]
    #[case(&[(1, 1), (2, 2), (3, 3), (100, 0)])]
    fn level_never_exceeds_max_after_sleep(#[case] steps: &[(u64, u64)]) {
        let mut buffer = BufferState::new(6_000, 1);
        for (elapsed, segment) in steps {
            let update = buffer.on_segment(*elapsed, *segment);
            buffer.apply_sleep(update.sleep_ms);
            assert!(buffer.level_ms <= buffer.max_ms);
        }
    }

    #[test]
    fn projection_only_drains_while_playing() {
        let mut buffer = BufferState::new(10_000, 1);
        buffer.level_ms = 3_000;
        assert_eq!(buffer.projected_level_ms(1_000), 3_000);
        buffer.on_segment(0, 1_000);
        assert_eq!(buffer.projected_level_ms(5_000), 0);
        assert_eq!(buffer.projected_level_ms(1_500), 2_500);
    }
}
