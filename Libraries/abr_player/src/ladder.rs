//! Representation ladder: the bandwidth table of one media track.

use crate::error::{PlayerError, PlayerResult};

/// One encoded quality of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    /// Position in the ascending ladder.
    pub index: usize,
    /// Identifier from the manifest, used for URL templates.
    pub id: String,
    /// Bandwidth in bits per second (bps).
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codecs: Option<String>,
}

impl Representation {
    pub fn new(id: impl Into<String>, bandwidth: u64) -> Self {
        Self {
            index: 0,
            id: id.into(),
            bandwidth,
            width: None,
            height: None,
            codecs: None,
        }
    }
}

/// Representations sorted by ascending bandwidth, indices `0..N-1`.
///
/// `lowest_index`/`highest_index` bound the usable range; they only differ
/// from `0`/`N-1` when a constraint such as a maximum height narrows it.
#[derive(Debug, Clone, PartialEq)]
pub struct RepresentationLadder {
    representations: Vec<Representation>,
    lowest_index: usize,
    highest_index: usize,
}

impl RepresentationLadder {
    /// Sorts the representations by bandwidth and renumbers them.
    pub fn new(mut representations: Vec<Representation>) -> PlayerResult<Self> {
        if representations.is_empty() {
            return Err(PlayerError::config("representation ladder is empty"));
        }
        representations.sort_by_key(|r| r.bandwidth);
        for (index, rep) in representations.iter_mut().enumerate() {
            rep.index = index;
        }
        let highest_index = representations.len() - 1;
        Ok(Self {
            representations,
            lowest_index: 0,
            highest_index,
        })
    }

    pub fn from_bandwidths(bandwidths: &[u64]) -> PlayerResult<Self> {
        Self::new(
            bandwidths
                .iter()
                .enumerate()
                .map(|(i, bw)| Representation::new(i.to_string(), *bw))
                .collect(),
        )
    }

    /// Drops representations taller than `max_height` from the usable range.
    /// Representations without a height are kept. The lowest rung always stays.
    pub fn limit_height(mut self, max_height: u32) -> Self {
        let highest = self
            .representations
            .iter()
            .rev()
            .find(|r| r.height.map_or(true, |h| h <= max_height))
            .map_or(self.lowest_index, |r| r.index);
        self.highest_index = highest.max(self.lowest_index);
        self
    }

    pub fn len(&self) -> usize {
        self.representations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.representations.is_empty()
    }

    pub fn lowest_index(&self) -> usize {
        self.lowest_index
    }

    pub fn highest_index(&self) -> usize {
        self.highest_index
    }

    pub fn get(&self, index: usize) -> Option<&Representation> {
        self.representations.get(index)
    }

    pub fn representations(&self) -> &[Representation] {
        &self.representations
    }

    /// Bandwidth of `index`, clamped into the usable range.
    pub fn bandwidth(&self, index: usize) -> u64 {
        self.representations[self.clamp(index)].bandwidth
    }

    pub fn lowest_bitrate(&self) -> u64 {
        self.representations[self.lowest_index].bandwidth
    }

    pub fn highest_bitrate(&self) -> u64 {
        self.representations[self.highest_index].bandwidth
    }

    pub fn clamp(&self, index: usize) -> usize {
        index.clamp(self.lowest_index, self.highest_index)
    }
}

/// Highest usable index whose bandwidth is `<= target_bps`, or the lowest
/// index when the target is below every rung (or not a positive number).
pub fn select_index_for_bitrate(target_bps: f64, ladder: &RepresentationLadder) -> usize {
    if target_bps.is_nan() || target_bps <= 0.0 {
        return ladder.lowest_index();
    }
    ladder.representations[ladder.lowest_index..=ladder.highest_index]
        .iter()
        .take_while(|r| r.bandwidth as f64 <= target_bps)
        .last()
        .map_or(ladder.lowest_index(), |r| r.index)
}
