//! DASH manifest model: one [`TrackManifest`] per adaptation set, each with its
//! representation ladder and segment addressing.

pub mod parser;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::error::{FetchError, PlayerResult};
use crate::ladder::RepresentationLadder;

static NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$Number(?::%0(\d+)d|%0(\d+)d)?\$").expect("number pattern is a valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive byte range, as written in `mediaRange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn parse(value: &str) -> Option<Self> {
        let (start, end) = value.trim().split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        (end >= start).then_some(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    pub url: String,
    pub byte_range: Option<ByteRange>,
}

/// How the segments of one representation are found.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentAddressing {
    Template {
        initialization: Option<String>,
        media: String,
    },
    List {
        initialization: Option<SegmentLocation>,
        segments: Vec<SegmentLocation>,
    },
}

/// One audio or video track of a manifest.
#[derive(Debug, Clone)]
pub struct TrackManifest {
    pub kind: TrackKind,
    pub mime_type: String,
    pub ladder: RepresentationLadder,
    pub segment_duration_ms: u64,
    pub start_number: u64,
    /// Segments available, when the manifest bounds them.
    pub segment_count: Option<u64>,
    pub base_url: String,
    /// Indexed like `ladder`.
    addressing: Vec<SegmentAddressing>,
}

impl TrackManifest {
    pub fn new(
        kind: TrackKind,
        ladder: RepresentationLadder,
        addressing: Vec<SegmentAddressing>,
        segment_duration_ms: u64,
        base_url: impl Into<String>,
    ) -> Self {
        let segment_count = addressing.iter().find_map(|a| match a {
            SegmentAddressing::List { segments, .. } => Some(segments.len() as u64),
            SegmentAddressing::Template { .. } => None,
        });
        Self {
            kind,
            mime_type: String::new(),
            ladder,
            segment_duration_ms,
            start_number: 1,
            segment_count,
            base_url: base_url.into(),
            addressing,
        }
    }

    /// Last segment number, when the manifest bounds the count.
    pub fn last_segment_number(&self) -> Option<u64> {
        self.segment_count
            .map(|count| self.start_number + count.saturating_sub(1))
    }

    pub fn has_segment(&self, number: u64) -> bool {
        number >= self.start_number && self.last_segment_number().map_or(true, |last| number <= last)
    }

    pub fn segment_location(&self, index: usize, number: u64) -> Option<SegmentLocation> {
        let rep = self.ladder.get(index)?;
        match self.addressing.get(index)? {
            SegmentAddressing::Template { media, .. } => Some(SegmentLocation {
                url: resolve_url(&self.base_url, &expand_template(media, &rep.id, rep.bandwidth, number)),
                byte_range: None,
            }),
            SegmentAddressing::List { segments, .. } => {
                let offset = number.checked_sub(self.start_number)?;
                let segment = segments.get(usize::try_from(offset).ok()?)?;
                Some(SegmentLocation {
                    url: resolve_url(&self.base_url, &segment.url),
                    byte_range: segment.byte_range,
                })
            }
        }
    }

    pub fn init_location(&self, index: usize) -> Option<SegmentLocation> {
        let rep = self.ladder.get(index)?;
        match self.addressing.get(index)? {
            SegmentAddressing::Template { initialization, .. } => {
                initialization.as_ref().map(|init| SegmentLocation {
                    url: resolve_url(&self.base_url, &expand_template(init, &rep.id, rep.bandwidth, 0)),
                    byte_range: None,
                })
            }
            SegmentAddressing::List { initialization, .. } => {
                initialization.as_ref().map(|init| SegmentLocation {
                    url: resolve_url(&self.base_url, &init.url),
                    byte_range: init.byte_range,
                })
            }
        }
    }

    /// Size in bits of segment `number` for every representation, when the
    /// manifest lists byte ranges for all of them.
    pub fn segment_bits(&self, number: u64) -> Option<Vec<u64>> {
        (0..self.ladder.len())
            .map(|index| {
                let location = self.segment_location(index, number)?;
                location.byte_range.map(|range| range.len() * 8)
            })
            .collect()
    }
}

/// A parsed manifest: one entry per usable adaptation set.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub url: String,
    pub duration_ms: Option<u64>,
    pub tracks: Vec<TrackManifest>,
}

impl Manifest {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackManifest> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Downloads and parses a manifest.
    pub async fn load(client: &Client, url: &str) -> PlayerResult<Self> {
        let text = async {
            client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        }
        .await
        .map_err(|e| FetchError::from(e).into_player_error(url))?;

        let manifest = parser::parse_mpd(url, &text)?;
        info!(
            url,
            tracks = manifest.tracks.len(),
            duration_ms = manifest.duration_ms,
            "Manifest loaded"
        );
        Ok(manifest)
    }
}

/// Expands `$RepresentationID$`, `$Bandwidth$`, `$Number$` (with optional
/// `%0Nd` width) and `$$` in a segment template.
pub fn expand_template(template: &str, representation_id: &str, bandwidth: u64, number: u64) -> String {
    let template = template
        .replace("$RepresentationID$", representation_id)
        .replace("$Bandwidth$", &bandwidth.to_string());
    replace_number_format(&template, number).replace("$$", "$")
}

fn replace_number_format(template: &str, segment_number: u64) -> String {
    NUMBER_PATTERN
        .replace_all(template, |caps: &regex::Captures| {
            match caps.get(1).or_else(|| caps.get(2)) {
                Some(width) => format!(
                    "{:0width$}",
                    segment_number,
                    width = width.as_str().parse::<usize>().unwrap_or(1)
                ),
                None => segment_number.to_string(),
            }
        })
        .to_string()
}

/// Joins a relative reference onto a base; absolute URLs pass through.
pub fn resolve_url(base: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") || base.is_empty() {
        return reference.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        reference.trim_start_matches("./").trim_start_matches('/')
    )
}
