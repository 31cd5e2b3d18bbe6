use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::error::{PlayerError, PlayerResult};
use crate::ladder::{Representation, RepresentationLadder};
use crate::mpd::{ByteRange, Manifest, SegmentAddressing, SegmentLocation, TrackKind, TrackManifest};

#[derive(Debug, Clone, Default)]
struct TemplateAttrs {
    media: Option<String>,
    initialization: Option<String>,
    duration: Option<u64>,
    timescale: Option<u64>,
    start_number: Option<u64>,
}

impl TemplateAttrs {
    /// Attributes of `self` win, missing ones are inherited from `parent`.
    fn inherit(self, parent: Option<&TemplateAttrs>) -> Self {
        let Some(parent) = parent else {
            return self;
        };
        Self {
            media: self.media.or_else(|| parent.media.clone()),
            initialization: self.initialization.or_else(|| parent.initialization.clone()),
            duration: self.duration.or(parent.duration),
            timescale: self.timescale.or(parent.timescale),
            start_number: self.start_number.or(parent.start_number),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ListAttrs {
    duration: Option<u64>,
    timescale: Option<u64>,
    initialization: Option<SegmentLocation>,
    segments: Vec<SegmentLocation>,
}

#[derive(Debug)]
struct RepresentationDraft {
    representation: Representation,
    mime_type: Option<String>,
    template: Option<TemplateAttrs>,
    list: Option<ListAttrs>,
}

#[derive(Debug, Default)]
struct AdaptationDraft {
    content_type: Option<String>,
    mime_type: Option<String>,
    template: Option<TemplateAttrs>,
    list: Option<ListAttrs>,
    representations: Vec<RepresentationDraft>,
}

fn xml_error(e: impl std::fmt::Display) -> PlayerError {
    PlayerError::manifest(format!("malformed MPD: {e}"))
}

fn attributes(e: &BytesStart<'_>) -> PlayerResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        let key = std::str::from_utf8(attr.key.local_name().as_ref())
            .map_err(xml_error)?
            .to_string();
        let value = attr.unescape_value().map_err(xml_error)?.to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_number<T: std::str::FromStr>(attrs: &HashMap<String, String>, key: &str) -> PlayerResult<Option<T>> {
    attrs
        .get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| PlayerError::manifest(format!("invalid {key} '{value}'")))
        })
        .transpose()
}

/// Seconds in an ISO 8601 duration such as `PT1M30.5S`.
pub fn parse_duration(value: &str) -> Option<f64> {
    let iso = iso8601_duration::Duration::parse(value).ok()?;
    iso.to_std().map(|d| d.as_secs_f64())
}

fn track_kind(content_type: Option<&str>, mime_type: Option<&str>) -> Option<TrackKind> {
    let hint = content_type.or(mime_type)?;
    if hint.contains("audio") {
        Some(TrackKind::Audio)
    } else if hint.contains("video") {
        Some(TrackKind::Video)
    } else {
        None
    }
}

/// Parses an MPD document fetched from `url`. Relative segment URLs resolve
/// against the `BaseURL` element or the directory of `url`.
pub fn parse_mpd(url: &str, xml: &str) -> PlayerResult<Manifest> {
    let mut reader = Reader::from_str(xml);
    // self-closing elements still need their End event to close drafts
    reader.config_mut().expand_empty_elements = true;
    let mut buf = Vec::new();

    let mut duration_ms = None;
    let mut base_url = url.rsplit_once('/').map(|(base, _)| base).unwrap_or("").to_string();
    let mut in_base_url = false;
    let mut adaptations: Vec<AdaptationDraft> = Vec::new();
    let mut current_adaptation: Option<AdaptationDraft> = None;
    let mut current_rep: Option<RepresentationDraft> = None;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(xml_error)?;
        match event {
            Event::Start(ref e) => {
                let attrs = attributes(e)?;
                match e.local_name().as_ref() {
                    b"MPD" => {
                        if let Some(value) = attrs.get("mediaPresentationDuration") {
                            duration_ms = parse_duration(value).map(|s| (s * 1000.0).round() as u64);
                        }
                    }
                    b"BaseURL" => in_base_url = current_adaptation.is_none(),
                    b"AdaptationSet" => {
                        current_adaptation = Some(AdaptationDraft {
                            content_type: attrs.get("contentType").cloned(),
                            mime_type: attrs.get("mimeType").cloned(),
                            ..AdaptationDraft::default()
                        });
                    }
                    b"Representation" => {
                        let id = attrs.get("id").cloned().unwrap_or_default();
                        let bandwidth = parse_number::<u64>(&attrs, "bandwidth")?
                            .ok_or_else(|| PlayerError::manifest(format!("representation '{id}' has no bandwidth")))?;
                        let mut representation = Representation::new(id, bandwidth);
                        representation.width = parse_number(&attrs, "width")?;
                        representation.height = parse_number(&attrs, "height")?;
                        representation.codecs = attrs.get("codecs").cloned();
                        current_rep = Some(RepresentationDraft {
                            representation,
                            mime_type: attrs.get("mimeType").cloned(),
                            template: None,
                            list: None,
                        });
                    }
                    b"SegmentTemplate" => {
                        let template = TemplateAttrs {
                            media: attrs.get("media").cloned(),
                            initialization: attrs.get("initialization").cloned(),
                            duration: parse_number(&attrs, "duration")?,
                            timescale: parse_number(&attrs, "timescale")?,
                            start_number: parse_number(&attrs, "startNumber")?,
                        };
                        if let Some(rep) = current_rep.as_mut() {
                            rep.template = Some(template);
                        } else if let Some(adaptation) = current_adaptation.as_mut() {
                            adaptation.template = Some(template);
                        }
                    }
                    b"SegmentList" => {
                        let list = ListAttrs {
                            duration: parse_number(&attrs, "duration")?,
                            timescale: parse_number(&attrs, "timescale")?,
                            ..ListAttrs::default()
                        };
                        if let Some(rep) = current_rep.as_mut() {
                            rep.list = Some(list);
                        } else if let Some(adaptation) = current_adaptation.as_mut() {
                            adaptation.list = Some(list);
                        }
                    }
                    b"Initialization" | b"SegmentURL" => {
                        let is_init = e.local_name().as_ref() == b"Initialization";
                        let (url_key, range_key) = if is_init {
                            ("sourceURL", "range")
                        } else {
                            ("media", "mediaRange")
                        };
                        let location = SegmentLocation {
                            url: attrs.get(url_key).cloned().unwrap_or_default(),
                            byte_range: attrs.get(range_key).and_then(|r| ByteRange::parse(r)),
                        };
                        let list = match current_rep.as_mut() {
                            Some(rep) => rep.list.as_mut(),
                            None => current_adaptation.as_mut().and_then(|a| a.list.as_mut()),
                        };
                        if let Some(list) = list {
                            if is_init {
                                list.initialization = Some(location);
                            } else {
                                list.segments.push(location);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) if in_base_url => {
                let text = t.unescape().map_err(xml_error)?;
                let text = text.trim();
                if !text.is_empty() {
                    base_url = super::resolve_url(&base_url, text).trim_end_matches('/').to_string();
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"BaseURL" => in_base_url = false,
                b"Representation" => {
                    if let (Some(rep), Some(adaptation)) = (current_rep.take(), current_adaptation.as_mut()) {
                        adaptation.representations.push(rep);
                    }
                }
                b"AdaptationSet" => {
                    if let Some(adaptation) = current_adaptation.take() {
                        adaptations.push(adaptation);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let mut tracks = Vec::new();
    for adaptation in adaptations {
        if let Some(track) = build_track(adaptation, &base_url, duration_ms)? {
            tracks.push(track);
        }
    }
    if tracks.is_empty() {
        return Err(PlayerError::manifest(format!("{url} has no audio or video adaptation set")));
    }

    Ok(Manifest {
        url: url.to_string(),
        duration_ms,
        tracks,
    })
}

fn build_track(
    adaptation: AdaptationDraft,
    base_url: &str,
    presentation_ms: Option<u64>,
) -> PlayerResult<Option<TrackManifest>> {
    let first_mime = adaptation
        .representations
        .first()
        .and_then(|r| r.mime_type.as_deref());
    let mime_type = adaptation.mime_type.as_deref().or(first_mime);
    let Some(kind) = track_kind(adaptation.content_type.as_deref(), mime_type) else {
        debug!(content_type = ?adaptation.content_type, "Skipping adaptation set");
        return Ok(None);
    };
    let mime_type = mime_type.unwrap_or_default().to_string();

    let mut resolved = Vec::with_capacity(adaptation.representations.len());
    let mut segment_duration_ms = None;
    let mut start_number = None;

    for draft in adaptation.representations {
        let id = draft.representation.id.clone();
        let (addressing, duration_ms, start) = if let Some(list) = draft.list.or_else(|| adaptation.list.clone()) {
            let timescale = list.timescale.unwrap_or(1).max(1);
            let duration_ms = list.duration.map(|d| d * 1000 / timescale);
            (
                SegmentAddressing::List {
                    initialization: list.initialization,
                    segments: list.segments,
                },
                duration_ms,
                1,
            )
        } else {
            let template = draft
                .template
                .unwrap_or_default()
                .inherit(adaptation.template.as_ref());
            let media = template
                .media
                .ok_or_else(|| PlayerError::manifest(format!("representation '{id}' has no segment addressing")))?;
            let timescale = template.timescale.unwrap_or(1).max(1);
            (
                SegmentAddressing::Template {
                    initialization: template.initialization,
                    media,
                },
                template.duration.map(|d| d * 1000 / timescale),
                template.start_number.unwrap_or(1),
            )
        };

        match (segment_duration_ms, duration_ms) {
            (None, Some(d)) => segment_duration_ms = Some(d),
            (Some(first), Some(d)) if first != d => {
                warn!(representation = %id, first, duration_ms = d, "Segment durations differ within a track");
            }
            _ => {}
        }
        start_number.get_or_insert(start);
        resolved.push((draft.representation, addressing));
    }

    let segment_duration_ms = segment_duration_ms
        .filter(|d| *d > 0)
        .ok_or_else(|| PlayerError::manifest(format!("{kind} track has no segment duration")))?;

    resolved.sort_by_key(|(rep, _)| rep.bandwidth);
    let (representations, addressing): (Vec<_>, Vec<_>) = resolved.into_iter().unzip();
    let ladder = RepresentationLadder::new(representations)
        .map_err(|_| PlayerError::manifest(format!("{kind} track has no representations")))?;

    let mut track = TrackManifest::new(kind, ladder, addressing, segment_duration_ms, base_url);
    track.mime_type = mime_type;
    track.start_number = start_number.unwrap_or(1);
    if track.segment_count.is_none() {
        track.segment_count = presentation_ms.map(|total| total.div_ceil(segment_duration_ms));
    }
    Ok(Some(track))
}
