/*
 * Podcast Knowledge Pipeline - Rust Edition
 * Copyright (c) 2024 Podcast Knowledge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! WebVTT transcript parser: ordered cues with millisecond timestamps,
//! `<v Speaker Name>` voice tags, and NOTE blocks carrying podcast/episode
//! metadata.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

use crate::error::{IngestError, Result};
use crate::types::Segment;

lazy_static! {
    static ref TIMESTAMP_LINE: Regex = Regex::new(
        r"^\s*(\d{1,2}:)?(\d{1,2}):(\d{2})\.(\d{3})\s*-->\s*(\d{1,2}:)?(\d{1,2}):(\d{2})\.(\d{3})"
    )
    .unwrap();
    static ref VOICE_TAG: Regex = Regex::new(r"^<v(?:\.[^ >]*)?\s+([^>]+)>").unwrap();
    static ref MARKUP_TAG: Regex = Regex::new(r"</?[^>]+>").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct VttCue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub speaker: String,
    pub text: String,
}

/// Episode metadata extracted from NOTE blocks
/// (`NOTE\nPodcast: ...\nEpisode: ...\nDate: ...`).
#[derive(Debug, Clone, Default)]
pub struct VttMetadata {
    pub podcast: Option<String>,
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VttDocument {
    pub metadata: VttMetadata,
    pub cues: Vec<VttCue>,
}

impl VttDocument {
    /// Episode title, falling back to the file stem when no NOTE block
    /// carries one.
    pub fn title_or(&self, path: &Path) -> String {
        self.metadata.title.clone().unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("untitled")
                .to_string()
        })
    }

    /// Convert cues into contiguously indexed segments.
    pub fn to_segments(&self) -> Vec<Segment> {
        self.cues
            .iter()
            .enumerate()
            .map(|(index, cue)| Segment {
                index,
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                speaker: cue.speaker.clone(),
                text: cue.text.clone(),
            })
            .collect()
    }
}

fn parse_timestamp_pair(line: &str) -> Option<(u64, u64)> {
    let caps = TIMESTAMP_LINE.captures(line)?;
    let part = |hours: Option<&str>, m: &str, s: &str, ms: &str| -> u64 {
        let h: u64 = hours
            .map(|h| h.trim_end_matches(':').parse().unwrap_or(0))
            .unwrap_or(0);
        let m: u64 = m.parse().unwrap_or(0);
        let s: u64 = s.parse().unwrap_or(0);
        let ms: u64 = ms.parse().unwrap_or(0);
        ((h * 60 + m) * 60 + s) * 1000 + ms
    };
    let start = part(
        caps.get(1).map(|c| c.as_str()),
        &caps[2],
        &caps[3],
        &caps[4],
    );
    let end = part(
        caps.get(5).map(|c| c.as_str()),
        &caps[6],
        &caps[7],
        &caps[8],
    );
    Some((start, end))
}

/// Extract the speaker from a payload line. Returns (speaker, cleaned text);
/// speaker falls back to the previous cue's voice when the payload carries
/// no tag, and to a generic label at the start of the file.
fn parse_payload_line(line: &str, current_speaker: &str) -> (String, String) {
    let trimmed = line.trim();
    if let Some(caps) = VOICE_TAG.captures(trimmed) {
        let speaker = caps[1].trim().to_string();
        let rest = &trimmed[caps.get(0).unwrap().end()..];
        let text = MARKUP_TAG.replace_all(rest, "").trim().to_string();
        (speaker, text)
    } else {
        let text = MARKUP_TAG.replace_all(trimmed, "").trim().to_string();
        (current_speaker.to_string(), text)
    }
}

fn parse_note_block(lines: &[String], metadata: &mut VttMetadata) {
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "podcast" => metadata.podcast = Some(value.to_string()),
            "episode" | "title" => metadata.title = Some(value.to_string()),
            "date" => metadata.date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok(),
            "description" => metadata.description = Some(value.to_string()),
            _ => {}
        }
    }
}

pub fn parse(content: &str) -> Result<VttDocument> {
    let mut lines = content.lines();
    match lines.next() {
        Some(first) if first.trim_start_matches('\u{feff}').starts_with("WEBVTT") => {}
        _ => {
            return Err(IngestError::StructureInvalid(
                "missing WEBVTT header".into(),
            ))
        }
    }

    let mut metadata = VttMetadata::default();
    let mut cues: Vec<VttCue> = Vec::new();
    let mut current_speaker = "Speaker 0".to_string();

    let all: Vec<&str> = lines.collect();
    let mut i = 0;
    while i < all.len() {
        let line = all[i].trim_end();
        if line.trim().is_empty() {
            i += 1;
            continue;
        }

        if line.trim_start().starts_with("NOTE") {
            let mut block = Vec::new();
            let inline = line.trim_start().trim_start_matches("NOTE").trim();
            if !inline.is_empty() {
                block.push(inline.to_string());
            }
            i += 1;
            while i < all.len() && !all[i].trim().is_empty() {
                block.push(all[i].to_string());
                i += 1;
            }
            parse_note_block(&block, &mut metadata);
            continue;
        }

        // A cue is an optional identifier line followed by a timing line.
        let timing_line = if TIMESTAMP_LINE.is_match(line) {
            line
        } else if i + 1 < all.len() && TIMESTAMP_LINE.is_match(all[i + 1]) {
            i += 1;
            all[i]
        } else {
            // STYLE/REGION blocks and stray text are skipped wholesale.
            i += 1;
            while i < all.len() && !all[i].trim().is_empty() {
                i += 1;
            }
            continue;
        };

        let Some((start_ms, end_ms)) = parse_timestamp_pair(timing_line) else {
            return Err(IngestError::StructureInvalid(format!(
                "malformed cue timing line: '{}'",
                timing_line.trim()
            )));
        };

        i += 1;
        let mut speaker = None;
        let mut text_parts: Vec<String> = Vec::new();
        while i < all.len() && !all[i].trim().is_empty() {
            let (line_speaker, text) = parse_payload_line(all[i], &current_speaker);
            if speaker.is_none() {
                speaker = Some(line_speaker);
            }
            if !text.is_empty() {
                text_parts.push(text);
            }
            i += 1;
        }

        let speaker = speaker.unwrap_or_else(|| current_speaker.clone());
        current_speaker = speaker.clone();
        let text = text_parts.join(" ");
        if !text.is_empty() {
            cues.push(VttCue {
                start_ms,
                end_ms,
                speaker,
                text,
            });
        }
    }

    Ok(VttDocument { metadata, cues })
}

pub fn parse_file(path: &Path) -> Result<VttDocument> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\nNOTE\nPodcast: Tech Talk\nEpisode: Scaling Databases\nDate: 2024-03-01\n\n00:00:00.000 --> 00:00:04.120\n<v Alice>Welcome back to the show.\n\n00:00:04.120 --> 00:00:09.500\n<v Bob>Thanks, great to be here.\n\n1\n00:00:09.500 --> 00:00:12.000\nSo, scaling databases.\n";

    #[test]
    fn parses_cues_with_voice_tags() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(doc.cues.len(), 3);
        assert_eq!(doc.cues[0].speaker, "Alice");
        assert_eq!(doc.cues[0].text, "Welcome back to the show.");
        assert_eq!(doc.cues[0].start_ms, 0);
        assert_eq!(doc.cues[0].end_ms, 4120);
        assert_eq!(doc.cues[1].speaker, "Bob");
        // No voice tag: the previous speaker carries over.
        assert_eq!(doc.cues[2].speaker, "Bob");
        assert_eq!(doc.cues[2].text, "So, scaling databases.");
    }

    #[test]
    fn parses_note_metadata() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(doc.metadata.podcast.as_deref(), Some("Tech Talk"));
        assert_eq!(doc.metadata.title.as_deref(), Some("Scaling Databases"));
        assert_eq!(
            doc.metadata.date,
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
    }

    #[test]
    fn segments_are_contiguously_indexed() {
        let doc = parse(SAMPLE).unwrap();
        let segments = doc.to_segments();
        let indices: Vec<usize> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn generic_speaker_without_voice_tags() {
        let vtt = "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHello there.\n";
        let doc = parse(vtt).unwrap();
        assert_eq!(doc.cues[0].speaker, "Speaker 0");
    }

    #[test]
    fn hour_field_is_optional() {
        let vtt = "WEBVTT\n\n01:05.250 --> 01:09.000\n<v Carol>Short form timestamps.\n";
        let doc = parse(vtt).unwrap();
        assert_eq!(doc.cues[0].start_ms, 65_250);
        assert_eq!(doc.cues[0].end_ms, 69_000);
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(matches!(
            parse("00:00:00.000 --> 00:00:01.000\nhi\n"),
            Err(IngestError::StructureInvalid(_))
        ));
    }

    #[test]
    fn empty_transcript_yields_no_cues() {
        let doc = parse("WEBVTT\n").unwrap();
        assert!(doc.cues.is_empty());
    }

    #[test]
    fn markup_is_stripped_from_payload() {
        let vtt = "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\n<v Dana>I <i>really</i> mean it.\n";
        let doc = parse(vtt).unwrap();
        assert_eq!(doc.cues[0].text, "I really mean it.");
    }
}
