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

//! Conversation analysis: one JSON-mode call that covers the segment range
//! with typed units, followed by a deterministic index-repair pass and a
//! strict validator. Structure that cannot be repaired fails the episode;
//! it is never guessed.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::llm::{parse_json_strict, CompletionOptions, LlmProvider};
use crate::types::{ConversationStructure, ConversationUnit, Segment, UnitType};

pub const STRUCTURE_TEMPLATE_NAME: &str = "conversation_structure";
pub const STRUCTURE_TEMPLATE_VERSION: &str = "v2";

pub const STRUCTURE_SYSTEM_PROMPT: &str = "You are a conversation analyst for podcast transcripts. \
You group numbered transcript segments into coherent conversational units and respond with JSON only, \
matching the requested schema exactly. Never include markdown fences or commentary.";

/// Raw unit as returned by the model; indices may be out of range or
/// overlapping until the repair pass has run.
#[derive(Debug, Clone, Deserialize)]
struct RawUnit {
    start_index: i64,
    end_index: i64,
    unit_type: String,
    #[serde(default)]
    themes: Vec<String>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct RawStructure {
    units: Vec<RawUnit>,
    #[serde(default)]
    themes: Vec<String>,
    #[serde(default)]
    summary: String,
}

fn build_prompt(podcast_name: &str, episode_title: &str, segments: &[Segment]) -> String {
    let mut numbered = String::with_capacity(segments.len() * 80);
    for segment in segments {
        numbered.push_str(&format!(
            "[{}] {}: {}\n",
            segment.index, segment.speaker, segment.text
        ));
    }

    format!(
        r#"Podcast: {podcast}
Episode: {title}

Segments ({count} total, numbered 0 to {last}):
{numbered}
Group the segments into conversational units covering the discussion in order.
Unit types: introduction, topic_discussion, transition, conclusion, key_moment, tangent
(or another short snake_case label if none fits).

Rules:
- Units must be in order and must not overlap: if unit i ends at index N,
  unit i+1 must start at index N+1 or later.
- start_index and end_index are inclusive segment numbers from the list above.
- Give each unit 1-3 themes and a one-sentence summary.

Respond with JSON only:
{{"units": [{{"start_index": 0, "end_index": 4, "unit_type": "introduction", "themes": ["..."], "summary": "..."}}], "themes": ["episode-level themes"], "summary": "one-paragraph episode summary"}}"#,
        podcast = podcast_name,
        title = episode_title,
        count = segments.len(),
        last = segments.len().saturating_sub(1),
        numbered = numbered,
    )
}

/// Repair pass over model-reported indices:
/// clip to `[0, segment_count - 1]`, sort by start, shrink the earlier unit
/// of every colliding pair, and drop units that end up empty.
fn repair_units(units: Vec<RawUnit>, segment_count: usize) -> Vec<RawUnit> {
    let last = segment_count.saturating_sub(1) as i64;
    let mut clipped: Vec<RawUnit> = units
        .into_iter()
        .filter_map(|mut unit| {
            unit.start_index = unit.start_index.clamp(0, last);
            unit.end_index = unit.end_index.clamp(0, last);
            (unit.start_index <= unit.end_index).then_some(unit)
        })
        .collect();

    clipped.sort_by_key(|u| (u.start_index, u.end_index));

    let mut repaired: Vec<RawUnit> = Vec::with_capacity(clipped.len());
    for unit in clipped {
        if let Some(prev) = repaired.last_mut() {
            if prev.end_index >= unit.start_index {
                debug!(
                    prev_end = prev.end_index,
                    curr_start = unit.start_index,
                    "repairing unit overlap"
                );
                prev.end_index = unit.start_index - 1;
                if prev.end_index < prev.start_index {
                    repaired.pop();
                }
            }
        }
        repaired.push(unit);
    }
    repaired
}

/// Hard validation contract: strictly ordered, non-overlapping units. Both
/// overlap and equal-index adjacency are rejected.
fn validate_units(units: &[RawUnit], segment_count: usize) -> std::result::Result<(), String> {
    if units.is_empty() {
        return Err("no units remain after repair".into());
    }
    let last = segment_count.saturating_sub(1) as i64;
    for unit in units {
        if unit.start_index < 0 || unit.end_index > last || unit.start_index > unit.end_index {
            return Err(format!(
                "unit range [{}, {}] is outside segments [0, {}]",
                unit.start_index, unit.end_index, last
            ));
        }
    }
    for pair in units.windows(2) {
        if pair[0].end_index >= pair[1].start_index {
            return Err(format!(
                "unit ending at {} collides with unit starting at {}",
                pair[0].end_index, pair[1].start_index
            ));
        }
    }
    Ok(())
}

pub struct ConversationAnalyzer<'a> {
    provider: &'a dyn LlmProvider,
    config: &'a Config,
}

impl<'a> ConversationAnalyzer<'a> {
    pub fn new(provider: &'a dyn LlmProvider, config: &'a Config) -> Self {
        Self { provider, config }
    }

    pub async fn analyze(
        &self,
        podcast_name: &str,
        episode_title: &str,
        segments: &[Segment],
    ) -> Result<ConversationStructure> {
        if segments.is_empty() {
            return Err(IngestError::StructureInvalid(
                "transcript contains no segments".into(),
            ));
        }

        let prompt = build_prompt(podcast_name, episode_title, segments);
        let options = CompletionOptions {
            model: self.config.gemini.flash_model.clone(),
            system: Some(STRUCTURE_SYSTEM_PROMPT.to_string()),
            json_mode: true,
            temperature: self.config.gemini.temperature,
            max_output_tokens: self.config.gemini.max_output_tokens,
        };

        let completion = self.provider.complete_with_options(&prompt, &options).await?;
        // A structure response that is not parseable JSON fails the whole
        // episode, unlike a per-unit extraction parse failure.
        let raw: RawStructure = parse_json_strict(&completion.content).map_err(|e| {
            IngestError::StructureInvalid(format!("unparseable structure JSON: {}", e))
        })?;

        let reported = raw.units.len();
        let repaired = repair_units(raw.units, segments.len());
        if repaired.len() != reported {
            warn!(
                reported,
                kept = repaired.len(),
                "analyzer output needed unit repair"
            );
        }

        validate_units(&repaired, segments.len())
            .map_err(IngestError::StructureInvalid)?;

        info!(
            units = repaired.len(),
            themes = raw.themes.len(),
            "conversation structure accepted"
        );

        Ok(ConversationStructure {
            units: repaired
                .into_iter()
                .map(|u| ConversationUnit {
                    start_index: u.start_index as usize,
                    end_index: u.end_index as usize,
                    unit_type: UnitType::new(&u.unit_type),
                    themes: u.themes,
                    summary: u.summary,
                })
                .collect(),
            themes: raw.themes,
            summary: raw.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_unit(start: i64, end: i64) -> RawUnit {
        RawUnit {
            start_index: start,
            end_index: end,
            unit_type: "topic_discussion".to_string(),
            themes: vec![],
            summary: String::new(),
        }
    }

    fn ranges(units: &[RawUnit]) -> Vec<(i64, i64)> {
        units.iter().map(|u| (u.start_index, u.end_index)).collect()
    }

    #[test]
    fn equal_index_adjacency_is_repaired() {
        // The overlap-at-equal-indices shape: unit 1 ends where unit 2
        // starts. The earlier unit must shrink by one.
        let repaired = repair_units(
            vec![raw_unit(0, 5), raw_unit(5, 10), raw_unit(10, 12)],
            13,
        );
        assert_eq!(ranges(&repaired), vec![(0, 4), (5, 9), (10, 12)]);
        assert!(validate_units(&repaired, 13).is_ok());
    }

    #[test]
    fn overlapping_unit_is_shrunk() {
        let repaired = repair_units(vec![raw_unit(0, 7), raw_unit(5, 10)], 11);
        assert_eq!(ranges(&repaired), vec![(0, 4), (5, 10)]);
        assert!(validate_units(&repaired, 11).is_ok());
    }

    #[test]
    fn emptied_unit_is_dropped() {
        // First unit is fully swallowed by the second's start.
        let repaired = repair_units(vec![raw_unit(3, 4), raw_unit(3, 10)], 11);
        assert_eq!(ranges(&repaired), vec![(3, 10)]);
    }

    #[test]
    fn out_of_range_indices_are_clipped() {
        let repaired = repair_units(vec![raw_unit(-2, 3), raw_unit(4, 99)], 10);
        assert_eq!(ranges(&repaired), vec![(0, 3), (4, 9)]);
        assert!(validate_units(&repaired, 10).is_ok());
    }

    #[test]
    fn unsorted_units_are_ordered_before_repair() {
        let repaired = repair_units(vec![raw_unit(6, 9), raw_unit(0, 5)], 10);
        assert_eq!(ranges(&repaired), vec![(0, 5), (6, 9)]);
    }

    #[test]
    fn validator_rejects_equal_index_collision() {
        // Post-repair the validator is strict: end >= next start fails,
        // equality included.
        let unrepaired = vec![raw_unit(0, 5), raw_unit(5, 10)];
        assert!(validate_units(&unrepaired, 11).is_err());
    }

    #[test]
    fn validator_rejects_empty_cover() {
        assert!(validate_units(&[], 5).is_err());
    }

    #[test]
    fn prompt_numbers_all_segments() {
        let segments = vec![
            Segment {
                index: 0,
                start_ms: 0,
                end_ms: 1000,
                speaker: "Alice".into(),
                text: "Hello".into(),
            },
            Segment {
                index: 1,
                start_ms: 1000,
                end_ms: 2000,
                speaker: "Bob".into(),
                text: "Hi there".into(),
            },
        ];
        let prompt = build_prompt("Tech Talk", "Pilot", &segments);
        assert!(prompt.contains("[0] Alice: Hello"));
        assert!(prompt.contains("[1] Bob: Hi there"));
        assert!(prompt.contains("unit i+1 must start at index N+1 or later"));
    }
}
