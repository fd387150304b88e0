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

//! Materializes MeaningfulUnits from the conversation structure and the raw
//! segments. Unit ids are deterministic: re-running the same episode yields
//! the same id set, and different episodes can never collide because the
//! episode id is a prefix.

use chrono::Utc;
use tracing::{info, warn};

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::types::{
    ConversationStructure, EmbeddingFailure, MeaningfulUnit, Segment, UnitType,
};

/// `{episode_id}_unit_{NNN}_{unit_type}` with a zero-padded 3-digit ordinal.
pub fn unit_id(episode_id: &str, ordinal: usize, unit_type: &UnitType) -> String {
    format!("{}_unit_{:03}_{}", episode_id, ordinal, unit_type)
}

/// Build units from the structure in strict ordinal order. Pure; embeddings
/// are attached separately.
pub fn build_units(
    episode_id: &str,
    segments: &[Segment],
    structure: &ConversationStructure,
) -> Vec<(MeaningfulUnit, UnitType)> {
    structure
        .units
        .iter()
        .enumerate()
        .map(|(ordinal, conversation_unit)| {
            let range = &segments[conversation_unit.start_index..=conversation_unit.end_index];

            let mut speakers: Vec<String> = Vec::new();
            for segment in range {
                if !speakers.contains(&segment.speaker) {
                    speakers.push(segment.speaker.clone());
                }
            }

            let text = range
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");

            let unit = MeaningfulUnit {
                id: unit_id(episode_id, ordinal, &conversation_unit.unit_type),
                episode_id: episode_id.to_string(),
                ordinal,
                start_ms: range.first().map(|s| s.start_ms).unwrap_or(0),
                end_ms: range.last().map(|s| s.end_ms).unwrap_or(0),
                speakers,
                text,
                summary: conversation_unit.summary.clone(),
                themes: conversation_unit.themes.clone(),
                embedding: None,
                sentiment: None,
            };
            (unit, conversation_unit.unit_type.clone())
        })
        .collect()
}

pub struct Regrouper<'a> {
    embeddings: &'a EmbeddingClient,
}

/// Units plus the list of embedding failures the driver must log.
pub struct RegroupResult {
    pub units: Vec<(MeaningfulUnit, UnitType)>,
    pub failed_embeddings: Vec<EmbeddingFailure>,
}

impl<'a> Regrouper<'a> {
    pub fn new(embeddings: &'a EmbeddingClient) -> Self {
        Self { embeddings }
    }

    /// Materialize units and attach embeddings in one batched pass. Units
    /// whose vector came back absent keep `embedding = None`; processing
    /// continues and the failure is recorded for the recovery job.
    pub async fn regroup(
        &self,
        podcast_id: &str,
        episode_id: &str,
        segments: &[Segment],
        structure: &ConversationStructure,
    ) -> Result<RegroupResult> {
        let mut units = build_units(episode_id, segments, structure);

        let texts: Vec<String> = units.iter().map(|(u, _)| u.text.clone()).collect();
        let vectors = self.embeddings.embed(&texts).await?;

        let mut failed_embeddings = Vec::new();
        for ((unit, _), vector) in units.iter_mut().zip(vectors) {
            match vector {
                Some(v) => unit.embedding = Some(v),
                None => {
                    warn!(unit_id = %unit.id, "unit embedding absent");
                    failed_embeddings.push(EmbeddingFailure {
                        podcast_id: podcast_id.to_string(),
                        episode_id: episode_id.to_string(),
                        unit_id: unit.id.clone(),
                        error: "embedding generation failed".to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        info!(
            units = units.len(),
            missing_embeddings = failed_embeddings.len(),
            "regrouped segments into meaningful units"
        );

        Ok(RegroupResult {
            units,
            failed_embeddings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationUnit;

    fn segment(index: usize, speaker: &str, text: &str) -> Segment {
        Segment {
            index,
            start_ms: (index as u64) * 1000,
            end_ms: (index as u64 + 1) * 1000,
            speaker: speaker.to_string(),
            text: text.to_string(),
        }
    }

    fn structure(ranges: &[(usize, usize, &str)]) -> ConversationStructure {
        ConversationStructure {
            units: ranges
                .iter()
                .map(|(start, end, unit_type)| ConversationUnit {
                    start_index: *start,
                    end_index: *end,
                    unit_type: UnitType::new(unit_type),
                    themes: vec!["theme".to_string()],
                    summary: "summary".to_string(),
                })
                .collect(),
            themes: vec![],
            summary: String::new(),
        }
    }

    #[test]
    fn ids_are_deterministic_and_zero_padded() {
        let segments = vec![
            segment(0, "Alice", "Hello."),
            segment(1, "Bob", "Hi."),
            segment(2, "Alice", "Let's begin."),
        ];
        let structure = structure(&[(0, 1, "introduction"), (2, 2, "topic_discussion")]);

        let first = build_units("tech_talk_2024-03-01_pilot", &segments, &structure);
        let second = build_units("tech_talk_2024-03-01_pilot", &segments, &structure);

        assert_eq!(
            first[0].0.id,
            "tech_talk_2024-03-01_pilot_unit_000_introduction"
        );
        assert_eq!(
            first[1].0.id,
            "tech_talk_2024-03-01_pilot_unit_001_topic_discussion"
        );
        // Re-running the same episode yields the same id set.
        let first_ids: Vec<&str> = first.iter().map(|(u, _)| u.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|(u, _)| u.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn different_episodes_cannot_collide() {
        let segments = vec![segment(0, "Alice", "Hello.")];
        let structure = structure(&[(0, 0, "introduction")]);

        let a = build_units("tech_talk_2024-03-01_pilot", &segments, &structure);
        let b = build_units("tech_talk_2024-03-08_sequel", &segments, &structure);
        assert_ne!(a[0].0.id, b[0].0.id);
    }

    #[test]
    fn text_is_joined_with_single_spaces_and_bounds_derive_from_range() {
        let segments = vec![
            segment(0, "Alice", "First part."),
            segment(1, "Bob", "Second part."),
            segment(2, "Alice", "Third part."),
        ];
        let structure = structure(&[(0, 2, "topic_discussion")]);
        let units = build_units("ep", &segments, &structure);

        let (unit, _) = &units[0];
        assert_eq!(unit.text, "First part. Second part. Third part.");
        assert_eq!(unit.start_ms, 0);
        assert_eq!(unit.end_ms, 3000);
    }

    #[test]
    fn speakers_are_deduplicated_in_first_appearance_order() {
        let segments = vec![
            segment(0, "Bob", "One."),
            segment(1, "Alice", "Two."),
            segment(2, "Bob", "Three."),
        ];
        let structure = structure(&[(0, 2, "topic_discussion")]);
        let units = build_units("ep", &segments, &structure);
        assert_eq!(units[0].0.speakers, vec!["Bob", "Alice"]);
    }

    #[test]
    fn ordinals_follow_structure_order() {
        let segments = (0..6)
            .map(|i| segment(i, "Alice", "Text."))
            .collect::<Vec<_>>();
        let structure = structure(&[
            (0, 1, "introduction"),
            (2, 3, "key_moment"),
            (4, 5, "conclusion"),
        ]);
        let units = build_units("ep", &segments, &structure);
        let ordinals: Vec<usize> = units.iter().map(|(u, _)| u.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}
