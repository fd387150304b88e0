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

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A single speaker-timed cue from the VTT source. Input-only; segments are
/// held in memory during processing and never persisted to the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// 0-based, contiguous across the episode.
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub speaker: String,
    pub text: String,
}

/// Label chosen by the conversation analyzer for a unit. The set is open
/// (the model may invent labels), so this is a normalized string rather than
/// a closed enum. Normalization keeps the label safe to embed in unit ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitType(String);

impl UnitType {
    pub fn new(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        let mut last_was_sep = true;
        for c in raw.trim().chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_lowercase());
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        }
        while out.ends_with('_') {
            out.pop();
        }
        if out.is_empty() {
            out.push_str("topic_discussion");
        }
        UnitType(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One typed unit in the analyzer's cover of the segment range. Indices are
/// inclusive and refer to `Segment.index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationUnit {
    pub start_index: usize,
    pub end_index: usize,
    pub unit_type: UnitType,
    pub themes: Vec<String>,
    pub summary: String,
}

/// Analyzer output for one episode: a strictly ordered, non-overlapping
/// cover of the segments plus episode-level themes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStructure {
    pub units: Vec<ConversationUnit>,
    pub themes: Vec<String>,
    pub summary: String,
}

/// One emotion tag on a sentiment record, already threshold-filtered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    pub name: String,
    pub intensity: f32,
}

/// Sentiment for a meaningful unit. All fields are clamped into their
/// declared ranges before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    /// [-1, 1]
    pub polarity: f32,
    /// [0, 1]
    pub score: f32,
    /// [0, 1]
    pub energy_level: f32,
    #[serde(default)]
    pub emotions: Vec<Emotion>,
}

/// A semantically coherent group of contiguous segments, the unit of
/// persistence and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeaningfulUnit {
    /// `{episode_id}_unit_{NNN}_{unit_type}` - globally unique, stable
    /// across re-runs of the same episode.
    pub id: String,
    pub episode_id: String,
    pub ordinal: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    /// De-duplicated, in order of first appearance.
    pub speakers: Vec<String>,
    /// Segment texts joined with single spaces.
    pub text: String,
    pub summary: String,
    pub themes: Vec<String>,
    /// Either a full vector of the configured dimension or absent, never
    /// partial.
    pub embedding: Option<Vec<f32>>,
    pub sentiment: Option<Sentiment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Complete => "complete",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "in_progress" => Some(ProcessingStatus::InProgress),
            "complete" => Some(ProcessingStatus::Complete),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeCounts {
    pub segments: usize,
    pub units: usize,
    pub entities: usize,
}

/// Episode node state as owned by the driver until commit.
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: String,
    pub podcast_id: String,
    pub title: String,
    pub publication_date: NaiveDate,
    pub source_file_hash: String,
    pub status: ProcessingStatus,
    pub archive_path: Option<PathBuf>,
    pub counts: EpisodeCounts,
}

/// A named thing mentioned in a unit. No embedding is stored on entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// `entity_{canonical slug}` - identical mentions across episodes
    /// collapse onto one node.
    pub id: String,
    pub canonical_name: String,
    pub entity_type: String,
    pub mention_offsets: Vec<usize>,
}

/// A verbatim quote; `text` is guaranteed to occur as a substring of the
/// parent unit's text (after NFC + whitespace normalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub speaker: String,
    pub text: String,
    pub unit_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub statement: String,
    pub category: String,
    pub unit_id: String,
}

/// Entity-to-entity relationship with unit provenance. Persisted by entity
/// id, never by in-memory reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub subject_id: String,
    pub predicate: String,
    pub object_id: String,
    pub unit_id: String,
}

/// Validated result of the combined extraction call for one unit.
#[derive(Debug, Clone, Default)]
pub struct UnitExtraction {
    pub entities: Vec<Entity>,
    pub quotes: Vec<Quote>,
    pub insights: Vec<Insight>,
    pub relationships: Vec<EntityRelationship>,
    pub sentiment: Option<Sentiment>,
}

/// One line in the embedding failure log, consumed by the backfill job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingFailure {
    pub podcast_id: String,
    pub episode_id: String,
    pub unit_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// One line in the extraction failure log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub podcast_id: String,
    pub episode_id: String,
    pub unit_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}
