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

//! End-to-end invariants over the pure pipeline stages, with the LLM
//! replaced by a scripted provider: non-overlapping unit covers, stable
//! unit ids, quote faithfulness, and archive exclusivity.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use podcast_knowledge_rs::analyzer::ConversationAnalyzer;
use podcast_knowledge_rs::config::{
    CacheConfig, Config, EmbeddingConfig, GeminiConfig, PathsConfig, PipelineConfig,
    PipelineMode, SentimentConfig, TimeoutConfig,
};
use podcast_knowledge_rs::error::{IngestError, Result};
use podcast_knowledge_rs::extraction::ExtractionOrchestrator;
use podcast_knowledge_rs::graph::archive_vtt;
use podcast_knowledge_rs::llm::{Completion, CompletionOptions, LlmProvider};
use podcast_knowledge_rs::regrouper::build_units;
use podcast_knowledge_rs::tracker::episode_id;
use podcast_knowledge_rs::types::UnitType;
use podcast_knowledge_rs::vtt;

/// Provider that replays canned responses in order.
struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(responses: &[&str]) -> Self {
        let mut queue: Vec<String> = responses.iter().map(|s| s.to_string()).collect();
        queue.reverse();
        Self {
            responses: Mutex::new(queue),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete_with_options(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<Completion> {
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| IngestError::Transient("script exhausted".into()))?;
        Ok(Completion {
            content,
            tokens_in: 100,
            tokens_out: 50,
        })
    }
}

fn test_config() -> Config {
    Config {
        gemini: GeminiConfig {
            api_keys: vec!["test".into()],
            flash_model: "gemini-2.0-flash".into(),
            pro_model: "gemini-2.5-pro".into(),
            embedding_model: "text-embedding-004".into(),
            temperature: 0.2,
            max_output_tokens: 8192,
        },
        cache: CacheConfig {
            min_cache_size_tokens: 1250,
            cache_ttl: Duration::from_secs(3600),
            template_ttl: Duration::from_secs(86400),
        },
        sentiment: SentimentConfig {
            min_confidence: 0.5,
            emotion_threshold: 0.3,
        },
        embedding: EmbeddingConfig {
            batch_size: 100,
            interbatch_delay: Duration::from_millis(1),
            dimension: 768,
        },
        pipeline: PipelineConfig {
            timeout: Duration::from_secs(5400),
            workers: 1,
            important_unit_types: ["introduction", "conclusion", "key_moment"]
                .iter()
                .map(|t| UnitType::new(t))
                .collect(),
            mode: PipelineMode::Independent,
        },
        timeouts: TimeoutConfig {
            llm: Duration::from_secs(5),
            embedding: Duration::from_secs(5),
            db: Duration::from_secs(5),
            key_acquire: Duration::from_secs(1),
        },
        paths: PathsConfig {
            data_root: PathBuf::from("/tmp/pk-test/data"),
            logs_root: PathBuf::from("/tmp/pk-test/logs"),
            registry_path: PathBuf::from("podcasts.yaml"),
            state_path: PathBuf::from("/tmp/pk-test/state.json"),
        },
        quotas: HashMap::new(),
        quota_day_reset_hour: 0,
    }
}

fn sample_vtt(cue_count: usize) -> String {
    let mut out = String::from(
        "WEBVTT\n\nNOTE\nPodcast: Tech Talk\nEpisode: Scaling Databases\nDate: 2024-03-01\n\n",
    );
    for i in 0..cue_count {
        let speaker = if i % 2 == 0 { "Alice" } else { "Bob" };
        out.push_str(&format!(
            "00:00:{:02}.000 --> 00:00:{:02}.000\n<v {}>Segment number {} about database scaling.\n\n",
            i,
            i + 1,
            speaker,
            i
        ));
    }
    out
}

#[tokio::test]
async fn empty_transcript_fails_with_structure_invalid() {
    let config = test_config();
    let provider = ScriptedProvider::new(&[]);
    let analyzer = ConversationAnalyzer::new(&provider, &config);

    let err = analyzer
        .analyze("Tech Talk", "Empty Episode", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::StructureInvalid(_)));
    assert_eq!(err.reason_code(), "structure_invalid");
}

#[tokio::test]
async fn equal_index_overlap_is_repaired_into_a_valid_cover() {
    // Scenario S2: the analyzer reports [{0,5},{5,10},{10,12}]; the repair
    // pass must deliver [{0,4},{5,9},{10,12}].
    let doc = vtt::parse(&sample_vtt(13)).unwrap();
    let segments = doc.to_segments();

    let config = test_config();
    let provider = ScriptedProvider::new(&[r#"{
        "units": [
            {"start_index": 0, "end_index": 5, "unit_type": "introduction", "themes": ["intro"], "summary": "Opening"},
            {"start_index": 5, "end_index": 10, "unit_type": "topic_discussion", "themes": ["scaling"], "summary": "Main topic"},
            {"start_index": 10, "end_index": 12, "unit_type": "conclusion", "themes": ["wrap"], "summary": "Closing"}
        ],
        "themes": ["databases"],
        "summary": "An episode about scaling."
    }"#]);
    let analyzer = ConversationAnalyzer::new(&provider, &config);

    let structure = analyzer
        .analyze("Tech Talk", "Scaling Databases", &segments)
        .await
        .unwrap();

    let ranges: Vec<(usize, usize)> = structure
        .units
        .iter()
        .map(|u| (u.start_index, u.end_index))
        .collect();
    assert_eq!(ranges, vec![(0, 4), (5, 9), (10, 12)]);

    // No pair (a,b),(c,d) with c <= b.
    for pair in structure.units.windows(2) {
        assert!(pair[1].start_index > pair[0].end_index);
    }

    // Three MeaningfulUnits materialize with deterministic ids.
    let id = episode_id("tech_talk", "Scaling Databases", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    let units = build_units(&id, &segments, &structure);
    assert_eq!(units.len(), 3);
    assert_eq!(
        units[0].0.id,
        "tech_talk_2024-03-01_scaling_databases_unit_000_introduction"
    );
    assert_eq!(
        units[2].0.id,
        "tech_talk_2024-03-01_scaling_databases_unit_002_conclusion"
    );
}

#[tokio::test]
async fn fenced_structure_output_fails_as_structure_invalid() {
    // A malformed structure response is a total episode failure, not the
    // partial-success condition a per-unit extraction parse failure maps to.
    let doc = vtt::parse(&sample_vtt(5)).unwrap();
    let segments = doc.to_segments();

    let config = test_config();
    let provider = ScriptedProvider::new(&["```json\n{\"units\": []}\n```"]);
    let analyzer = ConversationAnalyzer::new(&provider, &config);

    let err = analyzer
        .analyze("Tech Talk", "Fenced", &segments)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::StructureInvalid(_)));
    assert_eq!(err.reason_code(), "structure_invalid");
}

#[tokio::test]
async fn prose_structure_output_fails_as_structure_invalid() {
    let doc = vtt::parse(&sample_vtt(5)).unwrap();
    let segments = doc.to_segments();

    let config = test_config();
    let provider = ScriptedProvider::new(&["Here is the conversation breakdown you asked for."]);
    let analyzer = ConversationAnalyzer::new(&provider, &config);

    let err = analyzer
        .analyze("Tech Talk", "Prose", &segments)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "structure_invalid");
}

#[tokio::test]
async fn unrepairable_structure_fails_the_episode() {
    let doc = vtt::parse(&sample_vtt(4)).unwrap();
    let segments = doc.to_segments();

    let config = test_config();
    // Every unit collapses to nothing after clipping and shrinking.
    let provider = ScriptedProvider::new(&[r#"{"units": [], "themes": [], "summary": ""}"#]);
    let analyzer = ConversationAnalyzer::new(&provider, &config);

    let err = analyzer
        .analyze("Tech Talk", "Broken", &segments)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::StructureInvalid(_)));
}

#[test]
fn unit_id_sets_of_distinct_episodes_are_disjoint() {
    let doc = vtt::parse(&sample_vtt(6)).unwrap();
    let segments = doc.to_segments();
    let structure = podcast_knowledge_rs::types::ConversationStructure {
        units: vec![
            podcast_knowledge_rs::types::ConversationUnit {
                start_index: 0,
                end_index: 2,
                unit_type: UnitType::new("introduction"),
                themes: vec![],
                summary: String::new(),
            },
            podcast_knowledge_rs::types::ConversationUnit {
                start_index: 3,
                end_index: 5,
                unit_type: UnitType::new("conclusion"),
                themes: vec![],
                summary: String::new(),
            },
        ],
        themes: vec![],
        summary: String::new(),
    };

    let date_a = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let date_b = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
    let episode_a = episode_id("tech_talk", "Scaling Databases", date_a);
    let episode_b = episode_id("tech_talk", "Scaling Databases", date_b);

    let ids_a: HashSet<String> = build_units(&episode_a, &segments, &structure)
        .into_iter()
        .map(|(u, _)| u.id)
        .collect();
    let ids_b: HashSet<String> = build_units(&episode_b, &segments, &structure)
        .into_iter()
        .map(|(u, _)| u.id)
        .collect();

    assert!(ids_a.is_disjoint(&ids_b));

    // Reprocessing yields the identical id set.
    let ids_a_again: HashSet<String> = build_units(&episode_a, &segments, &structure)
        .into_iter()
        .map(|(u, _)| u.id)
        .collect();
    assert_eq!(ids_a, ids_a_again);
}

#[tokio::test]
async fn extraction_keeps_only_faithful_quotes_and_resolvable_relationships() {
    let doc = vtt::parse(&sample_vtt(3)).unwrap();
    let segments = doc.to_segments();
    let structure = podcast_knowledge_rs::types::ConversationStructure {
        units: vec![podcast_knowledge_rs::types::ConversationUnit {
            start_index: 0,
            end_index: 2,
            unit_type: UnitType::new("topic_discussion"),
            themes: vec![],
            summary: String::new(),
        }],
        themes: vec![],
        summary: String::new(),
    };
    let units = build_units("tech_talk_2024-03-01_scaling_databases", &segments, &structure);
    let (unit, unit_type) = &units[0];

    let config = test_config();
    let provider = ScriptedProvider::new(&[r#"{
        "entities": [
            {"name": "Alice", "type": "PERSON"},
            {"name": "PostgreSQL", "type": "PRODUCT"}
        ],
        "quotes": [
            {"speaker": "Alice", "text": "Segment number 0 about database scaling."},
            {"speaker": "Bob", "text": "a line nobody ever said"}
        ],
        "insights": [{"statement": "Sharding early avoids rewrites.", "category": "architecture"}],
        "relationships": [
            {"subject": "alice", "predicate": "recommends", "object": "postgresql"},
            {"subject": "Alice", "predicate": "works_at", "object": "Initech"}
        ],
        "sentiment": {"polarity": 0.4, "score": 0.7, "energy_level": 0.6, "confidence": 0.9}
    }"#]);
    let orchestrator = ExtractionOrchestrator::new(&provider, &config);

    let extraction = orchestrator.extract(unit, unit_type).await.unwrap();

    assert_eq!(extraction.quotes.len(), 1);
    assert!(unit.text.contains(&extraction.quotes[0].text));
    assert_eq!(extraction.entities.len(), 2);
    assert_eq!(extraction.relationships.len(), 1);
    assert_eq!(extraction.relationships[0].object_id, "entity_postgresql");
    assert_eq!(extraction.insights.len(), 1);
    assert!(extraction.sentiment.is_some());
}

#[tokio::test]
async fn fenced_extraction_output_is_rejected_not_rescued() {
    let doc = vtt::parse(&sample_vtt(2)).unwrap();
    let segments = doc.to_segments();
    let structure = podcast_knowledge_rs::types::ConversationStructure {
        units: vec![podcast_knowledge_rs::types::ConversationUnit {
            start_index: 0,
            end_index: 1,
            unit_type: UnitType::new("topic_discussion"),
            themes: vec![],
            summary: String::new(),
        }],
        themes: vec![],
        summary: String::new(),
    };
    let units = build_units("ep", &segments, &structure);
    let (unit, unit_type) = &units[0];

    let config = test_config();
    let provider = ScriptedProvider::new(&["```json\n{\"entities\": []}\n```"]);
    let orchestrator = ExtractionOrchestrator::new(&provider, &config);

    let err = orchestrator.extract(unit, unit_type).await.unwrap_err();
    assert!(matches!(err, IngestError::Parse(_)));
}

#[test]
fn archive_leaves_exactly_one_copy() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("inbox").join("2024-03-01_scaling.vtt");
    std::fs::create_dir_all(input.parent().unwrap()).unwrap();
    std::fs::write(&input, sample_vtt(3)).unwrap();

    let data_root = dir.path().join("data");
    let archived = archive_vtt(&input, &data_root, "tech_talk").unwrap();

    assert!(!input.exists());
    assert!(archived.exists());
    assert!(archived.starts_with(
        data_root.join("podcasts").join("tech_talk").join("processed")
    ));

    // Archived content is intact and still parseable for recovery.
    let doc = vtt::parse(&std::fs::read_to_string(&archived).unwrap()).unwrap();
    assert_eq!(doc.cues.len(), 3);
}

#[test]
fn single_segment_episode_is_representable() {
    let doc = vtt::parse(&sample_vtt(1)).unwrap();
    let segments = doc.to_segments();
    assert_eq!(segments.len(), 1);

    let structure = podcast_knowledge_rs::types::ConversationStructure {
        units: vec![podcast_knowledge_rs::types::ConversationUnit {
            start_index: 0,
            end_index: 0,
            unit_type: UnitType::new("topic_discussion"),
            themes: vec![],
            summary: String::new(),
        }],
        themes: vec![],
        summary: String::new(),
    };
    let units = build_units("ep", &segments, &structure);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].0.speakers, vec!["Alice"]);
}
