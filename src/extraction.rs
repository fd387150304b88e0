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

//! Combined extraction: one JSON-mode call per meaningful unit returns
//! entities, quotes, insights, relationships, and sentiment together.
//! Validation is strict - unfaithful quotes and unresolvable relationships
//! are dropped, sentiment is clamped and confidence-gated. Entity embeddings
//! are deliberately not generated.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;
use crate::error::Result;
use crate::llm::{parse_json_strict, CompletionOptions, LlmProvider};
use crate::types::{
    Emotion, Entity, EntityRelationship, Insight, MeaningfulUnit, Quote, Sentiment, UnitExtraction,
};

pub const EXTRACTION_TEMPLATE_NAME: &str = "combined_extraction";
pub const EXTRACTION_TEMPLATE_VERSION: &str = "v2";

pub const EXTRACTION_SYSTEM_PROMPT: &str = "You are a knowledge extraction engine for podcast \
conversations. For the given conversational unit you extract named entities, verbatim quotes, \
insights, entity relationships, and overall sentiment, all in a single JSON object matching the \
requested schema. Quotes must be copied verbatim from the unit text. Respond with JSON only, \
never markdown.";

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    mention_offsets: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    #[serde(default)]
    speaker: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawInsight {
    statement: String,
    #[serde(default)]
    category: String,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    subject: String,
    predicate: String,
    object: String,
}

#[derive(Debug, Deserialize)]
struct RawEmotion {
    name: String,
    #[serde(default)]
    intensity: f32,
}

#[derive(Debug, Deserialize)]
struct RawSentiment {
    #[serde(default)]
    polarity: f32,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    energy_level: f32,
    /// Self-reported confidence; absent means fully confident.
    confidence: Option<f32>,
    #[serde(default)]
    emotions: Vec<RawEmotion>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    quotes: Vec<RawQuote>,
    #[serde(default)]
    insights: Vec<RawInsight>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
    sentiment: Option<RawSentiment>,
}

/// NFC + whitespace collapse, the normalization under which quote
/// faithfulness is checked.
pub fn normalize_for_match(text: &str) -> String {
    let composed: String = text.nfc().collect();
    WHITESPACE.replace_all(composed.trim(), " ").to_string()
}

/// Case-folded, diacritic-stripped canonical key for entity resolution.
pub fn canonical_entity_key(name: &str) -> String {
    let stripped: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    NON_ALNUM
        .replace_all(&stripped, "_")
        .trim_matches('_')
        .to_string()
}

pub fn entity_id(name: &str) -> String {
    format!("entity_{}", canonical_entity_key(name))
}

fn build_prompt(unit: &MeaningfulUnit, unit_type: &crate::types::UnitType) -> String {
    format!(
        r#"Conversational unit ({unit_type}, speakers: {speakers}):
"{text}"

Extract from this unit only:
1. entities - people, organizations, products, concepts mentioned by name.
2. quotes - the most notable verbatim quotes, copied character-for-character.
3. insights - non-obvious takeaways a listener should remember.
4. relationships - how the extracted entities relate to each other.
5. sentiment - overall polarity (-1 to 1), score (0 to 1), energy_level (0 to 1),
   your confidence (0 to 1), and emotion tags with intensity (0 to 1).

Respond with JSON only:
{{"entities": [{{"name": "...", "type": "PERSON|ORG|PRODUCT|CONCEPT|PLACE|OTHER", "mention_offsets": [0]}}],
"quotes": [{{"speaker": "...", "text": "..."}}],
"insights": [{{"statement": "...", "category": "..."}}],
"relationships": [{{"subject": "...", "predicate": "...", "object": "..."}}],
"sentiment": {{"polarity": 0.0, "score": 0.0, "energy_level": 0.0, "confidence": 0.0, "emotions": [{{"name": "...", "intensity": 0.0}}]}}}}"#,
        unit_type = unit_type.as_str(),
        speakers = unit.speakers.join(", "),
        text = unit.text,
    )
}

/// Validate a raw extraction against its unit. Invalid items are dropped
/// (with a debug log), never repaired into something the model did not say.
fn validate_extraction(
    raw: RawExtraction,
    unit: &MeaningfulUnit,
    config: &Config,
) -> UnitExtraction {
    let normalized_unit_text = normalize_for_match(&unit.text);

    let mut entities: Vec<Entity> = Vec::new();
    for raw_entity in raw.entities {
        let key = canonical_entity_key(&raw_entity.name);
        if key.is_empty() {
            continue;
        }
        // First mention wins; later duplicates only add offsets.
        if let Some(existing) = entities.iter_mut().find(|e| e.id == entity_id(&raw_entity.name)) {
            existing.mention_offsets.extend(raw_entity.mention_offsets);
            continue;
        }
        entities.push(Entity {
            id: entity_id(&raw_entity.name),
            canonical_name: raw_entity.name.trim().to_string(),
            entity_type: if raw_entity.entity_type.is_empty() {
                "OTHER".to_string()
            } else {
                raw_entity.entity_type.to_uppercase()
            },
            mention_offsets: raw_entity.mention_offsets,
        });
    }

    let mut quotes: Vec<Quote> = Vec::new();
    for raw_quote in raw.quotes {
        let normalized_quote = normalize_for_match(&raw_quote.text);
        if normalized_quote.is_empty() {
            continue;
        }
        if !normalized_unit_text.contains(&normalized_quote) {
            debug!(
                unit_id = %unit.id,
                quote = %raw_quote.text.chars().take(60).collect::<String>(),
                "dropping quote that is not a substring of the unit text"
            );
            continue;
        }
        quotes.push(Quote {
            id: format!("{}_quote_{}", unit.id, quotes.len()),
            speaker: raw_quote.speaker,
            text: raw_quote.text,
            unit_id: unit.id.clone(),
        });
    }

    let insights: Vec<Insight> = raw
        .insights
        .into_iter()
        .filter(|i| !i.statement.trim().is_empty())
        .enumerate()
        .map(|(n, raw_insight)| Insight {
            id: format!("{}_insight_{}", unit.id, n),
            statement: raw_insight.statement,
            category: if raw_insight.category.is_empty() {
                "general".to_string()
            } else {
                raw_insight.category
            },
            unit_id: unit.id.clone(),
        })
        .collect();

    let mut relationships: Vec<EntityRelationship> = Vec::new();
    for raw_rel in raw.relationships {
        let subject_key = canonical_entity_key(&raw_rel.subject);
        let object_key = canonical_entity_key(&raw_rel.object);
        let resolves = |key: &str| {
            entities
                .iter()
                .any(|e| canonical_entity_key(&e.canonical_name) == key)
        };
        if !resolves(&subject_key) || !resolves(&object_key) {
            debug!(
                unit_id = %unit.id,
                subject = %raw_rel.subject,
                object = %raw_rel.object,
                "dropping relationship with unresolved endpoint"
            );
            continue;
        }
        relationships.push(EntityRelationship {
            subject_id: entity_id(&raw_rel.subject),
            predicate: raw_rel.predicate,
            object_id: entity_id(&raw_rel.object),
            unit_id: unit.id.clone(),
        });
    }

    let sentiment = raw.sentiment.and_then(|raw_sentiment| {
        let confidence = raw_sentiment.confidence.unwrap_or(1.0);
        if confidence < config.sentiment.min_confidence {
            debug!(
                unit_id = %unit.id,
                confidence,
                threshold = config.sentiment.min_confidence,
                "dropping low-confidence sentiment"
            );
            return None;
        }
        Some(Sentiment {
            polarity: raw_sentiment.polarity.clamp(-1.0, 1.0),
            score: raw_sentiment.score.clamp(0.0, 1.0),
            energy_level: raw_sentiment.energy_level.clamp(0.0, 1.0),
            emotions: raw_sentiment
                .emotions
                .into_iter()
                .filter(|e| e.intensity >= config.sentiment.emotion_threshold)
                .map(|e| Emotion {
                    name: e.name,
                    intensity: e.intensity.clamp(0.0, 1.0),
                })
                .collect(),
        })
    });

    UnitExtraction {
        entities,
        quotes,
        insights,
        relationships,
        sentiment,
    }
}

pub struct ExtractionOrchestrator<'a> {
    provider: &'a dyn LlmProvider,
    config: &'a Config,
}

impl<'a> ExtractionOrchestrator<'a> {
    pub fn new(provider: &'a dyn LlmProvider, config: &'a Config) -> Self {
        Self { provider, config }
    }

    /// Run the combined extraction for one unit. The caller records the
    /// failure and moves on; a failed unit never aborts the episode.
    pub async fn extract(
        &self,
        unit: &MeaningfulUnit,
        unit_type: &crate::types::UnitType,
    ) -> Result<UnitExtraction> {
        let model = self.config.model_for_unit(unit_type);
        info!(unit_id = %unit.id, model, unit_type = %unit_type, "routing extraction");

        let options = CompletionOptions {
            model: model.to_string(),
            system: Some(EXTRACTION_SYSTEM_PROMPT.to_string()),
            json_mode: true,
            temperature: self.config.gemini.temperature,
            max_output_tokens: self.config.gemini.max_output_tokens,
        };
        let prompt = build_prompt(unit, unit_type);

        let completion = self.provider.complete_with_options(&prompt, &options).await?;
        let raw: RawExtraction = parse_json_strict(&completion.content)?;
        let validated = validate_extraction(raw, unit, self.config);

        if validated.entities.is_empty() && validated.quotes.is_empty() {
            warn!(unit_id = %unit.id, "extraction produced no entities or quotes");
        }

        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;

    fn unit_with_text(text: &str) -> MeaningfulUnit {
        MeaningfulUnit {
            id: "tech_talk_2024-03-01_pilot_unit_000_introduction".to_string(),
            episode_id: "tech_talk_2024-03-01_pilot".to_string(),
            ordinal: 0,
            start_ms: 0,
            end_ms: 60_000,
            speakers: vec!["Alice".into(), "Bob".into()],
            text: text.to_string(),
            summary: String::new(),
            themes: vec![],
            embedding: None,
            sentiment: None,
        }
    }

    fn raw(json: &str) -> RawExtraction {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn quote_must_be_substring_of_unit_text() {
        let unit = unit_with_text("We shipped the new cache layer last week and it held up.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{
                "quotes": [
                    {"speaker": "Alice", "text": "shipped the new cache layer"},
                    {"speaker": "Bob", "text": "this was never said"}
                ]
            }"#),
            &unit,
            &config,
        );
        assert_eq!(extraction.quotes.len(), 1);
        assert_eq!(extraction.quotes[0].text, "shipped the new cache layer");
        assert_eq!(
            extraction.quotes[0].id,
            "tech_talk_2024-03-01_pilot_unit_000_introduction_quote_0"
        );
    }

    #[test]
    fn quote_check_survives_whitespace_and_nfc_differences() {
        // Unit text uses a decomposed e-acute and a double space; the quote
        // uses the composed form with single spacing.
        let unit = unit_with_text("The  cafe\u{0301} was packed when we recorded.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{"quotes": [{"speaker": "Alice", "text": "The café was packed"}]}"#),
            &unit,
            &config,
        );
        assert_eq!(extraction.quotes.len(), 1);
    }

    #[test]
    fn relationships_require_resolvable_endpoints() {
        let unit = unit_with_text("Acme hired Jane Doe to run their graph team.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{
                "entities": [
                    {"name": "Acme", "type": "ORG"},
                    {"name": "Jane Doe", "type": "PERSON"}
                ],
                "relationships": [
                    {"subject": "ACME", "predicate": "employs", "object": "jane doe"},
                    {"subject": "Acme", "predicate": "acquired", "object": "Initech"}
                ]
            }"#),
            &unit,
            &config,
        );
        // Case-insensitive resolution keeps the first, drops the second.
        assert_eq!(extraction.relationships.len(), 1);
        assert_eq!(extraction.relationships[0].subject_id, "entity_acme");
        assert_eq!(extraction.relationships[0].object_id, "entity_jane_doe");
        assert_eq!(
            extraction.relationships[0].unit_id,
            "tech_talk_2024-03-01_pilot_unit_000_introduction"
        );
    }

    #[test]
    fn diacritics_do_not_break_entity_resolution() {
        let unit = unit_with_text("Jose spoke about Sao Paulo.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{
                "entities": [{"name": "José", "type": "PERSON"}, {"name": "São Paulo", "type": "PLACE"}],
                "relationships": [{"subject": "Jose", "predicate": "visited", "object": "Sao Paulo"}]
            }"#),
            &unit,
            &config,
        );
        assert_eq!(extraction.relationships.len(), 1);
        assert_eq!(extraction.relationships[0].object_id, "entity_sao_paulo");
    }

    #[test]
    fn sentiment_is_clamped_and_confidence_gated() {
        let unit = unit_with_text("Great discussion.");
        let config = test_config();

        let kept = validate_extraction(
            raw(r#"{"sentiment": {"polarity": 1.7, "score": -0.2, "energy_level": 0.4, "confidence": 0.9}}"#),
            &unit,
            &config,
        );
        let sentiment = kept.sentiment.unwrap();
        assert_eq!(sentiment.polarity, 1.0);
        assert_eq!(sentiment.score, 0.0);
        assert_eq!(sentiment.energy_level, 0.4);

        let dropped = validate_extraction(
            raw(r#"{"sentiment": {"polarity": 0.2, "score": 0.5, "energy_level": 0.5, "confidence": 0.3}}"#),
            &unit,
            &config,
        );
        assert!(dropped.sentiment.is_none());
    }

    #[test]
    fn weak_emotions_are_filtered() {
        let unit = unit_with_text("Tense exchange about budgets.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{"sentiment": {"polarity": -0.4, "score": 0.6, "energy_level": 0.7,
                "emotions": [{"name": "frustration", "intensity": 0.8}, {"name": "hope", "intensity": 0.1}]}}"#),
            &unit,
            &config,
        );
        let sentiment = extraction.sentiment.unwrap();
        assert_eq!(sentiment.emotions.len(), 1);
        assert_eq!(sentiment.emotions[0].name, "frustration");
    }

    #[test]
    fn duplicate_entities_merge_offsets() {
        let unit = unit_with_text("Acme again and again.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{"entities": [
                {"name": "Acme", "type": "ORG", "mention_offsets": [0]},
                {"name": "ACME", "type": "ORG", "mention_offsets": [15]}
            ]}"#),
            &unit,
            &config,
        );
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].mention_offsets, vec![0, 15]);
    }

    #[test]
    fn insight_ids_are_ordinal_and_deterministic() {
        let unit = unit_with_text("Plenty of takeaways here.");
        let config = test_config();
        let extraction = validate_extraction(
            raw(r#"{"insights": [
                {"statement": "First takeaway", "category": "engineering"},
                {"statement": "Second takeaway"}
            ]}"#),
            &unit,
            &config,
        );
        assert_eq!(extraction.insights.len(), 2);
        assert!(extraction.insights[0].id.ends_with("_insight_0"));
        assert!(extraction.insights[1].id.ends_with("_insight_1"));
        assert_eq!(extraction.insights[1].category, "general");
    }
}
