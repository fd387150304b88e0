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

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;

use crate::keypool::ModelBudget;
use crate::types::UnitType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Orchestrator script drives both transcription and ingestion; the
    /// graph is the only tracking source.
    Combined,
    /// Standalone run; a local file tracker is consulted as a fallback when
    /// the graph is not reachable.
    Independent,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_keys: Vec<String>,
    pub flash_model: String,
    pub pro_model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Below this estimated token count an episode transcript is not cached.
    pub min_cache_size_tokens: usize,
    pub cache_ttl: Duration,
    pub template_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SentimentConfig {
    pub min_confidence: f32,
    pub emotion_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub interbatch_delay: Duration,
    pub dimension: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub timeout: Duration,
    pub workers: usize,
    pub important_unit_types: HashSet<UnitType>,
    pub mode: PipelineMode,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub llm: Duration,
    pub embedding: Duration,
    pub db: Duration,
    /// How long a call may wait for a usable API key before the episode
    /// fails with quota_exhausted.
    pub key_acquire: Duration,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub data_root: PathBuf,
    pub logs_root: PathBuf,
    pub registry_path: PathBuf,
    pub state_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gemini: GeminiConfig,
    pub cache: CacheConfig,
    pub sentiment: SentimentConfig,
    pub embedding: EmbeddingConfig,
    pub pipeline: PipelineConfig,
    pub timeouts: TimeoutConfig,
    pub paths: PathsConfig,
    /// Per-model quota budgets handed to the key pool.
    pub quotas: HashMap<String, ModelBudget>,
    pub quota_day_reset_hour: u32,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let api_keys: Vec<String> = env::var("GEMINI_API_KEYS")
            .or_else(|_| env::var("GEMINI_API_KEY"))
            .context("GEMINI_API_KEYS environment variable not found")?
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();

        if api_keys.is_empty() {
            anyhow::bail!("GEMINI_API_KEYS is set but contains no keys");
        }

        let flash_model =
            env::var("FLASH_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string());
        let pro_model = env::var("PRO_MODEL").unwrap_or_else(|_| "gemini-2.5-pro".to_string());
        let embedding_model =
            env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding-004".to_string());

        let gemini = GeminiConfig {
            api_keys,
            flash_model: flash_model.clone(),
            pro_model: pro_model.clone(),
            embedding_model: embedding_model.clone(),
            temperature: env_parse("LLM_TEMPERATURE", 0.2),
            max_output_tokens: env_parse("LLM_MAX_OUTPUT_TOKENS", 8192),
        };

        let cache = CacheConfig {
            min_cache_size_tokens: env_parse("MIN_CACHE_SIZE_TOKENS", 1250),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 3600)),
            template_ttl: Duration::from_secs(env_parse("PROMPT_TEMPLATE_TTL_SECONDS", 86400)),
        };

        let sentiment = SentimentConfig {
            min_confidence: env_parse("SENTIMENT_MIN_CONFIDENCE", 0.5),
            emotion_threshold: env_parse("SENTIMENT_EMOTION_THRESHOLD", 0.3),
        };

        let embedding = EmbeddingConfig {
            batch_size: env_parse("EMBEDDING_BATCH_SIZE", 100),
            interbatch_delay: Duration::from_millis(env_parse(
                "EMBEDDING_INTERBATCH_DELAY_MS",
                100,
            )),
            dimension: env_parse("EMBEDDING_DIMENSION", 768),
        };

        let important_unit_types: HashSet<UnitType> = env::var("IMPORTANT_UNIT_TYPES")
            .unwrap_or_else(|_| "introduction,conclusion,key_moment".to_string())
            .split(',')
            .map(|t| UnitType::new(t))
            .collect();

        let mode = match env::var("PIPELINE_MODE").as_deref() {
            Ok("combined") => PipelineMode::Combined,
            _ => PipelineMode::Independent,
        };

        let pipeline = PipelineConfig {
            timeout: Duration::from_secs(env_parse("PIPELINE_TIMEOUT_SECONDS", 5400)),
            workers: env_parse("PIPELINE_WORKERS", 1usize).max(1),
            important_unit_types,
            mode,
        };

        let timeouts = TimeoutConfig {
            llm: Duration::from_secs(env_parse("LLM_TIMEOUT_SECONDS", 60)),
            embedding: Duration::from_secs(env_parse("EMBEDDING_TIMEOUT_SECONDS", 30)),
            db: Duration::from_secs(env_parse("DB_TIMEOUT_SECONDS", 30)),
            key_acquire: Duration::from_secs(env_parse("KEY_ACQUIRE_DEADLINE_SECONDS", 120)),
        };

        let default_root = home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".podcast-knowledge");

        let paths = PathsConfig {
            data_root: env_path("DATA_ROOT", default_root.join("data")),
            logs_root: env_path("LOGS_ROOT", default_root.join("logs")),
            registry_path: env_path("REGISTRY_PATH", PathBuf::from("podcasts.yaml")),
            state_path: env_path("STATE_PATH", default_root.join("key_state.json")),
        };

        std::fs::create_dir_all(&paths.data_root)
            .context("Failed to create data root directory")?;
        std::fs::create_dir_all(&paths.logs_root)
            .context("Failed to create logs root directory")?;
        if let Some(parent) = paths.state_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        // The flash tier ships with a far larger budget than pro; embedding
        // requests are cheap but frequent. Each tier can be overridden
        // through QUOTA_<TIER>_{RPM,RPD,TPM}.
        let mut quotas = HashMap::new();
        quotas.insert(
            flash_model,
            ModelBudget {
                requests_per_minute: env_parse("QUOTA_FLASH_RPM", 15),
                requests_per_day: env_parse("QUOTA_FLASH_RPD", 1500),
                tokens_per_minute: env_parse("QUOTA_FLASH_TPM", 1_000_000),
            },
        );
        quotas.insert(
            pro_model,
            ModelBudget {
                requests_per_minute: env_parse("QUOTA_PRO_RPM", 5),
                requests_per_day: env_parse("QUOTA_PRO_RPD", 100),
                tokens_per_minute: env_parse("QUOTA_PRO_TPM", 250_000),
            },
        );
        quotas.insert(
            embedding_model,
            ModelBudget {
                requests_per_minute: env_parse("QUOTA_EMBEDDING_RPM", 100),
                requests_per_day: env_parse("QUOTA_EMBEDDING_RPD", 10_000),
                tokens_per_minute: env_parse("QUOTA_EMBEDDING_TPM", 1_000_000),
            },
        );

        Ok(Config {
            gemini,
            cache,
            sentiment,
            embedding,
            pipeline,
            timeouts,
            paths,
            quotas,
            quota_day_reset_hour: env_parse("QUOTA_DAY_RESET_HOUR", 0),
        })
    }

    /// Model used for a unit of the given type under tier routing.
    pub fn model_for_unit(&self, unit_type: &UnitType) -> &str {
        if self.pipeline.important_unit_types.contains(unit_type) {
            &self.gemini.pro_model
        } else {
            &self.gemini.flash_model
        }
    }
}

/// Shared fixture for unit tests across the crate.
#[cfg(test)]
pub mod tests_support {
    use super::*;

    pub fn test_config() -> Config {
        Config {
            gemini: GeminiConfig {
                api_keys: vec!["k1".into()],
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
                interbatch_delay: Duration::from_millis(100),
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
                llm: Duration::from_secs(60),
                embedding: Duration::from_secs(30),
                db: Duration::from_secs(30),
                key_acquire: Duration::from_secs(2),
            },
            paths: PathsConfig {
                data_root: PathBuf::from("/tmp/pk/data"),
                logs_root: PathBuf::from("/tmp/pk/logs"),
                registry_path: PathBuf::from("podcasts.yaml"),
                state_path: PathBuf::from("/tmp/pk/key_state.json"),
            },
            quotas: HashMap::new(),
            quota_day_reset_hour: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::test_config;
    use crate::types::UnitType;

    #[test]
    fn important_unit_types_route_to_pro_tier() {
        let config = test_config();
        assert_eq!(
            config.model_for_unit(&UnitType::new("key_moment")),
            "gemini-2.5-pro"
        );
        assert_eq!(
            config.model_for_unit(&UnitType::new("topic_discussion")),
            "gemini-2.0-flash"
        );
    }
}
