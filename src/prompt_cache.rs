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

//! Prompt-cache management over the provider's context-prefix caching.
//! Episode transcripts are cached for about an hour (long enough to process
//! every unit of one episode); stable prompt templates are cached for a day
//! and warmed at startup. Handles are opaque strings.

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::llm::GeminiClient;

/// Rough token estimate used for the minimum-size gate. The provider bills
/// on its own tokenizer; four characters per token is close enough to
/// decide whether caching pays for itself.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone)]
struct CacheEntry {
    handle: String,
    expires_at: DateTime<Utc>,
    token_count: u64,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub created: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub tokens_saved_estimate: u64,
}

impl CacheStats {
    /// Rolling cost-savings estimate: cached tokens are billed at roughly a
    /// quarter of the standard input rate.
    pub fn savings_ratio(&self) -> f64 {
        0.75
    }

    pub fn tokens_saved(&self) -> u64 {
        (self.tokens_saved_estimate as f64 * self.savings_ratio()) as u64
    }
}

pub struct PromptCacheManager {
    client: Arc<GeminiClient>,
    config: CacheConfig,
    /// episode_id -> entry. The async mutex doubles as the coalescing
    /// mechanism: concurrent creators for one episode line up behind the
    /// first and find its handle on wake.
    episodes: Mutex<HashMap<String, CacheEntry>>,
    /// (template_name, template_version) -> entry.
    templates: Mutex<HashMap<(String, String), CacheEntry>>,
    stats: SyncMutex<CacheStats>,
}

impl PromptCacheManager {
    pub fn new(client: Arc<GeminiClient>, config: CacheConfig) -> Self {
        Self {
            client,
            config,
            episodes: Mutex::new(HashMap::new()),
            templates: Mutex::new(HashMap::new()),
            stats: SyncMutex::new(CacheStats::default()),
        }
    }

    /// Create (or reuse) the transcript cache for an episode. Returns the
    /// handle, or `None` when the transcript is below the size gate or the
    /// provider refused - callers fall back to uncached calls either way.
    pub async fn ensure_episode_cache(
        &self,
        episode_id: &str,
        model: &str,
        system: &str,
        transcript: &str,
    ) -> Option<String> {
        let estimated = estimate_tokens(transcript);
        if estimated < self.config.min_cache_size_tokens {
            debug!(
                episode_id,
                estimated,
                minimum = self.config.min_cache_size_tokens,
                "transcript below cache size gate, not caching"
            );
            return None;
        }

        let mut episodes = self.episodes.lock().await;
        if let Some(entry) = episodes.get(episode_id) {
            if entry.is_live() {
                self.stats.lock().hits += 1;
                return Some(entry.handle.clone());
            }
            episodes.remove(episode_id);
            self.stats.lock().evictions += 1;
        }

        match self
            .client
            .create_cached_content(model, system, transcript, self.config.cache_ttl)
            .await
        {
            Ok((handle, token_count)) => {
                info!(episode_id, token_count, "created episode transcript cache");
                episodes.insert(
                    episode_id.to_string(),
                    CacheEntry {
                        handle: handle.clone(),
                        expires_at: Utc::now()
                            + chrono::Duration::from_std(self.config.cache_ttl)
                                .unwrap_or_else(|_| chrono::Duration::hours(1)),
                        token_count,
                    },
                );
                self.stats.lock().created += 1;
                Some(handle)
            }
            Err(e) => {
                // Never fatal: the episode just runs uncached.
                warn!(episode_id, error = %e, "episode cache creation failed");
                None
            }
        }
    }

    /// Current handle for an episode, if one is live. Counts hit/miss and
    /// accumulates the tokens-served-from-cache estimate.
    pub async fn episode_handle(&self, episode_id: &str) -> Option<String> {
        let mut episodes = self.episodes.lock().await;
        match episodes.get(episode_id) {
            Some(entry) if entry.is_live() => {
                let mut stats = self.stats.lock();
                stats.hits += 1;
                stats.tokens_saved_estimate += entry.token_count;
                Some(entry.handle.clone())
            }
            Some(_) => {
                episodes.remove(episode_id);
                let mut stats = self.stats.lock();
                stats.evictions += 1;
                stats.misses += 1;
                None
            }
            None => {
                self.stats.lock().misses += 1;
                None
            }
        }
    }

    /// Warm long-lived template caches at startup. Below-gate templates are
    /// skipped; provider failures are warnings.
    pub async fn warm_templates(&self, model: &str, templates: &[(&str, &str, &str)]) {
        for (name, version, text) in templates {
            if estimate_tokens(text) < self.config.min_cache_size_tokens {
                debug!(template = name, "template below cache size gate, not warming");
                continue;
            }
            let key = (name.to_string(), version.to_string());
            let mut map = self.templates.lock().await;
            if map.get(&key).map_or(false, |e| e.is_live()) {
                continue;
            }
            match self
                .client
                .create_cached_content(model, text, text, self.config.template_ttl)
                .await
            {
                Ok((handle, token_count)) => {
                    info!(template = name, version, "warmed prompt template cache");
                    map.insert(
                        key,
                        CacheEntry {
                            handle,
                            expires_at: Utc::now()
                                + chrono::Duration::from_std(self.config.template_ttl)
                                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
                            token_count,
                        },
                    );
                    self.stats.lock().created += 1;
                }
                Err(e) => {
                    warn!(template = name, error = %e, "template cache warm failed");
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypool::{KeyPool, ModelBudget};
    use std::time::Duration;

    fn cache_config(min_tokens: usize) -> CacheConfig {
        CacheConfig {
            min_cache_size_tokens: min_tokens,
            cache_ttl: Duration::from_secs(3600),
            template_ttl: Duration::from_secs(86400),
        }
    }

    fn test_client(dir: &tempfile::TempDir, base_url: &str) -> Arc<GeminiClient> {
        let mut budgets = HashMap::new();
        budgets.insert(
            "gemini-2.0-flash".to_string(),
            ModelBudget {
                requests_per_minute: 100,
                requests_per_day: 1000,
                tokens_per_minute: 1_000_000,
            },
        );
        let pool = Arc::new(KeyPool::new(
            &["cache-test-key".to_string()],
            budgets,
            dir.path().join("state.json"),
            0,
        ));
        Arc::new(
            GeminiClient::new(pool, Duration::from_secs(5), Duration::from_secs(1))
                .with_base_url(base_url),
        )
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[tokio::test]
    async fn small_transcript_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        // Unreachable base URL: the gate must reject before any request.
        let client = test_client(&dir, "http://127.0.0.1:1");
        let manager = PromptCacheManager::new(client, cache_config(1250));

        let handle = manager
            .ensure_episode_cache("ep1", "gemini-2.0-flash", "sys", "too short")
            .await;
        assert!(handle.is_none());
        assert_eq!(manager.stats().created, 0);
    }

    #[tokio::test]
    async fn cache_creation_failure_is_not_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", mockito::Matcher::Regex("cachedContents".to_string()))
            .with_status(500)
            .with_body("{}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = test_client(&dir, &server.url());
        let manager = PromptCacheManager::new(client, cache_config(10));

        let transcript = "long transcript text ".repeat(50);
        let handle = manager
            .ensure_episode_cache("ep1", "gemini-2.0-flash", "sys", &transcript)
            .await;
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn created_cache_is_reused_and_counted() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "name": "cachedContents/abc123",
            "usageMetadata": {"totalTokenCount": 2000}
        });
        let mock = server
            .mock("POST", mockito::Matcher::Regex("cachedContents".to_string()))
            .with_status(200)
            .with_body(body.to_string())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = test_client(&dir, &server.url());
        let manager = PromptCacheManager::new(client, cache_config(10));

        let transcript = "long transcript text ".repeat(50);
        let first = manager
            .ensure_episode_cache("ep1", "gemini-2.0-flash", "sys", &transcript)
            .await;
        assert_eq!(first.as_deref(), Some("cachedContents/abc123"));

        // Second ensure coalesces on the existing entry; no second creation.
        let second = manager
            .ensure_episode_cache("ep1", "gemini-2.0-flash", "sys", &transcript)
            .await;
        assert_eq!(second.as_deref(), Some("cachedContents/abc123"));

        let bound = manager.episode_handle("ep1").await;
        assert_eq!(bound.as_deref(), Some("cachedContents/abc123"));

        let stats = manager.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.tokens_saved_estimate, 2000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_episode_counts_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(&dir, "http://127.0.0.1:1");
        let manager = PromptCacheManager::new(client, cache_config(10));
        assert!(manager.episode_handle("nope").await.is_none());
        assert_eq!(manager.stats().misses, 1);
    }
}
