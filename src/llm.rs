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

//! Thin Gemini request layer: JSON-mode completions, cache-handle binding,
//! retry with key rotation, and quota reporting. Failures surface; there is
//! no fallback to a different vendor.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::keypool::{KeyPool, Outcome};
use crate::prompt_cache::PromptCacheManager;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const MAX_RETRIES: u32 = 4;

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: String,
    pub system: Option<String>,
    pub json_mode: bool,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Strict JSON parsing for model output. JSON mode means the provider
/// returns bare JSON; anything else (markdown fences included) is rejected
/// without rescue.
pub fn parse_json_strict<T: DeserializeOwned>(content: &str) -> Result<T> {
    let trimmed = content.trim();
    if trimmed.starts_with("```") {
        return Err(IngestError::Parse(
            "response is markdown-fenced, expected bare JSON".into(),
        ));
    }
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return Err(IngestError::Parse(format!(
            "response does not start with a JSON value: '{}'",
            &trimmed.chars().take(40).collect::<String>()
        )));
    }
    serde_json::from_str(trimmed).map_err(|e| IngestError::Parse(e.to_string()))
}

enum CallFailure {
    RateLimited(String),
    InvalidKey(String),
    Transient(String),
}

pub struct GeminiClient {
    http: Client,
    pool: Arc<KeyPool>,
    base_url: String,
    timeout: Duration,
    /// How long a single call may wait for a usable key.
    acquire_deadline: Duration,
    backoff_start: Duration,
    backoff_cap: Duration,
}

impl GeminiClient {
    pub fn new(pool: Arc<KeyPool>, timeout: Duration, acquire_deadline: Duration) -> Self {
        Self {
            http: Client::new(),
            pool,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout,
            acquire_deadline,
            backoff_start: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, start: Duration, cap: Duration) -> Self {
        self.backoff_start = start;
        self.backoff_cap = cap;
        self
    }

    /// One completion with retry: a fresh key per attempt, exponential
    /// backoff from 1s capped at 30s, at most 4 retries.
    pub async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        cache_handle: Option<&str>,
    ) -> Result<Completion> {
        let mut backoff = self.backoff_start;
        let mut last_failure = String::new();

        for attempt in 0..=MAX_RETRIES {
            let handle = self
                .pool
                .acquire(&options.model, self.acquire_deadline)
                .await?;

            match self
                .try_complete(&handle.api_key, prompt, options, cache_handle)
                .await
            {
                Ok(completion) => {
                    self.pool.report(
                        handle,
                        Outcome::Success,
                        Some(completion.tokens_in + completion.tokens_out),
                    );
                    return Ok(completion);
                }
                Err(CallFailure::RateLimited(msg)) => {
                    self.pool.report(handle, Outcome::RateLimited, None);
                    last_failure = msg;
                }
                Err(CallFailure::InvalidKey(msg)) => {
                    self.pool.report(handle, Outcome::InvalidKey, None);
                    last_failure = msg;
                    // A different key may work immediately; no backoff.
                    continue;
                }
                Err(CallFailure::Transient(msg)) => {
                    self.pool.report(handle, Outcome::TransientError, None);
                    last_failure = msg;
                }
            }

            if attempt < MAX_RETRIES {
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying LLM call");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.backoff_cap);
            }
        }

        Err(IngestError::Transient(format!(
            "LLM call failed after {} retries: {}",
            MAX_RETRIES, last_failure
        )))
    }

    async fn try_complete(
        &self,
        api_key: &str,
        prompt: &str,
        options: &CompletionOptions,
        cache_handle: Option<&str>,
    ) -> std::result::Result<Completion, CallFailure> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, options.model, api_key
        );

        let mut generation_config = json!({
            "temperature": options.temperature,
            "maxOutputTokens": options.max_output_tokens,
        });
        if options.json_mode {
            generation_config["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": generation_config,
        });
        if let Some(handle) = cache_handle {
            // Cached content already carries the transcript and system
            // instruction as its prefix.
            body["cachedContent"] = json!(handle);
        } else if let Some(system) = &options.system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CallFailure::RateLimited("provider returned 429".into()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CallFailure::InvalidKey(format!(
                "provider rejected key: {}",
                status
            )));
        }
        if status.as_u16() == 400 {
            let text = response.text().await.unwrap_or_default();
            if text.contains("API key") {
                return Err(CallFailure::InvalidKey("provider rejected key: 400".into()));
            }
            return Err(CallFailure::Transient(format!(
                "provider returned 400: {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        if !status.is_success() {
            return Err(CallFailure::Transient(format!(
                "provider returned {}",
                status
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CallFailure::Transient(e.to_string()))?;

        let content = payload
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if content.is_empty() {
            return Err(CallFailure::Transient("empty candidate content".into()));
        }

        let usage = payload.get("usageMetadata");
        let tokens_in = usage
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let tokens_out = usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(Completion {
            content,
            tokens_in,
            tokens_out,
        })
    }

    /// Create provider-side cached content and return (handle, cached token
    /// count). Used by the prompt-cache manager only.
    pub async fn create_cached_content(
        &self,
        model: &str,
        system: &str,
        content: &str,
        ttl: Duration,
    ) -> Result<(String, u64)> {
        let handle = self.pool.acquire(model, self.acquire_deadline).await?;
        let url = format!(
            "{}/v1beta/cachedContents?key={}",
            self.base_url, handle.api_key
        );
        let body = json!({
            "model": format!("models/{}", model),
            "contents": [{"role": "user", "parts": [{"text": content}]}],
            "systemInstruction": {"parts": [{"text": system}]},
            "ttl": format!("{}s", ttl.as_secs()),
        });

        let result: std::result::Result<(String, u64), String> = async {
            let response = self
                .http
                .post(&url)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("provider returned {}", response.status()));
            }
            let payload: Value = response.json().await.map_err(|e| e.to_string())?;
            let name = payload
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| "cache response missing name".to_string())?
                .to_string();
            let tokens = payload
                .get("usageMetadata")
                .and_then(|u| u.get("totalTokenCount"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Ok((name, tokens))
        }
        .await;

        match result {
            Ok((name, tokens)) => {
                self.pool.report(handle, Outcome::Success, Some(tokens));
                Ok((name, tokens))
            }
            Err(msg) => {
                self.pool.report(handle, Outcome::TransientError, None);
                Err(IngestError::Transient(format!(
                    "cache creation failed: {}",
                    msg
                )))
            }
        }
    }
}

/// Capability surface the pipeline codes against. Two variants exist -
/// direct and cached - and the driver picks one at construction time.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// JSON-mode completion with per-call options.
    async fn complete_with_options(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion>;

    /// JSON-mode completion with default options.
    async fn complete(&self, prompt: &str, model: &str) -> Result<Completion> {
        let options = CompletionOptions {
            model: model.to_string(),
            system: None,
            json_mode: true,
            temperature: 0.2,
            max_output_tokens: 8192,
        };
        self.complete_with_options(prompt, &options).await
    }
}

/// Uncached variant: every prompt ships its own context.
pub struct DirectProvider {
    client: Arc<GeminiClient>,
}

impl DirectProvider {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmProvider for DirectProvider {
    async fn complete_with_options(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion> {
        self.client.complete(prompt, options, None).await
    }
}

/// Cached variant: binds calls to the episode's provider-side transcript
/// cache when one exists; otherwise behaves like the direct variant.
pub struct CachedProvider {
    client: Arc<GeminiClient>,
    cache: Arc<PromptCacheManager>,
    episode_id: String,
}

impl CachedProvider {
    pub fn new(
        client: Arc<GeminiClient>,
        cache: Arc<PromptCacheManager>,
        episode_id: &str,
    ) -> Self {
        Self {
            client,
            cache,
            episode_id: episode_id.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for CachedProvider {
    async fn complete_with_options(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let handle = self.cache.episode_handle(&self.episode_id).await;
        if handle.is_none() {
            warn!(episode_id = %self.episode_id, "no cache handle, falling back to uncached call");
        }
        self.client
            .complete(prompt, options, handle.as_deref())
            .await
    }
}
