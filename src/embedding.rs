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

//! Batched vector generation: ordered batch in, ordered batch out. A failed
//! batch yields the absent sentinel (`None`) per item so the caller decides
//! recovery; the episode keeps going.

use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::Result;
use crate::keypool::{KeyPool, Outcome};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct EmbeddingClient {
    http: Client,
    pool: Arc<KeyPool>,
    base_url: String,
    model: String,
    config: EmbeddingConfig,
    timeout: Duration,
    acquire_deadline: Duration,
}

impl EmbeddingClient {
    pub fn new(
        pool: Arc<KeyPool>,
        model: &str,
        config: EmbeddingConfig,
        timeout: Duration,
        acquire_deadline: Duration,
    ) -> Self {
        Self {
            http: Client::new(),
            pool,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.to_string(),
            config,
            timeout,
            acquire_deadline,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Embed `texts` in input order. Each output slot is either a vector of
    /// the configured dimension or `None`.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut first_batch = true;

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            if !first_batch {
                tokio::time::sleep(self.config.interbatch_delay).await;
            }
            first_batch = false;
            out.extend(self.embed_batch(batch).await?);
        }

        Ok(out)
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let handle = self.pool.acquire(&self.model, self.acquire_deadline).await?;
        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents?key={}",
            self.base_url, self.model, handle.api_key
        );
        let requests: Vec<Value> = batch
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": {"parts": [{"text": text}]},
                })
            })
            .collect();

        let result: std::result::Result<Vec<Option<Vec<f32>>>, String> = async {
            let response = self
                .http
                .post(&url)
                .timeout(self.timeout)
                .json(&json!({ "requests": requests }))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("provider returned {}", response.status()));
            }
            let payload: Value = response.json().await.map_err(|e| e.to_string())?;
            let embeddings = payload
                .get("embeddings")
                .and_then(|e| e.as_array())
                .ok_or_else(|| "response missing embeddings".to_string())?;

            let vectors = embeddings
                .iter()
                .map(|item| {
                    let values: Option<Vec<f32>> = item
                        .get("values")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|n| n.as_f64().map(|f| f as f32))
                                .collect()
                        });
                    match values {
                        Some(v) if v.len() == self.config.dimension => Some(v),
                        Some(v) => {
                            warn!(
                                got = v.len(),
                                expected = self.config.dimension,
                                "embedding has wrong dimension, treating as absent"
                            );
                            None
                        }
                        None => None,
                    }
                })
                .collect::<Vec<_>>();

            if vectors.len() != batch.len() {
                return Err(format!(
                    "provider returned {} embeddings for {} inputs",
                    vectors.len(),
                    batch.len()
                ));
            }
            Ok(vectors)
        }
        .await;

        match result {
            Ok(vectors) => {
                // Usage metadata is not returned for embeddings; charge by
                // request count only.
                self.pool.report(handle, Outcome::Success, None);
                Ok(vectors)
            }
            Err(msg) => {
                warn!(batch_len = batch.len(), error = %msg, "embedding batch failed");
                self.pool.report(handle, Outcome::TransientError, None);
                // Absent sentinel for every item in the failed batch.
                debug!("marking batch embeddings absent");
                Ok(vec![None; batch.len()])
            }
        }
    }
}
