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

//! Episode-level tracking with the graph as the source of truth. The same
//! contract serves the ingestion pipeline and the upstream transcription
//! producer: an episode already `complete` in the graph is never worth
//! another API dollar. In independent mode a local JSON tracker mirrors
//! completion state as a fallback for when the graph is unreachable.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::PipelineMode;
use crate::error::Result;
use crate::graph::GraphRouter;
use crate::types::ProcessingStatus;

/// Deterministic canonical episode id: lowercase, spaces to underscores,
/// non-alphanumerics stripped, ISO date prepended, podcast id prefixed.
/// Pure - identical inputs yield identical ids across modules and restarts.
pub fn episode_id(podcast_id: &str, title: &str, date: NaiveDate) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_sep = true;
    for c in title.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_sep = false;
        } else if (c.is_whitespace() || c == '-' || c == '_') && !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
        // Every other character is stripped outright.
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    format!("{}_{}_{}", podcast_id, date.format("%Y-%m-%d"), slug)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileTrackerState {
    episodes: HashMap<String, String>,
}

/// Local JSON fallback tracker used in independent mode.
struct FileTracker {
    path: PathBuf,
    state: Mutex<FileTrackerState>,
}

impl FileTracker {
    fn load(path: PathBuf) -> Self {
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    async fn is_complete(&self, episode_id: &str) -> bool {
        self.state
            .lock()
            .await
            .episodes
            .get(episode_id)
            .map_or(false, |s| s == ProcessingStatus::Complete.as_str())
    }

    async fn record(&self, episode_id: &str, status: ProcessingStatus) {
        let mut state = self.state.lock().await;
        state
            .episodes
            .insert(episode_id.to_string(), status.as_str().to_string());
        let write_result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let parent = self
                .path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(serde_json::to_string_pretty(&*state)?.as_bytes())?;
            tmp.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = write_result {
            warn!(error = %e, "failed to persist file tracker");
        }
    }
}

pub struct EpisodeTracker {
    router: Arc<GraphRouter>,
    mode: PipelineMode,
    file_tracker: FileTracker,
}

impl EpisodeTracker {
    pub fn new(router: Arc<GraphRouter>, mode: PipelineMode, data_root: &std::path::Path) -> Self {
        Self {
            router,
            mode,
            file_tracker: FileTracker::load(data_root.join(".episode-tracker.json")),
        }
    }

    /// False iff the episode's graph node exists with status `complete`.
    /// This is the gate both the ingestion pipeline and the transcription
    /// producer consult before spending API budget.
    pub async fn should_ingest(
        &self,
        podcast_id: &str,
        title: &str,
        date: NaiveDate,
    ) -> Result<bool> {
        let id = episode_id(podcast_id, title, date);
        match self.router.store_for(podcast_id).await {
            Ok(store) => {
                let status = store.episode_status(&id).await?;
                Ok(status != Some(ProcessingStatus::Complete))
            }
            Err(e) if self.mode == PipelineMode::Independent => {
                // Graph unreachable in standalone mode: trust the local
                // mirror rather than re-transcribing blindly.
                warn!(error = %e, "graph unreachable, consulting file tracker");
                Ok(!self.file_tracker.is_complete(&id).await)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mark_in_progress(&self, podcast_id: &str, episode_id: &str) -> Result<()> {
        debug!(episode_id, "tracking in_progress");
        if self.mode == PipelineMode::Independent {
            self.file_tracker
                .record(episode_id, ProcessingStatus::InProgress)
                .await;
        }
        // The graph node itself is written by the driver through the store;
        // nothing further to do here.
        let _ = podcast_id;
        Ok(())
    }

    pub async fn mark_complete(&self, podcast_id: &str, episode_id: &str) -> Result<()> {
        let store = self.router.store_for(podcast_id).await?;
        store.mark_complete(episode_id).await?;
        if self.mode == PipelineMode::Independent {
            self.file_tracker
                .record(episode_id, ProcessingStatus::Complete)
                .await;
        }
        Ok(())
    }

    pub async fn mark_failed(&self, podcast_id: &str, episode_id: &str, reason: &str) -> Result<()> {
        let store = self.router.store_for(podcast_id).await?;
        store.mark_failed(episode_id, reason).await?;
        if self.mode == PipelineMode::Independent {
            self.file_tracker
                .record(episode_id, ProcessingStatus::Failed)
                .await;
        }
        Ok(())
    }
}
