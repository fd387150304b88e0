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

//! Per-episode driver: sequences analysis, regrouping, extraction, and
//! persistence as an explicit state machine. Transitions happen only on
//! success, every transition is logged with elapsed time, and cancellation
//! is honored at state boundaries (in-flight network calls are never
//! interrupted).

use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analyzer::{ConversationAnalyzer, STRUCTURE_SYSTEM_PROMPT};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{IngestError, Result};
use crate::extraction::ExtractionOrchestrator;
use crate::graph::{archive_vtt, hash_source, GraphRouter};
use crate::llm::{CachedProvider, DirectProvider, GeminiClient, LlmProvider};
use crate::prompt_cache::PromptCacheManager;
use crate::regrouper::Regrouper;
use crate::registry::PodcastEntry;
use crate::tracker::{episode_id, EpisodeTracker};
use crate::types::{
    EmbeddingFailure, Episode, EpisodeCounts, ExtractionFailure, ProcessingStatus, Segment,
};
use crate::vtt;

lazy_static! {
    static ref FILENAME_DATE: Regex = Regex::new(r"(\d{4}-\d{2}-\d{2})").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Discovered,
    Tracked,
    Parsed,
    Structured,
    Unitized,
    Extracted,
    Persisted,
    Archived,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovered => "discovered",
            Stage::Tracked => "tracked",
            Stage::Parsed => "parsed",
            Stage::Structured => "structured",
            Stage::Unitized => "unitized",
            Stage::Extracted => "extracted",
            Stage::Persisted => "persisted",
            Stage::Archived => "archived",
            Stage::Completed => "completed",
        };
        write!(f, "{}", name)
    }
}

/// Everything one episode run needs, passed explicitly - no component reads
/// mutable process state.
#[derive(Debug, Clone)]
pub struct EpisodeContext {
    pub run_id: Uuid,
    pub podcast: PodcastEntry,
    pub vtt_path: PathBuf,
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug)]
pub enum EpisodeOutcome {
    Completed {
        episode_id: String,
        units: usize,
        extraction_failures: usize,
        missing_embeddings: usize,
        archive_failed: bool,
    },
    Skipped {
        episode_id: String,
    },
    DryRun {
        episode_id: String,
        segments: usize,
        would_ingest: bool,
    },
    Failed {
        episode_id: Option<String>,
        reason: String,
        resumable: bool,
    },
}

impl EpisodeOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, EpisodeOutcome::Failed { .. })
    }
}

/// Publication date for an episode: NOTE metadata first, then a
/// `YYYY-MM-DD` anywhere in the file name, then the file's modified time.
fn resolve_publication_date(metadata_date: Option<NaiveDate>, path: &Path) -> NaiveDate {
    if let Some(date) = metadata_date {
        return date;
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Some(caps) = FILENAME_DATE.captures(name) {
            if let Ok(date) = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d") {
                return date;
            }
        }
    }
    path.metadata()
        .and_then(|m| m.modified())
        .map(|t| chrono::DateTime::<Utc>::from(t).date_naive())
        .unwrap_or_else(|_| Utc::now().date_naive())
}

/// Write failure entries as JSON lines under
/// `{logs_root}/{kind}/failures_{timestamp}.json`. Best-effort.
fn write_failure_log<T: serde::Serialize>(logs_root: &Path, kind: &str, entries: &[T]) {
    if entries.is_empty() {
        return;
    }
    let dir = logs_root.join(kind);
    let result = (|| -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "failures_{}.json",
            Utc::now().format("%Y-%m-%dT%H-%M-%S")
        ));
        let mut file = std::fs::File::create(&path)?;
        for entry in entries {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        warn!(kind, error = %e, "failed to write failure log");
    }
}

struct EpisodeArtifacts {
    units: usize,
    extraction_failures: Vec<ExtractionFailure>,
    failed_embeddings: Vec<EmbeddingFailure>,
}

pub struct PipelineDriver {
    config: Arc<Config>,
    client: Arc<GeminiClient>,
    cache: Arc<PromptCacheManager>,
    embeddings: Arc<EmbeddingClient>,
    router: Arc<GraphRouter>,
    tracker: Arc<EpisodeTracker>,
    cancel: CancellationToken,
}

impl PipelineDriver {
    pub fn new(
        config: Arc<Config>,
        client: Arc<GeminiClient>,
        cache: Arc<PromptCacheManager>,
        embeddings: Arc<EmbeddingClient>,
        router: Arc<GraphRouter>,
        tracker: Arc<EpisodeTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            cache,
            embeddings,
            router,
            tracker,
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(IngestError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn log_transition(&self, ctx: &EpisodeContext, episode_id: &str, stage: Stage, started: Instant) {
        info!(
            run_id = %ctx.run_id,
            episode_id,
            state = %stage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline transition"
        );
    }

    /// Process one episode end to end. Never panics the worker: every
    /// failure becomes an `EpisodeOutcome::Failed` with a stable reason.
    pub async fn process_episode(&self, ctx: EpisodeContext) -> EpisodeOutcome {
        let started = Instant::now();

        let doc = match vtt::parse_file(&ctx.vtt_path) {
            Ok(doc) => doc,
            Err(e) => {
                error!(path = %ctx.vtt_path.display(), error = %e, "failed to parse VTT");
                return EpisodeOutcome::Failed {
                    episode_id: None,
                    reason: e.reason_code().to_string(),
                    resumable: e.is_resumable(),
                };
            }
        };

        let title = doc.title_or(&ctx.vtt_path);
        let date = resolve_publication_date(doc.metadata.date, &ctx.vtt_path);
        let id = episode_id(&ctx.podcast.id, &title, date);
        self.log_transition(&ctx, &id, Stage::Discovered, started);

        if !ctx.force {
            match self.tracker.should_ingest(&ctx.podcast.id, &title, date).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(episode_id = %id, "episode already complete, skipping");
                    return EpisodeOutcome::Skipped { episode_id: id };
                }
                Err(e) => {
                    return self.fail(&ctx, Some(&id), e).await;
                }
            }
        }

        if ctx.dry_run {
            let segments = doc.cues.len();
            info!(episode_id = %id, segments, "dry run, not ingesting");
            return EpisodeOutcome::DryRun {
                episode_id: id,
                segments,
                would_ingest: true,
            };
        }

        let store = match self.router.store_for(&ctx.podcast.id).await {
            Ok(store) => store,
            Err(e) => return self.fail(&ctx, Some(&id), e).await,
        };

        let segments = doc.to_segments();
        let source_file_hash = match hash_source(&ctx.vtt_path) {
            Ok(hash) => hash,
            Err(e) => return self.fail(&ctx, Some(&id), e).await,
        };

        let mut episode = Episode {
            id: id.clone(),
            podcast_id: ctx.podcast.id.clone(),
            title: title.clone(),
            publication_date: date,
            source_file_hash,
            status: ProcessingStatus::InProgress,
            archive_path: None,
            counts: EpisodeCounts {
                segments: segments.len(),
                units: 0,
                entities: 0,
            },
        };

        // Track in_progress immediately so observers see work in flight.
        if let Err(e) = store.upsert_episode_in_progress(&episode, &ctx.podcast).await {
            return self.fail(&ctx, Some(&id), e).await;
        }
        if let Err(e) = self.tracker.mark_in_progress(&ctx.podcast.id, &id).await {
            return self.fail(&ctx, Some(&id), e).await;
        }
        self.log_transition(&ctx, &id, Stage::Tracked, started);

        let work = self.run_stages(&ctx, &mut episode, &segments, started);
        let artifacts = match tokio::time::timeout(self.config.pipeline.timeout, work).await {
            Ok(Ok(artifacts)) => artifacts,
            Ok(Err(e)) => return self.fail(&ctx, Some(&id), e).await,
            Err(_) => {
                warn!(episode_id = %id, "per-episode wall clock budget exceeded");
                return self
                    .fail(
                        &ctx,
                        Some(&id),
                        IngestError::Transient("pipeline timeout exceeded".into()),
                    )
                    .await;
            }
        };

        // Archive after the commit; failure here is logged, never fatal.
        let mut archive_failed = false;
        match archive_vtt(&ctx.vtt_path, &self.config.paths.data_root, &ctx.podcast.id) {
            Ok(target) => {
                if let Err(e) = store.set_archive_path(&id, &target).await {
                    warn!(episode_id = %id, error = %e, "archive path not recorded");
                }
                self.log_transition(&ctx, &id, Stage::Archived, started);
            }
            Err(e) => {
                warn!(episode_id = %id, error = %e, "archive move failed; episode retains archive_path = null");
                archive_failed = true;
            }
        }

        if let Err(e) = self.tracker.mark_complete(&ctx.podcast.id, &id).await {
            return self.fail(&ctx, Some(&id), e).await;
        }
        self.log_transition(&ctx, &id, Stage::Completed, started);

        write_failure_log(
            &self.config.paths.logs_root,
            "embedding_failures",
            &artifacts.failed_embeddings,
        );
        write_failure_log(
            &self.config.paths.logs_root,
            "extraction_failures",
            &artifacts.extraction_failures,
        );

        EpisodeOutcome::Completed {
            episode_id: id,
            units: artifacts.units,
            extraction_failures: artifacts.extraction_failures.len(),
            missing_embeddings: artifacts.failed_embeddings.len(),
            archive_failed,
        }
    }

    /// PARSED through PERSISTED, bounded by the pipeline timeout.
    async fn run_stages(
        &self,
        ctx: &EpisodeContext,
        episode: &mut Episode,
        segments: &[Segment],
        started: Instant,
    ) -> Result<EpisodeArtifacts> {
        if segments.is_empty() {
            return Err(IngestError::StructureInvalid(
                "transcript contains no segments".into(),
            ));
        }
        self.log_transition(ctx, &episode.id, Stage::Parsed, started);
        self.check_cancelled()?;

        // One transcript cache per episode; below the size gate or on
        // provider refusal the episode simply runs uncached.
        let transcript = segments
            .iter()
            .map(|s| format!("{}: {}", s.speaker, s.text))
            .collect::<Vec<_>>()
            .join("\n");
        let cache_handle = self
            .cache
            .ensure_episode_cache(
                &episode.id,
                &self.config.gemini.flash_model,
                STRUCTURE_SYSTEM_PROMPT,
                &transcript,
            )
            .await;

        // Single constructor choice between the two provider variants.
        let provider: Box<dyn LlmProvider> = if cache_handle.is_some() {
            Box::new(CachedProvider::new(
                self.client.clone(),
                self.cache.clone(),
                &episode.id,
            ))
        } else {
            Box::new(DirectProvider::new(self.client.clone()))
        };

        let analyzer = ConversationAnalyzer::new(provider.as_ref(), &self.config);
        let structure = analyzer
            .analyze(&ctx.podcast.name, &episode.title, segments)
            .await?;
        self.log_transition(ctx, &episode.id, Stage::Structured, started);
        self.check_cancelled()?;

        let regrouper = Regrouper::new(&self.embeddings);
        let regrouped = regrouper
            .regroup(&ctx.podcast.id, &episode.id, segments, &structure)
            .await?;
        let mut units = regrouped.units;
        self.log_transition(ctx, &episode.id, Stage::Unitized, started);
        self.check_cancelled()?;

        // One combined extraction call per unit, sequentially: ordered
        // prompts keep the prompt cache effective and the quota accounting
        // per-episode. A failed unit is recorded and skipped.
        let orchestrator = ExtractionOrchestrator::new(provider.as_ref(), &self.config);
        let mut extractions = HashMap::new();
        let mut extraction_failures: Vec<ExtractionFailure> = Vec::new();
        for (unit, unit_type) in units.iter_mut() {
            self.check_cancelled()?;
            match orchestrator.extract(unit, unit_type).await {
                Ok(extraction) => {
                    unit.sentiment = extraction.sentiment.clone();
                    extractions.insert(unit.id.clone(), extraction);
                }
                Err(e) => {
                    warn!(unit_id = %unit.id, error = %e, "unit extraction failed");
                    extraction_failures.push(ExtractionFailure {
                        podcast_id: ctx.podcast.id.clone(),
                        episode_id: episode.id.clone(),
                        unit_id: unit.id.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
        self.log_transition(ctx, &episode.id, Stage::Extracted, started);
        self.check_cancelled()?;

        episode.counts.units = units.len();
        episode.counts.entities = extractions
            .values()
            .map(|e: &crate::types::UnitExtraction| e.entities.len())
            .sum();

        let plain_units: Vec<_> = units.iter().map(|(u, _)| u.clone()).collect();
        let store = self.router.store_for(&ctx.podcast.id).await?;
        store
            .persist_episode(episode, &plain_units, &extractions, &structure.themes)
            .await?;
        self.log_transition(ctx, &episode.id, Stage::Persisted, started);

        Ok(EpisodeArtifacts {
            units: plain_units.len(),
            extraction_failures,
            failed_embeddings: regrouped.failed_embeddings,
        })
    }

    async fn fail(
        &self,
        ctx: &EpisodeContext,
        episode_id: Option<&str>,
        e: IngestError,
    ) -> EpisodeOutcome {
        let reason = e.reason_code().to_string();
        error!(
            run_id = %ctx.run_id,
            episode_id = episode_id.unwrap_or("unknown"),
            reason = %reason,
            error = %e,
            "episode failed"
        );
        if let Some(id) = episode_id {
            if let Err(mark_err) = self.tracker.mark_failed(&ctx.podcast.id, id, &reason).await {
                warn!(episode_id = id, error = %mark_err, "could not mark episode failed");
            }
        }
        EpisodeOutcome::Failed {
            episode_id: episode_id.map(|s| s.to_string()),
            reason,
            resumable: e.is_resumable(),
        }
    }

    /// Recovery job: attach vectors to completed units that are missing
    /// one. A run with nothing missing is a no-op.
    pub async fn backfill_embeddings(&self, podcast_id: &str) -> Result<usize> {
        let store = self.router.store_for(podcast_id).await?;
        let missing = store.units_missing_embeddings().await?;
        if missing.is_empty() {
            info!(podcast_id, "no units missing embeddings");
            return Ok(0);
        }

        let texts: Vec<String> = missing.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.embeddings.embed(&texts).await?;

        let mut attached = 0;
        for ((unit_id, _), vector) in missing.iter().zip(vectors) {
            if let Some(vector) = vector {
                store.attach_embedding(unit_id, &vector).await?;
                attached += 1;
            } else {
                warn!(unit_id, "embedding still absent after backfill attempt");
            }
        }
        info!(podcast_id, attached, total = missing.len(), "embedding backfill finished");
        Ok(attached)
    }
}
