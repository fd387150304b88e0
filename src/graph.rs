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

//! Graph storage coordination: idempotent schema bootstrap, MERGE-based
//! writes inside one transaction per episode, multi-podcast database
//! routing with a validated connection cache, and the post-commit archive
//! move. Re-running an episode is safe by construction.

use chrono::Utc;
use neo4rs::{query, ConfigBuilder, Graph, Query};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::extraction::canonical_entity_key;
use crate::registry::{PodcastEntry, Registry};
use crate::types::{Episode, MeaningfulUnit, ProcessingStatus, UnitExtraction};

pub const VECTOR_INDEX_NAME: &str = "meaningfulUnitEmbeddings";
/// Vector indexes landed in Neo4j 5.13.
const VECTOR_INDEX_MIN_VERSION: (u32, u32) = (5, 13);

/// SHA-256 of the source file, stored on the Episode node so re-ingestion
/// of a changed transcript is detectable.
pub fn hash_source(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn parse_server_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn supports_vector_index(version: &str) -> bool {
    parse_server_version(version).map_or(false, |v| v >= VECTOR_INDEX_MIN_VERSION)
}

fn topic_id(name: &str) -> String {
    format!("topic_{}", canonical_entity_key(name))
}

/// Move the source VTT into the podcast's processed directory. Rename when
/// both paths share a filesystem; copy + fsync + unlink otherwise. The
/// graph write is already committed when this runs, so failure is reported
/// as `archive_failed` and never rolls anything back.
pub fn archive_vtt(source: &Path, data_root: &Path, podcast_id: &str) -> Result<PathBuf> {
    let processed_dir = data_root.join("podcasts").join(podcast_id).join("processed");
    std::fs::create_dir_all(&processed_dir)
        .map_err(|e| IngestError::ArchiveFailed(format!("cannot create archive dir: {}", e)))?;

    let basename = source
        .file_name()
        .ok_or_else(|| IngestError::ArchiveFailed("source has no file name".into()))?;
    let target = processed_dir.join(basename);

    match std::fs::rename(source, &target) {
        Ok(()) => Ok(target),
        Err(rename_err) => {
            // Cross-filesystem move: copy, flush to disk, then unlink.
            std::fs::copy(source, &target).map_err(|e| {
                IngestError::ArchiveFailed(format!(
                    "rename failed ({}) and copy failed: {}",
                    rename_err, e
                ))
            })?;
            std::fs::File::open(&target)
                .and_then(|f| f.sync_all())
                .map_err(|e| IngestError::ArchiveFailed(format!("fsync failed: {}", e)))?;
            std::fs::remove_file(source)
                .map_err(|e| IngestError::ArchiveFailed(format!("unlink failed: {}", e)))?;
            Ok(target)
        }
    }
}

/// Session bound to one podcast's database.
pub struct GraphStore {
    graph: Graph,
    podcast_id: String,
    embedding_dimension: usize,
    db_timeout: Duration,
}

impl GraphStore {
    pub async fn connect(
        podcast: &PodcastEntry,
        embedding_dimension: usize,
        db_timeout: Duration,
    ) -> Result<Self> {
        let username = podcast
            .database
            .username
            .clone()
            .or_else(|| std::env::var("NEO4J_USERNAME").ok())
            .unwrap_or_else(|| "neo4j".to_string());
        let password = podcast
            .database
            .password
            .clone()
            .or_else(|| std::env::var("NEO4J_PASSWORD").ok())
            .unwrap_or_else(|| "neo4j".to_string());

        let config = ConfigBuilder::default()
            .uri(podcast.database.address())
            .user(username)
            .password(password)
            .db(podcast.database.database_name.as_str())
            .build()
            .map_err(|e| IngestError::DatabaseUnavailable {
                podcast: podcast.id.clone(),
                message: e.to_string(),
            })?;

        let graph = tokio::time::timeout(db_timeout, Graph::connect(config))
            .await
            .map_err(|_| IngestError::DatabaseUnavailable {
                podcast: podcast.id.clone(),
                message: "connection timed out".into(),
            })?
            .map_err(|e| IngestError::DatabaseUnavailable {
                podcast: podcast.id.clone(),
                message: e.to_string(),
            })?;

        let store = Self {
            graph,
            podcast_id: podcast.id.clone(),
            embedding_dimension,
            db_timeout,
        };
        store.validate().await?;
        Ok(store)
    }

    /// Trivial round-trip so a dead target fails loudly at first use
    /// instead of at commit time.
    async fn validate(&self) -> Result<()> {
        let result = tokio::time::timeout(self.db_timeout, async {
            let mut rows = self.graph.execute(query("RETURN 1 AS probe")).await?;
            rows.next().await?;
            Ok::<_, neo4rs::Error>(())
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(IngestError::DatabaseUnavailable {
                podcast: self.podcast_id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(IngestError::DatabaseUnavailable {
                podcast: self.podcast_id.clone(),
                message: "validation query timed out".into(),
            }),
        }
    }

    /// Idempotent schema bootstrap: uniqueness constraints, property
    /// indexes, and - when the server is new enough - the vector index.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT episode_id_unique IF NOT EXISTS \
             FOR (e:Episode) REQUIRE e.id IS UNIQUE",
            "CREATE CONSTRAINT meaningful_unit_id_unique IF NOT EXISTS \
             FOR (u:MeaningfulUnit) REQUIRE u.id IS UNIQUE",
            "CREATE CONSTRAINT entity_id_unique IF NOT EXISTS \
             FOR (en:Entity) REQUIRE en.id IS UNIQUE",
            "CREATE INDEX episode_podcast_id IF NOT EXISTS \
             FOR (e:Episode) ON (e.podcast_id)",
            "CREATE INDEX topic_name IF NOT EXISTS FOR (t:Topic) ON (t.name)",
        ];
        for statement in statements {
            self.graph.run(query(statement)).await?;
        }

        match self.server_version().await {
            Ok(version) if supports_vector_index(&version) => {
                let statement = format!(
                    "CREATE VECTOR INDEX {} IF NOT EXISTS \
                     FOR (u:MeaningfulUnit) ON (u.embedding) \
                     OPTIONS {{indexConfig: {{`vector.dimensions`: {}, \
                     `vector.similarity_function`: 'cosine'}}}}",
                    VECTOR_INDEX_NAME, self.embedding_dimension
                );
                self.graph.run(query(&statement)).await?;
                info!(podcast = %self.podcast_id, version, "vector index ensured");
            }
            Ok(version) => {
                warn!(
                    podcast = %self.podcast_id,
                    version,
                    "server does not support vector indexes; similarity queries disabled"
                );
            }
            Err(e) => {
                warn!(podcast = %self.podcast_id, error = %e, "version probe failed; skipping vector index");
            }
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        let mut rows = self
            .graph
            .execute(query(
                "CALL dbms.components() YIELD versions RETURN versions[0] AS version",
            ))
            .await?;
        if let Some(row) = rows.next().await? {
            let version: String = row.get("version").unwrap_or_default();
            return Ok(version);
        }
        Err(IngestError::Transient("empty version probe result".into()))
    }

    /// Write the Episode node as soon as work starts so external observers
    /// (including the upstream transcription producer) see it in flight.
    pub async fn upsert_episode_in_progress(&self, episode: &Episode, podcast: &PodcastEntry) -> Result<()> {
        let q = query(
            "MERGE (p:Podcast {id: $podcast_id}) \
             SET p.name = $podcast_name, p.rss_url = $rss_url \
             MERGE (e:Episode {id: $episode_id}) \
             SET e.podcast_id = $podcast_id, e.title = $title, \
                 e.publication_date = $publication_date, \
                 e.source_file_hash = $source_file_hash, \
                 e.processing_status = $status \
             MERGE (p)-[:HAS_EPISODE]->(e)",
        )
        .param("podcast_id", episode.podcast_id.as_str())
        .param("podcast_name", podcast.name.as_str())
        .param("rss_url", podcast.rss_feed_url.as_str())
        .param("episode_id", episode.id.as_str())
        .param("title", episode.title.as_str())
        .param(
            "publication_date",
            episode.publication_date.format("%Y-%m-%d").to_string(),
        )
        .param("source_file_hash", episode.source_file_hash.as_str())
        .param("status", ProcessingStatus::InProgress.as_str());
        self.graph.run(q).await?;
        Ok(())
    }

    fn unit_query(&self, episode_id: &str, unit: &MeaningfulUnit) -> Query {
        let mut statement = String::from(
            "MATCH (e:Episode {id: $episode_id}) \
             MERGE (u:MeaningfulUnit {id: $id}) \
             SET u.episode_id = $episode_id, u.ordinal = $ordinal, \
                 u.start_ms = $start_ms, u.end_ms = $end_ms, \
                 u.speakers = $speakers, u.text = $text, \
                 u.summary = $summary, u.themes = $themes",
        );
        if unit.embedding.is_some() {
            statement.push_str(", u.embedding = $embedding");
        }
        if unit.sentiment.is_some() {
            statement.push_str(
                ", u.sentiment_polarity = $polarity, u.sentiment_score = $score, \
                 u.sentiment_energy = $energy, u.sentiment_emotions = $emotions",
            );
        }
        statement.push_str(" MERGE (e)-[:HAS_UNIT]->(u)");

        let mut q = query(&statement)
            .param("episode_id", episode_id)
            .param("id", unit.id.as_str())
            .param("ordinal", unit.ordinal as i64)
            .param("start_ms", unit.start_ms as i64)
            .param("end_ms", unit.end_ms as i64)
            .param("speakers", unit.speakers.clone())
            .param("text", unit.text.as_str())
            .param("summary", unit.summary.as_str())
            .param("themes", unit.themes.clone());
        if let Some(embedding) = &unit.embedding {
            q = q.param(
                "embedding",
                embedding.iter().map(|v| *v as f64).collect::<Vec<f64>>(),
            );
        }
        if let Some(sentiment) = &unit.sentiment {
            q = q
                .param("polarity", sentiment.polarity as f64)
                .param("score", sentiment.score as f64)
                .param("energy", sentiment.energy_level as f64)
                .param(
                    "emotions",
                    sentiment
                        .emotions
                        .iter()
                        .map(|e| format!("{}:{:.2}", e.name, e.intensity))
                        .collect::<Vec<String>>(),
                );
        }
        q
    }

    /// Persist the full episode in one transaction, MERGE everywhere so a
    /// re-run leaves the graph unchanged. Write order: episode, units,
    /// entities, quotes, insights, topics, then entity relationships as a
    /// second pass over ids.
    pub async fn persist_episode(
        &self,
        episode: &Episode,
        units: &[MeaningfulUnit],
        extractions: &HashMap<String, UnitExtraction>,
        episode_themes: &[String],
    ) -> Result<()> {
        let mut queries: Vec<Query> = Vec::new();

        queries.push(
            query(
                "MATCH (e:Episode {id: $episode_id}) \
                 SET e.segment_count = $segments, e.unit_count = $units, \
                     e.entity_count = $entities",
            )
            .param("episode_id", episode.id.as_str())
            .param("segments", episode.counts.segments as i64)
            .param("units", episode.counts.units as i64)
            .param("entities", episode.counts.entities as i64),
        );

        for unit in units {
            queries.push(self.unit_query(&episode.id, unit));
        }

        for unit in units {
            let Some(extraction) = extractions.get(&unit.id) else {
                continue;
            };
            for entity in &extraction.entities {
                queries.push(
                    query(
                        "MERGE (en:Entity {id: $id}) \
                         ON CREATE SET en.canonical_name = $name, en.type = $entity_type \
                         WITH en MATCH (u:MeaningfulUnit {id: $unit_id}) \
                         MERGE (u)-[m:MENTIONS]->(en) SET m.offsets = $offsets",
                    )
                    .param("id", entity.id.as_str())
                    .param("name", entity.canonical_name.as_str())
                    .param("entity_type", entity.entity_type.as_str())
                    .param("unit_id", unit.id.as_str())
                    .param(
                        "offsets",
                        entity
                            .mention_offsets
                            .iter()
                            .map(|o| *o as i64)
                            .collect::<Vec<i64>>(),
                    ),
                );
            }
            for quote in &extraction.quotes {
                queries.push(
                    query(
                        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
                         MERGE (q:Quote {id: $id}) \
                         SET q.speaker = $speaker, q.text = $text, q.unit_id = $unit_id \
                         MERGE (u)-[:CONTAINS_QUOTE]->(q)",
                    )
                    .param("id", quote.id.as_str())
                    .param("speaker", quote.speaker.as_str())
                    .param("text", quote.text.as_str())
                    .param("unit_id", quote.unit_id.as_str()),
                );
            }
            for insight in &extraction.insights {
                queries.push(
                    query(
                        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
                         MERGE (i:Insight {id: $id}) \
                         SET i.statement = $statement, i.category = $category, \
                             i.unit_id = $unit_id \
                         MERGE (u)-[:YIELDS_INSIGHT]->(i)",
                    )
                    .param("id", insight.id.as_str())
                    .param("statement", insight.statement.as_str())
                    .param("category", insight.category.as_str())
                    .param("unit_id", insight.unit_id.as_str()),
                );
            }
        }

        for theme in episode_themes {
            if theme.trim().is_empty() {
                continue;
            }
            queries.push(
                query(
                    "MATCH (e:Episode {id: $episode_id}) \
                     MERGE (t:Topic {name: $name}) ON CREATE SET t.id = $topic_id \
                     MERGE (e)-[:HAS_TOPIC]->(t)",
                )
                .param("episode_id", episode.id.as_str())
                .param("name", theme.trim())
                .param("topic_id", topic_id(theme)),
            );
        }

        // Entity relationships last: both endpoints exist by now, so the
        // cyclic in-memory shape flattens into id lookups.
        for extraction in extractions.values() {
            for relationship in &extraction.relationships {
                queries.push(
                    query(
                        "MATCH (a:Entity {id: $subject_id}), (b:Entity {id: $object_id}) \
                         MERGE (a)-[r:RELATES_TO {predicate: $predicate, unit_id: $unit_id}]->(b)",
                    )
                    .param("subject_id", relationship.subject_id.as_str())
                    .param("object_id", relationship.object_id.as_str())
                    .param("predicate", relationship.predicate.as_str())
                    .param("unit_id", relationship.unit_id.as_str()),
                );
            }
        }

        debug!(
            episode_id = %episode.id,
            statements = queries.len(),
            "committing episode transaction"
        );
        let mut txn = self.graph.start_txn().await?;
        txn.run_queries(queries).await?;
        txn.commit().await?;
        info!(episode_id = %episode.id, "episode persisted");
        Ok(())
    }

    pub async fn set_archive_path(&self, episode_id: &str, archive_path: &Path) -> Result<()> {
        let q = query(
            "MATCH (e:Episode {id: $episode_id}) \
             SET e.archive_path = $archive_path, e.archived_at = $archived_at",
        )
        .param("episode_id", episode_id)
        .param("archive_path", archive_path.to_string_lossy().to_string())
        .param("archived_at", Utc::now().to_rfc3339());
        self.graph.run(q).await?;
        Ok(())
    }

    pub async fn mark_complete(&self, episode_id: &str) -> Result<()> {
        self.set_status(episode_id, ProcessingStatus::Complete, None).await
    }

    pub async fn mark_failed(&self, episode_id: &str, reason: &str) -> Result<()> {
        self.set_status(episode_id, ProcessingStatus::Failed, Some(reason))
            .await
    }

    async fn set_status(
        &self,
        episode_id: &str,
        status: ProcessingStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut statement = String::from(
            "MERGE (e:Episode {id: $episode_id}) SET e.processing_status = $status",
        );
        if reason.is_some() {
            statement.push_str(", e.failure_reason = $reason");
        } else {
            statement.push_str(", e.failure_reason = null");
        }
        let mut q = query(&statement)
            .param("episode_id", episode_id)
            .param("status", status.as_str());
        if let Some(reason) = reason {
            q = q.param("reason", reason);
        }
        self.graph.run(q).await?;
        Ok(())
    }

    /// Processing status of an episode, if its node exists.
    pub async fn episode_status(&self, episode_id: &str) -> Result<Option<ProcessingStatus>> {
        let q = query(
            "MATCH (e:Episode {id: $episode_id}) RETURN e.processing_status AS status",
        )
        .param("episode_id", episode_id);
        let mut rows = self.graph.execute(q).await?;
        if let Some(row) = rows.next().await? {
            let status: String = row.get("status").unwrap_or_default();
            return Ok(ProcessingStatus::parse(&status));
        }
        Ok(None)
    }

    /// Units of completed episodes that still lack a vector, for the
    /// embedding backfill job.
    pub async fn units_missing_embeddings(&self) -> Result<Vec<(String, String)>> {
        let q = query(
            "MATCH (e:Episode)-[:HAS_UNIT]->(u:MeaningfulUnit) \
             WHERE u.embedding IS NULL AND e.processing_status = 'complete' \
             RETURN u.id AS id, u.text AS text ORDER BY u.id",
        );
        let mut rows = self.graph.execute(q).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get("id").unwrap_or_default();
            let text: String = row.get("text").unwrap_or_default();
            if !id.is_empty() {
                out.push((id, text));
            }
        }
        Ok(out)
    }

    pub async fn attach_embedding(&self, unit_id: &str, embedding: &[f32]) -> Result<()> {
        let q = query("MATCH (u:MeaningfulUnit {id: $id}) SET u.embedding = $embedding")
            .param("id", unit_id)
            .param(
                "embedding",
                embedding.iter().map(|v| *v as f64).collect::<Vec<f64>>(),
            );
        self.graph.run(q).await?;
        Ok(())
    }
}

/// Process-wide podcast -> store routing. Connections are created lazily,
/// validated once, and cached behind a single mutex; a dead target raises
/// `database_unavailable` rather than falling back anywhere.
pub struct GraphRouter {
    registry: Registry,
    embedding_dimension: usize,
    db_timeout: Duration,
    cache: Mutex<HashMap<String, Arc<GraphStore>>>,
}

impl GraphRouter {
    pub fn new(registry: Registry, embedding_dimension: usize, db_timeout: Duration) -> Self {
        Self {
            registry,
            embedding_dimension,
            db_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn store_for(&self, podcast_id: &str) -> Result<Arc<GraphStore>> {
        let mut cache = self.cache.lock().await;
        if let Some(store) = cache.get(podcast_id) {
            return Ok(store.clone());
        }
        let podcast = self.registry.find(podcast_id)?;
        let store = Arc::new(
            GraphStore::connect(podcast, self.embedding_dimension, self.db_timeout).await?,
        );
        store.ensure_schema().await?;
        cache.insert(podcast_id.to_string(), store.clone());
        Ok(store)
    }
}
