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

use thiserror::Error;

/// Stable error vocabulary for the ingestion engine. Reason codes are part of
/// the operator-facing contract: they end up on failed Episode nodes and in
/// failure logs, so variants map 1:1 to the documented kinds.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database unavailable for '{podcast}': {message}")]
    DatabaseUnavailable { podcast: String, message: String },

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("conversation structure invalid: {0}")]
    StructureInvalid(String),

    #[error("archive failed: {0}")]
    ArchiveFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("LLM response was not parseable JSON: {0}")]
    Parse(String),

    #[error("graph error: {0}")]
    Graph(#[from] neo4rs::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Short machine-readable code stored on failed Episode nodes and in
    /// failure logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            IngestError::Config(_) => "config_error",
            IngestError::DatabaseUnavailable { .. } => "database_unavailable",
            IngestError::QuotaExhausted(_) => "quota_exhausted",
            IngestError::StructureInvalid(_) => "structure_invalid",
            IngestError::ArchiveFailed(_) => "archive_failed",
            IngestError::Cancelled => "cancelled",
            IngestError::Transient(_) => "transient",
            IngestError::Parse(_) => "extraction_partial",
            IngestError::Graph(_) => "database_unavailable",
            IngestError::Io(_) => "transient",
        }
    }

    /// True when the failure is worth retrying on a later run without
    /// operator intervention.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            IngestError::QuotaExhausted(_)
                | IngestError::Transient(_)
                | IngestError::Cancelled
                | IngestError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
