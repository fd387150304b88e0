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

//! Podcast registry: the single source of truth for podcast configuration
//! and database routing. The core consumes it read-only.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{IngestError, Result};

/// Connection target for one podcast's logically separate graph database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseTarget {
    pub uri: String,
    pub database_name: String,
    #[serde(default = "default_bolt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_bolt_port() -> u16 {
    7687
}

impl DatabaseTarget {
    /// Full bolt address, folding the port into the URI when the URI itself
    /// carries none.
    pub fn address(&self) -> String {
        if self.uri.rsplit(':').next().map_or(false, |tail| {
            !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())
        }) {
            self.uri.clone()
        } else {
            format!("{}:{}", self.uri.trim_end_matches('/'), self.port)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodcastEntry {
    /// Filesystem-safe identifier, used for routing and archive paths.
    pub id: String,
    pub name: String,
    pub rss_feed_url: String,
    pub database: DatabaseTarget,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Registry {
    pub podcasts: Vec<PodcastEntry>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read registry {}: {}", path.display(), e))
        })?;
        let registry: Registry = serde_yaml::from_str(&raw)
            .map_err(|e| IngestError::Config(format!("malformed registry: {}", e)))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        if self.podcasts.is_empty() {
            return Err(IngestError::Config("registry lists no podcasts".into()));
        }
        let mut seen = HashSet::new();
        for podcast in &self.podcasts {
            if podcast.id.is_empty()
                || !podcast
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(IngestError::Config(format!(
                    "podcast id '{}' is not filesystem-safe",
                    podcast.id
                )));
            }
            if !seen.insert(podcast.id.as_str()) {
                return Err(IngestError::Config(format!(
                    "duplicate podcast id '{}'",
                    podcast.id
                )));
            }
            if podcast.database.uri.is_empty() || podcast.database.database_name.is_empty() {
                return Err(IngestError::Config(format!(
                    "podcast '{}' has an incomplete database target",
                    podcast.id
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, podcast_id: &str) -> Result<&PodcastEntry> {
        self.podcasts
            .iter()
            .find(|p| p.id == podcast_id)
            .ok_or_else(|| {
                IngestError::Config(format!("podcast '{}' is not in the registry", podcast_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REGISTRY_YAML: &str = r#"
podcasts:
  - id: tech_talk
    name: "Tech Talk"
    rss_feed_url: "https://example.com/tech_talk.rss"
    database:
      uri: "neo4j://localhost"
      database_name: "tech_talk"
      port: 7687
  - id: history_hour
    name: "History Hour"
    rss_feed_url: "https://example.com/history.rss"
    database:
      uri: "neo4j://graph.internal:7688"
      database_name: "history_hour"
"#;

    fn write_registry(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_and_routes_by_podcast_id() {
        let file = write_registry(REGISTRY_YAML);
        let registry = Registry::load(file.path()).unwrap();
        assert_eq!(registry.podcasts.len(), 2);

        let tech = registry.find("tech_talk").unwrap();
        assert_eq!(tech.database.address(), "neo4j://localhost:7687");

        // URI already carries a port; the separate port field is ignored.
        let history = registry.find("history_hour").unwrap();
        assert_eq!(history.database.address(), "neo4j://graph.internal:7688");
    }

    #[test]
    fn unknown_podcast_is_a_config_error() {
        let file = write_registry(REGISTRY_YAML);
        let registry = Registry::load(file.path()).unwrap();
        assert!(matches!(
            registry.find("missing"),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn rejects_unsafe_ids_and_duplicates() {
        let bad_id = REGISTRY_YAML.replace("tech_talk", "tech talk");
        let file = write_registry(&bad_id);
        assert!(Registry::load(file.path()).is_err());

        let duplicate = REGISTRY_YAML.replace("history_hour", "tech_talk");
        let file = write_registry(&duplicate);
        assert!(Registry::load(file.path()).is_err());
    }
}
