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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use podcast_knowledge_rs::analyzer::{
    STRUCTURE_SYSTEM_PROMPT, STRUCTURE_TEMPLATE_NAME, STRUCTURE_TEMPLATE_VERSION,
};
use podcast_knowledge_rs::config::Config;
use podcast_knowledge_rs::extraction::{
    EXTRACTION_SYSTEM_PROMPT, EXTRACTION_TEMPLATE_NAME, EXTRACTION_TEMPLATE_VERSION,
};
use podcast_knowledge_rs::embedding::EmbeddingClient;
use podcast_knowledge_rs::error::IngestError;
use podcast_knowledge_rs::graph::GraphRouter;
use podcast_knowledge_rs::keypool::KeyPool;
use podcast_knowledge_rs::llm::GeminiClient;
use podcast_knowledge_rs::pipeline::{EpisodeContext, EpisodeOutcome, PipelineDriver};
use podcast_knowledge_rs::prompt_cache::PromptCacheManager;
use podcast_knowledge_rs::registry::Registry;
use podcast_knowledge_rs::tracker::EpisodeTracker;

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_PARTIAL: i32 = 2;
const EXIT_FATAL: i32 = 3;

/// Podcast Knowledge Pipeline - turns WebVTT podcast transcripts into a
/// queryable knowledge graph of entities, quotes, insights, and sentiment.
#[derive(Parser)]
#[command(name = "podcast-knowledge")]
#[command(version = "0.1.0")]
#[command(about = "Ingest podcast transcripts into a knowledge graph")]
struct Cli {
    /// Increase log verbosity on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one VTT file or a directory of VTT files for a podcast
    Ingest {
        /// Podcast id from the registry
        #[arg(long)]
        podcast: String,

        /// VTT file or directory containing VTT files
        #[arg(long)]
        input: PathBuf,

        /// Parse and report without calling the LLM or writing the graph
        #[arg(long)]
        dry_run: bool,

        /// Stop after this many episodes
        #[arg(long)]
        max_episodes: Option<usize>,

        /// Re-ingest episodes already marked complete
        #[arg(long)]
        force: bool,
    },

    /// Show registry, database connectivity, and key-pool headroom
    Status,

    /// Attach embeddings to completed units that are missing one
    BackfillEmbeddings {
        /// Podcast id from the registry
        #[arg(long)]
        podcast: String,
    },
}

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = config.paths.logs_root.join("pipeline");
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "podcast-knowledge.log");

    let stderr_level = if verbose { "debug" } else { "warn" };

    // File gets everything, stderr stays quiet unless -v is passed.
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("podcast_knowledge_rs=debug".parse()?)
                        .add_directive("info".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive(format!("podcast_knowledge_rs={}", stderr_level).parse()?)
                        .add_directive("warn".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Collect VTT inputs: a single file, or every `.vtt` in a directory in
/// name order.
fn discover_inputs(input: &PathBuf, max_episodes: Option<usize>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if input.is_file() {
        files.push(input.clone());
    } else if input.is_dir() {
        for entry in std::fs::read_dir(input)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "vtt") {
                files.push(path);
            }
        }
        files.sort();
    } else {
        anyhow::bail!("input path {} does not exist", input.display());
    }
    if let Some(max) = max_episodes {
        files.truncate(max);
    }
    Ok(files)
}

struct Runtime {
    config: Arc<Config>,
    driver: Arc<PipelineDriver>,
    cache: Arc<PromptCacheManager>,
    pool: Arc<KeyPool>,
    router: Arc<GraphRouter>,
    cancel: CancellationToken,
}

fn build_runtime(config: Config) -> Result<Runtime> {
    let config = Arc::new(config);
    let registry = Registry::load(&config.paths.registry_path)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let pool = Arc::new(KeyPool::new(
        &config.gemini.api_keys,
        config.quotas.clone(),
        config.paths.state_path.clone(),
        config.quota_day_reset_hour,
    ));

    // LLM and embedding clients share the same pool so their consumption is
    // coordinated.
    let client = Arc::new(GeminiClient::new(
        pool.clone(),
        config.timeouts.llm,
        config.timeouts.key_acquire,
    ));
    let embeddings = Arc::new(EmbeddingClient::new(
        pool.clone(),
        &config.gemini.embedding_model,
        config.embedding.clone(),
        config.timeouts.embedding,
        config.timeouts.key_acquire,
    ));
    let cache = Arc::new(PromptCacheManager::new(client.clone(), config.cache.clone()));
    let router = Arc::new(GraphRouter::new(
        registry,
        config.embedding.dimension,
        config.timeouts.db,
    ));
    let tracker = Arc::new(EpisodeTracker::new(
        router.clone(),
        config.pipeline.mode,
        &config.paths.data_root,
    ));

    let cancel = CancellationToken::new();
    let ctrlc_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancellation requested, finishing current state...");
        ctrlc_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    let driver = Arc::new(PipelineDriver::new(
        config.clone(),
        client,
        cache.clone(),
        embeddings,
        router.clone(),
        tracker,
        cancel.clone(),
    ));

    Ok(Runtime {
        config,
        driver,
        cache,
        pool,
        router,
        cancel,
    })
}

async fn run_ingest(
    runtime: &Runtime,
    podcast_id: &str,
    input: &PathBuf,
    dry_run: bool,
    max_episodes: Option<usize>,
    force: bool,
) -> Result<i32> {
    let podcast = runtime
        .router
        .registry()
        .find(podcast_id)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .clone();

    let inputs = discover_inputs(input, max_episodes)?;
    if inputs.is_empty() {
        println!("{}", "No VTT files found to ingest.".yellow());
        return Ok(EXIT_OK);
    }

    println!(
        "Ingesting {} episode(s) for {} with {} worker(s){}",
        inputs.len(),
        podcast.name.bold(),
        runtime.config.pipeline.workers,
        if dry_run { " (dry run)".yellow().to_string() } else { String::new() }
    );

    // Long-lived template caches are warmed once per process; episode
    // transcript caches are created per episode by the driver.
    if !dry_run {
        runtime
            .cache
            .warm_templates(
                &runtime.config.gemini.flash_model,
                &[
                    (
                        STRUCTURE_TEMPLATE_NAME,
                        STRUCTURE_TEMPLATE_VERSION,
                        STRUCTURE_SYSTEM_PROMPT,
                    ),
                    (
                        EXTRACTION_TEMPLATE_NAME,
                        EXTRACTION_TEMPLATE_VERSION,
                        EXTRACTION_SYSTEM_PROMPT,
                    ),
                ],
            )
            .await;
    }

    let contexts: Vec<EpisodeContext> = inputs
        .into_iter()
        .map(|vtt_path| EpisodeContext {
            run_id: Uuid::new_v4(),
            podcast: podcast.clone(),
            vtt_path,
            dry_run,
            force,
        })
        .collect();

    // Parallel across episodes; strictly sequential within one.
    let driver = runtime.driver.clone();
    let outcomes: Vec<EpisodeOutcome> = stream::iter(contexts)
        .map(|ctx| {
            let driver = driver.clone();
            async move { driver.process_episode(ctx).await }
        })
        .buffer_unordered(runtime.config.pipeline.workers)
        .collect()
        .await;

    let mut completed = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for outcome in &outcomes {
        match outcome {
            EpisodeOutcome::Completed {
                episode_id,
                units,
                extraction_failures,
                missing_embeddings,
                archive_failed,
            } => {
                completed += 1;
                let mut notes = Vec::new();
                if *extraction_failures > 0 {
                    notes.push(format!("{} unit(s) without extraction", extraction_failures));
                }
                if *missing_embeddings > 0 {
                    notes.push(format!("{} embedding(s) missing", missing_embeddings));
                }
                if *archive_failed {
                    notes.push("archive move failed".to_string());
                }
                let suffix = if notes.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", notes.join(", ")).yellow().to_string()
                };
                println!(
                    "  {} {} - {} unit(s){}",
                    "✓".green(),
                    episode_id,
                    units,
                    suffix
                );
            }
            EpisodeOutcome::Skipped { episode_id } => {
                skipped += 1;
                println!("  {} {} - already complete", "−".dimmed(), episode_id);
            }
            EpisodeOutcome::DryRun {
                episode_id,
                segments,
                ..
            } => {
                println!(
                    "  {} {} - {} segment(s), would ingest",
                    "○".cyan(),
                    episode_id,
                    segments
                );
            }
            EpisodeOutcome::Failed {
                episode_id,
                reason,
                resumable,
            } => {
                failed += 1;
                println!(
                    "  {} {} - {}{}",
                    "✗".red(),
                    episode_id.as_deref().unwrap_or("(unidentified)"),
                    reason.red(),
                    if *resumable { " (resumable)".dimmed().to_string() } else { String::new() }
                );
            }
        }
    }

    let stats = runtime.cache.stats();
    if stats.created > 0 || stats.hits > 0 {
        info!(
            created = stats.created,
            hits = stats.hits,
            misses = stats.misses,
            tokens_saved = stats.tokens_saved(),
            "prompt cache summary"
        );
    }

    println!(
        "\nDone: {} completed, {} skipped, {} failed",
        completed.to_string().green(),
        skipped,
        if failed > 0 {
            failed.to_string().red().to_string()
        } else {
            failed.to_string()
        }
    );

    if runtime.cancel.is_cancelled() {
        return Ok(EXIT_PARTIAL);
    }
    if failed > 0 && completed == 0 && skipped == 0 {
        // Nothing succeeded: distinguish per-process failure.
        let all_fatal = outcomes.iter().all(|o| {
            matches!(o, EpisodeOutcome::Failed { reason, .. }
                if reason == "database_unavailable" || reason == "config_error")
        });
        return Ok(if all_fatal { EXIT_FATAL } else { EXIT_PARTIAL });
    }
    Ok(if failed > 0 { EXIT_PARTIAL } else { EXIT_OK })
}

async fn run_status(runtime: &Runtime) -> Result<i32> {
    println!("{}", "Podcast registry".bold());
    for podcast in &runtime.router.registry().podcasts {
        let connectivity = match runtime.router.store_for(&podcast.id).await {
            Ok(_) => "reachable".green().to_string(),
            Err(e) => format!("{}", e).red().to_string(),
        };
        println!(
            "  {} ({}) -> {}/{} [{}]",
            podcast.id.bold(),
            podcast.name,
            podcast.database.address(),
            podcast.database.database_name,
            connectivity
        );
    }

    println!("\n{}", "Key pool (remaining daily requests)".bold());
    for (fingerprint, remaining) in runtime
        .pool
        .headroom_summary(&runtime.config.gemini.flash_model)
    {
        println!("  {}… {} [{}]", fingerprint, remaining, runtime.config.gemini.flash_model);
    }

    let stats = runtime.cache.stats();
    println!("\n{}", "Prompt cache".bold());
    println!(
        "  created {} / hits {} / misses {} / evictions {} / ~{} tokens saved",
        stats.created,
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.tokens_saved()
    );
    Ok(EXIT_OK)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load()?;
    setup_logging(&config, cli.verbose)?;
    let runtime = build_runtime(config)?;

    match cli.command {
        Commands::Ingest {
            podcast,
            input,
            dry_run,
            max_episodes,
            force,
        } => {
            run_ingest(
                &runtime,
                &podcast,
                &input,
                dry_run,
                max_episodes,
                force,
            )
            .await
        }
        Commands::Status => run_status(&runtime).await,
        Commands::BackfillEmbeddings { podcast } => {
            match runtime.driver.backfill_embeddings(&podcast).await {
                Ok(attached) => {
                    println!("Backfilled {} embedding(s) for {}", attached, podcast.bold());
                    Ok(EXIT_OK)
                }
                Err(e @ IngestError::DatabaseUnavailable { .. }) => {
                    eprintln!("{}", e.to_string().red());
                    Ok(EXIT_FATAL)
                }
                Err(e) => {
                    warn!(error = %e, "backfill failed");
                    eprintln!("{}", e.to_string().red());
                    Ok(EXIT_PARTIAL)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap's help/version output is not a usage error.
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // Configuration and registry problems are unrecoverable.
            eprintln!("{} {}", "error:".red().bold(), e);
            EXIT_FATAL
        }
    };
    std::process::exit(exit_code);
}
