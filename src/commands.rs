//! CLI command implementations.
//!
//! Each `run_*` function backs one `sentinel` subcommand, prints a human
//! readable summary to stdout, and returns `anyhow::Result` so `main` can
//! report failures uniformly.

use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::eval::{evaluate, load_cases};
use crate::index::IndexHealth;
use crate::models::Deadline;
use crate::pipeline::{IngestMetadata, IngestOutcome, RagPipeline};
use crate::store::open_store;

/// Create the database file and schema. Safe to run repeatedly.
pub async fn run_init(config: &Config) -> Result<()> {
    if config.db.is_in_memory() {
        println!("db.path is ':memory:'; nothing to initialize.");
        return Ok(());
    }
    open_store(&config.db).await?;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

/// Ingest one file, or every matching file under a directory.
pub async fn run_ingest(config: &Config, path: &str, version: Option<u32>) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let resolved = pipeline.gate().validate_path(path, pipeline.corpus_root())?;

    if resolved.is_dir() {
        if version.is_some() {
            bail!("--version applies to a single file, not a directory");
        }
        let report = pipeline.ingest_corpus(Some(path)).await?;
        println!(
            "Ingested {} of {} files ({} chunks, {} stale, {} failed)",
            report.indexed,
            report.scanned,
            report.chunks,
            report.stale,
            report.failures.len()
        );
        for f in &report.failures {
            println!("  {} [{}] {}", f.path, f.code, f.message);
        }
        return Ok(());
    }

    let metadata = IngestMetadata {
        version,
        ..IngestMetadata::trusted()
    };
    match pipeline.ingest_path(path, metadata).await? {
        IngestOutcome::Indexed {
            source_id,
            version,
            chunks,
            ..
        } => println!("Indexed {} v{} ({} chunks)", source_id, version, chunks),
        IngestOutcome::Stale {
            source_id,
            version,
            current,
        } => println!(
            "Skipped {} v{}: version {} is already indexed",
            source_id, version, current
        ),
    }
    Ok(())
}

/// Rebuild the whole index from the corpus. `reset` first clears the store,
/// which is the only way out of an unhealthy index.
pub async fn run_rebuild(config: &Config, reset: bool) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    if reset {
        pipeline.index().reset().await?;
    } else if let IndexHealth::Unhealthy(reason) = pipeline.index().health() {
        bail!("index is unhealthy ({}); rerun with --reset", reason);
    }
    let handle = pipeline.rebuild().await?;
    println!(
        "Rebuilt index: {} documents, {} chunks (generation {})",
        handle.documents, handle.chunks, handle.generation
    );
    Ok(())
}

/// Answer a question and print the answer with its sources.
pub async fn run_query(config: &Config, text: &str, json: bool) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let deadline = Deadline::after(Duration::from_millis(config.server.request_timeout_ms));
    let outcome = pipeline.query(text, deadline).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "request_id": outcome.request_id,
                "answer": outcome.answer,
                "sources": outcome.retrieval.hits,
            }))?
        );
        return Ok(());
    }

    println!("{}", outcome.answer.text());
    println!();
    if let Some(reason) = outcome.answer.degraded_reason() {
        println!("  degraded:    {:?}", reason);
    }
    println!("  grounded:    {}", outcome.answer.grounded());
    println!("  confidence:  {:.2}", outcome.answer.confidence_score());
    if !outcome.answer.citations().is_empty() {
        println!("  citations:   {}", outcome.answer.citations().join(", "));
    }
    println!();
    println!("  {:<40} {:>8}", "CHUNK", "SCORE");
    println!("  {}", "-".repeat(49));
    for hit in &outcome.retrieval.hits {
        println!("  {:<40} {:>8.3}", hit.chunk_id, hit.similarity_score);
    }
    Ok(())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let stats = pipeline.stats();
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Sentinel index");
    println!("==============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Corpus:      {}", config.corpus.root.display());
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    println!("  Model:       {} ({} dims, {:?})", stats.model, stats.dims, stats.metric);
    match &stats.health {
        IndexHealth::Healthy => println!("  Health:      healthy"),
        IndexHealth::Unhealthy(reason) => println!("  Health:      UNHEALTHY: {}", reason),
    }
    println!();
    Ok(())
}

/// Evaluate retrieval precision@k against a labelled JSON file.
pub async fn run_eval(config: &Config, cases_path: &Path, json: bool) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let cases = load_cases(cases_path)?;
    let report = evaluate(&pipeline, &cases).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for case in &report.cases {
        let score = match (case.precision, &case.error) {
            (_, Some(code)) => format!("error: {}", code),
            (Some(p), None) => format!("{:.2}", p),
            (None, None) => "-".to_string(),
        };
        println!("  {:>10}  {}", score, case.query);
    }
    println!();
    println!(
        "Precision@{} = {:.2}% over {} queries",
        report.k,
        report.precision_at_k_mean * 100.0,
        report.num_queries
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
