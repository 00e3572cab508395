use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use grantmatch::config::MatchConfig;
use grantmatch::db::{Database, FoundationRow, GrantRow};
use grantmatch::matching::similarity::token_score;
use grantmatch::matching::{RegistryEntry, RunOptions, RunSummary, TierOrchestrator};
use grantmatch::TARGET_MATCH;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured tier over the unresolved grants
    Run {
        /// JSON config file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Match and report without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Only consider the N lowest grant ids
        #[arg(short, long)]
        limit: Option<i64>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the normalized form of one or more names
    Normalize {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Score two names against each other after normalization
    Score { a: String, b: String },

    /// Resolved grants per tier and the remaining unresolved count
    Stats,

    /// Store normalized names on registry and grant rows
    Precompute {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Load registry entries from a JSON-lines file
    ImportRegistry { file: PathBuf },

    /// Load grants from a JSON-lines file
    ImportGrants { file: PathBuf },

    /// Load foundations from a JSON-lines file
    ImportFoundations { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("GRANTMATCH_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    grantmatch::logging::configure_logging(Path::new(&log_dir));

    let cli = Cli::parse();

    match cli.command {
        Commands::Normalize { names } => {
            let normalizer = MatchConfig::load(None)?.normalizer();
            for name in &names {
                println!("{}\t{}", name, normalizer.normalize(name));
            }
        }

        Commands::Score { a, b } => {
            let normalizer = MatchConfig::load(None)?.normalizer();
            let (left, right) = (normalizer.normalize(&a), normalizer.normalize(&b));
            println!("'{}' vs '{}': {:.2}", left, right, token_score(&left, &right));
        }

        Commands::Run {
            config,
            dry_run,
            limit,
            json,
        } => {
            let config = MatchConfig::load(config.as_deref())?;
            let db = open_database().await?;
            let summary = TierOrchestrator::new(&db, &config)?
                .with_options(RunOptions { dry_run, limit })
                .run()
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }

        Commands::Stats => {
            let db = open_database().await?;
            let stats = db
                .resolution_stats()
                .await
                .context("Failed to load resolution stats")?;
            if stats.is_empty() {
                println!("No grants resolved yet");
            }
            for row in stats {
                match row.tier {
                    Some(tier) => println!("Tier {}: {} resolved", tier, row.resolved),
                    None => println!("Resolved elsewhere: {}", row.resolved),
                }
            }
            println!("Unresolved: {}", db.count_unresolved().await?);
            println!("Registry entries: {}", db.registry_count().await?);
        }

        Commands::Precompute { config } => {
            let config = MatchConfig::load(config.as_deref())?;
            let db = open_database().await?;
            let (registry, grants) = db
                .precompute_normalized_names(&config.normalizer(), config.batch_size)
                .await
                .context("Failed to precompute normalized names")?;
            println!(
                "Stored normalized names for {} registry entries and {} grants",
                registry, grants
            );
        }

        Commands::ImportRegistry { file } => {
            let db = open_database().await?;
            let entries: Vec<RegistryEntry> = read_json_lines(&file)?;
            for entry in &entries {
                db.upsert_registry_entry(entry)
                    .await
                    .with_context(|| format!("Failed to import registry entry {}", entry.id))?;
            }
            println!("Imported {} registry entries", entries.len());
        }

        Commands::ImportGrants { file } => {
            let db = open_database().await?;
            let grants: Vec<GrantRow> = read_json_lines(&file)?;
            for grant in &grants {
                db.insert_grant(grant)
                    .await
                    .with_context(|| format!("Failed to import grant {}", grant.id))?;
            }
            println!("Imported {} grants", grants.len());
        }

        Commands::ImportFoundations { file } => {
            let db = open_database().await?;
            let foundations: Vec<FoundationRow> = read_json_lines(&file)?;
            for foundation in &foundations {
                db.upsert_foundation(foundation)
                    .await
                    .with_context(|| format!("Failed to import foundation {}", foundation.ein))?;
            }
            println!("Imported {} foundations", foundations.len());
        }
    }

    Ok(())
}

async fn open_database() -> Result<Database> {
    let database_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "grantmatch.db".to_string());
    Database::new(&database_path)
        .await
        .context("Failed to connect to database")
}

/// Parse one JSON object per line. Blank lines are skipped.
fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), number + 1))?;
        rows.push(row);
    }

    info!(target: TARGET_MATCH, "Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

fn print_summary(summary: &RunSummary) {
    if summary.dry_run {
        println!("Dry run: nothing was written");
    }
    for tier in &summary.tiers {
        println!(
            "Tier {} {} @ {:.1}: {} in, {} candidates, {} committed, {} faults ({} ms)",
            tier.tier,
            tier.strategy,
            tier.cutoff,
            tier.records_in,
            tier.candidates,
            tier.committed,
            tier.faults,
            tier.elapsed_ms
        );
        println!(
            "  index: {} indexed, {} skipped, {} buckets, {} collisions",
            tier.index.entries_indexed,
            tier.index.entries_skipped,
            tier.index.buckets,
            tier.index.collisions
        );
        for batch in &tier.failed_batches {
            warn!(
                target: TARGET_MATCH,
                "Tier {}: batch of {} records rolled back: {}",
                tier.tier,
                batch.record_ids.len(),
                batch.error
            );
        }
    }

    println!("Committed: {}", summary.total_committed());
    println!("Remaining unresolved: {}", summary.remaining_unresolved);

    let retry = summary.failed_record_ids();
    if !retry.is_empty() {
        println!("Awaiting retry ({}): {:?}", retry.len(), retry);
    }
}
