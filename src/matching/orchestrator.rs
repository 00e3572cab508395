use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::committer::{BatchCommitter, FailedBatch};
use super::index::{BlockingIndex, IndexStats};
use super::matcher::Matcher;
use super::normalizer::Normalizer;
use super::types::{MatchCandidate, Tier, UnresolvedRecord};
use super::TARGET_MATCH;
use crate::config::MatchConfig;
use crate::db::Database;

/// Counters for one tier of a run.
#[derive(Debug, Clone, Serialize)]
pub struct TierSummary {
    // 1-based position in the tier list
    pub tier: usize,
    pub strategy: String,
    pub cutoff: f64,
    pub records_in: usize,
    // Ids of the records this tier considered, ascending
    #[serde(skip)]
    pub record_ids: Vec<i64>,
    pub candidates: usize,
    pub committed: u64,
    // Records whose scoring panicked; treated as no-match
    pub faults: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub index: IndexStats,
    pub elapsed_ms: u64,
}

/// Counters for a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub tiers: Vec<TierSummary>,
    pub remaining_unresolved: i64,
}

impl RunSummary {
    pub fn total_committed(&self) -> u64 {
        self.tiers.iter().map(|tier| tier.committed).sum()
    }

    /// Records from rolled-back batches, for a retry run.
    pub fn failed_record_ids(&self) -> Vec<i64> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.failed_batches.iter())
            .flat_map(|batch| batch.record_ids.iter().copied())
            .collect()
    }
}

/// Candidates found by the parallel matching phase.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub candidates: Vec<MatchCandidate>,
    pub faults: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    // Match without writing; later tiers skip records earlier tiers matched
    pub dry_run: bool,
    // Sample the N lowest unresolved ids at the first tier; later tiers only
    // see what is left of that sample
    pub limit: Option<i64>,
}

/// Runs the configured tiers in order, highest precision first.
///
/// Each tier reads the records still unresolved after the previous tier's
/// commit, matches them in parallel against a freshly built index, and
/// commits before the next tier starts.
pub struct TierOrchestrator<'a> {
    db: &'a Database,
    tiers: Vec<Tier>,
    normalizer: Arc<Normalizer>,
    worker_count: usize,
    batch_size: usize,
    options: RunOptions,
}

impl<'a> TierOrchestrator<'a> {
    pub fn new(db: &'a Database, config: &MatchConfig) -> Result<Self> {
        let tiers = config.validate().context("Invalid match configuration")?;

        Ok(Self {
            db,
            tiers,
            normalizer: Arc::new(config.normalizer()),
            worker_count: config.worker_count,
            batch_size: config.batch_size,
            options: RunOptions::default(),
        })
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub async fn run(&self) -> Result<RunSummary> {
        info!(
            target: TARGET_MATCH,
            "Starting run: {} tiers, {} workers, batch size {}{}",
            self.tiers.len(),
            self.worker_count,
            self.batch_size,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        // Records a later tier must not see in this run: dry-run matches and
        // records from rolled-back batches (reported for retry instead)
        let mut excluded: HashSet<i64> = HashSet::new();
        let mut sample: Option<HashSet<i64>> = None;
        let mut summaries = Vec::with_capacity(self.tiers.len());

        for (i, tier) in self.tiers.iter().enumerate() {
            let summary = self
                .run_tier(i + 1, *tier, &mut excluded, &mut sample)
                .await?;
            summaries.push(summary);
        }

        let remaining_unresolved = self
            .db
            .count_unresolved()
            .await
            .context("Failed to count unresolved records")?;

        let summary = RunSummary {
            dry_run: self.options.dry_run,
            tiers: summaries,
            remaining_unresolved,
        };

        info!(
            target: TARGET_MATCH,
            "Run complete: {} committed, {} remain unresolved, {} awaiting retry",
            summary.total_committed(),
            summary.remaining_unresolved,
            summary.failed_record_ids().len()
        );
        Ok(summary)
    }

    async fn run_tier(
        &self,
        position: usize,
        tier: Tier,
        excluded: &mut HashSet<i64>,
        sample: &mut Option<HashSet<i64>>,
    ) -> Result<TierSummary> {
        let started = Instant::now();

        let mut records = match sample.as_ref() {
            Some(ids) => match ids.iter().max() {
                Some(&ceiling) => self
                    .db
                    .fetch_unresolved_records(None, Some(ceiling))
                    .await
                    .with_context(|| {
                        format!("Failed to fetch unresolved records for tier {}", position)
                    })?,
                None => Vec::new(),
            },
            None => self
                .db
                .fetch_unresolved_records(self.options.limit, None)
                .await
                .with_context(|| {
                    format!("Failed to fetch unresolved records for tier {}", position)
                })?,
        };

        if let Some(ids) = sample.as_ref() {
            records.retain(|record| ids.contains(&record.id));
        } else if self.options.limit.is_some() {
            *sample = Some(records.iter().map(|record| record.id).collect());
        }
        records.retain(|record| !excluded.contains(&record.id));
        let records_in = records.len();
        let record_ids: Vec<i64> = records.iter().map(|record| record.id).collect();

        let registry = self
            .db
            .load_registry_snapshot()
            .await
            .with_context(|| format!("Failed to load registry for tier {}", position))?;

        let normalizer = Arc::clone(&self.normalizer);
        let index = tokio::task::spawn_blocking(move || {
            BlockingIndex::build(tier.strategy, &registry, &normalizer)
        })
        .await
        .context("Index build task failed")?;
        let index = Arc::new(index);
        let index_stats = index.stats().clone();

        let outcome = {
            let normalizer = Arc::clone(&self.normalizer);
            let index = Arc::clone(&index);
            match_records(records, self.worker_count, move |record| {
                Matcher::new(&normalizer, &index).find_match(record, tier.cutoff, position)
            })
            .await?
        };
        let candidates = outcome.candidates.len();

        let (committed, failed_batches) = if self.options.dry_run {
            excluded.extend(outcome.candidates.iter().map(|candidate| candidate.record_id));
            (0, Vec::new())
        } else {
            let report = BatchCommitter::new(self.db, self.batch_size)
                .commit(outcome.candidates)
                .await;
            excluded.extend(report.failed_record_ids());
            (report.applied, report.failed_batches)
        };

        let summary = TierSummary {
            tier: position,
            strategy: tier.strategy.to_string(),
            cutoff: tier.cutoff,
            records_in,
            record_ids,
            candidates,
            committed,
            faults: outcome.faults,
            failed_batches,
            index: index_stats,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            target: TARGET_MATCH,
            "Tier {} [{}]: {} in, {} candidates, {} committed, {} faults, {} failed batches ({} ms)",
            summary.tier,
            tier,
            summary.records_in,
            summary.candidates,
            summary.committed,
            summary.faults,
            summary.failed_batches.len(),
            summary.elapsed_ms
        );
        Ok(summary)
    }
}

/// Run `match_one` over every record on a pool of `worker_count` blocking
/// workers. Workers pull records one at a time from a shared cursor, so
/// results arrive in no particular order. A panic while matching one record
/// counts as a fault for that record only.
pub async fn match_records<F>(
    records: Vec<UnresolvedRecord>,
    worker_count: usize,
    match_one: F,
) -> Result<MatchOutcome>
where
    F: Fn(&UnresolvedRecord) -> Option<MatchCandidate> + Send + Sync + 'static,
{
    if records.is_empty() {
        return Ok(MatchOutcome::default());
    }

    let workers = worker_count.clamp(1, records.len());
    let records = Arc::new(records);
    let cursor = Arc::new(AtomicUsize::new(0));
    let match_one = Arc::new(match_one);

    let handles = (0..workers).map(|_| {
        let records = Arc::clone(&records);
        let cursor = Arc::clone(&cursor);
        let match_one = Arc::clone(&match_one);

        tokio::task::spawn_blocking(move || {
            let mut outcome = MatchOutcome::default();
            loop {
                let next = cursor.fetch_add(1, Ordering::Relaxed);
                let record = match records.get(next) {
                    Some(record) => record,
                    None => break,
                };

                match panic::catch_unwind(AssertUnwindSafe(|| (*match_one)(record))) {
                    Ok(Some(candidate)) => outcome.candidates.push(candidate),
                    Ok(None) => {}
                    Err(_) => {
                        warn!(
                            target: TARGET_MATCH,
                            "Scoring record {} failed; treating as no match", record.id
                        );
                        outcome.faults += 1;
                    }
                }
            }
            outcome
        })
    });

    let mut merged = MatchOutcome::default();
    for result in join_all(handles).await {
        let outcome = result.context("Matcher worker terminated unexpectedly")?;
        merged.candidates.extend(outcome.candidates);
        merged.faults += outcome.faults;
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: i64) -> Vec<UnresolvedRecord> {
        (1..=n)
            .map(|id| UnresolvedRecord::new(id, format!("Record {}", id)))
            .collect()
    }

    fn echo(record: &UnresolvedRecord) -> Option<MatchCandidate> {
        (record.id % 2 == 0).then(|| MatchCandidate {
            record_id: record.id,
            registry_id: format!("R{}", record.id),
            score: 100.0,
            tier: 1,
        })
    }

    #[tokio::test]
    async fn test_every_record_visited_once() {
        let outcome = match_records(records(101), 4, echo).await.expect("match");
        let mut ids: Vec<i64> = outcome.candidates.iter().map(|c| c.record_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=101).filter(|id| id % 2 == 0).collect::<Vec<_>>());
        assert_eq!(outcome.faults, 0);
    }

    #[tokio::test]
    async fn test_panicking_record_is_isolated() {
        let outcome = match_records(records(10), 3, |record| {
            if record.id == 4 {
                panic!("malformed record");
            }
            echo(record)
        })
        .await
        .expect("match");

        assert_eq!(outcome.faults, 1);
        let mut ids: Vec<i64> = outcome.candidates.iter().map(|c| c.record_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 6, 8, 10]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let outcome = match_records(Vec::new(), 8, echo).await.expect("match");
        assert!(outcome.candidates.is_empty());
    }
}
