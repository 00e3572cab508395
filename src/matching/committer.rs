use serde::Serialize;
use tracing::{error, info, warn};

use super::types::MatchCandidate;
use super::TARGET_MATCH;
use crate::db::{Database, DbLockErrorExt};

/// A batch the store refused; none of its updates were applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedBatch {
    pub record_ids: Vec<i64>,
    pub error: String,
}

/// Outcome of committing one tier's candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitReport {
    pub proposed: usize,
    pub applied: u64,
    pub failed_batches: Vec<FailedBatch>,
}

impl CommitReport {
    /// Record ids from failed batches, to be retried by a later run.
    pub fn failed_record_ids(&self) -> Vec<i64> {
        self.failed_batches
            .iter()
            .flat_map(|batch| batch.record_ids.iter().copied())
            .collect()
    }
}

/// Writes confirmed matches back to the store in fixed-size, all-or-nothing batches.
pub struct BatchCommitter<'a> {
    db: &'a Database,
    batch_size: usize,
}

impl<'a> BatchCommitter<'a> {
    pub fn new(db: &'a Database, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Commit candidates in record-id order. A failed batch is rolled back
    /// and reported; later batches are still attempted.
    pub async fn commit(&self, mut candidates: Vec<MatchCandidate>) -> CommitReport {
        candidates.sort_by_key(|candidate| candidate.record_id);

        let mut report = CommitReport {
            proposed: candidates.len(),
            ..CommitReport::default()
        };

        for (batch_number, batch) in candidates.chunks(self.batch_size).enumerate() {
            match self.db.apply_matches_batch(batch).await {
                Ok(applied) => {
                    report.applied += applied;
                    if applied < batch.len() as u64 {
                        info!(
                            target: TARGET_MATCH,
                            "Batch {}: {} of {} candidates skipped (already resolved)",
                            batch_number + 1,
                            batch.len() as u64 - applied,
                            batch.len()
                        );
                    }
                }
                Err(e) => {
                    if e.is_database_lock_error() {
                        warn!(target: TARGET_MATCH, "Batch {} hit a locked database", batch_number + 1);
                    }
                    error!(
                        target: TARGET_MATCH,
                        "Batch {} rolled back ({} records): {}",
                        batch_number + 1,
                        batch.len(),
                        e
                    );
                    report.failed_batches.push(FailedBatch {
                        record_ids: batch.iter().map(|candidate| candidate.record_id).collect(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::GrantRow;

    async fn db_with_grants(ids: &[i64]) -> Database {
        let db = Database::in_memory().await.expect("db");
        for id in ids {
            db.insert_grant(&GrantRow {
                id: *id,
                foundation_ein: None,
                recipient_name: Some(format!("Recipient {}", id)),
                recipient_ein: None,
            })
            .await
            .expect("grant");
        }
        db
    }

    fn candidate(record_id: i64, registry_id: &str) -> MatchCandidate {
        MatchCandidate {
            record_id,
            registry_id: registry_id.to_string(),
            score: 90.0,
            tier: 3,
        }
    }

    #[tokio::test]
    async fn test_commit_counts_applied() {
        let db = db_with_grants(&[1, 2, 3]).await;
        let committer = BatchCommitter::new(&db, 2);

        let report = committer
            .commit(vec![candidate(3, "C"), candidate(1, "A"), candidate(2, "B")])
            .await;
        assert_eq!(report.proposed, 3);
        assert_eq!(report.applied, 3);
        assert!(report.failed_batches.is_empty());

        // Re-running is a no-op
        let again = committer.commit(vec![candidate(1, "Z")]).await;
        assert_eq!(again.applied, 0);
        assert_eq!(db.resolved_id(1).await.expect("id").as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_alone() {
        let db = db_with_grants(&[1, 2, 3, 4]).await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_poison BEFORE UPDATE ON grants
            WHEN NEW.recipient_ein_matched = 'POISON'
            BEGIN
                SELECT RAISE(ABORT, 'poisoned update');
            END;
            "#,
        )
        .execute(db.pool())
        .await
        .expect("trigger");

        let report = BatchCommitter::new(&db, 2)
            .commit(vec![
                candidate(1, "A"),
                candidate(2, "B"),
                candidate(3, "C"),
                candidate(4, "POISON"),
            ])
            .await;

        assert_eq!(report.applied, 2);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_record_ids(), vec![3, 4]);
        assert!(report.failed_batches[0].error.contains("poisoned update"));

        // First batch stays committed; the whole second batch was rolled back
        assert_eq!(db.resolved_id(2).await.expect("id").as_deref(), Some("B"));
        assert_eq!(db.resolved_id(3).await.expect("id"), None);
        assert_eq!(db.resolved_id(4).await.expect("id"), None);
    }
}
