use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::Database;
use crate::matching::{MatchCandidate, Normalizer, UnresolvedRecord};
use crate::TARGET_DB;

/// A grant as delivered by the ingestion side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRow {
    pub id: i64,
    #[serde(default)]
    pub foundation_ein: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    // Recipient EIN printed on the source document, if any
    #[serde(default)]
    pub recipient_ein: Option<String>,
}

/// Number of grants resolved by one tier. `tier` is `None` for rows resolved
/// outside the matching engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierCount {
    pub tier: Option<i64>,
    pub resolved: i64,
}

impl Database {
    pub async fn insert_grant(&self, grant: &GrantRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO grants (id, foundation_ein, recipient_name, recipient_ein)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                foundation_ein = excluded.foundation_ein,
                recipient_name = excluded.recipient_name,
                recipient_ein = excluded.recipient_ein
            "#,
        )
        .bind(grant.id)
        .bind(&grant.foundation_ein)
        .bind(&grant.recipient_name)
        .bind(&grant.recipient_ein)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Fetch grants whose recipient has not been resolved yet, with the
    /// granting foundation's state as region hint. Ordered by id.
    ///
    /// `limit` keeps the lowest ids; `max_id` drops anything above it.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn fetch_unresolved_records(
        &self,
        limit: Option<i64>,
        max_id: Option<i64>,
    ) -> Result<Vec<UnresolvedRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, COALESCE(g.recipient_name, '') AS recipient_name,
                   g.recipient_ein, f.state
            FROM grants g
            LEFT JOIN foundations f ON g.foundation_ein = f.ein
            WHERE g.recipient_ein_matched IS NULL
              AND (?2 IS NULL OR g.id <= ?2)
            ORDER BY g.id ASC
            LIMIT ?1
            "#,
        )
        // SQLite treats a negative LIMIT as no limit
        .bind(limit.unwrap_or(-1))
        .bind(max_id)
        .fetch_all(self.pool())
        .await?;

        let records: Vec<UnresolvedRecord> = rows
            .into_iter()
            .map(|row| UnresolvedRecord {
                id: row.get("id"),
                name: row.get("recipient_name"),
                region_hint: row.get("state"),
                asserted_id: row.get("recipient_ein"),
                resolved_id: None,
            })
            .collect();

        info!(target: TARGET_DB, "Fetched {} unresolved records", records.len());
        Ok(records)
    }

    /// Apply one batch of matches in a single transaction.
    ///
    /// Each update only touches a grant that is still unresolved, so replays
    /// and overlapping tiers cannot overwrite an earlier decision. Any error
    /// rolls back the entire batch. Returns the number of grants changed.
    #[instrument(target = "db", level = "debug", skip(self, candidates), fields(batch = candidates.len()))]
    pub async fn apply_matches_batch(
        &self,
        candidates: &[MatchCandidate],
    ) -> Result<u64, sqlx::Error> {
        let matched_at = chrono::Utc::now().to_rfc3339();
        let mut transaction = self.pool().begin().await?;
        let mut applied = 0;

        for candidate in candidates {
            let result = sqlx::query(
                r#"
                UPDATE grants
                SET recipient_ein_matched = ?1,
                    match_tier = ?2,
                    match_score = ?3,
                    matched_at = ?4
                WHERE id = ?5 AND recipient_ein_matched IS NULL
                "#,
            )
            .bind(&candidate.registry_id)
            .bind(candidate.tier as i64)
            .bind(candidate.score)
            .bind(&matched_at)
            .bind(candidate.record_id)
            .execute(&mut *transaction)
            .await;

            match result {
                Ok(done) => applied += done.rows_affected(),
                Err(e) => {
                    transaction.rollback().await?;
                    return Err(e);
                }
            }
        }

        transaction.commit().await?;
        debug!(
            target: TARGET_DB,
            "Committed batch: {} of {} candidates applied", applied, candidates.len()
        );
        Ok(applied)
    }

    pub async fn count_unresolved(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM grants WHERE recipient_ein_matched IS NULL")
            .fetch_one(self.pool())
            .await
    }

    pub async fn resolved_id(&self, grant_id: i64) -> Result<Option<String>, sqlx::Error> {
        let resolved = sqlx::query_scalar::<_, Option<String>>(
            "SELECT recipient_ein_matched FROM grants WHERE id = ?1",
        )
        .bind(grant_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(resolved.flatten())
    }

    /// Every (grant id, registry id) assignment, ordered by grant id.
    pub async fn resolved_assignments(&self) -> Result<Vec<(i64, String)>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, recipient_ein_matched
            FROM grants
            WHERE recipient_ein_matched IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("recipient_ein_matched")))
            .collect())
    }

    /// The tier that resolved a grant, if the matching engine resolved it.
    pub async fn match_tier(&self, grant_id: i64) -> Result<Option<i64>, sqlx::Error> {
        let tier = sqlx::query_scalar::<_, Option<i64>>("SELECT match_tier FROM grants WHERE id = ?1")
            .bind(grant_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(tier.flatten())
    }

    pub async fn resolution_stats(&self) -> Result<Vec<TierCount>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT match_tier, COUNT(*) AS resolved
            FROM grants
            WHERE recipient_ein_matched IS NOT NULL
            GROUP BY match_tier
            ORDER BY match_tier ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TierCount {
                tier: row.get("match_tier"),
                resolved: row.get("resolved"),
            })
            .collect())
    }

    /// Store normalized names on registry and grant rows so they can be
    /// inspected or joined on directly. Returns (registry rows, grant rows)
    /// updated.
    #[instrument(target = "db", level = "info", skip(self, normalizer))]
    pub async fn precompute_normalized_names(
        &self,
        normalizer: &Normalizer,
        batch_size: usize,
    ) -> Result<(u64, u64), sqlx::Error> {
        let registry_rows = sqlx::query("SELECT ein, name FROM registry WHERE name IS NOT NULL")
            .fetch_all(self.pool())
            .await?;
        let registry_updates: Vec<(String, String)> = registry_rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("name");
                (normalizer.normalize(&name), row.get("ein"))
            })
            .collect();

        let mut registry_updated = 0;
        for chunk in registry_updates.chunks(batch_size.max(1)) {
            let mut transaction = self.pool().begin().await?;
            for (normalized, ein) in chunk {
                registry_updated += sqlx::query("UPDATE registry SET normalized_name = ?1 WHERE ein = ?2")
                    .bind(normalized)
                    .bind(ein)
                    .execute(&mut *transaction)
                    .await?
                    .rows_affected();
            }
            transaction.commit().await?;
        }

        let grant_rows =
            sqlx::query("SELECT id, recipient_name FROM grants WHERE recipient_name IS NOT NULL")
                .fetch_all(self.pool())
                .await?;
        let grant_updates: Vec<(String, i64)> = grant_rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("recipient_name");
                (normalizer.normalize(&name), row.get("id"))
            })
            .collect();

        let mut grants_updated = 0;
        for chunk in grant_updates.chunks(batch_size.max(1)) {
            let mut transaction = self.pool().begin().await?;
            for (normalized, id) in chunk {
                grants_updated += sqlx::query("UPDATE grants SET normalized_name = ?1 WHERE id = ?2")
                    .bind(normalized)
                    .bind(id)
                    .execute(&mut *transaction)
                    .await?
                    .rows_affected();
            }
            transaction.commit().await?;
        }

        info!(
            target: TARGET_DB,
            "Precomputed normalized names for {} registry entries and {} grants",
            registry_updated, grants_updated
        );
        Ok((registry_updated, grants_updated))
    }
}
