use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::Database;
use crate::matching::RegistryEntry;
use crate::TARGET_DB;

/// A grant-making foundation, the parent entity that supplies a grant's region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundationRow {
    pub ein: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl Database {
    pub async fn upsert_foundation(&self, foundation: &FoundationRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO foundations (ein, name, city, state)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(ein) DO UPDATE SET
                name = excluded.name,
                city = excluded.city,
                state = excluded.state
            "#,
        )
        .bind(foundation.ein.trim())
        .bind(&foundation.name)
        .bind(&foundation.city)
        .bind(&foundation.state)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Add or replace a registry entry. Any previously stored normalized name
    /// is cleared since it may no longer match the new name.
    pub async fn upsert_registry_entry(&self, entry: &RegistryEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO registry (ein, name, city, state)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(ein) DO UPDATE SET
                name = excluded.name,
                city = excluded.city,
                state = excluded.state,
                normalized_name = NULL
            "#,
        )
        .bind(entry.id.trim())
        .bind(&entry.name)
        .bind(&entry.city)
        .bind(&entry.region)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Load the full registry ordered by id.
    ///
    /// The order is part of the contract: index builders resolve name
    /// collisions by keeping the last entry they see.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn load_registry_snapshot(&self) -> Result<Vec<RegistryEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT ein, name, city, state
            FROM registry
            WHERE name IS NOT NULL
            ORDER BY ein ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let entries: Vec<RegistryEntry> = rows
            .into_iter()
            .map(|row| RegistryEntry {
                id: row.get("ein"),
                name: row.get("name"),
                region: row.get("state"),
                city: row.get("city"),
            })
            .collect();

        info!(target: TARGET_DB, "Loaded registry snapshot with {} entries", entries.len());
        Ok(entries)
    }

    pub async fn registry_count(&self) -> Result<i64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM registry")
            .fetch_one(self.pool())
            .await?;
        debug!(target: TARGET_DB, "Registry holds {} entries", count);
        Ok(count)
    }
}
