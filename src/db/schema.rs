use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            -- Grant-making foundations; the parent entity of each grant
            CREATE TABLE IF NOT EXISTS foundations (
                ein TEXT PRIMARY KEY,
                name TEXT,
                city TEXT,
                state TEXT
            );

            -- Canonical organizations that grant recipients resolve to
            CREATE TABLE IF NOT EXISTS registry (
                ein TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                city TEXT,
                state TEXT,
                normalized_name TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_registry_state ON registry (state);
            CREATE INDEX IF NOT EXISTS idx_registry_normalized_name ON registry (normalized_name);

            CREATE TABLE IF NOT EXISTS grants (
                id INTEGER PRIMARY KEY,
                foundation_ein TEXT,
                recipient_name TEXT,
                recipient_ein TEXT,
                recipient_ein_matched TEXT,
                match_tier INTEGER,
                match_score REAL,
                matched_at TEXT,
                normalized_name TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_grants_matched ON grants (recipient_ein_matched);
            CREATE INDEX IF NOT EXISTS idx_grants_foundation_ein ON grants (foundation_ein);
            CREATE INDEX IF NOT EXISTS idx_grants_match_tier ON grants (match_tier);
            "#,
        )
        .execute(&mut *conn)
        .await?;
        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
