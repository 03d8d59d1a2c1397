//! Ruleset persistence.
//!
//! At most one ruleset per type is active; activation flips flags inside a
//! single transaction. Deprecation is irreversible and clears the active
//! flag.

use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use shared::error::{AppError, AppResult};
use shared::types::now_ts;

use crate::model::{Ruleset, RulesetType};

/// Store for versioned rulesets.
#[derive(Debug, Clone)]
pub struct RulesetStore {
    pool: SqlitePool,
}

impl RulesetStore {
    /// Create a new ruleset store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate and persist a ruleset. An empty hash is filled in before
    /// saving; a present hash must match the content.
    pub async fn save(&self, ruleset: &Ruleset) -> AppResult<Ruleset> {
        let mut ruleset = ruleset.clone();
        if ruleset.hash.is_empty() {
            ruleset
                .seal()
                .map_err(|e| AppError::Internal(e.to_string()))?;
        }
        if ruleset.created_at == 0 {
            ruleset.created_at = now_ts();
        }
        ruleset.validate()?;

        let content = serde_json::to_string(&ruleset)?;

        sqlx::query(
            r#"
            INSERT INTO rulesets
                (ruleset_id, name, ruleset_type, version, hash, content, is_active, created_at, deprecated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(ruleset_id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                hash = excluded.hash,
                content = excluded.content,
                deprecated_at = excluded.deprecated_at
            "#,
        )
        .bind(&ruleset.id)
        .bind(&ruleset.name)
        .bind(ruleset.ruleset_type.to_string())
        .bind(&ruleset.version)
        .bind(&ruleset.hash)
        .bind(&content)
        .bind(ruleset.created_at)
        .bind(ruleset.deprecated_at)
        .execute(&self.pool)
        .await?;

        Ok(ruleset)
    }

    /// Activate a ruleset, deactivating any other of the same type in the
    /// same transaction. Deprecated rulesets cannot be activated.
    pub async fn activate(&self, ruleset_id: &str) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT ruleset_type, deprecated_at FROM rulesets WHERE ruleset_id = ?")
            .bind(ruleset_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ruleset {}", ruleset_id)))?;

        let ruleset_type: String = row.get("ruleset_type");
        let deprecated_at: Option<i64> = row.get("deprecated_at");
        if deprecated_at.is_some() {
            return Err(AppError::BadRequest(format!(
                "ruleset {} is deprecated",
                ruleset_id
            )));
        }

        sqlx::query("UPDATE rulesets SET is_active = 0 WHERE ruleset_type = ?")
            .bind(&ruleset_type)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE rulesets SET is_active = 1 WHERE ruleset_id = ?")
            .bind(ruleset_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Clear the active flag on a ruleset.
    pub async fn deactivate(&self, ruleset_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE rulesets SET is_active = 0 WHERE ruleset_id = ?")
            .bind(ruleset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deprecate a ruleset. Irreversible; also clears the active flag.
    pub async fn deprecate(&self, ruleset_id: &str) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE rulesets SET deprecated_at = ?, is_active = 0 WHERE ruleset_id = ? AND deprecated_at IS NULL",
        )
        .bind(now_ts())
        .bind(ruleset_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "ruleset {} (or already deprecated)",
                ruleset_id
            )));
        }
        Ok(())
    }

    /// Active ruleset of the given type, if any.
    pub async fn get_active(&self, ruleset_type: RulesetType) -> AppResult<Option<Ruleset>> {
        let row = sqlx::query(
            "SELECT content FROM rulesets WHERE ruleset_type = ? AND is_active = 1 LIMIT 1",
        )
        .bind(ruleset_type.to_string())
        .fetch_optional(&self.pool)
        .await?;

        parse_content(row)
    }

    /// Fetch a ruleset by id.
    pub async fn get_by_id(&self, ruleset_id: &str) -> AppResult<Option<Ruleset>> {
        let row = sqlx::query("SELECT content FROM rulesets WHERE ruleset_id = ?")
            .bind(ruleset_id)
            .fetch_optional(&self.pool)
            .await?;

        parse_content(row)
    }

    /// All rulesets, newest first.
    pub async fn list(&self) -> AppResult<Vec<Ruleset>> {
        let rows = sqlx::query("SELECT content FROM rulesets ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let mut rulesets = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row.get("content");
            rulesets.push(serde_json::from_str(&content)?);
        }
        Ok(rulesets)
    }

    /// Delete a ruleset.
    pub async fn delete(&self, ruleset_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM rulesets WHERE ruleset_id = ?")
            .bind(ruleset_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hashes of all non-deprecated rulesets. This is the approved-hash
    /// set the aggregator filters against.
    pub async fn approved_hashes(&self) -> AppResult<HashSet<String>> {
        let rows = sqlx::query("SELECT hash FROM rulesets WHERE deprecated_at IS NULL")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.get("hash")).collect())
    }
}

fn parse_content(row: Option<sqlx::sqlite::SqliteRow>) -> AppResult<Option<Ruleset>> {
    match row {
        Some(row) => {
            let content: String = row.get("content");
            Ok(Some(serde_json::from_str(&content)?))
        }
        None => Ok(None),
    }
}
