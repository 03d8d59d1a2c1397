//! Decision persistence.
//!
//! Decisions are upserted by `decision_id`. The id itself covers the
//! curator, target, verdict, and timestamp, so a curator re-deciding at a
//! new timestamp produces a new row; the aggregator treats every stored
//! row as an independent vote.

use sqlx::{Row, SqlitePool};

use shared::error::{AppError, AppResult};
use shared::types::now_ts;

use crate::aggregator::AggregatedDecision;
use crate::decision::VerificationDecision;

/// Store for verification decisions.
#[derive(Debug, Clone)]
pub struct DecisionStore {
    pool: SqlitePool,
}

impl DecisionStore {
    /// Create a new decision store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a decision by id.
    pub async fn save(&self, decision: &VerificationDecision) -> AppResult<()> {
        decision.validate()?;

        let reason_codes = serde_json::to_string(&decision.reason_codes)?;
        let ruleset_type = decision.ruleset_type.map(|t| t.to_string());
        let aggregated = decision
            .aggregated_decision
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO verification_decisions
                (decision_id, target_event_id, target_infohash, decision, reason_codes,
                 ruleset_type, ruleset_version, ruleset_hash, curator_pubkey, signature,
                 created_at, processed_at, aggregated_decision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(decision_id) DO UPDATE SET
                processed_at = excluded.processed_at,
                aggregated_decision = excluded.aggregated_decision
            "#,
        )
        .bind(&decision.decision_id)
        .bind(&decision.target_event_id)
        .bind(&decision.target_infohash)
        .bind(decision.decision.to_string())
        .bind(&reason_codes)
        .bind(&ruleset_type)
        .bind(&decision.ruleset_version)
        .bind(&decision.ruleset_hash)
        .bind(&decision.curator_pubkey)
        .bind(&decision.signature)
        .bind(decision.created_at)
        .bind(decision.processed_at)
        .bind(&aggregated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch one decision by id.
    pub async fn get_by_id(&self, decision_id: &str) -> AppResult<Option<VerificationDecision>> {
        let row = sqlx::query("SELECT * FROM verification_decisions WHERE decision_id = ?")
            .bind(decision_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode_row).transpose()
    }

    /// All decisions on an infohash, in received (creation) order.
    pub async fn list_for_infohash(
        &self,
        infohash: &str,
    ) -> AppResult<Vec<VerificationDecision>> {
        let rows = sqlx::query(
            "SELECT * FROM verification_decisions WHERE target_infohash = ? ORDER BY created_at ASC",
        )
        .bind(infohash)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Recent decisions by a curator.
    pub async fn list_by_curator(
        &self,
        curator_pubkey: &str,
        limit: i64,
    ) -> AppResult<Vec<VerificationDecision>> {
        let rows = sqlx::query(
            "SELECT * FROM verification_decisions WHERE curator_pubkey = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(curator_pubkey)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Decisions not yet folded by the aggregator.
    pub async fn list_unprocessed(&self, limit: i64) -> AppResult<Vec<VerificationDecision>> {
        let rows = sqlx::query(
            "SELECT * FROM verification_decisions WHERE processed_at IS NULL ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Cache an aggregated verdict on every decision row of an infohash
    /// and mark them processed.
    pub async fn cache_aggregated(
        &self,
        infohash: &str,
        aggregated: &AggregatedDecision,
    ) -> AppResult<()> {
        let json = serde_json::to_string(aggregated)?;

        sqlx::query(
            "UPDATE verification_decisions SET aggregated_decision = ?, processed_at = ? WHERE target_infohash = ?",
        )
        .bind(&json)
        .bind(now_ts())
        .bind(infohash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Total number of stored decisions.
    pub async fn count(&self) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM verification_decisions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> AppResult<VerificationDecision> {
    let decision_str: String = row.get("decision");
    let decision = serde_json::from_value(serde_json::Value::String(decision_str))
        .map_err(|e| AppError::Internal(format!("bad decision value in store: {}", e)))?;

    let reason_codes: String = row.get("reason_codes");
    let ruleset_type: Option<String> = row.get("ruleset_type");
    let aggregated: Option<String> = row.get("aggregated_decision");

    Ok(VerificationDecision {
        decision_id: row.get("decision_id"),
        target_event_id: row.get("target_event_id"),
        target_infohash: row.get("target_infohash"),
        decision,
        reason_codes: serde_json::from_str(&reason_codes)?,
        ruleset_type: ruleset_type
            .map(|t| serde_json::from_value(serde_json::Value::String(t)))
            .transpose()
            .map_err(|e| AppError::Internal(format!("bad ruleset type in store: {}", e)))?,
        ruleset_version: row.get("ruleset_version"),
        ruleset_hash: row.get("ruleset_hash"),
        curator_pubkey: row.get("curator_pubkey"),
        signature: row.get("signature"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        aggregated_decision: aggregated.map(|a| serde_json::from_str(&a)).transpose()?,
    })
}
