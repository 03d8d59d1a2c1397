//! Trust policy persistence and the derived curator index.
//!
//! The canonical policy JSON is the source of truth; `curator_trust` is a
//! derived index rebuilt inside the same transaction that switches the
//! current policy. Queries go through the index.

use sqlx::{Row, SqlitePool};

use shared::error::{AppError, AppResult};
use shared::types::now_ts;

use crate::trust::{TrustPolicy, TrustStatus};

/// One row of the derived curator index.
#[derive(Debug, Clone, PartialEq)]
pub struct CuratorTrustRow {
    pub pubkey: String,
    pub alias: Option<String>,
    pub weight: f64,
    pub status: TrustStatus,
    pub approved_ruleset_hashes: Vec<String>,
    pub reason: Option<String>,
    pub updated_at: i64,
}

/// Store for trust policies.
#[derive(Debug, Clone)]
pub struct TrustPolicyStore {
    pool: SqlitePool,
}

impl TrustPolicyStore {
    /// Create a new trust policy store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate, verify, and persist a policy. Saving does not make it
    /// current.
    pub async fn save(&self, policy: &TrustPolicy) -> AppResult<()> {
        policy.validate()?;
        policy
            .verify()
            .map_err(|e| AppError::BadRequest(format!("policy signature invalid: {}", e)))?;

        let content = serde_json::to_string(policy)?;

        sqlx::query(
            r#"
            INSERT INTO trust_policies
                (policy_id, version, hash, content, effective_at, expires_at,
                 admin_pubkey, signature, is_current, saved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(policy_id) DO UPDATE SET
                version = excluded.version,
                hash = excluded.hash,
                content = excluded.content,
                effective_at = excluded.effective_at,
                expires_at = excluded.expires_at,
                admin_pubkey = excluded.admin_pubkey,
                signature = excluded.signature
            "#,
        )
        .bind(&policy.policy_id)
        .bind(&policy.version)
        .bind(&policy.hash)
        .bind(&content)
        .bind(policy.effective_at)
        .bind(policy.expires_at)
        .bind(&policy.admin_pubkey)
        .bind(&policy.signature)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically make a saved policy current and rebuild the curator
    /// index: flip the current flags, mark every curator pending, upsert
    /// the allowlist as approved, then apply revocations.
    pub async fn set_current(&self, policy_id: &str) -> AppResult<()> {
        let policy = self
            .get_by_id(policy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("trust policy {}", policy_id)))?;

        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE trust_policies SET is_current = 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE trust_policies SET is_current = 1 WHERE policy_id = ?")
            .bind(policy_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE curator_trust SET status = 'pending', updated_at = ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        for entry in &policy.allowlist {
            let hashes = serde_json::to_string(&entry.approved_ruleset_hashes)?;
            sqlx::query(
                r#"
                INSERT INTO curator_trust
                    (pubkey, alias, weight, status, approved_ruleset_hashes, reason, updated_at)
                VALUES (?, ?, ?, 'approved', ?, NULL, ?)
                ON CONFLICT(pubkey) DO UPDATE SET
                    alias = excluded.alias,
                    weight = excluded.weight,
                    status = 'approved',
                    approved_ruleset_hashes = excluded.approved_ruleset_hashes,
                    reason = NULL,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.pubkey)
            .bind(&entry.alias)
            .bind(entry.weight)
            .bind(&hashes)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for revoked in &policy.revoked {
            sqlx::query(
                r#"
                INSERT INTO curator_trust
                    (pubkey, alias, weight, status, approved_ruleset_hashes, reason, updated_at)
                VALUES (?, NULL, 0.0, 'revoked', '[]', ?, ?)
                ON CONFLICT(pubkey) DO UPDATE SET
                    status = 'revoked',
                    reason = excluded.reason,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&revoked.pubkey)
            .bind(&revoked.reason)
            .bind(revoked.revoked_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// The current policy, if one has been activated.
    pub async fn get_current(&self) -> AppResult<Option<TrustPolicy>> {
        let row = sqlx::query("SELECT content FROM trust_policies WHERE is_current = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let content: String = row.get("content");
                Ok(Some(serde_json::from_str(&content)?))
            }
            None => Ok(None),
        }
    }

    /// Fetch a policy by id.
    pub async fn get_by_id(&self, policy_id: &str) -> AppResult<Option<TrustPolicy>> {
        let row = sqlx::query("SELECT content FROM trust_policies WHERE policy_id = ?")
            .bind(policy_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let content: String = row.get("content");
                Ok(Some(serde_json::from_str(&content)?))
            }
            None => Ok(None),
        }
    }

    /// All saved policies, newest first.
    pub async fn list(&self) -> AppResult<Vec<TrustPolicy>> {
        let rows =
            sqlx::query("SELECT content FROM trust_policies ORDER BY effective_at DESC")
                .fetch_all(&self.pool)
                .await?;

        let mut policies = Vec::with_capacity(rows.len());
        for row in rows {
            let content: String = row.get("content");
            policies.push(serde_json::from_str(&content)?);
        }
        Ok(policies)
    }

    /// Delete a policy. The current policy cannot be deleted.
    pub async fn delete(&self, policy_id: &str) -> AppResult<bool> {
        let result =
            sqlx::query("DELETE FROM trust_policies WHERE policy_id = ? AND is_current = 0")
                .bind(policy_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether the derived index marks a pubkey approved.
    pub async fn is_approved(&self, pubkey: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT status FROM curator_trust WHERE pubkey = ?")
            .bind(pubkey)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some_and(|r| r.get::<String, _>("status") == "approved"))
    }

    /// The derived index row for a pubkey.
    pub async fn curator_status(&self, pubkey: &str) -> AppResult<Option<CuratorTrustRow>> {
        let row = sqlx::query("SELECT * FROM curator_trust WHERE pubkey = ?")
            .bind(pubkey)
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode_curator_row).transpose()
    }

    /// Every curator in the derived index.
    pub async fn list_curators(&self) -> AppResult<Vec<CuratorTrustRow>> {
        let rows = sqlx::query("SELECT * FROM curator_trust ORDER BY pubkey")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(decode_curator_row).collect()
    }
}

fn decode_curator_row(row: sqlx::sqlite::SqliteRow) -> AppResult<CuratorTrustRow> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "approved" => TrustStatus::Approved,
        "revoked" => TrustStatus::Revoked,
        "denied" => TrustStatus::Denied,
        _ => TrustStatus::Unknown,
    };

    let hashes: String = row.get("approved_ruleset_hashes");

    Ok(CuratorTrustRow {
        pubkey: row.get("pubkey"),
        alias: row.get("alias"),
        weight: row.get("weight"),
        status,
        approved_ruleset_hashes: serde_json::from_str(&hashes)?,
        reason: row.get("reason"),
        updated_at: row.get("updated_at"),
    })
}
