//! Report persistence.

use sqlx::{Row, SqlitePool};

use shared::error::{AppError, AppResult, ValidationError};
use shared::types::now_ts;

use crate::report::{Report, ReportCategory, ReportKind, ReportStatus};

/// Store for reports and appeals.
#[derive(Debug, Clone)]
pub struct ReportStore {
    pool: SqlitePool,
}

impl ReportStore {
    /// Create a new report store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate and persist a new report.
    pub async fn submit(&self, report: &Report) -> AppResult<()> {
        report.validate()?;

        sqlx::query(
            r#"
            INSERT INTO reports
                (report_id, kind, category, target_event_id, target_infohash, evidence,
                 scope, jurisdiction, reporter_pubkey, signature, status, created_at,
                 acknowledged_at, resolved_at, resolution, resolved_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.report_id)
        .bind(report.kind.to_string())
        .bind(report.category.to_string())
        .bind(&report.target_event_id)
        .bind(&report.target_infohash)
        .bind(&report.evidence)
        .bind(&report.scope)
        .bind(&report.jurisdiction)
        .bind(&report.reporter_pubkey)
        .bind(&report.signature)
        .bind(report.status.to_string())
        .bind(report.created_at)
        .bind(report.acknowledged_at)
        .bind(report.resolved_at)
        .bind(&report.resolution)
        .bind(&report.resolved_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch one report.
    pub async fn get_by_id(&self, report_id: &str) -> AppResult<Option<Report>> {
        let row = sqlx::query("SELECT * FROM reports WHERE report_id = ?")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode_row).transpose()
    }

    /// Advance a report's status. Transitions must follow the status
    /// order; a regression is rejected.
    pub async fn update_status(
        &self,
        report_id: &str,
        next: ReportStatus,
        resolution: Option<String>,
        resolved_by: Option<String>,
    ) -> AppResult<Report> {
        let report = self
            .get_by_id(report_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("report {}", report_id)))?;

        if !report.status.can_transition_to(next) {
            return Err(ValidationError::InvalidTransition {
                from: report.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }

        let now = now_ts();
        let acknowledged_at = if next == ReportStatus::Acknowledged {
            Some(now)
        } else {
            report.acknowledged_at
        };
        let resolved_at = if next.is_terminal() {
            Some(now)
        } else {
            report.resolved_at
        };

        sqlx::query(
            r#"
            UPDATE reports
            SET status = ?, acknowledged_at = ?, resolved_at = ?, resolution = ?, resolved_by = ?
            WHERE report_id = ?
            "#,
        )
        .bind(next.to_string())
        .bind(acknowledged_at)
        .bind(resolved_at)
        .bind(resolution.as_ref().or(report.resolution.as_ref()))
        .bind(resolved_by.as_ref().or(report.resolved_by.as_ref()))
        .bind(report_id)
        .execute(&self.pool)
        .await?;

        self.get_by_id(report_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("report {}", report_id)))
    }

    /// Shorthand for the acknowledge transition.
    pub async fn acknowledge(&self, report_id: &str) -> AppResult<Report> {
        self.update_status(report_id, ReportStatus::Acknowledged, None, None)
            .await
    }

    /// Reports in a given status, oldest first.
    pub async fn list_by_status(&self, status: ReportStatus) -> AppResult<Vec<Report>> {
        let rows = sqlx::query("SELECT * FROM reports WHERE status = ? ORDER BY created_at ASC")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Pending reports created before the cutoff.
    pub async fn list_pending_older_than(&self, cutoff: i64) -> AppResult<Vec<Report>> {
        let rows = sqlx::query(
            "SELECT * FROM reports WHERE status = 'pending' AND created_at < ? ORDER BY created_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Open (pending/acknowledged/investigating) reports created before
    /// the cutoff.
    pub async fn list_open_older_than(&self, cutoff: i64) -> AppResult<Vec<Report>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM reports
            WHERE status IN ('pending', 'acknowledged', 'investigating') AND created_at < ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Whether an infohash has any open report against it.
    pub async fn has_open_report(&self, infohash: &str) -> AppResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM reports
            WHERE target_infohash = ?
              AND status IN ('pending', 'acknowledged', 'investigating')
            "#,
        )
        .bind(infohash)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("n") > 0)
    }

    /// File an appeal against a resolved or rejected report.
    pub async fn create_appeal(
        &self,
        original_id: &str,
        reporter_pubkey: Option<String>,
        evidence: Option<String>,
    ) -> AppResult<Report> {
        let original = self
            .get_by_id(original_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("report {}", original_id)))?;

        if !original.status.is_terminal() {
            return Err(AppError::BadRequest(format!(
                "report {} is still open; only resolved or rejected reports can be appealed",
                original_id
            )));
        }

        let mut appeal = Report::new(
            original.category,
            original.target_event_id.clone(),
            original.target_infohash.clone(),
        );
        appeal.kind = ReportKind::Appeal;
        appeal.scope = Some(format!("Appeal of report {}", original_id));
        appeal.reporter_pubkey = reporter_pubkey;
        appeal.evidence = evidence;

        self.submit(&appeal).await?;
        Ok(appeal)
    }

    /// Open-report counts, for the facade's SLA snapshot.
    pub async fn count_by_status(&self, status: ReportStatus) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reports WHERE status = ?")
            .bind(status.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> AppResult<Report> {
    fn enum_from<T: serde::de::DeserializeOwned>(value: String, what: &str) -> AppResult<T> {
        serde_json::from_value(serde_json::Value::String(value))
            .map_err(|e| AppError::Internal(format!("bad {} in store: {}", what, e)))
    }

    let kind: ReportKind = enum_from(row.get("kind"), "report kind")?;
    let category: ReportCategory = enum_from(row.get("category"), "report category")?;
    let status: ReportStatus = enum_from(row.get("status"), "report status")?;

    Ok(Report {
        report_id: row.get("report_id"),
        kind,
        category,
        target_event_id: row.get("target_event_id"),
        target_infohash: row.get("target_infohash"),
        evidence: row.get("evidence"),
        scope: row.get("scope"),
        jurisdiction: row.get("jurisdiction"),
        reporter_pubkey: row.get("reporter_pubkey"),
        signature: row.get("signature"),
        status,
        created_at: row.get("created_at"),
        acknowledged_at: row.get("acknowledged_at"),
        resolved_at: row.get("resolved_at"),
        resolution: row.get("resolution"),
        resolved_by: row.get("resolved_by"),
    })
}
