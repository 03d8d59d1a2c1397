//! SLA enforcement.
//!
//! The enforcer sweeps on a fixed tick. Pending reports older than the
//! acknowledgement deadline fire an `acknowledgment_overdue` violation
//! (and are auto-acknowledged when configured); open reports older than
//! the resolution deadline fire `resolution_overdue`. Violations never
//! fail a report.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shared::error::AppResult;
use shared::types::now_ts;

use crate::store::ReportStore;

/// SLA deadlines and sweep behavior.
#[derive(Debug, Clone)]
pub struct SlaPolicy {
    /// Maximum hours a report may stay unacknowledged
    pub acknowledgment_deadline_hours: i64,
    /// Maximum days a report may stay unresolved
    pub resolution_deadline_days: i64,
    /// Acknowledge overdue pending reports automatically
    pub auto_acknowledge: bool,
    /// Sweep interval in minutes
    pub tick_minutes: u64,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            acknowledgment_deadline_hours: 24,
            resolution_deadline_days: 7,
            auto_acknowledge: false,
            tick_minutes: 15,
        }
    }
}

/// Which deadline was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaViolationKind {
    AcknowledgmentOverdue,
    ResolutionOverdue,
}

impl SlaViolationKind {
    /// Violation tag handed to the callback.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcknowledgmentOverdue => "acknowledgment_overdue",
            Self::ResolutionOverdue => "resolution_overdue",
        }
    }
}

/// One breached deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaViolation {
    pub report_id: String,
    pub kind: SlaViolationKind,
    pub age_secs: i64,
}

/// Callback invoked once per violation per sweep.
pub type ViolationCallback = Arc<dyn Fn(SlaViolation) + Send + Sync>;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub acknowledgment_overdue: usize,
    pub resolution_overdue: usize,
    pub auto_acknowledged: usize,
}

/// The SLA enforcer.
pub struct SlaEnforcer {
    store: ReportStore,
    policy: SlaPolicy,
    callback: Option<ViolationCallback>,
}

impl SlaEnforcer {
    /// Create a new enforcer
    pub fn new(store: ReportStore, policy: SlaPolicy) -> Self {
        Self {
            store,
            policy,
            callback: None,
        }
    }

    /// Attach the violation callback.
    pub fn with_callback(mut self, callback: ViolationCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn fire(&self, violation: SlaViolation) {
        if let Some(callback) = &self.callback {
            callback(violation);
        }
    }

    /// Run one sweep over the report store.
    pub async fn sweep(&self) -> AppResult<SweepOutcome> {
        let now = now_ts();
        let mut outcome = SweepOutcome::default();

        // Step 1: unacknowledged reports past the acknowledgement deadline.
        let ack_cutoff = now - self.policy.acknowledgment_deadline_hours * 3600;
        for report in self.store.list_pending_older_than(ack_cutoff).await? {
            outcome.acknowledgment_overdue += 1;
            self.fire(SlaViolation {
                report_id: report.report_id.clone(),
                kind: SlaViolationKind::AcknowledgmentOverdue,
                age_secs: report.age_secs(now),
            });

            if self.policy.auto_acknowledge {
                match self.store.acknowledge(&report.report_id).await {
                    Ok(_) => outcome.auto_acknowledged += 1,
                    Err(e) => warn!(
                        "Failed to auto-acknowledge report {}: {}",
                        report.report_id, e
                    ),
                }
            }
        }

        // Step 2: open reports past the resolution deadline.
        let resolution_cutoff = now - self.policy.resolution_deadline_days * 86_400;
        for report in self.store.list_open_older_than(resolution_cutoff).await? {
            outcome.resolution_overdue += 1;
            self.fire(SlaViolation {
                report_id: report.report_id.clone(),
                kind: SlaViolationKind::ResolutionOverdue,
                age_secs: report.age_secs(now),
            });
        }

        if outcome != SweepOutcome::default() {
            info!(
                ack_overdue = outcome.acknowledgment_overdue,
                resolution_overdue = outcome.resolution_overdue,
                auto_acknowledged = outcome.auto_acknowledged,
                "SLA sweep found violations"
            );
        }

        Ok(outcome)
    }

    /// Sweep on the configured tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.policy.tick_minutes * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            tick_minutes = self.policy.tick_minutes,
            "SLA enforcer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("SLA enforcer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("SLA sweep failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Report, ReportCategory, ReportStatus};
    use shared::database::Database;
    use std::sync::Mutex;

    async fn store() -> ReportStore {
        let db = Database::connect_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        ReportStore::new(db.pool().clone())
    }

    fn recorder() -> (ViolationCallback, Arc<Mutex<Vec<SlaViolation>>>) {
        let seen: Arc<Mutex<Vec<SlaViolation>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ViolationCallback =
            Arc::new(move |violation| sink.lock().unwrap().push(violation));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_breach_fires_once_with_auto_acknowledge() {
        let store = store().await;

        // A pending report created 25 hours ago.
        let mut report = Report::new(ReportCategory::Dmca, None, Some("a".repeat(40)));
        report.created_at = now_ts() - 25 * 3600;
        store.submit(&report).await.unwrap();

        let (callback, seen) = recorder();
        let enforcer = SlaEnforcer::new(
            store.clone(),
            SlaPolicy {
                auto_acknowledge: true,
                ..SlaPolicy::default()
            },
        )
        .with_callback(callback);

        let outcome = enforcer.sweep().await.unwrap();
        assert_eq!(outcome.acknowledgment_overdue, 1);
        assert_eq!(outcome.auto_acknowledged, 1);
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].kind, SlaViolationKind::AcknowledgmentOverdue);
            assert_eq!(seen[0].report_id, report.report_id);
        }

        let stored = store.get_by_id(&report.report_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Acknowledged);
        assert!(stored.acknowledged_at.is_some());

        // Second tick: the report is acknowledged, nothing re-fires.
        let outcome = enforcer.sweep().await.unwrap();
        assert_eq!(outcome.acknowledgment_overdue, 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_breach_refires_without_auto_acknowledge() {
        let store = store().await;
        let mut report = Report::new(ReportCategory::Spam, None, Some("b".repeat(40)));
        report.created_at = now_ts() - 25 * 3600;
        store.submit(&report).await.unwrap();

        let (callback, seen) = recorder();
        let enforcer =
            SlaEnforcer::new(store.clone(), SlaPolicy::default()).with_callback(callback);

        enforcer.sweep().await.unwrap();
        enforcer.sweep().await.unwrap();
        // Still pending: the violation keeps firing on each sweep.
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolution_overdue_on_open_reports() {
        let store = store().await;
        let mut report = Report::new(ReportCategory::Illegal, None, Some("c".repeat(40)));
        report.created_at = now_ts() - 8 * 86_400;
        store.submit(&report).await.unwrap();
        store.acknowledge(&report.report_id).await.unwrap();

        let (callback, seen) = recorder();
        let enforcer =
            SlaEnforcer::new(store.clone(), SlaPolicy::default()).with_callback(callback);

        let outcome = enforcer.sweep().await.unwrap();
        // Acknowledged but unresolved for 8 days: only the resolution
        // deadline is breached.
        assert_eq!(outcome.acknowledgment_overdue, 0);
        assert_eq!(outcome.resolution_overdue, 1);
        assert_eq!(
            seen.lock().unwrap()[0].kind,
            SlaViolationKind::ResolutionOverdue
        );
    }

    #[tokio::test]
    async fn test_fresh_reports_are_untouched() {
        let store = store().await;
        let report = Report::new(ReportCategory::Other, None, Some("d".repeat(40)));
        store.submit(&report).await.unwrap();

        let (callback, seen) = recorder();
        let enforcer =
            SlaEnforcer::new(store.clone(), SlaPolicy::default()).with_callback(callback);

        let outcome = enforcer.sweep().await.unwrap();
        assert_eq!(outcome, SweepOutcome::default());
        assert!(seen.lock().unwrap().is_empty());
    }
}
