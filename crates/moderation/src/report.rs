//! Report and appeal model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::error::ValidationError;
use shared::types::now_ts;

/// A report or an appeal of a resolved report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Report,
    Appeal,
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Report => write!(f, "report"),
            Self::Appeal => write!(f, "appeal"),
        }
    }
}

/// What the report alleges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportCategory {
    Dmca,
    Illegal,
    Spam,
    Malware,
    FalseInfo,
    Duplicate,
    Other,
}

impl std::fmt::Display for ReportCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dmca => "dmca",
            Self::Illegal => "illegal",
            Self::Spam => "spam",
            Self::Malware => "malware",
            Self::FalseInfo => "false_info",
            Self::Duplicate => "duplicate",
            Self::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state. Transitions are monotone; `rejected` is a terminal
/// alternative to `resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Acknowledged,
    Investigating,
    Resolved,
    Rejected,
}

impl ReportStatus {
    /// Position in the status order. Both terminals share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Acknowledged => 1,
            Self::Investigating => 2,
            Self::Resolved | Self::Rejected => 3,
        }
    }

    /// Whether the status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }

    /// Whether the report is still open.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a transition to `next` is allowed.
    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// A moderation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Report id (UUID)
    pub report_id: String,

    /// Report or appeal
    pub kind: ReportKind,

    /// Alleged violation
    pub category: ReportCategory,

    /// Targeted event id; at least one target is required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_event_id: Option<String>,

    /// Targeted infohash; at least one target is required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_infohash: Option<String>,

    /// Supporting evidence (free text, URLs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,

    /// Claimed scope of the violation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Claimed jurisdiction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,

    /// Reporter pubkey, when the report was signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter_pubkey: Option<String>,

    /// Optional reporter signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Lifecycle state
    pub status: ReportStatus,

    /// Creation time, unix seconds
    pub created_at: i64,

    /// Acknowledgement time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<i64>,

    /// Resolution time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,

    /// Resolution text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,

    /// Who resolved it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Report {
    /// New pending report against an event and/or infohash.
    pub fn new(
        category: ReportCategory,
        target_event_id: Option<String>,
        target_infohash: Option<String>,
    ) -> Self {
        Self {
            report_id: Uuid::new_v4().to_string(),
            kind: ReportKind::Report,
            category,
            target_event_id,
            target_infohash,
            evidence: None,
            scope: None,
            jurisdiction: None,
            reporter_pubkey: None,
            signature: None,
            status: ReportStatus::Pending,
            created_at: now_ts(),
            acknowledged_at: None,
            resolved_at: None,
            resolution: None,
            resolved_by: None,
        }
    }

    /// Structural validation: a report needs at least one target.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let has_event = self
            .target_event_id
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        let has_infohash = self
            .target_infohash
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if !has_event && !has_infohash {
            return Err(ValidationError::MissingField(
                "target_event_id or target_infohash".to_string(),
            ));
        }
        Ok(())
    }

    /// Age in seconds at `now`.
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_is_monotone() {
        use ReportStatus::*;

        assert!(Pending.can_transition_to(Acknowledged));
        assert!(Pending.can_transition_to(Resolved));
        assert!(Acknowledged.can_transition_to(Investigating));
        assert!(Investigating.can_transition_to(Resolved));
        assert!(Investigating.can_transition_to(Rejected));

        // No regressions, no leaving a terminal state.
        assert!(!Acknowledged.can_transition_to(Pending));
        assert!(!Resolved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Resolved));
        assert!(!Investigating.can_transition_to(Investigating));
    }

    #[test]
    fn test_validate_requires_a_target() {
        let report = Report::new(ReportCategory::Spam, None, None);
        assert!(report.validate().is_err());

        let report = Report::new(ReportCategory::Spam, None, Some("a".repeat(40)));
        report.validate().unwrap();
    }

    #[test]
    fn test_wire_round_trip() {
        let mut report = Report::new(
            ReportCategory::Dmca,
            Some("e".repeat(64)),
            Some("a".repeat(40)),
        );
        report.jurisdiction = Some("US".to_string());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"category\":\"dmca\""));
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
