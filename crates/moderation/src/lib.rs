//! Reports, appeals, and SLA enforcement.
//!
//! Reports move monotonically through pending, acknowledged,
//! investigating, and a terminal resolved or rejected. The SLA enforcer
//! sweeps on a fixed tick and fires a violation callback for reports that
//! outlive their acknowledgement or resolution deadlines.

pub mod report;
pub mod sla;
pub mod store;

pub use report::{Report, ReportCategory, ReportKind, ReportStatus};
pub use sla::{SlaEnforcer, SlaPolicy, SlaViolation, SlaViolationKind};
pub use store::ReportStore;
