//! Rejection reason codes.
//!
//! A closed enum grouped into legal, abuse, and semantic categories.
//! Legal outranks abuse outranks semantic; within a category each code
//! carries its own priority. Legal and abuse codes are deterministic, as
//! is an exact duplicate; the remaining semantic codes are probabilistic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reason code category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonCategory {
    Legal,
    Abuse,
    Semantic,
}

/// Why a torrent was (or would be) rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    // Legal
    LegalCsam,
    LegalCourtOrder,
    LegalDmca,
    LegalGdpr,

    // Abuse
    AbuseMalware,
    AbusePhishing,
    AbuseSpam,

    // Semantic
    SemDuplicateExact,
    SemFake,
    SemDuplicateFuzzy,
    SemWrongCategory,
    SemBadMeta,
    SemLowQuality,
}

impl ReasonCode {
    /// The category this code belongs to.
    pub fn category(&self) -> ReasonCategory {
        match self {
            Self::LegalCsam | Self::LegalCourtOrder | Self::LegalDmca | Self::LegalGdpr => {
                ReasonCategory::Legal
            }
            Self::AbuseMalware | Self::AbusePhishing | Self::AbuseSpam => ReasonCategory::Abuse,
            _ => ReasonCategory::Semantic,
        }
    }

    /// Ordering weight. Legal codes always outrank abuse codes, which
    /// always outrank semantic codes.
    pub fn priority(&self) -> u32 {
        match self {
            Self::LegalCsam => 130,
            Self::LegalCourtOrder => 120,
            Self::LegalDmca => 110,
            Self::LegalGdpr => 105,
            Self::AbuseMalware => 80,
            Self::AbusePhishing => 75,
            Self::AbuseSpam => 70,
            Self::SemDuplicateExact => 40,
            Self::SemFake => 35,
            Self::SemDuplicateFuzzy => 30,
            Self::SemWrongCategory => 25,
            Self::SemBadMeta => 20,
            Self::SemLowQuality => 10,
        }
    }

    /// Whether the code represents a deterministic finding.
    pub fn is_deterministic(&self) -> bool {
        self.category() != ReasonCategory::Semantic || *self == Self::SemDuplicateExact
    }

    /// Whether the code is a legal reason.
    pub fn is_legal(&self) -> bool {
        self.category() == ReasonCategory::Legal
    }

    /// Wire spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LegalCsam => "LEGAL_CSAM",
            Self::LegalCourtOrder => "LEGAL_COURT_ORDER",
            Self::LegalDmca => "LEGAL_DMCA",
            Self::LegalGdpr => "LEGAL_GDPR",
            Self::AbuseMalware => "ABUSE_MALWARE",
            Self::AbusePhishing => "ABUSE_PHISHING",
            Self::AbuseSpam => "ABUSE_SPAM",
            Self::SemDuplicateExact => "SEM_DUPLICATE_EXACT",
            Self::SemFake => "SEM_FAKE",
            Self::SemDuplicateFuzzy => "SEM_DUPLICATE_FUZZY",
            Self::SemWrongCategory => "SEM_WRONG_CATEGORY",
            Self::SemBadMeta => "SEM_BAD_META",
            Self::SemLowQuality => "SEM_LOW_QUALITY",
        }
    }

    /// The highest-priority code in a list, ties broken by position.
    pub fn strongest(codes: &[ReasonCode]) -> Option<ReasonCode> {
        codes
            .iter()
            .copied()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.priority()
                    .cmp(&b.priority())
                    // On equal priority prefer the earlier entry.
                    .then(ib.cmp(ia))
            })
            .map(|(_, code)| code)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown reason code: {}", s))
    }
}
