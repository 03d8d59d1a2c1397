//! Signed verification decisions.
//!
//! A decision is an accept/reject on a specific (event id, infohash) pair,
//! tied to the ruleset that produced it. Signing borrows the wire-event
//! scheme as a notary: the canonical decision payload becomes the content
//! of a kind-30175 event, and that event's signature is stored on the
//! decision. Verification rebuilds the same event and checks it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use protocol::event::Event;
use protocol::identity::Keys;
use protocol::kinds;
use ruleset::model::RulesetType;
use ruleset::reason::ReasonCode;
use shared::error::{ProtocolError, ValidationError};

use crate::aggregator::AggregatedDecision;

/// Accept or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionValue {
    Accept,
    Reject,
}

impl std::fmt::Display for DecisionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// A curator's signed verdict on one torrent announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationDecision {
    /// Derived id, 32 hex chars
    pub decision_id: String,

    /// Id of the judged event
    pub target_event_id: String,

    /// Infohash of the judged torrent
    pub target_infohash: String,

    /// The verdict
    pub decision: DecisionValue,

    /// Reason codes; empty on accept
    #[serde(default)]
    pub reason_codes: Vec<ReasonCode>,

    /// Type of the ruleset that produced the verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_type: Option<RulesetType>,

    /// Version of that ruleset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_version: Option<String>,

    /// Content hash of that ruleset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_hash: Option<String>,

    /// Deciding curator
    pub curator_pubkey: String,

    /// Notary-event signature, hex
    pub signature: String,

    /// Decision time, unix seconds
    pub created_at: i64,

    /// When the aggregator last folded this decision in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,

    /// Cached aggregator output for the target infohash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_decision: Option<AggregatedDecision>,
}

/// Canonical payload hashed into the decision id. Field order is part of
/// the format.
#[derive(Serialize)]
struct IdPayload<'a> {
    target_event_id: &'a str,
    target_infohash: &'a str,
    decision: DecisionValue,
    curator_pubkey: &'a str,
    created_at: i64,
}

/// Canonical payload signed by the notary event. Field order is part of
/// the format.
#[derive(Serialize)]
struct SigningPayload<'a> {
    decision_id: &'a str,
    target_event_id: &'a str,
    target_infohash: &'a str,
    decision: DecisionValue,
    reason_codes: &'a [ReasonCode],
    ruleset_hash: &'a Option<String>,
    curator_pubkey: &'a str,
    created_at: i64,
}

impl VerificationDecision {
    /// Derive the decision id: 16 bytes of SHA-256 over the canonical id
    /// payload, hex-encoded.
    pub fn derive_id(
        target_event_id: &str,
        target_infohash: &str,
        decision: DecisionValue,
        curator_pubkey: &str,
        created_at: i64,
    ) -> Result<String, ProtocolError> {
        let payload = serde_json::to_string(&IdPayload {
            target_event_id,
            target_infohash,
            decision,
            curator_pubkey,
            created_at,
        })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let digest = Sha256::digest(payload.as_bytes());
        Ok(hex::encode(&digest[..16]))
    }

    /// The notary event carrying the canonical payload, unsigned.
    fn notary_event(&self) -> Result<Event, ProtocolError> {
        let content = serde_json::to_string(&SigningPayload {
            decision_id: &self.decision_id,
            target_event_id: &self.target_event_id,
            target_infohash: &self.target_infohash,
            decision: self.decision,
            reason_codes: &self.reason_codes,
            ruleset_hash: &self.ruleset_hash,
            curator_pubkey: &self.curator_pubkey,
            created_at: self.created_at,
        })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let mut event = Event {
            id: String::new(),
            pubkey: self.curator_pubkey.clone(),
            created_at: self.created_at,
            kind: kinds::CURATOR_DECISION,
            tags: vec![
                vec!["d".to_string(), self.target_infohash.clone()],
                vec!["e".to_string(), self.target_event_id.clone()],
            ],
            content,
            sig: String::new(),
        };
        event.id = event.canonical_id()?;
        Ok(event)
    }

    /// Fill in the decision id, curator pubkey, and signature.
    pub fn sign(&mut self, keys: &Keys) -> Result<(), ProtocolError> {
        self.curator_pubkey = keys.public_key_hex().to_string();
        self.decision_id = Self::derive_id(
            &self.target_event_id,
            &self.target_infohash,
            self.decision,
            &self.curator_pubkey,
            self.created_at,
        )?;

        let notary = self.notary_event()?;
        let digest: [u8; 32] = hex::decode(&notary.id)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::IdMismatch)?;
        self.signature = keys.sign_digest(digest);
        Ok(())
    }

    /// Verify the signature against the reconstructed notary event.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let mut notary = self.notary_event()?;
        notary.sig = self.signature.clone();
        notary.verify_signature()
    }

    /// Structural validation: non-empty targets, sane timestamps, and
    /// reason codes consistent with the verdict.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target_event_id.trim().is_empty() {
            return Err(ValidationError::MissingField("target_event_id".to_string()));
        }
        if self.target_infohash.trim().is_empty() {
            return Err(ValidationError::MissingField("target_infohash".to_string()));
        }
        if self.curator_pubkey.trim().is_empty() {
            return Err(ValidationError::MissingField("curator_pubkey".to_string()));
        }
        if self.created_at == 0 {
            return Err(ValidationError::MissingField("created_at".to_string()));
        }
        match self.decision {
            DecisionValue::Accept if !self.reason_codes.is_empty() => {
                Err(ValidationError::InvalidField {
                    field: "reason_codes".to_string(),
                    message: "accept decisions carry no reasons".to_string(),
                })
            }
            DecisionValue::Reject if self.reason_codes.is_empty() => {
                Err(ValidationError::InvalidField {
                    field: "reason_codes".to_string(),
                    message: "reject decisions require at least one reason".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Export as a kind-30175 event for publication. The event is signed by
    /// `keys`, which must be the deciding curator.
    pub fn to_event(&self, keys: &Keys) -> Result<Event, ProtocolError> {
        if keys.public_key_hex() != self.curator_pubkey {
            return Err(ProtocolError::InvalidPubkey(
                "publication key differs from curator".to_string(),
            ));
        }

        let mut tags = vec![
            vec!["d".to_string(), self.target_infohash.clone()],
            vec!["e".to_string(), self.target_event_id.clone()],
            vec!["p".to_string(), self.curator_pubkey.clone()],
            vec!["decision".to_string(), self.decision.to_string()],
        ];
        for code in &self.reason_codes {
            tags.push(vec!["reason".to_string(), code.to_string()]);
        }
        if let Some(hash) = &self.ruleset_hash {
            tags.push(vec![
                "ruleset".to_string(),
                hash.clone(),
                self.ruleset_version.clone().unwrap_or_default(),
            ]);
        }

        // Strip transient fields from the wire form.
        let mut wire = self.clone();
        wire.processed_at = None;
        wire.aggregated_decision = None;
        let content = serde_json::to_string(&wire)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        keys.sign(kinds::CURATOR_DECISION, tags, content, self.created_at)
    }

    /// Parse the publication form back into a decision.
    pub fn from_event(event: &Event) -> Result<Self, ProtocolError> {
        if event.kind != kinds::CURATOR_DECISION {
            return Err(ProtocolError::MalformedFrame(format!(
                "kind {} is not a curator decision",
                event.kind
            )));
        }
        serde_json::from_str(&event.content)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(keys: &Keys, value: DecisionValue, reasons: Vec<ReasonCode>) -> VerificationDecision {
        let mut decision = VerificationDecision {
            decision_id: String::new(),
            target_event_id: "e".repeat(64),
            target_infohash: "a".repeat(40),
            decision: value,
            reason_codes: reasons,
            ruleset_type: Some(RulesetType::Censoring),
            ruleset_version: Some("1.0".to_string()),
            ruleset_hash: Some("h".repeat(64)),
            curator_pubkey: String::new(),
            signature: String::new(),
            created_at: 1_700_000_000,
            processed_at: None,
            aggregated_decision: None,
        };
        decision.sign(keys).unwrap();
        decision
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keys = Keys::generate();
        let d = decision(&keys, DecisionValue::Reject, vec![ReasonCode::AbuseMalware]);

        assert_eq!(d.decision_id.len(), 32);
        assert_eq!(d.curator_pubkey, keys.public_key_hex());
        d.verify().unwrap();
        d.validate().unwrap();
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let keys = Keys::generate();
        let mut d = decision(&keys, DecisionValue::Reject, vec![ReasonCode::AbuseMalware]);
        d.decision = DecisionValue::Accept;
        d.reason_codes.clear();
        assert!(d.verify().is_err());
    }

    #[test]
    fn test_foreign_curator_fails_verification() {
        let keys = Keys::generate();
        let mut d = decision(&keys, DecisionValue::Reject, vec![ReasonCode::AbuseSpam]);
        d.curator_pubkey = Keys::generate().public_key_hex().to_string();
        assert!(d.verify().is_err());
    }

    #[test]
    fn test_validate_reason_consistency() {
        let keys = Keys::generate();

        let mut d = decision(&keys, DecisionValue::Accept, vec![]);
        d.validate().unwrap();
        d.reason_codes.push(ReasonCode::AbuseSpam);
        assert!(d.validate().is_err());

        let mut d = decision(&keys, DecisionValue::Reject, vec![ReasonCode::AbuseSpam]);
        d.reason_codes.clear();
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_validate_requires_targets_and_time() {
        let keys = Keys::generate();
        let mut d = decision(&keys, DecisionValue::Accept, vec![]);
        d.target_infohash = String::new();
        assert!(d.validate().is_err());

        let mut d = decision(&keys, DecisionValue::Accept, vec![]);
        d.created_at = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_decision_id_depends_on_inputs() {
        let id_a = VerificationDecision::derive_id(
            &"e".repeat(64),
            &"a".repeat(40),
            DecisionValue::Accept,
            &"p".repeat(64),
            100,
        )
        .unwrap();
        let id_b = VerificationDecision::derive_id(
            &"e".repeat(64),
            &"a".repeat(40),
            DecisionValue::Accept,
            &"p".repeat(64),
            101,
        )
        .unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(id_a.len(), 32);
    }

    #[test]
    fn test_publication_event_round_trip() {
        let keys = Keys::generate();
        let d = decision(
            &keys,
            DecisionValue::Reject,
            vec![ReasonCode::LegalDmca, ReasonCode::SemLowQuality],
        );

        let event = d.to_event(&keys).unwrap();
        event.verify().unwrap();
        assert_eq!(event.kind, kinds::CURATOR_DECISION);
        assert_eq!(event.tag_value("d"), Some(d.target_infohash.as_str()));
        assert_eq!(event.tag_value("decision"), Some("reject"));
        assert_eq!(event.tag_values("reason").len(), 2);

        let parsed = VerificationDecision::from_event(&event).unwrap();
        assert_eq!(parsed.decision_id, d.decision_id);
        assert_eq!(parsed.reason_codes, d.reason_codes);
        parsed.verify().unwrap();
    }

    #[test]
    fn test_publication_requires_matching_key() {
        let keys = Keys::generate();
        let d = decision(&keys, DecisionValue::Accept, vec![]);
        assert!(d.to_event(&Keys::generate()).is_err());
    }
}
