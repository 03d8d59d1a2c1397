//! Trust policies.
//!
//! A trust policy is the signed list of curators an instance listens to:
//! an allowlist with weights and approved ruleset hashes, a denylist, and
//! self-contained revocations. Approval order is denylist, then revoked,
//! then allowlist; first match wins. Exactly one policy is current at any
//! moment.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use protocol::event::Event;
use protocol::identity::Keys;
use protocol::kinds;
use shared::error::{ProtocolError, ValidationError};

/// One allowlisted curator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratorEntry {
    /// Curator pubkey, hex
    pub pubkey: String,

    /// Display alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Aggregation weight, >= 0
    pub weight: f64,

    /// Ruleset hashes this curator is approved for
    #[serde(default)]
    pub approved_ruleset_hashes: Vec<String>,

    /// When the entry was added, unix seconds
    pub added_at: i64,

    /// Operator notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A revoked curator key. Carries its own signature so it stays meaningful
/// when extracted from the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokedKey {
    pub pubkey: String,
    pub reason: String,
    pub revoked_at: i64,
    pub signature: String,
}

/// Trust status of a pubkey under a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Approved,
    Denied,
    Revoked,
    Unknown,
}

impl std::fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Denied => write!(f, "denied"),
            Self::Revoked => write!(f, "revoked"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// The signed curator trust policy of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustPolicy {
    /// Policy id
    pub policy_id: String,

    /// Version string
    pub version: String,

    /// Content hash (hex SHA-256, `hash` and `signature` cleared)
    pub hash: String,

    /// Trusted curators
    #[serde(default)]
    pub allowlist: Vec<CuratorEntry>,

    /// Hard-blocked pubkeys; checked before everything else
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Revoked keys; checked before the allowlist
    #[serde(default)]
    pub revoked: Vec<RevokedKey>,

    /// When the policy takes effect, unix seconds
    pub effective_at: i64,

    /// Optional expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    /// Signing admin pubkey
    pub admin_pubkey: String,

    /// Notary-event signature, hex
    pub signature: String,
}

impl TrustPolicy {
    /// Compute the content hash with `hash` and `signature` cleared.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut cleared = self.clone();
        cleared.hash = String::new();
        cleared.signature = String::new();

        let canonical = serde_json::to_string(&cleared)?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// The notary event carrying the content hash, unsigned.
    fn notary_event(&self, hash: &str) -> Result<Event, ProtocolError> {
        let mut event = Event {
            id: String::new(),
            pubkey: self.admin_pubkey.clone(),
            created_at: self.effective_at,
            kind: kinds::TRUST_POLICY,
            tags: vec![
                vec!["d".to_string(), "trust-policy".to_string()],
                vec!["version".to_string(), self.version.clone()],
            ],
            content: hash.to_string(),
            sig: String::new(),
        };
        event.id = event.canonical_id()?;
        Ok(event)
    }

    /// Fill in admin pubkey, content hash, and signature.
    pub fn sign(&mut self, admin: &Keys) -> Result<(), ProtocolError> {
        self.admin_pubkey = admin.public_key_hex().to_string();
        self.hash = self
            .compute_hash()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let notary = self.notary_event(&self.hash.clone())?;
        let digest: [u8; 32] = hex::decode(&notary.id)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::IdMismatch)?;
        self.signature = admin.sign_digest(digest);
        Ok(())
    }

    /// Verify the content hash and admin signature.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let computed = self
            .compute_hash()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if computed != self.hash {
            return Err(ProtocolError::IdMismatch);
        }

        let mut notary = self.notary_event(&self.hash)?;
        notary.sig = self.signature.clone();
        notary.verify_signature()
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.policy_id.trim().is_empty() {
            return Err(ValidationError::MissingField("policy_id".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(ValidationError::MissingField("version".to_string()));
        }
        if self.effective_at == 0 {
            return Err(ValidationError::MissingField("effective_at".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.allowlist {
            if entry.weight < 0.0 {
                return Err(ValidationError::OutOfRange(format!(
                    "curator {} has negative weight",
                    entry.pubkey
                )));
            }
            if !seen.insert(entry.pubkey.as_str()) {
                return Err(ValidationError::InvalidField {
                    field: "allowlist".to_string(),
                    message: format!("duplicate curator: {}", entry.pubkey),
                });
            }
        }

        Ok(())
    }

    /// Trust status of a pubkey: denylist, then revoked, then allowlist.
    pub fn status_of(&self, pubkey: &str) -> TrustStatus {
        if self.denylist.iter().any(|p| p == pubkey) {
            return TrustStatus::Denied;
        }
        if self.revoked.iter().any(|r| r.pubkey == pubkey) {
            return TrustStatus::Revoked;
        }
        if self.allowlist.iter().any(|e| e.pubkey == pubkey) {
            return TrustStatus::Approved;
        }
        TrustStatus::Unknown
    }

    /// Whether a pubkey is an approved curator.
    pub fn is_approved(&self, pubkey: &str) -> bool {
        self.status_of(pubkey) == TrustStatus::Approved
    }

    /// Aggregation weight of a curator; 1.0 when unspecified.
    pub fn weight_of(&self, pubkey: &str) -> f64 {
        self.allowlist
            .iter()
            .find(|e| e.pubkey == pubkey)
            .map(|e| e.weight)
            .unwrap_or(1.0)
    }

    /// Allowlist entry for a pubkey.
    pub fn entry_of(&self, pubkey: &str) -> Option<&CuratorEntry> {
        self.allowlist.iter().find(|e| e.pubkey == pubkey)
    }
}

/// Build a self-contained revocation signed by the admin key.
pub fn sign_revocation(
    admin: &Keys,
    pubkey: &str,
    reason: &str,
    revoked_at: i64,
) -> Result<RevokedKey, ProtocolError> {
    let notary = revocation_event(admin.public_key_hex(), pubkey, reason, revoked_at)?;
    let digest: [u8; 32] = hex::decode(&notary.id)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::IdMismatch)?;

    Ok(RevokedKey {
        pubkey: pubkey.to_string(),
        reason: reason.to_string(),
        revoked_at,
        signature: admin.sign_digest(digest),
    })
}

/// Verify a revocation against the admin pubkey.
pub fn verify_revocation(revoked: &RevokedKey, admin_pubkey: &str) -> Result<(), ProtocolError> {
    let mut notary = revocation_event(
        admin_pubkey,
        &revoked.pubkey,
        &revoked.reason,
        revoked.revoked_at,
    )?;
    notary.sig = revoked.signature.clone();
    notary.verify_signature()
}

fn revocation_event(
    admin_pubkey: &str,
    pubkey: &str,
    reason: &str,
    revoked_at: i64,
) -> Result<Event, ProtocolError> {
    let mut event = Event {
        id: String::new(),
        pubkey: admin_pubkey.to_string(),
        created_at: revoked_at,
        kind: kinds::TRUST_POLICY,
        tags: vec![
            vec!["d".to_string(), "revocation".to_string()],
            vec!["p".to_string(), pubkey.to_string()],
        ],
        content: format!("revoke:{}:{}", pubkey, reason),
        sig: String::new(),
    };
    event.id = event.canonical_id()?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pubkey: &str, weight: f64) -> CuratorEntry {
        CuratorEntry {
            pubkey: pubkey.to_string(),
            alias: None,
            weight,
            approved_ruleset_hashes: vec![],
            added_at: 1_700_000_000,
            notes: None,
        }
    }

    fn signed_policy(admin: &Keys) -> TrustPolicy {
        let mut policy = TrustPolicy {
            policy_id: "policy-1".to_string(),
            version: "1".to_string(),
            hash: String::new(),
            allowlist: vec![entry(&"1".repeat(64), 1.0), entry(&"2".repeat(64), 100.0)],
            denylist: vec!["3".repeat(64)],
            revoked: vec![],
            effective_at: 1_700_000_000,
            expires_at: None,
            admin_pubkey: String::new(),
            signature: String::new(),
        };
        policy.sign(admin).unwrap();
        policy
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let admin = Keys::generate();
        let policy = signed_policy(&admin);
        policy.verify().unwrap();
        policy.validate().unwrap();
        assert_eq!(policy.admin_pubkey, admin.public_key_hex());
    }

    #[test]
    fn test_tampered_policy_fails() {
        let admin = Keys::generate();
        let mut policy = signed_policy(&admin);
        policy.allowlist.push(entry(&"9".repeat(64), 1.0));
        assert!(policy.verify().is_err());
    }

    #[test]
    fn test_hash_survives_reserialization() {
        let admin = Keys::generate();
        let policy = signed_policy(&admin);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: TrustPolicy = serde_json::from_str(&json).unwrap();
        parsed.verify().unwrap();
        assert_eq!(parsed.hash, policy.hash);
    }

    #[test]
    fn test_approval_order_denylist_first() {
        let admin = Keys::generate();
        let mut policy = signed_policy(&admin);

        // A pubkey on every list is denied: denylist wins.
        let contested = "1".repeat(64);
        policy.denylist.push(contested.clone());
        policy.revoked.push(
            sign_revocation(&admin, &contested, "compromised", 1_700_000_100).unwrap(),
        );
        assert_eq!(policy.status_of(&contested), TrustStatus::Denied);

        // Off the denylist, revocation wins over the allowlist.
        policy.denylist.retain(|p| p != &contested);
        assert_eq!(policy.status_of(&contested), TrustStatus::Revoked);

        assert_eq!(policy.status_of(&"2".repeat(64)), TrustStatus::Approved);
        assert_eq!(policy.status_of(&"8".repeat(64)), TrustStatus::Unknown);
    }

    #[test]
    fn test_weight_lookup() {
        let admin = Keys::generate();
        let policy = signed_policy(&admin);
        assert_eq!(policy.weight_of(&"2".repeat(64)), 100.0);
        assert_eq!(policy.weight_of(&"8".repeat(64)), 1.0);
    }

    #[test]
    fn test_revocation_round_trip() {
        let admin = Keys::generate();
        let revoked =
            sign_revocation(&admin, &"5".repeat(64), "key leaked", 1_700_000_000).unwrap();

        verify_revocation(&revoked, admin.public_key_hex()).unwrap();

        let mut tampered = revoked.clone();
        tampered.reason = "innocent".to_string();
        assert!(verify_revocation(&tampered, admin.public_key_hex()).is_err());
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let admin = Keys::generate();
        let mut policy = signed_policy(&admin);
        policy.allowlist[0].weight = -1.0;
        assert!(policy.validate().is_err());
    }
}
