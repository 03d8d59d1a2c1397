//! Wire event model and canonical signing form.
//!
//! An event's `id` is the SHA-256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]` (compact JSON, UTF-8);
//! its `sig` is a BIP-340 Schnorr signature of the id under the x-only
//! `pubkey`. A mismatched id or failed signature is a hard rejection
//! before any other processing.

use lazy_static::lazy_static;
use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use shared::error::ProtocolError;

lazy_static! {
    static ref SECP_VERIFY: Secp256k1<VerifyOnly> = Secp256k1::verification_only();
}

/// A signed wire event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte event id, lowercase hex
    pub id: String,

    /// 32-byte x-only author key, lowercase hex
    pub pubkey: String,

    /// Creation time, unix seconds
    pub created_at: i64,

    /// Event kind
    pub kind: u32,

    /// Ordered tag list; the first element of each tag is its name
    pub tags: Vec<Vec<String>>,

    /// Free-form content
    pub content: String,

    /// 64-byte Schnorr signature of `id`, lowercase hex
    pub sig: String,
}

impl Event {
    /// Compute the canonical id for this event's content.
    pub fn canonical_id(&self) -> Result<String, ProtocolError> {
        let canonical = serde_json::to_string(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Check that `id` matches the canonical form.
    pub fn verify_id(&self) -> Result<(), ProtocolError> {
        if self.canonical_id()? != self.id {
            return Err(ProtocolError::IdMismatch);
        }
        Ok(())
    }

    /// Check that `sig` is a valid signature of `id` under `pubkey`.
    pub fn verify_signature(&self) -> Result<(), ProtocolError> {
        let pubkey_bytes = hex::decode(&self.pubkey)
            .map_err(|_| ProtocolError::InvalidPubkey(self.pubkey.clone()))?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|_| ProtocolError::InvalidPubkey(self.pubkey.clone()))?;

        let sig_bytes = hex::decode(&self.sig).map_err(|_| ProtocolError::InvalidSignature)?;
        let sig =
            Signature::from_slice(&sig_bytes).map_err(|_| ProtocolError::InvalidSignature)?;

        let digest: [u8; 32] = hex::decode(&self.id)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::IdMismatch)?;
        let message = Message::from_digest(digest);

        SECP_VERIFY
            .verify_schnorr(&sig, &message, &pubkey)
            .map_err(|_| ProtocolError::InvalidSignature)
    }

    /// Full boundary check: canonical id, then signature.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        self.verify_id()?;
        self.verify_signature()
    }

    /// First value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// First value of the first tag matching any of the given names.
    pub fn tag_value_any(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|n| self.tag_value(n))
    }

    /// All first-values of tags with the given name.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
            .collect()
    }

    /// All tags with the given name, full slices.
    pub fn tags_named(&self, name: &str) -> Vec<&[String]> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .map(|t| t.as_slice())
            .collect()
    }
}

/// Tag names the core interprets. Anything else is preserved verbatim and
/// passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagName {
    /// Torrent infohash (`x`, `btih`, or `infohash`)
    Infohash,
    /// Display name (`name` or `title`)
    Name,
    /// Payload size in decimal bytes (`size`)
    Size,
    /// Torznab category code (`category` or `cat`)
    Category,
    /// External id, e.g. `imdb:tt0000001` (`i`)
    ExternalId,
    /// Free-form label (`t`)
    Label,
    /// File entry `["file", path, size]` (`file`)
    File,
    /// Release year (`year`)
    Year,
    /// Referenced event id (`e`)
    EventRef,
    /// Referenced public key (`p`)
    PubkeyRef,
    /// Replaceable-event identifier (`d`)
    Identifier,
    /// Relay URL (`r`)
    RelayUrl,
}

impl TagName {
    /// Wire spellings recognized for this tag, in preference order.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Infohash => &["x", "btih", "infohash"],
            Self::Name => &["name", "title"],
            Self::Size => &["size"],
            Self::Category => &["category", "cat"],
            Self::ExternalId => &["i"],
            Self::Label => &["t"],
            Self::File => &["file"],
            Self::Year => &["year"],
            Self::EventRef => &["e"],
            Self::PubkeyRef => &["p"],
            Self::Identifier => &["d"],
            Self::RelayUrl => &["r"],
        }
    }

    /// Look up the first matching value on an event.
    pub fn value<'a>(&self, event: &'a Event) -> Option<&'a str> {
        event.tag_value_any(self.aliases())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;

    fn sample_event() -> Event {
        let keys = Keys::generate();
        keys.sign(
            2003,
            vec![
                vec!["x".to_string(), "a".repeat(40)],
                vec!["name".to_string(), "Test Torrent".to_string()],
            ],
            "test content".to_string(),
            1_700_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_canonical_id_matches_signed_event() {
        let event = sample_event();
        assert_eq!(event.canonical_id().unwrap(), event.id);
        event.verify().unwrap();
    }

    #[test]
    fn test_tampered_content_fails_id_check() {
        let mut event = sample_event();
        event.content = "tampered".to_string();
        assert!(matches!(event.verify(), Err(ProtocolError::IdMismatch)));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let mut event = sample_event();
        event.sig = "00".repeat(64);
        assert!(matches!(
            event.verify(),
            Err(ProtocolError::InvalidSignature)
        ));
    }

    #[test]
    fn test_foreign_signature_fails() {
        let mut event = sample_event();
        // Re-sign the same content under a different key but keep the old pubkey.
        let other = Keys::generate();
        let resigned = other
            .sign(
                event.kind,
                event.tags.clone(),
                event.content.clone(),
                event.created_at,
            )
            .unwrap();
        event.sig = resigned.sig;
        assert!(event.verify().is_err());
    }

    #[test]
    fn test_tag_accessors() {
        let event = sample_event();
        assert_eq!(event.tag_value("x"), Some("a".repeat(40)).as_deref());
        assert_eq!(event.tag_value("name"), Some("Test Torrent"));
        assert_eq!(event.tag_value("missing"), None);
        assert_eq!(TagName::Infohash.value(&event), Some("a".repeat(40)).as_deref());
        assert_eq!(event.tag_values("x").len(), 1);
    }

    #[test]
    fn test_tag_name_aliases() {
        let keys = Keys::generate();
        let event = keys
            .sign(
                2003,
                vec![vec!["btih".to_string(), "b".repeat(40)]],
                String::new(),
                1_700_000_000,
            )
            .unwrap();
        assert_eq!(TagName::Infohash.value(&event), Some("b".repeat(40)).as_deref());
    }
}
