//! Instance and curator identity.
//!
//! A `Keys` holds a secp256k1 keypair; all wire signatures are BIP-340
//! Schnorr over the x-only public key. Signing is deterministic (no
//! auxiliary randomness) so the same event content always produces the
//! same signature.

use lazy_static::lazy_static;
use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use shared::error::ProtocolError;

use crate::event::Event;

lazy_static! {
    static ref SECP: Secp256k1<All> = Secp256k1::new();
}

/// A signing identity.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_hex: String,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material.
        f.debug_struct("Keys")
            .field("public", &self.public_hex)
            .finish()
    }
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let keypair = Keypair::new(&*SECP, &mut rand::thread_rng());
        Self::from_keypair(keypair)
    }

    /// Load an identity from a 32-byte hex secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(secret.trim())
            .map_err(|_| ProtocolError::InvalidPubkey("bad secret key hex".to_string()))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| ProtocolError::InvalidPubkey(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&SECP, &secret_key);
        Ok(Self::from_keypair(keypair))
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let (xonly, _parity) = keypair.x_only_public_key();
        Self {
            keypair,
            public_hex: hex::encode(xonly.serialize()),
        }
    }

    /// Hex-encoded x-only public key.
    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    /// Sign a 32-byte digest, returning the hex signature.
    pub fn sign_digest(&self, digest: [u8; 32]) -> String {
        let message = Message::from_digest(digest);
        let sig = SECP.sign_schnorr_no_aux_rand(&message, &self.keypair);
        hex::encode(sig.serialize())
    }

    /// Build and sign a complete event.
    ///
    /// Fills `pubkey`, computes the canonical `id`, and signs it.
    pub fn sign(
        &self,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        created_at: i64,
    ) -> Result<Event, ProtocolError> {
        let mut event = Event {
            id: String::new(),
            pubkey: self.public_hex.clone(),
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        };

        event.id = event.canonical_id()?;

        let digest: [u8; 32] = hex::decode(&event.id)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::IdMismatch)?;
        event.sig = self.sign_digest(digest);

        Ok(event)
    }

    /// Sign arbitrary bytes by hashing them first.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        self.sign_digest(Sha256::digest(bytes).into())
    }
}
