//! Per-origin session keys. Each relying-party origin gets its own Ed25519
//! key pair; the public key (DER/SPKI) becomes the leaf of the delegation
//! chain issued for that origin. Private key material never leaves the
//! backing store unencoded anywhere else in the crate.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use der::{Decode, SliceReader};
use ic_agent::identity::BasicIdentity;
use ic_agent::Identity;
use ic_ed25519::PublicKey;
use pkcs8::spki::SubjectPublicKeyInfoRef;
use ring::signature::Ed25519KeyPair;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::KeyValueStore;

fn store_key(origin: &str) -> String {
    format!("session:{origin}")
}

#[derive(Serialize, Deserialize)]
struct StoredSessionKey {
    version: u8,
    session_pkcs8_hex: String,
    public_key_der_hex: String,
}

pub struct SessionKeyStore {
    store: Arc<dyn KeyValueStore>,
}

impl SessionKeyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Loads the session key for `origin`, generating and persisting a fresh
    /// one on first use.
    pub async fn get_or_create(&self, origin: &str) -> Result<SessionKey> {
        if let Some(bytes) = self.store.get(&store_key(origin)).await? {
            let stored: StoredSessionKey =
                serde_json::from_slice(&bytes).context("Failed to parse stored session key")?;
            return SessionKey::from_stored(&stored);
        }
        debug!(origin, "generating session key");
        let key = SessionKey::generate()?;
        self.store
            .set(&store_key(origin), &serde_json::to_vec(&key.to_stored())?)
            .await?;
        Ok(key)
    }

    pub async fn public_key_der(&self, origin: &str) -> Result<Vec<u8>> {
        Ok(self.get_or_create(origin).await?.public_key_der)
    }

    /// Signs with the stored key; fails if no key exists for the origin.
    pub async fn sign(&self, origin: &str, message: &[u8]) -> Result<Vec<u8>> {
        let bytes = self
            .store
            .get(&store_key(origin))
            .await?
            .ok_or_else(|| anyhow!("No session key for origin {origin}"))?;
        let stored: StoredSessionKey =
            serde_json::from_slice(&bytes).context("Failed to parse stored session key")?;
        let key = SessionKey::from_stored(&stored)?;
        let pair = key.key_pair()?;
        Ok(pair.sign(message).as_ref().to_vec())
    }

    pub async fn reset(&self, origin: &str) -> Result<()> {
        self.store.delete(&store_key(origin)).await
    }
}

pub struct SessionKey {
    pkcs8: Vec<u8>,
    pub public_key_der: Vec<u8>,
}

impl SessionKey {
    pub fn generate() -> Result<Self> {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| anyhow!("Failed to generate session key"))?
            .as_ref()
            .to_vec();
        let key_pair =
            Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|_| anyhow!("Invalid session key"))?;
        let identity = BasicIdentity::from_key_pair(key_pair);
        let public_key = identity
            .public_key()
            .ok_or_else(|| anyhow!("Session public key missing"))?;
        let public_key_der = normalize_spki_key(&public_key)?;
        Ok(Self {
            pkcs8,
            public_key_der,
        })
    }

    fn from_stored(stored: &StoredSessionKey) -> Result<Self> {
        Ok(Self {
            pkcs8: hex::decode(&stored.session_pkcs8_hex).context("Failed to decode session key")?,
            public_key_der: hex::decode(&stored.public_key_der_hex)
                .context("Failed to decode session public key")?,
        })
    }

    fn to_stored(&self) -> StoredSessionKey {
        StoredSessionKey {
            version: 1,
            session_pkcs8_hex: hex::encode(&self.pkcs8),
            public_key_der_hex: hex::encode(&self.public_key_der),
        }
    }

    fn key_pair(&self) -> Result<Ed25519KeyPair> {
        Ed25519KeyPair::from_pkcs8(&self.pkcs8).map_err(|_| anyhow!("Invalid session key"))
    }

    /// The session half of a delegated identity.
    pub fn identity(&self) -> Result<BasicIdentity> {
        Ok(BasicIdentity::from_key_pair(self.key_pair()?))
    }
}

/// Accepts either SPKI DER or a raw 32-byte Ed25519 key and normalizes to
/// SPKI DER, the form delegation chains carry.
pub fn normalize_spki_key(bytes: &[u8]) -> Result<Vec<u8>> {
    if SubjectPublicKeyInfoRef::decode(&mut SliceReader::new(bytes).map_err(|_| anyhow!("parse"))?)
        .is_ok()
    {
        return Ok(bytes.to_vec());
    }
    if bytes.len() == 32 {
        let public_key = PublicKey::deserialize_raw(bytes)
            .map_err(|_| anyhow!("Invalid Ed25519 raw key"))?;
        return Ok(public_key.serialize_rfc8410_der());
    }
    Err(anyhow!("Unknown public key encoding"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn keys_are_stable_per_origin_and_distinct_across_origins() {
        let store = SessionKeyStore::new(Arc::new(MemoryStore::default()));
        let a1 = store.get_or_create("https://a.example.com").await.unwrap();
        let a2 = store.get_or_create("https://a.example.com").await.unwrap();
        let b = store.get_or_create("https://b.example.com").await.unwrap();
        assert_eq!(a1.public_key_der, a2.public_key_der);
        assert_ne!(a1.public_key_der, b.public_key_der);
    }

    #[tokio::test]
    async fn sign_requires_existing_key() {
        let store = SessionKeyStore::new(Arc::new(MemoryStore::default()));
        assert!(store.sign("https://a.example.com", b"msg").await.is_err());
        store.get_or_create("https://a.example.com").await.unwrap();
        let signature = store.sign("https://a.example.com", b"msg").await.unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[tokio::test]
    async fn reset_clears_the_key() {
        let store = SessionKeyStore::new(Arc::new(MemoryStore::default()));
        let before = store.get_or_create("https://a.example.com").await.unwrap();
        store.reset("https://a.example.com").await.unwrap();
        let after = store.get_or_create("https://a.example.com").await.unwrap();
        assert_ne!(before.public_key_der, after.public_key_der);
    }
}
