//! Delegation chains: the normalized auth response returned by the backend,
//! its per-origin persistence with an expiry margin, and the conversion into
//! an `ic-agent` delegated identity.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use ic_agent::identity::{BasicIdentity, DelegatedIdentity, DelegationError, SignedDelegation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::normalize_spki_key;
use crate::store::KeyValueStore;

pub const DEFAULT_MIN_VALIDITY_SECS: u64 = 60;
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Delegation chain as issued by the backend, with `targets` already
/// unwrapped: an empty target list is dropped entirely so that "absent" and
/// "empty" stay distinguishable for callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub kind: String,
    pub user_public_key: Vec<u8>,
    pub delegations: Vec<SignedDelegation>,
    pub authn_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDelegation {
    pub version: u8,
    pub auth: AuthResponse,
    pub created_at_ns: u64,
}

pub fn current_time_ns() -> Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System time before UNIX_EPOCH")?;
    u64::try_from(now.as_nanos()).context("System time overflow")
}

fn store_key(origin: &str) -> String {
    format!("delegation:{origin}")
}

pub struct DelegationStore {
    store: Arc<dyn KeyValueStore>,
}

impl DelegationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Loads the chain persisted for `origin`. A chain that is absent,
    /// unreadable, or expires within the margin reads as `None`; that is the
    /// normal "needs (re-)authentication" signal, not an error.
    pub async fn get(&self, origin: &str, min_validity_secs: u64) -> Result<Option<AuthResponse>> {
        let Some(bytes) = self.store.get(&store_key(origin)).await? else {
            return Ok(None);
        };
        let stored: StoredDelegation = match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(origin, %err, "discarding unreadable stored delegation");
                self.store.delete(&store_key(origin)).await?;
                return Ok(None);
            }
        };
        let now = current_time_ns()?;
        let cutoff = now + min_validity_secs * NANOS_PER_SECOND;
        let valid = stored
            .auth
            .delegations
            .iter()
            .any(|entry| entry.delegation.expiration > cutoff);
        if !valid {
            debug!(origin, "stored delegation expired or about to expire");
            return Ok(None);
        }
        Ok(Some(stored.auth))
    }

    pub async fn set(&self, origin: &str, auth: &AuthResponse) -> Result<()> {
        let stored = StoredDelegation {
            version: 1,
            auth: auth.clone(),
            created_at_ns: current_time_ns()?,
        };
        self.store
            .set(&store_key(origin), &serde_json::to_vec(&stored)?)
            .await
    }

    pub async fn reset(&self, origin: &str) -> Result<()> {
        self.store.delete(&store_key(origin)).await
    }
}

/// Builds a delegated identity from the origin's session key and a chain.
/// Chains rooted in canister-signature or otherwise unknown key algorithms
/// cannot be verified locally; the replica still verifies them server-side,
/// so those are accepted unchecked with a warning.
pub fn delegated_identity(
    auth: &AuthResponse,
    session: &crate::session::SessionKey,
) -> Result<DelegatedIdentity> {
    let user_public_key = normalize_spki_key(&auth.user_public_key)
        .context("Unsupported user public key format")?;
    let delegations = normalize_delegations(&auth.delegations)?;
    let session_identity: BasicIdentity = session.identity()?;
    match DelegatedIdentity::new(
        user_public_key.clone(),
        Box::new(session_identity),
        delegations.clone(),
    ) {
        Ok(identity) => Ok(identity),
        Err(DelegationError::UnknownAlgorithm) => {
            warn!("delegation chain uses an unknown algorithm; skipping local verification");
            Ok(DelegatedIdentity::new_unchecked(
                user_public_key,
                Box::new(session.identity()?),
                delegations,
            ))
        }
        Err(err) => Err(err.into()),
    }
}

/// Backends sometimes return `Some([])` for unrestricted delegations; that
/// encoding is rejected by replica signature checks, so it is collapsed to
/// `None` before the chain is stored or handed out.
pub fn unwrap_empty_targets(mut auth: AuthResponse) -> AuthResponse {
    for signed in &mut auth.delegations {
        if signed
            .delegation
            .targets
            .as_ref()
            .is_some_and(|targets| targets.is_empty())
        {
            signed.delegation.targets = None;
        }
    }
    auth
}

/// The principal a relying application acts as once the chain is applied.
pub fn user_principal(auth: &AuthResponse) -> Result<ic_agent::export::Principal> {
    let user_public_key = normalize_spki_key(&auth.user_public_key)
        .context("Unsupported user public key format")?;
    Ok(ic_agent::export::Principal::self_authenticating(&user_public_key))
}

fn normalize_delegations(entries: &[SignedDelegation]) -> Result<Vec<SignedDelegation>> {
    entries
        .iter()
        .map(|entry| {
            let pubkey = normalize_spki_key(&entry.delegation.pubkey)
                .context("Unsupported delegation public key format")?;
            Ok(SignedDelegation {
                delegation: ic_agent::identity::Delegation {
                    pubkey,
                    expiration: entry.delegation.expiration,
                    targets: entry.delegation.targets.clone(),
                },
                signature: entry.signature.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ic_agent::identity::Delegation;

    fn chain_with_expiration(expiration: u64) -> AuthResponse {
        AuthResponse {
            kind: "authorize-client-success".to_string(),
            user_public_key: vec![1, 2, 3],
            delegations: vec![SignedDelegation {
                delegation: Delegation {
                    pubkey: vec![4, 5, 6],
                    expiration,
                    targets: None,
                },
                signature: vec![7, 8, 9],
            }],
            authn_method: "google".to_string(),
        }
    }

    #[tokio::test]
    async fn expiry_margin_boundary() {
        let store = DelegationStore::new(Arc::new(MemoryStore::default()));
        let now = current_time_ns().unwrap();

        // 59s of validity left: invalid under the default 60s margin.
        store
            .set("https://app.example.com", &chain_with_expiration(now + 59 * NANOS_PER_SECOND))
            .await
            .unwrap();
        assert!(store
            .get("https://app.example.com", DEFAULT_MIN_VALIDITY_SECS)
            .await
            .unwrap()
            .is_none());

        // 61s of validity left: valid.
        store
            .set("https://app.example.com", &chain_with_expiration(now + 61 * NANOS_PER_SECOND))
            .await
            .unwrap();
        assert!(store
            .get("https://app.example.com", DEFAULT_MIN_VALIDITY_SECS)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn origins_do_not_share_delegations() {
        let store = DelegationStore::new(Arc::new(MemoryStore::default()));
        let now = current_time_ns().unwrap();
        store
            .set("https://a.example.com", &chain_with_expiration(now + 3600 * NANOS_PER_SECOND))
            .await
            .unwrap();
        assert!(store
            .get("https://b.example.com", DEFAULT_MIN_VALIDITY_SECS)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reset_clears_the_chain() {
        let store = DelegationStore::new(Arc::new(MemoryStore::default()));
        let now = current_time_ns().unwrap();
        store
            .set("https://a.example.com", &chain_with_expiration(now + 3600 * NANOS_PER_SECOND))
            .await
            .unwrap();
        store.reset("https://a.example.com").await.unwrap();
        assert!(store
            .get("https://a.example.com", DEFAULT_MIN_VALIDITY_SECS)
            .await
            .unwrap()
            .is_none());
    }
}
