//! Delegation issuance: ties the session key, the provider sign-in and the
//! backend prepare/get round trip together, with a per-origin cache in
//! front.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use candid::Principal;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::backend::{Backend, Credential};
use crate::delegation::{
    AuthResponse, DEFAULT_MIN_VALIDITY_SECS, DelegationStore, unwrap_empty_targets,
};
use crate::provider::{AuthConfig, CredentialProvider, ProviderKey, pkce_pair};
use crate::session::{SessionKeyStore, normalize_spki_key};

/// Default delegation lifetime when the caller does not ask for one:
/// 30 minutes, in nanoseconds.
pub const DEFAULT_TTL_NS: u64 = 30 * 60 * 1_000_000_000;

/// Progress events emitted while a sign-in is under way. Dropped silently
/// when nobody listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Loading(String),
    SigningIn(String),
    Ready,
    Error(String),
}

/// Which key the delegation chain is rooted in. Requests the broker signs
/// itself use the origin's stored key; delegation handoffs to a relying
/// party root the chain in the key that party supplied.
#[derive(Debug, Clone)]
pub enum SessionKeySource {
    Stored,
    Provided(Vec<u8>),
}

#[derive(Clone, Default)]
pub struct StatusSender(Option<UnboundedSender<StatusUpdate>>);

impl StatusSender {
    pub fn new(sender: UnboundedSender<StatusUpdate>) -> Self {
        Self(Some(sender))
    }

    pub fn send(&self, update: StatusUpdate) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(update);
        }
    }
}

pub struct DelegationIssuer {
    backend: Arc<dyn Backend>,
    provider: Arc<dyn CredentialProvider>,
    sessions: SessionKeyStore,
    delegations: DelegationStore,
    // One issuance at a time per origin; concurrent requests wait and then
    // pick up the cached chain instead of opening a second browser.
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DelegationIssuer {
    pub fn new(
        backend: Arc<dyn Backend>,
        provider: Arc<dyn CredentialProvider>,
        sessions: SessionKeyStore,
        delegations: DelegationStore,
    ) -> Self {
        Self {
            backend,
            provider,
            sessions,
            delegations,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &SessionKeyStore {
        &self.sessions
    }

    pub fn delegations(&self) -> &DelegationStore {
        &self.delegations
    }

    /// Returns the cached delegation chain for `origin` if one is still
    /// valid, otherwise runs a full sign-in.
    pub async fn ensure_delegation(
        &self,
        provider_key: ProviderKey,
        origin: &str,
        key: &SessionKeySource,
        max_ttl_ns: u64,
        targets: Option<Vec<Principal>>,
        status: &StatusSender,
    ) -> Result<AuthResponse> {
        let cache_key = cache_key(origin, key)?;
        if let Some(auth) = self
            .delegations
            .get(&cache_key, DEFAULT_MIN_VALIDITY_SECS)
            .await?
        {
            debug!(origin, "using cached delegation chain");
            return Ok(auth);
        }
        let lock = self.origin_lock(&cache_key);
        let result = {
            let _guard = lock.lock().await;
            // Another request may have finished the sign-in while we waited.
            match self
                .delegations
                .get(&cache_key, DEFAULT_MIN_VALIDITY_SECS)
                .await
            {
                Ok(Some(auth)) => {
                    debug!(origin, "delegation chain issued while waiting");
                    Ok(auth)
                }
                Ok(None) => {
                    self.issue(provider_key, origin, key, max_ttl_ns, targets, status)
                        .await
                }
                Err(error) => Err(error),
            }
        };
        drop(lock);
        self.prune_origin_lock(&cache_key);
        result
    }

    /// Runs one full sign-in for `origin` and caches the resulting chain.
    pub async fn issue(
        &self,
        provider_key: ProviderKey,
        origin: &str,
        key: &SessionKeySource,
        max_ttl_ns: u64,
        targets: Option<Vec<Principal>>,
        status: &StatusSender,
    ) -> Result<AuthResponse> {
        let result = self
            .issue_inner(provider_key, origin, key, max_ttl_ns, targets, status)
            .await;
        if let Err(error) = &result {
            status.send(StatusUpdate::Error(format!("{error:#}")));
        }
        result
    }

    async fn issue_inner(
        &self,
        provider_key: ProviderKey,
        origin: &str,
        key: &SessionKeySource,
        max_ttl_ns: u64,
        targets: Option<Vec<Principal>>,
        status: &StatusSender,
    ) -> Result<AuthResponse> {
        status.send(StatusUpdate::Loading("Loading...".into()));
        let config = self.provider_config(provider_key).await?;
        let session_key = match key {
            SessionKeySource::Stored => {
                self.sessions.get_or_create(origin).await?.public_key_der
            }
            SessionKeySource::Provided(der) => normalize_spki_key(der)
                .context("Unsupported session public key format")?,
        };

        status.send(StatusUpdate::SigningIn(format!(
            "Signing in with {}...",
            provider_key.display_name()
        )));
        let credential = match &config {
            AuthConfig::Oidc(oidc) => {
                // Binding the nonce to the session key ties the token to
                // this exact session.
                let nonce = hex::encode(&session_key);
                match self.provider.id_token(oidc, &nonce).await? {
                    crate::provider::OidcCredential::IdToken(token) => Credential::IdToken(token),
                    crate::provider::OidcCredential::Code(code) => Credential::Code(code),
                }
            }
            AuthConfig::Pkce(pkce) => {
                let (verifier, challenge) = pkce_pair(&session_key);
                let code = self.provider.auth_code(pkce, &challenge).await?;
                Credential::PkceCode { code, verifier }
            }
        };

        status.send(StatusUpdate::Loading("Finalizing sign-in...".into()));
        let expire_at = self
            .backend
            .prepare_delegation(
                provider_key,
                credential,
                origin,
                &session_key,
                max_ttl_ns,
                targets.clone(),
            )
            .await
            .context("Failed to prepare delegation")?;
        let auth = self
            .backend
            .get_delegation(provider_key, origin, &session_key, expire_at, targets)
            .await
            .context("Failed to fetch delegation")?;
        let auth = unwrap_empty_targets(auth);

        self.delegations.set(&cache_key(origin, key)?, &auth).await?;
        info!(origin, provider = %provider_key, "delegation chain issued");
        status.send(StatusUpdate::Ready);
        Ok(auth)
    }

    async fn provider_config(&self, provider_key: ProviderKey) -> Result<AuthConfig> {
        let providers = self
            .backend
            .providers()
            .await
            .context("Failed to fetch provider configurations")?;
        providers
            .into_iter()
            .find(|(key, _)| *key == provider_key)
            .map(|(_, config)| config)
            .ok_or_else(|| anyhow!("Provider {provider_key} is not configured on the backend"))
    }

    fn origin_lock(&self, cache_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // A lock only the map itself still references has no waiters left.
    fn prune_origin_lock(&self, cache_key: &str) {
        let mut locks = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(cache_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(cache_key);
        }
    }
}

/// Chains for the stored key are cached under the bare origin; chains rooted
/// in an external key get their own slot so they never shadow each other.
fn cache_key(origin: &str, key: &SessionKeySource) -> Result<String> {
    match key {
        SessionKeySource::Stored => Ok(origin.to_string()),
        SessionKeySource::Provided(der) => {
            let der = normalize_spki_key(der).context("Unsupported session public key format")?;
            let digest = ring::digest::digest(&ring::digest::SHA256, &der);
            Ok(format!("{origin}#{}", hex::encode(&digest.as_ref()[..8])))
        }
    }
}
