//! Candid client for the delegation backend canister.
//!
//! The broker talks to the backend anonymously; signed calls on behalf of
//! the user only ever happen through a delegated identity in the signer
//! layer. Wire structs live here and are converted to the domain types at
//! the boundary.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use candid::{CandidType, Decode, Encode, Principal};
use ic_agent::{
    Agent,
    identity::{AnonymousIdentity, Delegation, Identity, SignedDelegation},
};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::delegation::AuthResponse;
use crate::provider::{AuthConfig, OidcConfig, PkceConfig, ProviderKey};

const MAINNET_URL: &str = "https://ic0.app";
const LOCAL_URL: &str = "http://127.0.0.1:4943";

/// Builds an agent against mainnet or a local replica. The root key is only
/// fetched for local replicas.
pub async fn create_agent(identity: impl Identity + 'static, ic: bool) -> Result<Agent> {
    let url = if ic { MAINNET_URL } else { LOCAL_URL };
    let agent = Agent::builder()
        .with_url(url)
        .with_identity(identity)
        .build()
        .context("Failed to build agent")?;
    if !ic {
        agent
            .fetch_root_key()
            .await
            .context("Failed to fetch root key from local replica")?;
    }
    Ok(agent)
}

pub async fn create_anonymous_agent(ic: bool) -> Result<Agent> {
    create_agent(AnonymousIdentity, ic).await
}

/// Credential handed to the backend to prove the provider sign-in. Which
/// prepare operation gets called depends on the variant.
#[derive(Debug, Clone)]
pub enum Credential {
    /// A verified OIDC ID token, checked by the backend against the
    /// provider's JWKS.
    IdToken(String),
    /// PKCE authorization code plus the verifier; the backend performs the
    /// token exchange itself.
    PkceCode { code: String, verifier: String },
    /// Authorization code for providers that return a JWT from their token
    /// endpoint; the backend locks the code first so it cannot be replayed.
    Code(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, CandidType, Deserialize)]
pub struct Stats {
    pub app_count: u64,
    pub key_count: u64,
    pub login_count: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn providers(&self) -> Result<Vec<(ProviderKey, AuthConfig)>>;

    /// Registers the session key with the backend and returns the exact
    /// expiration timestamp (nanoseconds) to pass to [`Backend::get_delegation`].
    async fn prepare_delegation(
        &self,
        provider: ProviderKey,
        credential: Credential,
        origin: &str,
        session_key: &[u8],
        max_ttl_ns: u64,
        targets: Option<Vec<Principal>>,
    ) -> Result<u64>;

    async fn get_delegation(
        &self,
        provider: ProviderKey,
        origin: &str,
        session_key: &[u8],
        expire_at: u64,
        targets: Option<Vec<Principal>>,
    ) -> Result<AuthResponse>;

    async fn exchange_token(
        &self,
        provider: ProviderKey,
        code: &str,
        extra: Option<&str>,
    ) -> Result<String>;

    async fn stats(&self) -> Result<Stats>;
}

#[derive(CandidType, Deserialize)]
enum WireResult<T> {
    #[serde(rename = "ok")]
    Ok(T),
    #[serde(rename = "err")]
    Err(String),
}

impl<T> WireResult<T> {
    fn into_result(self, op: &str) -> Result<T> {
        match self {
            WireResult::Ok(value) => Ok(value),
            WireResult::Err(message) => Err(anyhow!("{op} failed: {message}")),
        }
    }
}

#[derive(CandidType, Deserialize)]
enum WireAck {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "err")]
    Err(String),
}

#[derive(CandidType, Deserialize)]
struct WirePrepared {
    #[serde(rename = "expireAt")]
    expire_at: u64,
}

#[derive(CandidType, Deserialize)]
struct WireDelegation {
    pubkey: ByteBuf,
    expiration: u64,
    targets: Option<Vec<Principal>>,
}

#[derive(CandidType, Deserialize)]
struct WireSignedDelegation {
    delegation: WireDelegation,
    signature: ByteBuf,
}

#[derive(CandidType, Deserialize)]
struct WireAuthResponse {
    kind: String,
    delegations: Vec<WireSignedDelegation>,
    #[serde(rename = "userPublicKey")]
    user_public_key: ByteBuf,
    #[serde(rename = "authnMethod")]
    authn_method: String,
}

impl From<WireAuthResponse> for AuthResponse {
    fn from(wire: WireAuthResponse) -> Self {
        AuthResponse {
            kind: wire.kind,
            user_public_key: wire.user_public_key.into_vec(),
            delegations: wire
                .delegations
                .into_iter()
                .map(|signed| SignedDelegation {
                    delegation: Delegation {
                        pubkey: signed.delegation.pubkey.into_vec(),
                        expiration: signed.delegation.expiration,
                        targets: signed.delegation.targets,
                    },
                    signature: signed.signature.into_vec(),
                })
                .collect(),
            authn_method: wire.authn_method,
        }
    }
}

#[derive(CandidType, Deserialize)]
enum WireAuthConfig {
    #[serde(rename = "oidc")]
    Oidc(WireOidcConfig),
    #[serde(rename = "pkce")]
    Pkce(WirePkceConfig),
}

#[derive(CandidType, Deserialize)]
struct WireOidcConfig {
    name: String,
    client_id: String,
    scope: String,
    authority: String,
    authorization_url: String,
    response_type: String,
    fed_cm_config_url: Option<String>,
}

#[derive(CandidType, Deserialize)]
struct WirePkceConfig {
    name: String,
    client_id: String,
    authorization_url: String,
    token_url: String,
    user_info_endpoint: String,
    scope: String,
}

impl From<WireAuthConfig> for AuthConfig {
    fn from(wire: WireAuthConfig) -> Self {
        match wire {
            WireAuthConfig::Oidc(c) => AuthConfig::Oidc(OidcConfig {
                name: c.name,
                client_id: c.client_id,
                scope: c.scope,
                authority: c.authority,
                authorization_url: c.authorization_url,
                response_type: c.response_type,
                fed_cm_config_url: c.fed_cm_config_url,
            }),
            WireAuthConfig::Pkce(c) => AuthConfig::Pkce(PkceConfig {
                name: c.name,
                client_id: c.client_id,
                authorization_url: c.authorization_url,
                token_url: c.token_url,
                user_info_endpoint: c.user_info_endpoint,
                scope: c.scope,
            }),
        }
    }
}

#[derive(CandidType, Deserialize)]
struct WireProvider {
    key: ProviderKey,
    config: WireAuthConfig,
}

/// [`Backend`] implemented over an [`Agent`] against the backend canister.
pub struct AgentBackend {
    agent: Agent,
    canister_id: Principal,
}

impl AgentBackend {
    pub fn new(agent: Agent, canister_id: Principal) -> Self {
        Self { agent, canister_id }
    }

    async fn query(&self, method: &str, args: Vec<u8>) -> Result<Vec<u8>> {
        debug!(method, "backend query");
        self.agent
            .query(&self.canister_id, method)
            .with_arg(args)
            .call()
            .await
            .with_context(|| format!("Query {method} failed"))
    }

    async fn update(&self, method: &str, args: Vec<u8>) -> Result<Vec<u8>> {
        debug!(method, "backend update");
        self.agent
            .update(&self.canister_id, method)
            .with_arg(args)
            .call_and_wait()
            .await
            .with_context(|| format!("Update {method} failed"))
    }
}

#[async_trait]
impl Backend for AgentBackend {
    async fn providers(&self) -> Result<Vec<(ProviderKey, AuthConfig)>> {
        let response = self.query("getProviders", Encode!()?).await?;
        let providers = Decode!(&response, Vec<WireProvider>)?;
        Ok(providers
            .into_iter()
            .map(|p| (p.key, p.config.into()))
            .collect())
    }

    async fn prepare_delegation(
        &self,
        provider: ProviderKey,
        credential: Credential,
        origin: &str,
        session_key: &[u8],
        max_ttl_ns: u64,
        targets: Option<Vec<Principal>>,
    ) -> Result<u64> {
        let session_key = ByteBuf::from(session_key.to_vec());
        let response = match credential {
            Credential::IdToken(id_token) => {
                let args = Encode!(
                    &provider,
                    &id_token,
                    &origin,
                    &session_key,
                    &max_ttl_ns,
                    &targets
                )?;
                self.update("prepareDelegation", args).await?
            }
            Credential::PkceCode { code, verifier } => {
                let args = Encode!(
                    &provider,
                    &code,
                    &verifier,
                    &origin,
                    &session_key,
                    &max_ttl_ns,
                    &targets
                )?;
                self.update("prepareDelegationPKCE", args).await?
            }
            Credential::Code(code) => {
                // Locking first makes the code single-use even if the
                // prepare call is retried.
                let lock = self.update("lockPKCEJWTcode", Encode!(&code)?).await?;
                if let WireAck::Err(message) = Decode!(&lock, WireAck)? {
                    return Err(anyhow!("lockPKCEJWTcode failed: {message}"));
                }
                let args = Encode!(
                    &provider,
                    &code,
                    &origin,
                    &session_key,
                    &max_ttl_ns,
                    &targets
                )?;
                self.update("prepareDelegationPKCEJWT", args).await?
            }
        };
        let prepared = Decode!(&response, WireResult<WirePrepared>)?
            .into_result("prepareDelegation")?;
        Ok(prepared.expire_at)
    }

    async fn get_delegation(
        &self,
        provider: ProviderKey,
        origin: &str,
        session_key: &[u8],
        expire_at: u64,
        targets: Option<Vec<Principal>>,
    ) -> Result<AuthResponse> {
        let session_key = ByteBuf::from(session_key.to_vec());
        let args = Encode!(&provider, &origin, &session_key, &expire_at, &targets)?;
        let response = self.query("getDelegation", args).await?;
        let auth = Decode!(&response, WireResult<WireAuthResponse>)?
            .into_result("getDelegation")?;
        Ok(auth.into())
    }

    async fn exchange_token(
        &self,
        provider: ProviderKey,
        code: &str,
        extra: Option<&str>,
    ) -> Result<String> {
        let args = Encode!(&provider, &code, &extra)?;
        let response = self.update("exchangeToken", args).await?;
        Decode!(&response, WireResult<String>)?.into_result("exchangeToken")
    }

    async fn stats(&self) -> Result<Stats> {
        let response = self.query("getStats", Encode!()?).await?;
        Ok(Decode!(&response, Stats)?)
    }
}
