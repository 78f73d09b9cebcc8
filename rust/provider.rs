//! Auth provider configuration and the credential exchange.
//!
//! The broker itself never embeds provider SDKs; all it needs from a
//! provider is "produce an ID token or authorization code for this nonce or
//! challenge". That capability sits behind [`CredentialProvider`], with a
//! system-browser implementation that opens the provider's authorization URL
//! and collects the result on a localhost callback server.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    extract::{Query, State},
    response::Html,
    routing::get,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use candid::CandidType;
use reqwest::Url;
use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot},
};
use tracing::{debug, info};

/// Key of a configured provider, as the backend names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CandidType, Serialize, Deserialize)]
pub enum ProviderKey {
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "auth0")]
    Auth0,
    #[serde(rename = "zitadel")]
    Zitadel,
    #[serde(rename = "apple")]
    Apple,
    #[serde(rename = "github")]
    Github,
    #[serde(rename = "x")]
    X,
}

impl ProviderKey {
    /// Display name with the leading letter capitalized, used in status
    /// messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKey::Google => "Google",
            ProviderKey::Auth0 => "Auth0",
            ProviderKey::Zitadel => "Zitadel",
            ProviderKey::Apple => "Apple",
            ProviderKey::Github => "Github",
            ProviderKey::X => "X",
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = match self {
            ProviderKey::Google => "google",
            ProviderKey::Auth0 => "auth0",
            ProviderKey::Zitadel => "zitadel",
            ProviderKey::Apple => "apple",
            ProviderKey::Github => "github",
            ProviderKey::X => "x",
        };
        f.write_str(key)
    }
}

impl FromStr for ProviderKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderKey::Google),
            "auth0" => Ok(ProviderKey::Auth0),
            "zitadel" => Ok(ProviderKey::Zitadel),
            "apple" => Ok(ProviderKey::Apple),
            "github" => Ok(ProviderKey::Github),
            "x" | "twitter" => Ok(ProviderKey::X),
            other => Err(anyhow!("Unknown provider key: {other}")),
        }
    }
}

/// Provider configuration as a tagged union; each variant carries only the
/// fields valid for its flow family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "auth_type")]
pub enum AuthConfig {
    #[serde(rename = "OIDC")]
    Oidc(OidcConfig),
    #[serde(rename = "PKCE")]
    Pkce(PkceConfig),
}

impl AuthConfig {
    pub fn name(&self) -> &str {
        match self {
            AuthConfig::Oidc(config) => &config.name,
            AuthConfig::Pkce(config) => &config.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    pub name: String,
    pub client_id: String,
    pub scope: String,
    pub authority: String,
    pub authorization_url: String,
    /// "id_token" for the implicit family, "code" for providers whose code
    /// must be exchanged by the backend.
    pub response_type: String,
    pub fed_cm_config_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceConfig {
    pub name: String,
    pub client_id: String,
    pub authorization_url: String,
    pub token_url: String,
    pub user_info_endpoint: String,
    pub scope: String,
}

/// Credential produced by the OIDC family: either a ready ID token, or an
/// authorization code the backend has to exchange for one.
#[derive(Debug, Clone)]
pub enum OidcCredential {
    IdToken(String),
    Code(String),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// One sign-in round trip for the OIDC flow family. Idempotent per call;
    /// the caller decides whether to retry by calling again.
    async fn id_token(&self, config: &OidcConfig, nonce: &str) -> Result<OidcCredential>;

    /// One sign-in round trip for the PKCE flow family, returning the
    /// authorization code bound to `code_challenge`.
    async fn auth_code(&self, config: &PkceConfig, code_challenge: &str) -> Result<String>;
}

/// The PKCE verifier is derived from the session public key (SHA-256 hex of
/// the DER encoding) so that completing the exchange later needs no extra
/// persisted state; the challenge is base64url(SHA-256(verifier)).
pub fn pkce_pair(session_public_key_der: &[u8]) -> (String, String) {
    let verifier = hex::encode(ring::digest::digest(
        &ring::digest::SHA256,
        session_public_key_der,
    ));
    let challenge =
        URL_SAFE_NO_PAD.encode(ring::digest::digest(&ring::digest::SHA256, verifier.as_bytes()));
    (verifier, challenge)
}

fn random_state() -> Result<String> {
    let rng = ring::rand::SystemRandom::new();
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow!("Failed to generate state"))?;
    Ok(hex::encode(bytes))
}

/// Opens the system browser for the authorization round trip and collects
/// the callback on a localhost HTTP server, verifying the `state` parameter
/// generated for the attempt.
pub struct SystemBrowserProvider;

#[derive(Debug, Deserialize)]
struct CallbackParams {
    id_token: Option<String>,
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

struct CallbackState {
    sender: Mutex<Option<oneshot::Sender<CallbackParams>>>,
}

#[async_trait]
impl CredentialProvider for SystemBrowserProvider {
    async fn id_token(&self, config: &OidcConfig, nonce: &str) -> Result<OidcCredential> {
        let state = random_state()?;
        let (listener, redirect) = bind_callback().await?;
        let mut url = Url::parse(&config.authorization_url).context("Invalid authorization URL")?;
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &redirect)
            .append_pair("response_type", &config.response_type)
            .append_pair("scope", &config.scope)
            .append_pair("state", &state)
            .append_pair("nonce", nonce);
        let params = authorize_round_trip(listener, url, &state).await?;
        if let Some(id_token) = params.id_token {
            return Ok(OidcCredential::IdToken(id_token));
        }
        if let Some(code) = params.code {
            return Ok(OidcCredential::Code(code));
        }
        Err(anyhow!("Provider returned neither an id_token nor a code"))
    }

    async fn auth_code(&self, config: &PkceConfig, code_challenge: &str) -> Result<String> {
        let state = random_state()?;
        let (listener, redirect) = bind_callback().await?;
        let mut url = Url::parse(&config.authorization_url).context("Invalid authorization URL")?;
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &redirect)
            .append_pair("response_type", "code")
            .append_pair("scope", &config.scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        let params = authorize_round_trip(listener, url, &state).await?;
        params
            .code
            .ok_or_else(|| anyhow!("Authorization code not found in callback"))
    }
}

async fn bind_callback() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind localhost callback")?;
    let addr = listener.local_addr()?;
    Ok((listener, format!("http://127.0.0.1:{}/callback", addr.port())))
}

async fn authorize_round_trip(
    listener: TcpListener,
    url: Url,
    expected_state: &str,
) -> Result<CallbackParams> {
    let (sender, receiver) = oneshot::channel();
    let state = Arc::new(CallbackState {
        sender: Mutex::new(Some(sender)),
    });
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = Router::new()
        .route("/callback", get(callback_handler))
        .with_state(state);
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    open_browser_url(url.as_str())?;
    debug!(%url, "waiting for provider callback");

    // Timeouts are provider-defined; the browser may sit open indefinitely.
    let params = receiver.await.context("Provider callback channel closed")?;
    let _ = shutdown_tx.send(());
    let _ = server.await;

    if let Some(error) = params.error {
        return Err(anyhow!("Provider error: {error}"));
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err(anyhow!("Invalid state in provider callback"));
    }
    info!("provider callback received");
    Ok(params)
}

async fn callback_handler(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    // Implicit-flow responses arrive in the URL fragment, which the browser
    // never sends to the server; the page below re-posts them as a query.
    if params.id_token.is_none() && params.code.is_none() && params.error.is_none() {
        return Html(FRAGMENT_FORWARDER);
    }
    let mut sender = state.sender.lock().await;
    if let Some(tx) = sender.take() {
        let _ = tx.send(params);
        Html("<html><body>Sign-in complete. You can close this window.</body></html>")
    } else {
        Html("<html><body>Sign-in already completed.</body></html>")
    }
}

const FRAGMENT_FORWARDER: &str = r#"<html><body><script>
const params = new URLSearchParams(location.hash.slice(1));
if ([...params].length > 0) {
  location.replace("/callback?" + params.toString());
} else {
  document.body.textContent = "Authorization response not found.";
}
</script></body></html>"#;

fn open_browser_url(url: &str) -> Result<()> {
    let mut cmd = if cfg!(target_os = "macos") {
        let mut cmd = std::process::Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(target_os = "windows") {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd
    } else {
        let mut cmd = std::process::Command::new("xdg-open");
        cmd.arg(url);
        cmd
    };
    let status = cmd.status().context("Failed to open browser")?;
    if !status.success() {
        return Err(anyhow!("Failed to open browser"));
    }
    Ok(())
}
