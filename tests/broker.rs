//! End-to-end signer protocol tests over an in-process channel, with the
//! provider round trip and the backend canister both scripted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candid::Principal;
use ic_agent::identity::{Delegation, SignedDelegation};
use serde_json::json;

use identify_broker::backend::{Backend, Credential, Stats};
use identify_broker::channel::{LocalClient, drive_session, local_pair};
use identify_broker::delegation::{AuthResponse, DelegationStore, current_time_ns};
use identify_broker::issuer::{DelegationIssuer, StatusSender};
use identify_broker::provider::{
    AuthConfig, CredentialProvider, OidcConfig, OidcCredential, PkceConfig, ProviderKey,
};
use identify_broker::session::{SessionKey, SessionKeyStore};
use identify_broker::signer::SignerSession;
use identify_broker::store::MemoryStore;

struct ScriptedProvider {
    sign_ins: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for ScriptedProvider {
    async fn id_token(&self, _config: &OidcConfig, nonce: &str) -> Result<OidcCredential> {
        self.sign_ins.fetch_add(1, Ordering::SeqCst);
        Ok(OidcCredential::IdToken(format!("jwt-{nonce}")))
    }

    async fn auth_code(&self, _config: &PkceConfig, challenge: &str) -> Result<String> {
        self.sign_ins.fetch_add(1, Ordering::SeqCst);
        Ok(format!("code-{challenge}"))
    }
}

struct ScriptedBackend {
    user_key: Vec<u8>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn providers(&self) -> Result<Vec<(ProviderKey, AuthConfig)>> {
        Ok(vec![(
            ProviderKey::Google,
            AuthConfig::Oidc(OidcConfig {
                name: "Google".into(),
                client_id: "client".into(),
                scope: "openid email".into(),
                authority: "https://accounts.google.com".into(),
                authorization_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
                response_type: "id_token".into(),
                fed_cm_config_url: None,
            }),
        )])
    }

    async fn prepare_delegation(
        &self,
        _provider: ProviderKey,
        _credential: Credential,
        _origin: &str,
        _session_key: &[u8],
        _max_ttl_ns: u64,
        _targets: Option<Vec<Principal>>,
    ) -> Result<u64> {
        Ok(current_time_ns()? + 3_600_000_000_000)
    }

    async fn get_delegation(
        &self,
        _provider: ProviderKey,
        _origin: &str,
        session_key: &[u8],
        expire_at: u64,
        targets: Option<Vec<Principal>>,
    ) -> Result<AuthResponse> {
        Ok(AuthResponse {
            kind: "authorize-client-success".into(),
            user_public_key: self.user_key.clone(),
            delegations: vec![SignedDelegation {
                delegation: Delegation {
                    pubkey: session_key.to_vec(),
                    expiration: expire_at,
                    targets,
                },
                signature: vec![0xAA; 64],
            }],
            authn_method: "google".into(),
        })
    }

    async fn exchange_token(
        &self,
        _provider: ProviderKey,
        _code: &str,
        _extra: Option<&str>,
    ) -> Result<String> {
        Ok("jwt".into())
    }

    async fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            app_count: 1,
            key_count: 2,
            login_count: 3,
        })
    }
}

struct Harness {
    client: LocalClient,
    user_key: Vec<u8>,
    provider: Arc<ScriptedProvider>,
    _driver: tokio::task::JoinHandle<()>,
}

fn start(origin: &str) -> Harness {
    let user_key = SessionKey::generate().unwrap().public_key_der;
    let provider = Arc::new(ScriptedProvider {
        sign_ins: AtomicUsize::new(0),
    });
    let store = MemoryStore::shared();
    let issuer = Arc::new(DelegationIssuer::new(
        Arc::new(ScriptedBackend {
            user_key: user_key.clone(),
        }),
        provider.clone(),
        SessionKeyStore::new(store.clone()),
        DelegationStore::new(store),
    ));
    let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = SignerSession::new(
        issuer,
        ProviderKey::Google,
        origin.to_string(),
        false,
        StatusSender::new(status_tx),
    );
    let (mut sender, mut receiver, client) = local_pair();
    let driver = tokio::spawn(async move {
        let _ = drive_session(&session, status_rx, &mut sender, &mut receiver).await;
    });
    Harness {
        client,
        user_key,
        provider,
        _driver: driver,
    }
}

async fn hello(harness: &mut Harness) {
    let first = harness.client.response().await.unwrap();
    assert_eq!(first["kind"], "authorize-ready");
}

#[tokio::test]
async fn status_handshake() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness
        .client
        .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "icrc29_status"}));
    let response = harness.client.response().await.unwrap();
    assert_eq!(response["result"], "ready");
    assert_eq!(response["id"], 1);
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness
        .client
        .send(&json!({"jsonrpc": "2.0", "id": 2, "method": "icrc99_frobnicate"}));
    let response = harness.client.response().await.unwrap();
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn malformed_frame_is_a_parse_error() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    let _ = harness.client.tx.send("{not json".to_string());
    let response = harness.client.response().await.unwrap();
    assert_eq!(response["error"]["code"], -32700);
}

#[tokio::test]
async fn supported_standards() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness
        .client
        .send(&json!({"jsonrpc": "2.0", "id": 3, "method": "icrc25_supported_standards"}));
    let response = harness.client.response().await.unwrap();
    let standards = response["result"]["supportedStandards"].as_array().unwrap();
    assert_eq!(standards.len(), 5);
    assert!(standards.iter().all(|s| s["url"].as_str().unwrap().contains("ICRC")));
}

#[tokio::test]
async fn request_permissions_grants_supported_scopes() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness.client.send(&json!({
        "jsonrpc": "2.0", "id": 4, "method": "icrc25_request_permissions",
        "params": {"scopes": [{"method": "icrc34_delegation"}]}
    }));
    let response = harness.client.response().await.unwrap();
    assert_eq!(response["result"]["scopes"][0]["state"], "granted");
}

#[tokio::test]
async fn delegation_round_trip() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    let relying_key = SessionKey::generate().unwrap().public_key_der;
    harness.client.send(&json!({
        "jsonrpc": "2.0", "id": 5, "method": "icrc34_delegation",
        "params": {
            "publicKey": STANDARD.encode(&relying_key),
            "maxTimeToLive": "1800000000000",
        }
    }));
    let response = harness.client.response().await.unwrap();
    let result = &response["result"];
    assert_eq!(
        result["publicKey"],
        json!(STANDARD.encode(&harness.user_key))
    );
    let delegation = &result["signerDelegation"][0]["delegation"];
    assert_eq!(
        delegation["pubkey"],
        json!(STANDARD.encode(&relying_key))
    );
    // nat64 nanoseconds go out as a decimal string.
    assert!(delegation["expiration"].is_string());
    assert!(delegation.get("targets").is_none());
    assert_eq!(harness.provider.sign_ins.load(Ordering::SeqCst), 1);

    // Same key again: served from the cache, no second sign-in.
    harness.client.send(&json!({
        "jsonrpc": "2.0", "id": 6, "method": "icrc34_delegation",
        "params": {"publicKey": STANDARD.encode(&relying_key)}
    }));
    let response = harness.client.response().await.unwrap();
    assert!(response.get("error").is_none());
    assert_eq!(harness.provider.sign_ins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delegation_with_missing_public_key_is_invalid_params() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness.client.send(&json!({
        "jsonrpc": "2.0", "id": 7, "method": "icrc34_delegation", "params": {}
    }));
    let response = harness.client.response().await.unwrap();
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn accounts_returns_user_principal() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness
        .client
        .send(&json!({"jsonrpc": "2.0", "id": 8, "method": "icrc27_accounts"}));
    let response = harness.client.response().await.unwrap();
    let owner = response["result"]["accounts"][0]["owner"].as_str().unwrap();
    let expected = Principal::self_authenticating(&harness.user_key);
    assert_eq!(owner, expected.to_text());
}

#[tokio::test]
async fn legacy_authorize_client() {
    let mut harness = start("https://legacy.example");
    hello(&mut harness).await;
    let relying_key = SessionKey::generate().unwrap().public_key_der;
    harness.client.send(&json!({
        "kind": "authorize-client",
        "sessionPublicKey": STANDARD.encode(&relying_key),
        "maxTimeToLive": "1800000000000",
    }));
    let response = loop {
        let frame = harness.client.rx.recv().await.unwrap();
        if frame.get("kind").is_some() {
            break frame;
        }
    };
    assert_eq!(response["kind"], "authorize-client-success");
    assert_eq!(response["authnMethod"], "google");
    assert_eq!(
        response["userPublicKey"],
        json!(STANDARD.encode(&harness.user_key))
    );
    let delegation = &response["delegations"][0]["delegation"];
    assert_eq!(delegation["pubkey"], json!(STANDARD.encode(&relying_key)));
}

#[tokio::test]
async fn legacy_authorize_client_error() {
    let mut harness = start("https://legacy.example");
    hello(&mut harness).await;
    harness.client.send(&json!({"kind": "authorize-client"}));
    let response = loop {
        let frame = harness.client.rx.recv().await.unwrap();
        if frame.get("kind").is_some() {
            break frame;
        }
    };
    assert_eq!(response["kind"], "authorize-error");
    assert!(response["error"].as_str().unwrap().contains("sessionPublicKey"));
}

#[tokio::test]
async fn status_notifications_interleave() {
    let mut harness = start("https://app.example");
    hello(&mut harness).await;
    harness
        .client
        .send(&json!({"jsonrpc": "2.0", "id": 9, "method": "icrc27_accounts"}));
    let mut frames = Vec::new();
    loop {
        let frame = harness.client.rx.recv().await.unwrap();
        let done = frame.get("result").is_some();
        frames.push(frame);
        if done {
            break;
        }
    }
    // Progress frames precede the response, never trail it.
    assert!(frames.len() > 1);
    assert_eq!(frames[0]["method"], json!("identify_status"));
    for frame in &frames[..frames.len() - 1] {
        assert_eq!(frame["method"], json!("identify_status"));
    }
    assert_eq!(frames.last().unwrap()["id"], 9);
}
