//! The signer protocol surface: JSON-RPC methods from the ICRC-25 family
//! plus the legacy II authorize-client window protocol, dispatched over a
//! single message stream per connected relying party.

pub mod icrc25;
pub mod icrc27;
pub mod icrc29;
pub mod icrc34;
pub mod icrc49;
pub mod jsonrpc;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candid::Principal;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::issuer::{DEFAULT_TTL_NS, DelegationIssuer, SessionKeySource, StatusSender};
use jsonrpc::JsonRpcRequest;

#[derive(Debug)]
pub(crate) enum HandlerError {
    InvalidParams(String),
    Internal(anyhow::Error),
}

impl HandlerError {
    fn invalid_params(message: impl Into<String>) -> Self {
        HandlerError::InvalidParams(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Internal(error)
    }
}

pub(crate) type HandlerResult = Result<Value, HandlerError>;

/// One connected relying party. The origin is fixed at connection time and
/// scopes every key and delegation the session touches.
pub struct SignerSession {
    pub(crate) issuer: Arc<DelegationIssuer>,
    pub(crate) provider_key: crate::provider::ProviderKey,
    pub(crate) origin: String,
    pub(crate) ic: bool,
    pub(crate) status: StatusSender,
}

impl SignerSession {
    pub fn new(
        issuer: Arc<DelegationIssuer>,
        provider_key: crate::provider::ProviderKey,
        origin: String,
        ic: bool,
        status: StatusSender,
    ) -> Self {
        Self {
            issuer,
            provider_key,
            origin,
            ic,
            status,
        }
    }

    /// First message on connect, per the II window protocol. ICRC clients
    /// ignore it.
    pub fn hello(&self) -> Value {
        json!({ "kind": "authorize-ready" })
    }

    /// Dispatches one incoming message and returns the response, or `None`
    /// for messages that are neither JSON-RPC nor II protocol.
    pub async fn handle(&self, message: Value) -> Option<Value> {
        if message.get("jsonrpc").is_some() {
            return Some(self.handle_jsonrpc(message).await);
        }
        if message.get("kind").and_then(Value::as_str) == Some("authorize-client") {
            return Some(self.handle_authorize_client(&message).await);
        }
        // Browser extensions and the like chatter on the same channel.
        debug!("ignoring unrecognized message");
        None
    }

    async fn handle_jsonrpc(&self, message: Value) -> Value {
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(error) => {
                return jsonrpc::error_response(
                    None,
                    jsonrpc::INVALID_REQUEST,
                    format!("Invalid request: {error}"),
                );
            }
        };
        if !request.is_valid() {
            return jsonrpc::error_response(
                request.id,
                jsonrpc::INVALID_REQUEST,
                "Invalid request",
            );
        }
        debug!(method = %request.method, "signer request");
        let params = request.params.as_ref();
        let result = match request.method.as_str() {
            "icrc25_request_permissions" => Ok(icrc25::request_permissions(params)),
            "icrc25_permissions" => Ok(icrc25::permissions()),
            "icrc25_supported_standards" => Ok(icrc25::supported_standards()),
            "icrc29_status" => Ok(icrc29::status()),
            "icrc27_accounts" => icrc27::handle(self, params).await,
            "icrc34_delegation" => icrc34::handle(self, params).await,
            "icrc49_call_canister" => icrc49::handle(self, params).await,
            method => {
                return jsonrpc::error_response(
                    request.id,
                    jsonrpc::METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                );
            }
        };
        match result {
            Ok(value) => jsonrpc::result_response(request.id, value),
            Err(HandlerError::InvalidParams(message)) => {
                jsonrpc::error_response(request.id, jsonrpc::INVALID_PARAMS, message)
            }
            Err(HandlerError::Internal(error)) => {
                warn!(method = %request.method, "signer request failed: {error:#}");
                jsonrpc::error_response(
                    request.id,
                    jsonrpc::INTERNAL_ERROR,
                    format!("Internal error: {error:#}"),
                )
            }
        }
    }

    /// Legacy II window protocol: a single authorize-client message answered
    /// with authorize-client-success or authorize-error.
    async fn handle_authorize_client(&self, message: &Value) -> Value {
        match self.authorize_client(message).await {
            Ok(response) => response,
            Err(error) => {
                warn!("authorize-client failed: {error}");
                json!({ "kind": "authorize-error", "error": error })
            }
        }
    }

    async fn authorize_client(&self, message: &Value) -> Result<Value, String> {
        let session_public_key = message
            .get("sessionPublicKey")
            .and_then(Value::as_str)
            .ok_or("sessionPublicKey is required")?;
        let session_public_key = STANDARD
            .decode(session_public_key)
            .map_err(|_| "sessionPublicKey is not valid base64".to_string())?;
        let max_ttl_ns = match message.get("maxTimeToLive") {
            None | Some(Value::Null) => DEFAULT_TTL_NS,
            Some(Value::String(text)) => text
                .parse::<u64>()
                .map_err(|_| "maxTimeToLive is not a valid number".to_string())?,
            Some(Value::Number(number)) => number
                .as_u64()
                .ok_or("maxTimeToLive is not a valid number")?,
            Some(_) => return Err("maxTimeToLive must be a string or number".into()),
        };
        let targets = match message.get("targets") {
            None | Some(Value::Null) => None,
            Some(Value::Array(entries)) => Some(
                entries
                    .iter()
                    .map(|entry| {
                        entry
                            .as_str()
                            .and_then(|text| Principal::from_text(text).ok())
                            .ok_or("targets must be principal texts".to_string())
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(_) => return Err("targets must be an array".into()),
        };

        let auth = self
            .issuer
            .ensure_delegation(
                self.provider_key,
                &self.origin,
                &SessionKeySource::Provided(session_public_key),
                max_ttl_ns,
                targets,
                &self.status,
            )
            .await
            .map_err(|error| format!("{error:#}"))?;

        let delegations: Vec<Value> = auth
            .delegations
            .iter()
            .map(icrc34::signed_delegation_json)
            .collect();
        Ok(json!({
            "kind": "authorize-client-success",
            "delegations": delegations,
            "userPublicKey": STANDARD.encode(&auth.user_public_key),
            "authnMethod": auth.authn_method,
        }))
    }
}
