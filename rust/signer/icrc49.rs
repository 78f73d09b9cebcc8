//! ICRC-49 call handler: signs and submits a canister call with the
//! delegated identity and returns the content map plus the replica
//! certificate, both as base64 CBOR.

use std::collections::BTreeMap;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candid::Principal;
use ic_agent::agent::CallResponse;
use ic_agent::agent::signed::SignedUpdate;
use serde_json::{Value, json};
use tracing::debug;

use super::{HandlerError, HandlerResult, SignerSession};
use crate::backend::create_agent;
use crate::candid_decode;
use crate::delegation::{delegated_identity, user_principal};
use crate::issuer::{DEFAULT_TTL_NS, SessionKeySource, StatusUpdate};

struct CallParams {
    canister_id: Principal,
    sender: Option<Principal>,
    method: String,
    arg: Vec<u8>,
}

fn parse_params(params: &Value) -> Result<CallParams, HandlerError> {
    let canister_id = principal_param(params, "canisterId")?;
    // Optional; when a caller does name a sender it must be the signed-in
    // principal, anything else would misattribute the call.
    let sender = match params.get("sender") {
        Some(_) => Some(principal_param(params, "sender")?),
        None => None,
    };
    let method = params
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_params("method is required"))?;
    let arg = params
        .get("arg")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_params("arg is required"))?;
    let arg = STANDARD
        .decode(arg)
        .map_err(|_| HandlerError::invalid_params("arg is not valid base64"))?;
    Ok(CallParams {
        canister_id,
        sender,
        method: method.to_string(),
        arg,
    })
}

pub(crate) async fn handle(session: &SignerSession, params: Option<&Value>) -> HandlerResult {
    let params = params.ok_or_else(|| HandlerError::invalid_params("Missing params"))?;
    let CallParams {
        canister_id,
        sender,
        method,
        arg,
    } = parse_params(params)?;
    let method = method.as_str();

    let auth = session
        .issuer
        .ensure_delegation(
            session.provider_key,
            &session.origin,
            &SessionKeySource::Stored,
            DEFAULT_TTL_NS,
            None,
            &session.status,
        )
        .await?;
    if let Some(sender) = sender {
        if user_principal(&auth)? != sender {
            return Err(HandlerError::invalid_params(
                "sender does not match the signed-in principal",
            ));
        }
    }

    // Decoding the argument is display-only; an argument the decoder cannot
    // handle must not block the call.
    match candid_decode::decode(&arg, None) {
        Ok(values) => session.status.send(StatusUpdate::SigningIn(format!(
            "Calling {method} on {canister_id} with {values:?}"
        ))),
        Err(_) => session.status.send(StatusUpdate::SigningIn(format!(
            "Calling {method} on {canister_id}"
        ))),
    }

    let stored_session = session
        .issuer
        .sessions()
        .get_or_create(&session.origin)
        .await?;
    let identity = delegated_identity(&auth, &stored_session)?;
    let agent = create_agent(identity, session.ic).await?;

    let signed = agent
        .update(&canister_id, method)
        .with_arg(arg)
        .sign()
        .context("Failed to sign canister call")?;
    let content_map = encode_content_map(&signed)?;

    let response = agent
        .update_signed(canister_id, signed.signed_update.clone())
        .await
        .context("Canister call failed")?;
    if let CallResponse::Poll(request_id) = response {
        agent
            .wait(&request_id, canister_id)
            .await
            .context("Canister call was not replied")?;
    }

    let paths = vec![vec![
        "request_status".into(),
        signed.request_id.as_slice().to_vec().into(),
    ]];
    let certificate = agent
        .read_state_raw(paths, canister_id)
        .await
        .context("Failed to read call certificate")?;
    let certificate = serde_cbor::to_vec(&certificate).context("Failed to encode certificate")?;

    debug!(%canister_id, method, "canister call replied");
    session.status.send(StatusUpdate::Ready);
    Ok(json!({
        "contentMap": STANDARD.encode(content_map),
        "certificate": STANDARD.encode(certificate),
    }))
}

fn principal_param(params: &Value, key: &str) -> Result<Principal, HandlerError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .and_then(|text| Principal::from_text(text).ok())
        .ok_or_else(|| HandlerError::invalid_params(format!("{key} must be a principal text")))
}

/// Re-encodes the signed request's content map as CBOR, matching the
/// envelope layout the replica hashed for the request id.
fn encode_content_map(signed: &SignedUpdate) -> Result<Vec<u8>, HandlerError> {
    use serde_cbor::Value as Cbor;

    let mut map = BTreeMap::new();
    let mut put = |key: &str, value: Cbor| {
        map.insert(Cbor::Text(key.to_string()), value);
    };
    put("request_type", Cbor::Text("call".into()));
    put("sender", Cbor::Bytes(signed.sender.as_slice().to_vec()));
    put("ingress_expiry", Cbor::Integer(signed.ingress_expiry as i128));
    put("canister_id", Cbor::Bytes(signed.canister_id.as_slice().to_vec()));
    put("method_name", Cbor::Text(signed.method_name.clone()));
    put("arg", Cbor::Bytes(signed.arg.clone()));
    if let Some(nonce) = &signed.nonce {
        put("nonce", Cbor::Bytes(nonce.clone()));
    }
    serde_cbor::to_vec(&Cbor::Map(map))
        .context("Failed to encode content map")
        .map_err(HandlerError::from)
}
