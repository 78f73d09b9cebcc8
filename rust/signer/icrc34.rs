//! ICRC-34 delegation handler: hands a delegation chain to the relying
//! party, rooted in the session key the party supplied.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candid::Principal;
use serde_json::{Value, json};

use super::{HandlerError, HandlerResult, SignerSession};
use crate::delegation::AuthResponse;
use crate::issuer::{DEFAULT_TTL_NS, SessionKeySource};

pub(crate) async fn handle(session: &SignerSession, params: Option<&Value>) -> HandlerResult {
    let params = params.ok_or_else(|| HandlerError::invalid_params("Missing params"))?;
    let public_key = decode_public_key(params)?;
    let targets = decode_targets(params)?;
    let max_ttl_ns = decode_max_ttl(params)?.unwrap_or(DEFAULT_TTL_NS);

    let auth = session
        .issuer
        .ensure_delegation(
            session.provider_key,
            &session.origin,
            &SessionKeySource::Provided(public_key),
            max_ttl_ns,
            targets,
            &session.status,
        )
        .await?;
    Ok(delegation_result(&auth))
}

fn decode_public_key(params: &Value) -> Result<Vec<u8>, HandlerError> {
    let encoded = params
        .get("publicKey")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_params("publicKey is required"))?;
    STANDARD
        .decode(encoded)
        .map_err(|_| HandlerError::invalid_params("publicKey is not valid base64"))
}

fn decode_targets(params: &Value) -> Result<Option<Vec<Principal>>, HandlerError> {
    let Some(targets) = params.get("targets") else {
        return Ok(None);
    };
    let entries = targets
        .as_array()
        .ok_or_else(|| HandlerError::invalid_params("targets must be an array"))?;
    let principals = entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .and_then(|text| Principal::from_text(text).ok())
                .ok_or_else(|| HandlerError::invalid_params("targets must be principal texts"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(principals))
}

/// `maxTimeToLive` is nanoseconds, sent either as a decimal string or as a
/// JSON number by older clients.
fn decode_max_ttl(params: &Value) -> Result<Option<u64>, HandlerError> {
    match params.get("maxTimeToLive") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => text
            .parse::<u64>()
            .map(Some)
            .map_err(|_| HandlerError::invalid_params("maxTimeToLive is not a valid number")),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(Some)
            .ok_or_else(|| HandlerError::invalid_params("maxTimeToLive is not a valid number")),
        Some(_) => Err(HandlerError::invalid_params(
            "maxTimeToLive must be a string or number",
        )),
    }
}

/// Expirations are nat64 nanoseconds and would lose precision as JSON
/// numbers, so they go out as decimal strings.
pub(crate) fn signed_delegation_json(signed: &ic_agent::identity::SignedDelegation) -> Value {
    let mut delegation = json!({
        "pubkey": STANDARD.encode(&signed.delegation.pubkey),
        "expiration": signed.delegation.expiration.to_string(),
    });
    if let Some(targets) = &signed.delegation.targets {
        delegation["targets"] = json!(targets.iter().map(Principal::to_text).collect::<Vec<_>>());
    }
    json!({
        "delegation": delegation,
        "signature": STANDARD.encode(&signed.signature),
    })
}

pub fn delegation_result(auth: &AuthResponse) -> Value {
    let signer_delegation: Vec<Value> =
        auth.delegations.iter().map(signed_delegation_json).collect();
    json!({
        "publicKey": STANDARD.encode(&auth.user_public_key),
        "signerDelegation": signer_delegation,
    })
}
