//! ICRC-27 accounts handler.

use serde_json::{Value, json};

use super::{HandlerResult, SignerSession};
use crate::delegation::user_principal;
use crate::issuer::{DEFAULT_TTL_NS, SessionKeySource};

/// One account per origin: the principal derived from the delegation chain
/// for the broker's own session key.
pub(crate) async fn handle(session: &SignerSession, _params: Option<&Value>) -> HandlerResult {
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
    let owner = user_principal(&auth)?;
    Ok(json!({ "accounts": [ { "owner": owner.to_text() } ] }))
}
