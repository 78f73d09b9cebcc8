//! ICRC-29 status handshake.

use serde_json::{Value, json};

/// Relying parties poll `icrc29_status` until the signer answers; "ready"
/// tells them the transport is up.
pub fn status() -> Value {
    json!("ready")
}
