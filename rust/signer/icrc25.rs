//! ICRC-25 permission and standard discovery handlers.

use serde_json::{Value, json};

pub struct Standard {
    pub name: &'static str,
    pub url: &'static str,
}

pub const STANDARDS: &[Standard] = &[
    Standard {
        name: "ICRC-25",
        url: "https://github.com/dfinity/ICRC/blob/main/ICRCs/ICRC-25/ICRC-25.md",
    },
    Standard {
        name: "ICRC-27",
        url: "https://github.com/dfinity/ICRC/blob/main/ICRCs/ICRC-27/ICRC-27.md",
    },
    Standard {
        name: "ICRC-29",
        url: "https://github.com/dfinity/ICRC/blob/main/ICRCs/ICRC-29/ICRC-29.md",
    },
    Standard {
        name: "ICRC-34",
        url: "https://github.com/dfinity/ICRC/blob/main/ICRCs/ICRC-34/ICRC-34.md",
    },
    Standard {
        name: "ICRC-49",
        url: "https://github.com/dfinity/ICRC/blob/main/ICRCs/ICRC-49/ICRC-49.md",
    },
];

pub const SCOPES: &[&str] = &[
    "icrc27_accounts",
    "icrc34_delegation",
    "icrc49_call_canister",
];

/// Grants every supported scope that was asked for and marks the rest
/// denied. There is no interactive consent step beyond the provider sign-in
/// itself.
pub fn request_permissions(params: Option<&Value>) -> Value {
    let requested: Vec<String> = params
        .and_then(|p| p.get("scopes"))
        .and_then(Value::as_array)
        .map(|scopes| {
            scopes
                .iter()
                .filter_map(|scope| scope.get("method"))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let scopes: Vec<Value> = requested
        .iter()
        .map(|method| {
            let state = if SCOPES.contains(&method.as_str()) {
                "granted"
            } else {
                "denied"
            };
            json!({ "scope": { "method": method }, "state": state })
        })
        .collect();
    json!({ "scopes": scopes })
}

pub fn permissions() -> Value {
    let scopes: Vec<Value> = SCOPES
        .iter()
        .map(|method| json!({ "scope": { "method": method }, "state": "granted" }))
        .collect();
    json!({ "scopes": scopes })
}

pub fn supported_standards() -> Value {
    let standards: Vec<Value> = STANDARDS
        .iter()
        .map(|standard| json!({ "name": standard.name, "url": standard.url }))
        .collect();
    json!({ "supportedStandards": standards })
}
