use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CreatedResponse {
    pub banner_id: i64,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
}

/// Raw query string parameters.
///
/// Optional numeric and boolean parameters that fail to parse are treated as absent.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(pub HashMap<String, String>);

impl QueryParams {
    pub fn string(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        let raw = self.string(name)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::info!(name, raw, "ignoring non-integer query parameter");
                None
            }
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        let raw = self.string(name)?;
        let value = parse_bool(raw);
        if value.is_none() {
            tracing::info!(name, raw, "ignoring non-boolean query parameter");
        }
        value
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
