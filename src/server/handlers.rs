//! Command handler infrastructure
//!
//! Parameter types for the command dispatcher. Clients are not consistent
//! about sending numbers as numbers, so numeric fields accept numeric strings
//! too.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::DispatchError;

// ============================================================================
// Request Parameter Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ViewParams {
    #[serde(deserialize_with = "lenient_i64")]
    pub start: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub end: i64,
    /// Echoed back unchanged so the client can match the reply
    pub record: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateParams {
    #[serde(deserialize_with = "lenient_i64")]
    pub rowid: i64,
    pub field: String,
    pub value: Value,
}

impl UpdateParams {
    /// Value as the provider expects it: strings verbatim, everything else as JSON text
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    /// URL-encoded `s=<terms>&p=<page>`
    pub query: String,
    #[serde(deserialize_with = "lenient_usize")]
    pub perpage: usize,
}

#[derive(Debug, Deserialize)]
pub struct LiteralQueryParams {
    pub query: String,
    #[serde(default, deserialize_with = "lenient_usize")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct TargetParams {
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct RowParams {
    #[serde(deserialize_with = "lenient_i64")]
    pub rowid: i64,
}

// ============================================================================
// Search query decoding
// ============================================================================

/// Decoded `search` query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub terms: String,
    pub page: usize,
}

impl SearchQuery {
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let mut terms = None;
        let mut page = None;

        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "s" if terms.is_none() => terms = Some(value.into_owned()),
                "p" if page.is_none() => {
                    let parsed = value.trim().parse::<usize>().map_err(|_| {
                        DispatchError::invalid_params(format!("invalid page number '{}'", value))
                    })?;
                    page = Some(parsed);
                }
                _ => {}
            }
        }

        Ok(Self {
            terms: terms.unwrap_or_default(),
            page: page.unwrap_or(1).max(1),
        })
    }

    pub fn offset(&self, perpage: usize) -> usize {
        (self.page - 1).saturating_mul(perpage)
    }
}

// ============================================================================
// Lenient numbers
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Number::deserialize(deserializer)? {
        Number::Int(n) => Ok(n),
        Number::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
        Number::Float(f) => Err(serde::de::Error::custom(format!("expected an integer, got {}", f))),
        Number::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected an integer, got '{}'", s))),
    }
}

fn lenient_usize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let n = lenient_i64(deserializer)?;
    usize::try_from(n)
        .map_err(|_| serde::de::Error::custom(format!("expected a non-negative integer, got {}", n)))
}
