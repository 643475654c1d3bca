use std::fmt::Write as _;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::Config;
use crate::event::IncomingEvent;

const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed check output: {reason}")]
    MalformedPayload { reason: String },

    #[error("check output is empty")]
    EmptyPayload,

    #[error("issued timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("index pattern {0:?} could not be formatted")]
    IndexPattern(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One serialized `_bulk` line, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord(Bytes);

impl WireRecord {
    fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(|v| Self(Bytes::from(v)))
    }

    #[cfg(test)]
    pub(crate) fn raw(line: &str) -> Self {
        Self(Bytes::copy_from_slice(line.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Serialize)]
struct ActionLine<'a> {
    index: IndexAction<'a>,
}

/// `_id` and `_routing` are always null so the backend assigns ids and
/// routes by default.
#[derive(Serialize)]
struct IndexAction<'a> {
    #[serde(rename = "_id")]
    id: Option<&'a str>,
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_type")]
    doc_type: &'a str,
    #[serde(rename = "_routing")]
    routing: Option<&'a str>,
}

/// Turn one event into its `(action, document)` line pair.
///
/// `now` selects the target index through `config.index_pattern`. Nothing is
/// produced when the check output does not hold a JSON object.
pub fn transform(
    event: &IncomingEvent,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<(WireRecord, WireRecord), TransformError> {
    let mut document = parse_payload(&event.check.output)?;

    let issued = DateTime::from_timestamp(event.check.issued, 0)
        .ok_or(TransformError::InvalidTimestamp(event.check.issued))?;

    let action = ActionLine {
        index: IndexAction {
            id: None,
            index: index_name(&config.index_pattern, now)?,
            doc_type: &config.doc_type,
            routing: None,
        },
    };

    let tags: Vec<Value> = event
        .client
        .tags
        .iter()
        .chain(&event.check.tags)
        .cloned()
        .map(Value::String)
        .collect();

    // Derived fields overwrite anything the check emitted under the same key.
    document.insert("@version".into(), SCHEMA_VERSION.into());
    document.insert(
        "@timestamp".into(),
        issued.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
    );
    document.insert("sensuclient".into(), event.client.name.clone().into());
    document.insert("tags".into(), Value::Array(tags));
    document.insert("type".into(), config.doc_type.clone().into());

    Ok((WireRecord::encode(&action)?, WireRecord::encode(&document)?))
}

fn parse_payload(output: &str) -> Result<Map<String, Value>, TransformError> {
    if output.trim().is_empty() {
        return Err(TransformError::EmptyPayload);
    }
    match serde_json::from_str::<Value>(output) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Err(TransformError::EmptyPayload),
        Ok(other) => Err(TransformError::MalformedPayload {
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => Err(TransformError::MalformedPayload {
            reason: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn index_name(pattern: &str, now: DateTime<Utc>) -> Result<String, TransformError> {
    let mut name = String::new();
    write!(name, "{}", now.format(pattern))
        .map_err(|_| TransformError::IndexPattern(pattern.to_owned()))?;
    Ok(name)
}
