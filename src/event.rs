use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// A monitoring event as handed over by the host pipeline.
///
/// Only the fields the forwarder reads are modelled; anything else in the
/// host's event is ignored when parsing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingEvent {
    pub client: Client,
    pub check: Check,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Client {
    pub name: String,
    #[serde(default, deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Check {
    /// Raw check output; expected to hold a JSON object.
    pub output: String,
    #[serde(default, deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,
    /// Issue time, epoch seconds.
    pub issued: i64,
}

impl IncomingEvent {
    pub fn new(client_name: impl Into<String>, output: impl Into<String>, issued: i64) -> Self {
        Self {
            client: Client {
                name: client_name.into(),
                tags: Vec::new(),
            },
            check: Check {
                output: output.into(),
                tags: Vec::new(),
                issued,
            },
        }
    }

    pub fn with_client_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_check_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a host event from its JSON form.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Missing and `null` tag lists both mean "no tags".
fn nullable_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
