use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "SENSU_ELASTIC_";

/// Key of the forwarder's section in the host settings document.
const SETTINGS_SECTION: &str = "elastic";

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_ENDPOINT: &str = "http://localhost:9200";
const DEFAULT_DOC_TYPE: &str = "sensu";
const DEFAULT_INDEX_PATTERN: &str = "sensu-%Y.%m.%d";
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("endpoint is not a valid http(s) URL: {0}")]
    EndpointInvalidUrl(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be a positive, finite number of seconds, got {1}")]
    InvalidDuration(&'static str, f64),

    #[error("index pattern is not a valid strftime template: {0:?}")]
    InvalidIndexPattern(String),

    #[error("document type must not be empty")]
    EmptyDocumentType,

    #[error("compression has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),

    #[error("invalid request header: {0:?}")]
    InvalidHeader(String),

    #[error("invalid elastic settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),
}

/// Resolved forwarder configuration. Built once at startup and shared
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Upper bound on a single `_bulk` write.
    pub timeout: Duration,
    pub endpoint: Url,
    /// Written to `_type` on every action line and `type` on every document.
    pub doc_type: String,
    /// strftime template for the target index name.
    pub index_pattern: String,
    pub flush_interval: Duration,
    pub compression: Compression,
    /// Sent with every bulk write.
    pub headers: HeaderMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
            doc_type: DEFAULT_DOC_TYPE.to_owned(),
            index_pattern: DEFAULT_INDEX_PATTERN.to_owned(),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            compression: Compression::None,
            headers: HeaderMap::new(),
        }
    }
}

/// Host-supplied overrides. Every field is optional; unset fields keep the
/// default.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub timeout: Option<f64>,
    pub endpoint: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: Option<String>,
    pub index: Option<String>,
    pub flush_interval: Option<f64>,
    pub compression: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
}

impl Config {
    /// Merge `overrides` over the defaults and validate the result.
    pub fn merge(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = overrides.timeout {
            config.timeout = parse_seconds("timeout", secs)?;
        }
        if let Some(raw) = overrides.endpoint {
            config.endpoint = parse_endpoint(&raw)?;
        }
        if let Some(doc_type) = overrides.doc_type {
            if doc_type.trim().is_empty() {
                return Err(ConfigError::EmptyDocumentType);
            }
            config.doc_type = doc_type;
        }
        if let Some(pattern) = overrides.index {
            config.index_pattern = parse_index_pattern(pattern)?;
        }
        if let Some(secs) = overrides.flush_interval {
            config.flush_interval = parse_seconds("flush_interval", secs)?;
        }
        if let Some(raw) = overrides.compression {
            config.compression = parse_compression(&raw)?;
        }
        if let Some(headers) = overrides.headers {
            config.headers = parse_headers(headers)?;
        }

        Ok(config)
    }

    /// Resolve from the host's settings document. Only the `elastic` object is
    /// read; a missing or non-object section means "all defaults".
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self, ConfigError> {
        let overrides = match settings.get(SETTINGS_SECTION) {
            Some(section @ serde_json::Value::Object(_)) => ConfigOverrides::deserialize(section)?,
            _ => ConfigOverrides::default(),
        };
        Self::merge(overrides)
    }

    /// Resolve from `SENSU_ELASTIC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::parse_env(&vars)
    }

    fn parse_env(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let overrides = ConfigOverrides {
            timeout: parse_env_seconds(vars, "SENSU_ELASTIC_TIMEOUT")?,
            endpoint: non_empty(vars, "SENSU_ELASTIC_ENDPOINT"),
            doc_type: non_empty(vars, "SENSU_ELASTIC_TYPE"),
            index: non_empty(vars, "SENSU_ELASTIC_INDEX"),
            flush_interval: parse_env_seconds(vars, "SENSU_ELASTIC_FLUSH_INTERVAL")?,
            compression: non_empty(vars, "SENSU_ELASTIC_COMPRESSION"),
            headers: parse_env_headers(vars),
        };
        Self::merge(overrides)
    }

    /// `{endpoint}/_bulk`, tolerating a trailing slash on the endpoint.
    pub fn bulk_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        let path = format!("{}/_bulk", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url
    }
}

fn parse_seconds(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if secs <= 0.0 {
        return Err(ConfigError::InvalidDuration(name, secs));
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::InvalidDuration(name, secs)),
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::EndpointInvalidUrl(raw.to_owned()))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        _ => Err(ConfigError::EndpointInvalidUrl(raw.to_owned())),
    }
}

fn parse_index_pattern(pattern: String) -> Result<String, ConfigError> {
    let invalid = pattern.is_empty()
        || StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error));
    if invalid {
        Err(ConfigError::InvalidIndexPattern(pattern))
    } else {
        Ok(pattern)
    }
}

fn parse_compression(raw: &str) -> Result<Compression, ConfigError> {
    match raw {
        "gzip" => Ok(Compression::Gzip),
        "none" => Ok(Compression::None),
        other => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}

/// Errors name the offending header, never its value.
fn parse_headers(pairs: BTreeMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            return Err(ConfigError::InvalidHeader(name));
        };
        let Ok(header_value) = HeaderValue::from_str(&value) else {
            return Err(ConfigError::InvalidHeader(name));
        };
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name).filter(|s| !s.is_empty()).cloned()
}

fn parse_env_seconds(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<f64>, ConfigError> {
    match vars.get(name).filter(|s| !s.is_empty()) {
        Some(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(None),
    }
}

fn parse_env_headers(vars: &HashMap<String, String>) -> Option<BTreeMap<String, String>> {
    vars.get("SENSU_ELASTIC_HEADERS")
        .filter(|s| !s.is_empty())
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    let k = k.trim();
                    let v = v.trim();
                    if k.is_empty() {
                        return None;
                    }
                    Some((k.to_owned(), v.to_owned()))
                })
                .collect()
        })
}
