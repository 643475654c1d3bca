use std::future::Future;
use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::buffers::Batch;
use crate::config::{Compression, Config};

const NDJSON: &str = "application/x-ndjson";

/// Response bodies kept on a rejection are cut to this many bytes.
const MAX_ERROR_BODY: usize = 4096;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("HTTP request failed: {0}")]
    Connection(#[source] reqwest::Error),

    #[error("bulk write timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend rejected bulk write: {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// What the backend reported for a bulk write it accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    /// Documents the backend refused individually.
    pub failed: usize,
    /// Reason given for the first refused document, if any.
    pub first_error: Option<String>,
}

/// Sends one drained batch to the indexing backend.
pub trait BulkExporter: Send + Sync + 'static {
    fn export(&self, batch: &Batch) -> impl Future<Output = Result<BulkSummary, ExportError>> + Send;
}

/// `_bulk` writer over HTTP.
pub struct HttpExporter {
    client: Client,
    bulk_url: Url,
    timeout: Duration,
    compression: Compression,
    headers: HeaderMap,
}

impl HttpExporter {
    pub fn new(config: &Config) -> Result<Self, ExportError> {
        // Already installed by the host is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ExportError::Client)?;

        Ok(Self {
            client,
            bulk_url: config.bulk_url(),
            timeout: config.timeout,
            compression: config.compression,
            headers: config.headers.clone(),
        })
    }

    async fn post(&self, body: Bytes) -> Result<BulkSummary, ExportError> {
        let body = match self.compression {
            Compression::Gzip => Bytes::from(compress_gzip(&body)?),
            Compression::None => body,
        };

        let mut req = self
            .client
            .post(self.bulk_url.clone())
            .header(CONTENT_TYPE, NDJSON);

        if self.compression == Compression::Gzip {
            req = req.header(CONTENT_ENCODING, "gzip");
        }

        let resp = req
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = resp.status();

        if !status.is_success() {
            // Keep the status even if the body never arrives.
            let text = resp.text().await.unwrap_or_default();
            return Err(ExportError::Rejected {
                status,
                body: truncate(text, MAX_ERROR_BODY),
            });
        }

        let text = resp.text().await.map_err(|e| self.classify(e))?;
        Ok(summarize(&text))
    }

    fn classify(&self, error: reqwest::Error) -> ExportError {
        if error.is_timeout() {
            ExportError::Timeout(self.timeout)
        } else {
            ExportError::Connection(error)
        }
    }
}

impl BulkExporter for HttpExporter {
    async fn export(&self, batch: &Batch) -> Result<BulkSummary, ExportError> {
        if batch.is_empty() {
            return Ok(BulkSummary::default());
        }
        self.post(batch.to_ndjson()).await
    }
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

/// Count per-document failures in a 2xx `_bulk` response. Each item is a
/// single-key object (`{"index": {...}}`) whose value carries `error` when
/// that document was refused.
fn summarize(body: &str) -> BulkSummary {
    let resp: BulkResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "unparseable bulk response body");
            return BulkSummary::default();
        }
    };
    if !resp.errors {
        return BulkSummary::default();
    }

    let mut summary = BulkSummary::default();
    for error in resp
        .items
        .iter()
        .filter_map(|item| item.values().next())
        .filter_map(|op| op.get("error"))
    {
        summary.failed += 1;
        if summary.first_error.is_none() {
            summary.first_error = Some(error_reason(error));
        }
    }
    summary
}

fn error_reason(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| other.to_string()),
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}
