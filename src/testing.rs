use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::buffers::Batch;
use crate::config::{Config, ConfigOverrides};
use crate::exporter::{BulkExporter, BulkSummary, ExportError};

/// Accepts every batch and keeps the rendered bodies.
#[derive(Clone, Default)]
pub struct RecordingExporter {
    pub bodies: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingExporter {
    pub fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().unwrap().clone()
    }
}

impl BulkExporter for RecordingExporter {
    async fn export(&self, batch: &Batch) -> Result<BulkSummary, ExportError> {
        self.bodies.lock().unwrap().push(batch.to_ndjson());
        Ok(BulkSummary::default())
    }
}

pub struct FailingExporter;

impl BulkExporter for FailingExporter {
    async fn export(&self, _batch: &Batch) -> Result<BulkSummary, ExportError> {
        Err(ExportError::Rejected {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".into(),
        })
    }
}

/// Sleeps before reporting a timeout, standing in for a hung backend.
pub struct StalledExporter(pub Duration);

impl BulkExporter for StalledExporter {
    async fn export(&self, _batch: &Batch) -> Result<BulkSummary, ExportError> {
        tokio::time::sleep(self.0).await;
        Err(ExportError::Timeout(self.0))
    }
}

/// A config pointing at `endpoint` with a short write timeout.
pub fn config_for(endpoint: &str, timeout: Duration) -> Config {
    Config::merge(ConfigOverrides {
        endpoint: Some(endpoint.to_owned()),
        timeout: Some(timeout.as_secs_f64()),
        ..Default::default()
    })
    .unwrap()
}

/// Bind to port 0 and return the OS-assigned port.
/// The listener is dropped, so nothing answers on it afterwards.
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: StatusCode,
    pub body: &'static str,
    pub delay: Duration,
}

impl StubResponse {
    pub fn ok(body: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A local stand-in for the search backend that records every request and
/// answers with a fixed response.
pub struct StubBackend {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    cancel: CancellationToken,
}

impl StubBackend {
    pub async fn start(response: StubResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(serve(
            listener,
            Arc::new(response),
            Arc::clone(&requests),
            cancel.clone(),
        ));
        Self {
            url: format!("http://{addr}"),
            requests,
            cancel,
        }
    }

    pub fn config(&self, timeout: Duration) -> Config {
        config_for(&self.url, timeout)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubBackend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle(
    req: Request<Incoming>,
    response: Arc<StubResponse>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    requests.lock().unwrap().push(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_owned(),
        headers: parts.headers,
        body,
    });

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    Ok(Response::builder()
        .status(response.status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(response.body.as_bytes())))
        .unwrap())
}

async fn serve(
    listener: TcpListener,
    response: Arc<StubResponse>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let Ok((stream, _)) = result else { continue };
                let response = Arc::clone(&response);
                let requests = Arc::clone(&requests);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&response), Arc::clone(&requests))
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}

/// Log sink for asserting on emitted `tracing` events.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Whether any line at `level` contains `needle`.
    pub fn has(&self, level: &str, needle: &str) -> bool {
        self.contents()
            .lines()
            .any(|line| line.contains(level) && line.contains(needle))
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Route this thread's `tracing` output into a buffer until the guard drops.
/// Works with `#[tokio::test]`'s single-threaded runtime, where spawned tasks
/// run on the test thread.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
