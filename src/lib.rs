//! Forwards monitoring events to Elasticsearch.
//!
//! Events are turned into `_bulk` action/document line pairs as they arrive,
//! held in memory, and shipped as one bulk write per flush interval. Delivery
//! is best-effort: a batch whose write fails is logged and dropped.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use sensu_elastic_forwarder::{BatchFlusher, Config, IncomingEvent};
//!
//! let config = Config::from_settings(&serde_json::json!({
//!     "elastic": {"endpoint": "http://es:9200", "flush_interval": 5}
//! }))?;
//! let flusher = BatchFlusher::new(config)?;
//! let timer = flusher.start();
//!
//! let event = IncomingEvent::new("web-01", r#"{"load": 0.4}"#, 1_709_251_200);
//! if let Err(e) = flusher.accept(&event) {
//!     eprintln!("skipped event: {e}");
//! }
//!
//! timer.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod buffers;
pub mod config;
pub mod event;
pub mod exporter;
pub mod flusher;
pub mod logging;
pub mod transform;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, ConfigOverrides};
pub use event::IncomingEvent;
pub use exporter::{BulkExporter, ExportError, HttpExporter};
pub use flusher::{BatchFlusher, FlushOutcome, FlushTimer};
pub use transform::{TransformError, WireRecord, transform};
