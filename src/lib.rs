//! Event Shipper Library
//!
//! Client for shipping telemetry events to an ingestion service:
//!
//! - **client**: `Client` façade with fire-and-forget `ingest`, `ingest_raw`, `flush` and `query`
//! - **batch**: Per-dataset buffers flushed on size or time, one request in flight per buffer
//! - **transport**: HTTP transport with retry, backoff and rate-limit short-circuit
//! - **limit**: Rate-limit header parsing and tracking
//! - **event**: Events, ingest options and ingest status
//! - **datasets**: Dataset management calls
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use event_shipper::{Client, IngestOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Reads EVENT_SHIPPER_URL, EVENT_SHIPPER_TOKEN, ...
//!     let client = Client::from_env().expect("Failed to create client");
//!
//!     client.ingest(
//!         "http-logs",
//!         [json!({"status": 200, "path": "/"}), json!({"status": 404, "path": "/x"})],
//!         &IngestOptions::default(),
//!     );
//!
//!     // Deliver anything still buffered before exiting
//!     client.flush().await;
//! }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod datasets;
pub mod error;
pub mod event;
pub mod limit;
pub mod transport;

pub use batch::{BatchConfig, BatchStats, Batcher, ErrorHandler, FailurePolicy, IngestSink};
pub use client::{Client, QueryOptions};
pub use config::{Config, ConfigError};
pub use datasets::{CreateDataset, Dataset, DatasetsService, UpdateDataset};
pub use error::{ClientError, Result};
pub use event::{
    BatchKey, ContentEncoding, ContentType, Event, IngestFailure, IngestOptions, IngestStatus,
};
pub use limit::{Category, RateLimit, RateLimitTracker, Scope};
pub use transport::{HttpTransport, RetryConfig};
