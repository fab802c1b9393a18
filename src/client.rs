//! Client façade for shipping events and querying them back.
//!
//! [`Client::ingest`] is fire-and-forget: events are buffered per dataset
//! and sent in the background, and any failure is reported to the error
//! handler instead of the caller. Call [`Client::flush`] before shutting
//! down to deliver whatever is still buffered.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::batch::{Batcher, ErrorHandler, IngestSink};
use crate::config::Config;
use crate::datasets::DatasetsService;
use crate::error::{ClientError, Result};
use crate::event::{
    encode_ndjson, inject_timestamp, ContentEncoding, ContentType, Event, IngestOptions,
    IngestStatus,
};
use crate::limit::{Category, RateLimit};
use crate::transport::{HttpTransport, TransportRequest};

/// Time range for a query. Unset bounds are left to the server.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    apl: &'a str,
    #[serde(flatten)]
    options: &'a QueryOptions,
}

fn ingest_path(dataset: &str) -> String {
    format!("/v1/datasets/{}/ingest", urlencoding::encode(dataset))
}

/// Sends events to the ingest endpoint.
struct Ingester {
    transport: Arc<HttpTransport>,
}

impl Ingester {
    async fn ingest_raw(
        &self,
        dataset: &str,
        payload: Bytes,
        content_type: ContentType,
        content_encoding: ContentEncoding,
        options: &IngestOptions,
    ) -> Result<IngestStatus> {
        let mut request =
            TransportRequest::new(Method::POST, ingest_path(dataset), Category::Ingest)
                .query(options.query_pairs())
                .body(payload, content_type.as_str());
        if content_encoding != ContentEncoding::Identity {
            request = request.content_encoding(content_encoding.as_str());
        }

        let status = self
            .transport
            .send::<IngestStatus>(&request)
            .await?
            .unwrap_or_default();

        if status.failed > 0 {
            warn!(
                dataset = %dataset,
                ingested = status.ingested,
                failed = status.failed,
                "Server rejected some events"
            );
        }

        Ok(status)
    }
}

#[async_trait]
impl IngestSink for Ingester {
    async fn ingest_events(
        &self,
        dataset: &str,
        events: &[Event],
        options: &IngestOptions,
    ) -> Result<IngestStatus> {
        let payload = encode_ndjson(events)?;
        self.ingest_raw(
            dataset,
            payload,
            ContentType::NdJson,
            ContentEncoding::Identity,
            options,
        )
        .await
    }
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &ClientError| {
        error!(error = %err, "Failed to ship events");
    })
}

/// Client for the ingestion API.
///
/// # Example
///
/// ```no_run
/// use event_shipper::{Client, Config, IngestOptions};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() {
///     let client = Client::new(Config::new("my-token")).expect("Failed to create client");
///
///     client.ingest("logs", [json!({"message": "hello"})], &IngestOptions::default());
///
///     client.flush().await;
/// }
/// ```
pub struct Client {
    transport: Arc<HttpTransport>,
    ingester: Arc<Ingester>,

    /// `None` when batching is disabled
    batcher: Option<Batcher>,

    /// Direct ingests still running, awaited by `flush`
    direct: Mutex<JoinSet<()>>,

    on_error: ErrorHandler,
}

impl Client {
    /// Create a client whose background failures are logged.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the token is empty or the HTTP client
    /// cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        Self::build(config, default_error_handler())
    }

    /// Create a client that reports background failures to `handler`.
    pub fn with_error_handler(
        config: Config,
        handler: impl Fn(&ClientError) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::build(config, Arc::new(handler))
    }

    /// Create a client from `EVENT_SHIPPER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Config::from_env().map_err(|e| ClientError::Config(e.to_string()))?;
        Self::new(config)
    }

    fn build(config: Config, on_error: ErrorHandler) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(ClientError::Config("token must not be empty".to_string()));
        }

        let transport = Arc::new(HttpTransport::new(&config)?);
        let ingester = Arc::new(Ingester {
            transport: Arc::clone(&transport),
        });

        let batcher = config.batching.then(|| {
            Batcher::new(
                config.batch_config(),
                ingester.clone(),
                Arc::clone(&on_error),
            )
        });

        debug!(
            url = %config.url,
            batching = config.batching,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Client created"
        );

        Ok(Self {
            transport,
            ingester,
            batcher,
            direct: Mutex::new(JoinSet::new()),
            on_error,
        })
    }

    fn direct(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.direct.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue events for `dataset`.
    ///
    /// Events without a timestamp get the current time. Returns immediately;
    /// delivery failures go to the error handler. Outside a Tokio runtime the
    /// events are dropped and the handler receives `ClientError::Runtime`.
    pub fn ingest(
        &self,
        dataset: &str,
        events: impl IntoIterator<Item = Event>,
        options: &IngestOptions,
    ) {
        if let Err(e) = tokio::runtime::Handle::try_current() {
            let err = ClientError::Runtime(e.to_string());
            warn!(dataset = %dataset, error = %err, "Dropping events");
            (self.on_error)(&err);
            return;
        }

        let now = Utc::now();
        let field = options.effective_timestamp_field();
        let events: Vec<Event> = events
            .into_iter()
            .map(|mut event| {
                inject_timestamp(&mut event, field, now);
                event
            })
            .collect();

        if events.is_empty() {
            return;
        }

        match &self.batcher {
            Some(batcher) => batcher.push(dataset, events, options),
            None => self.spawn_direct(dataset, events, options),
        }
    }

    fn spawn_direct(&self, dataset: &str, events: Vec<Event>, options: &IngestOptions) {
        let ingester = Arc::clone(&self.ingester);
        let on_error = Arc::clone(&self.on_error);
        let dataset = dataset.to_string();
        let options = options.clone();

        let mut direct = self.direct();
        // Reap finished ingests so the set does not grow without bound.
        while direct.try_join_next().is_some() {}

        direct.spawn(async move {
            if let Err(err) = ingester.ingest_events(&dataset, &events, &options).await {
                warn!(dataset = %dataset, batch_size = events.len(), error = %err, "Failed to ingest events");
                on_error(&err);
            }
        });
    }

    /// Send a pre-encoded payload straight to `dataset`.
    ///
    /// Never fails: on error the handler is notified and an empty status
    /// is returned.
    pub async fn ingest_raw(
        &self,
        dataset: &str,
        payload: impl Into<Bytes>,
        content_type: ContentType,
        content_encoding: ContentEncoding,
        options: &IngestOptions,
    ) -> IngestStatus {
        match self
            .ingester
            .ingest_raw(dataset, payload.into(), content_type, content_encoding, options)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                warn!(dataset = %dataset, error = %err, "Failed to ingest payload");
                (self.on_error)(&err);
                IngestStatus::default()
            }
        }
    }

    /// Deliver everything buffered and wait for pending direct ingests.
    ///
    /// Resolves once every batch has settled, whether or not its flush
    /// succeeded.
    pub async fn flush(&self) {
        if let Some(batcher) = &self.batcher {
            let results = batcher.flush_all().await;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            debug!(batches = results.len(), failed = failed, "Flushed all batches");
        }

        let mut pending = std::mem::take(&mut *self.direct());
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Direct ingest task panicked");
            }
        }
    }

    /// Run an APL query and return the raw result.
    pub async fn query(&self, apl: &str, options: &QueryOptions) -> Result<serde_json::Value> {
        let request = TransportRequest::new(Method::POST, "/v1/datasets/_apl", Category::Query)
            .query(vec![("format".to_string(), "tabular".to_string())])
            .json_body(&QueryRequest { apl, options })?;

        debug!(apl = %apl, "Running query");
        Ok(self
            .transport
            .send::<serde_json::Value>(&request)
            .await?
            .unwrap_or(serde_json::Value::Null))
    }

    /// Dataset management operations sharing this client's transport.
    pub fn datasets(&self) -> DatasetsService {
        DatasetsService::new(Arc::clone(&self.transport))
    }

    /// Rate-limit state seen so far.
    pub fn rate_limits(&self) -> Vec<RateLimit> {
        self.transport.rate_limits().snapshot()
    }

    /// The batch queue, when batching is enabled.
    pub fn batcher(&self) -> Option<&Batcher> {
        self.batcher.as_ref()
    }
}
