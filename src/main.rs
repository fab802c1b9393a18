//! Event Shipper - ship NDJSON events to an ingestion service
//!
//! Reads newline-delimited JSON events from stdin and ships them to a dataset,
//! or runs an APL query and prints the result.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `EVENT_SHIPPER_URL`: Ingestion service URL (default: http://localhost:8080)
//! - `EVENT_SHIPPER_TOKEN`: API token (required)
//! - `EVENT_SHIPPER_ORG_ID`: Organization ID sent with every request
//! - `EVENT_SHIPPER_BATCH_SIZE`: Events per ingest request (default: 1000)
//! - `EVENT_SHIPPER_FLUSH_INTERVAL_MS`: Max time an event waits in a batch (default: 1000)
//! - `EVENT_SHIPPER_MAX_ATTEMPTS`: Attempts per request including the first (default: 3)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_shipper::{Client, Config, Event, IngestOptions, QueryOptions};

/// Events handed to the client per `ingest` call
const DEFAULT_CHUNK_SIZE: usize = 100;

/// How long to wait for buffered events on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "event-shipper",
    about = "Ship NDJSON events to an ingestion service",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read NDJSON events from stdin and ingest them into a dataset
    Ingest {
        dataset: String,

        /// Field holding the event time
        #[arg(long)]
        timestamp_field: Option<String>,

        /// Format of the event time, if not RFC 3339
        #[arg(long)]
        timestamp_format: Option<String>,

        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Run an APL query and print the result as JSON
    Query {
        apl: String,

        #[arg(long)]
        start: Option<DateTime<Utc>>,

        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },

    /// List datasets
    Datasets,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => {
            debug!(
                url = %config.url,
                batch_size = config.batch_size,
                flush_interval_ms = config.flush_interval.as_millis() as u64,
                max_attempts = config.max_attempts,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let failures = Arc::new(AtomicU64::new(0));
    let failures_clone = failures.clone();
    let client = match Client::with_error_handler(config, move |err| {
        failures_clone.fetch_add(1, Ordering::Relaxed);
        error!(error = %err, "Failed to ship events");
    }) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create client");
            std::process::exit(1);
        }
    };

    let ok = match args.command {
        Command::Ingest {
            dataset,
            timestamp_field,
            timestamp_format,
            chunk_size,
        } => {
            let mut options = IngestOptions::new();
            options.timestamp_field = timestamp_field;
            options.timestamp_format = timestamp_format;

            run_ingest(&client, &dataset, &options, chunk_size.max(1)).await;
            failures.load(Ordering::Relaxed) == 0
        }
        Command::Query { apl, start, end } => {
            let options = QueryOptions {
                start_time: start,
                end_time: end,
            };
            match client.query(&apl, &options).await {
                Ok(result) => print_json(&result),
                Err(e) => {
                    error!(error = %e, "Query failed");
                    false
                }
            }
        }
        Command::Datasets => match client.datasets().list().await {
            Ok(datasets) => print_json(&datasets),
            Err(e) => {
                error!(error = %e, "Failed to list datasets");
                false
            }
        },
    };

    if !ok {
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Logs go to stderr so stdout stays clean for query output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to encode output");
            false
        }
    }
}

/// Ship stdin until EOF or Ctrl+C, then flush what is buffered.
async fn run_ingest(client: &Client, dataset: &str, options: &IngestOptions, chunk_size: usize) {
    info!(dataset = %dataset, "Reading events from stdin");

    tokio::select! {
        result = read_events(client, dataset, options, chunk_size) => match result {
            Ok(count) => info!(events = count, "Reached end of input"),
            Err(e) => error!(error = %e, "Failed to read stdin"),
        },
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, client.flush()).await {
        Ok(()) => info!("Flushed buffered events"),
        Err(_) => warn!("Flush timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    for limit in client.rate_limits() {
        debug!(limit = %limit, "Rate limit state");
    }
}

async fn read_events(
    client: &Client,
    dataset: &str,
    options: &IngestOptions,
    chunk_size: usize,
) -> std::io::Result<u64> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut chunk: Vec<Event> = Vec::with_capacity(chunk_size);
    let mut accepted: u64 = 0;
    let mut line_number: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Event>(line) {
            Ok(event) => {
                chunk.push(event);
                accepted += 1;
            }
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping invalid JSON line");
                continue;
            }
        }

        if chunk.len() >= chunk_size {
            client.ingest(dataset, chunk.drain(..), options);
        }
    }

    if !chunk.is_empty() {
        client.ingest(dataset, chunk, options);
    }

    Ok(accepted)
}
