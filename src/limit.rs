//! Rate-limit tracking from response headers.
//!
//! Every response from the API may carry a limit/remaining/reset header
//! triplet for the category of the request that produced it. The tracker
//! keeps the most recent record per `category:scope` so the transport can
//! refuse to send requests the server would reject anyway.
//!
//! Parsing never fails: a missing or malformed header degrades to "unknown",
//! and unknown is never treated as exhausted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::debug;

/// Request class used to select which rate-limit headers apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Api,
    Query,
    Ingest,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Query => "query",
            Category::Ingest => "ingest",
        }
    }

    fn header_names(self) -> HeaderNames {
        match self {
            Category::Ingest => HeaderNames {
                limit: "x-ingestlimit-limit",
                remaining: "x-ingestlimit-remaining",
                reset: "x-ingestlimit-reset",
                scope: None,
            },
            Category::Query => HeaderNames {
                limit: "x-querylimit-limit",
                remaining: "x-querylimit-remaining",
                reset: "x-querylimit-reset",
                scope: None,
            },
            Category::Api => HeaderNames {
                limit: "x-ratelimit-limit",
                remaining: "x-ratelimit-remaining",
                reset: "x-ratelimit-reset",
                scope: Some("x-ratelimit-scope"),
            },
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applicability axis of a rate limit. Only the general API category reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Unknown,
    User,
    Organization,
    Anonymous,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Unknown => "unknown",
            Scope::User => "user",
            Scope::Organization => "organization",
            Scope::Anonymous => "anonymous",
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Scope::User,
            "organization" => Scope::Organization,
            "anonymous" => Scope::Anonymous,
            _ => Scope::Unknown,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct HeaderNames {
    limit: &'static str,
    remaining: &'static str,
    reset: &'static str,
    scope: Option<&'static str>,
}

/// The last known rate-limit state for one category and scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub category: Category,
    pub scope: Scope,

    /// Requests allowed per window, 0 when unknown
    pub limit: u64,

    /// Requests left in the current window, `None` when unknown
    pub remaining: Option<u64>,

    /// When the current window ends
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimit {
    /// A record with every field at its safe default.
    pub fn unknown(category: Category, scope: Scope) -> Self {
        Self {
            category,
            scope,
            limit: 0,
            remaining: None,
            reset_at: None,
        }
    }

    /// Cache key for this record.
    pub fn key(&self) -> String {
        record_key(self.category, self.scope)
    }

    /// True if no requests remain and the window has not reset yet at `now`.
    pub fn is_exhausted_at(&self, now: DateTime<Utc>) -> bool {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) => now < reset_at,
            _ => false,
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} limit ({} scope)", self.category, self.scope)?;
        match self.remaining {
            Some(remaining) => write!(f, ", {}/{} remaining", remaining, self.limit)?,
            None => write!(f, ", remaining unknown")?,
        }
        if let Some(reset_at) = self.reset_at {
            write!(f, ", resets at {}", reset_at.to_rfc3339())?;
        }
        Ok(())
    }
}

fn record_key(category: Category, scope: Scope) -> String {
    format!("{}:{}", category, scope)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

fn header_epoch(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_str(headers, name)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Reads the scope for `category` from `headers`.
pub fn scope_from_headers(category: Category, headers: &HeaderMap) -> Scope {
    category
        .header_names()
        .scope
        .and_then(|name| header_str(headers, name))
        .map(Scope::parse)
        .unwrap_or(Scope::Unknown)
}

/// Builds a record from the header triplet for `category`.
///
/// Returns `None` if the response carries none of the category's headers.
/// Fields whose header is missing or not numeric keep the value from
/// `previous` when there is one, and the safe default otherwise.
pub fn record_from_headers(
    category: Category,
    scope: Scope,
    headers: &HeaderMap,
    previous: Option<&RateLimit>,
) -> Option<RateLimit> {
    let names = category.header_names();
    let present = [names.limit, names.remaining, names.reset]
        .iter()
        .any(|name| headers.contains_key(*name));
    if !present {
        return None;
    }

    let base = previous
        .cloned()
        .unwrap_or_else(|| RateLimit::unknown(category, scope));

    Some(RateLimit {
        category,
        scope,
        limit: header_u64(headers, names.limit).unwrap_or(base.limit),
        remaining: header_u64(headers, names.remaining).or(base.remaining),
        reset_at: header_epoch(headers, names.reset).or(base.reset_at),
    })
}

/// Per-client cache of the latest rate-limit record per `category:scope`.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    records: Mutex<HashMap<String, RateLimit>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, RateLimit>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the limit state carried by a response to a `category` request.
    ///
    /// Returns the stored record, or `None` if the response had no limit headers.
    pub fn update(&self, category: Category, headers: &HeaderMap) -> Option<RateLimit> {
        let scope = scope_from_headers(category, headers);
        let key = record_key(category, scope);

        let mut records = self.records();
        let record = record_from_headers(category, scope, headers, records.get(&key))?;

        debug!(
            category = %category,
            scope = %scope,
            limit = record.limit,
            remaining = ?record.remaining,
            reset_at = ?record.reset_at,
            "Updated rate limit"
        );

        records.insert(key, record.clone());
        Some(record)
    }

    /// Returns the first record for `category` that is exhausted at `now`.
    pub fn exhausted(&self, category: Category, now: DateTime<Utc>) -> Option<RateLimit> {
        self.records()
            .values()
            .find(|r| r.category == category && r.is_exhausted_at(now))
            .cloned()
    }

    pub fn is_exhausted(&self, category: Category, now: DateTime<Utc>) -> bool {
        self.exhausted(category, now).is_some()
    }

    pub fn get(&self, category: Category, scope: Scope) -> Option<RateLimit> {
        self.records().get(&record_key(category, scope)).cloned()
    }

    /// All known records, in no particular order.
    pub fn snapshot(&self) -> Vec<RateLimit> {
        self.records().values().cloned().collect()
    }
}
