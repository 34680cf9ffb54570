//! Short-TTL response cache for request actions.
//!
//! Entries are bucketed by the action's success type and keyed by a
//! fingerprint of the request. Expiry uses `tokio::time::Instant` so paused
//! clocks in tests advance it deterministically.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use crate::http::HttpRequest;

pub(crate) type FingerprintTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Throttle settings of a request action.
#[derive(Clone)]
pub struct ThrottleSpec {
    pub duration: Duration,
    /// Default for calls that do not override it.
    pub enabled: bool,
    pub(crate) transform: Option<FingerprintTransform>,
}

impl ThrottleSpec {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            enabled: true,
            transform: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Rewrite the fingerprint source before it is stringified, e.g. to drop
    /// a volatile header.
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ThrottleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleSpec")
            .field("duration", &self.duration)
            .field("enabled", &self.enabled)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Canonical fingerprint of a request.
///
/// `serde_json` objects are ordered maps, so the same logical request always
/// serializes to the same string.
pub fn fingerprint(
    model: &str,
    success_type: &str,
    request: &HttpRequest,
    transform: Option<&FingerprintTransform>,
) -> String {
    let source = json!({
        "model": model,
        "successType": success_type,
        "uri": request.uri,
        "method": request.method.as_str(),
        "body": request.body,
        "query": request.query,
        "options": request.options,
    });
    let source = match transform {
        Some(transform) => transform(source),
        None => source,
    };
    source.to_string()
}

#[derive(Debug, Clone)]
struct ThrottleEntry {
    expiry: Instant,
    response: Value,
}

#[derive(Debug, Default)]
pub(crate) struct ThrottleCache {
    buckets: HashMap<String, HashMap<String, ThrottleEntry>>,
}

impl ThrottleCache {
    /// Cached response if present and unexpired. Expired entries are dropped.
    pub(crate) fn lookup(&mut self, bucket: &str, fingerprint: &str) -> Option<Value> {
        let entries = self.buckets.get_mut(bucket)?;
        match entries.get(fingerprint) {
            Some(entry) if entry.expiry > Instant::now() => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    pub(crate) fn store(
        &mut self,
        bucket: &str,
        fingerprint: String,
        duration: Duration,
        response: Value,
    ) {
        let entry = ThrottleEntry {
            expiry: Instant::now() + duration,
            response,
        };
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(fingerprint, entry);
    }

    pub(crate) fn invalidate(&mut self, bucket: &str, fingerprint: &str) {
        if let Some(entries) = self.buckets.get_mut(bucket) {
            entries.remove(fingerprint);
        }
    }

    pub(crate) fn clear(&mut self, bucket: &str) {
        self.buckets.remove(bucket);
    }
}
