//! # Idempotency Store
//!
//! Maps a caller-supplied key to the cached result of the first successful
//! execution under that key. A repeat with the same content fingerprint
//! returns the cached result; a repeat with a different fingerprint is a
//! caller bug and fails with [`IdempotencyError::Conflict`].
//!
//! Each key owns a `tokio::sync::Mutex`, so concurrent calls for one key queue
//! behind each other (the operation runs once) while other keys proceed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{chrono_duration, Clock};
use crate::config::IdempotencyConfig;
use crate::metrics;

#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    #[error("Idempotency key '{key}' reused with different content (stored {stored_fingerprint}, got {fingerprint})")]
    Conflict {
        key: String,
        stored_fingerprint: String,
        fingerprint: String,
    },

    #[error("Operation for idempotency key '{key}' is currently being processed")]
    InProgress { key: String },

    #[error("Failed to serialize result for idempotency key '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> IdempotencyError<E> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, IdempotencyError::Conflict { .. })
    }
}

/// Result of the first successful execution under a key. Never updated in
/// place; replaced only once expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub content_fingerprint: String,
    pub cached_result: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

type Slot = Arc<Mutex<Option<IdempotencyRecord>>>;

#[derive(Debug)]
pub struct IdempotencyStore {
    records: DashMap<String, Slot>,
    ttl: Duration,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl IdempotencyStore {
    pub fn new(config: &IdempotencyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            ttl: config.ttl(),
            lock_timeout: config.lock_timeout(),
            clock,
        }
    }

    fn holds_slot(&self, key: &str, slot: &Slot) -> bool {
        self.records
            .get(key)
            .map(|entry| Arc::ptr_eq(entry.value(), slot))
            .unwrap_or(false)
    }

    fn slot(&self, key: &str) -> Slot {
        if let Some(existing) = self.records.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)));
        Arc::clone(entry.value())
    }

    /// Run `operation` at most once per live `(key, fingerprint)`.
    ///
    /// Failed operations are not cached, so the next call under the same key
    /// executes again.
    pub async fn execute_once<T, E, F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        operation: F,
    ) -> Result<T, IdempotencyError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        let mut guard = loop {
            let slot = self.slot(key);
            let guard = match tokio::time::timeout_at(deadline, Arc::clone(&slot).lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(
                        idempotency_key = %key,
                        lock_timeout_ms = self.lock_timeout.as_millis() as u64,
                        "Idempotent operation still in progress"
                    );
                    return Err(IdempotencyError::InProgress {
                        key: key.to_string(),
                    });
                }
            };
            // A purge or invalidate may have dropped the slot before we locked it
            if self.holds_slot(key, &slot) {
                break guard;
            }
            debug!(idempotency_key = %key, "Idempotency slot replaced while waiting, retrying");
        };

        let now = self.clock.now();
        if let Some(record) = guard.as_ref().filter(|record| record.is_live(now)) {
            if record.content_fingerprint != fingerprint {
                warn!(
                    idempotency_key = %key,
                    stored_fingerprint = %record.content_fingerprint,
                    fingerprint = %fingerprint,
                    "🚨 Idempotency key reused with different content"
                );
                return Err(IdempotencyError::Conflict {
                    key: key.to_string(),
                    stored_fingerprint: record.content_fingerprint.clone(),
                    fingerprint: fingerprint.to_string(),
                });
            }

            metrics::idempotency_hits_total().add(1, &[KeyValue::new("outcome", "cache_hit")]);
            debug!(idempotency_key = %key, "Returning cached idempotent result");
            return serde_json::from_value(record.cached_result.clone()).map_err(|source| {
                IdempotencyError::Serialization {
                    key: key.to_string(),
                    source,
                }
            });
        }

        let result = operation().await.map_err(IdempotencyError::OperationFailed)?;
        let cached_result =
            serde_json::to_value(&result).map_err(|source| IdempotencyError::Serialization {
                key: key.to_string(),
                source,
            })?;

        let expires_at = now + chrono_duration(self.ttl);
        *guard = Some(IdempotencyRecord {
            key: key.to_string(),
            content_fingerprint: fingerprint.to_string(),
            cached_result,
            created_at: now,
            expires_at,
        });
        debug!(idempotency_key = %key, expires_at = %expires_at, "Stored idempotent result");

        Ok(result)
    }

    /// Live record for `key`, if any
    pub async fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        let slot = self.records.get(key).map(|entry| Arc::clone(entry.value()))?;
        let now = self.clock.now();
        let guard = slot.lock().await;
        guard.as_ref().filter(|record| record.is_live(now)).cloned()
    }

    /// Drop the record for `key`. A key whose operation is still running is
    /// left alone and reported as not invalidated.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self
            .records
            .remove_if(key, |_, slot| slot.try_lock().is_ok())
            .is_some();
        if removed {
            info!(idempotency_key = %key, "Invalidated idempotency record");
        } else if self.records.contains_key(key) {
            warn!(idempotency_key = %key, "Idempotent operation in progress, not invalidated");
        }
        removed
    }

    /// Drop empty and expired slots; slots held by a running operation are kept
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard.as_ref().map(|r| r.is_live(now)).unwrap_or(false),
            Err(_) => true,
        });
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired idempotency records");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// First 16 hex chars of the SHA-256 of the value's canonical JSON.
///
/// `serde_json::Value` objects keep keys sorted, so logically equal payloads
/// fingerprint identically regardless of field order.
pub fn content_fingerprint<T: Serialize + ?Sized>(content: &T) -> String {
    let canonical = serde_json::to_value(content)
        .map(|value| value.to_string())
        .unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(16);
    encoded
}
