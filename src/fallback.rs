//! # Fallback Cache
//!
//! Last good result per key, served flagged as stale when a guarded call
//! cannot reach its dependency. Entries older than `max_stale` are never
//! served and are dropped by [`FallbackCache::purge_stale`]. The cache holds at
//! most `max_entries` keys; storing past that evicts the oldest entry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{elapsed_between, Clock};
use crate::config::FallbackConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
}

/// A value returned by a fallback-aware call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Served<T> {
    pub value: T,
    /// True when the value came from the cache instead of the dependency
    pub is_stale: bool,
    /// When a stale value was originally produced
    pub stored_at: Option<DateTime<Utc>>,
}

impl<T> Served<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            is_stale: false,
            stored_at: None,
        }
    }

    pub fn stale(value: T, stored_at: DateTime<Utc>) -> Self {
        Self {
            value,
            is_stale: true,
            stored_at: Some(stored_at),
        }
    }
}

#[derive(Debug)]
pub struct FallbackCache {
    entries: DashMap<String, FallbackEntry>,
    max_stale: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl FallbackCache {
    pub fn new(config: &FallbackConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_stale: config.max_stale(),
            max_entries: config.max_entries,
            clock,
        }
    }

    /// Replace the last good result for `key`
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key.to_string(),
            FallbackEntry {
                value,
                stored_at: self.clock.now(),
            },
        );
        Ok(())
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            debug!(fallback_key = %key, "Evicted oldest fallback entry");
        }
    }

    /// The cached result for `key` if it is still young enough to serve
    pub fn lookup(&self, key: &str) -> Option<FallbackEntry> {
        let entry = self.entries.get(key)?;
        let age = elapsed_between(entry.stored_at, self.clock.now());
        if age > self.max_stale {
            debug!(
                fallback_key = %key,
                age_secs = age.as_secs(),
                max_stale_secs = self.max_stale.as_secs(),
                "Fallback entry too stale to serve"
            );
            return None;
        }
        Some(entry.clone())
    }

    /// Typed [`Self::lookup`]; an entry that no longer decodes as `T` is a miss
    pub fn lookup_as<T: DeserializeOwned>(&self, key: &str) -> Option<Served<T>> {
        let entry = self.lookup(key)?;
        match serde_json::from_value(entry.value) {
            Ok(value) => Some(Served::stale(value, entry.stored_at)),
            Err(e) => {
                debug!(fallback_key = %key, error = %e, "Fallback entry has a different shape");
                None
            }
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop entries older than `max_stale`
    pub fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| elapsed_between(entry.stored_at, now) <= self.max_stale);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            info!(purged = purged, remaining = self.entries.len(), "🧹 Purged stale fallback entries");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
