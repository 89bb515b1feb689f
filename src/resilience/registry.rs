//! # Circuit Breaker Registry
//!
//! One breaker per logical dependency name. Breakers live in a `DashMap` so
//! lookups and calls on different dependencies never contend on a shared lock.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerSettings;
use crate::resilience::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerError, CircuitState, RegistrySnapshot,
};

/// Registry of named circuit breakers
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with every configured component pre-registered
    pub fn new(settings: CircuitBreakerSettings, clock: Arc<dyn Clock>) -> Self {
        let registry = Self {
            breakers: DashMap::new(),
            settings,
            clock,
        };

        let configured: Vec<String> = registry.settings.components.keys().cloned().collect();
        for name in &configured {
            registry.breaker(name);
        }

        info!(
            breakers = registry.breakers.len(),
            "Initialized circuit breaker registry"
        );
        registry
    }

    /// Get or create the breaker for a dependency
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        if self.breakers.len() >= self.settings.max_circuit_breakers {
            warn!(
                dependency = name,
                current_count = self.breakers.len(),
                max_allowed = self.settings.max_circuit_breakers,
                "🚨 Maximum circuit breaker limit reached"
            );
        }

        // entry() holds the shard lock, so concurrent creators agree on one instance
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .settings
                .config_for_component(name)
                .to_resilience_config();
            Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.clock)))
        });
        Arc::clone(entry.value())
    }

    /// Execute `operation` through the named breaker
    pub async fn call<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker(name).call(operation).await
    }

    /// Execute `operation` through the named breaker, counting only classified failures
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        name: &str,
        operation: F,
        counts_as_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.breaker(name)
            .call_classified(operation, counts_as_failure)
            .await
    }

    /// Execute `operation` through the named breaker with a timeout
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        name: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker(name).call_with_timeout(timeout, operation).await
    }

    pub fn get(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(name).map(|b| b.value().snapshot())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let breakers = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        RegistrySnapshot::new(breakers, self.clock.now())
    }

    /// Force every breaker to CLOSED (operator override). Returns how many
    /// breakers were not already closed.
    pub fn reset_all(&self) -> usize {
        warn!("🚨 Forcing all circuit breakers closed (operator reset)");

        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(e.value())).collect();

        let mut reset = 0;
        for breaker in breakers {
            if breaker.state() != CircuitState::Closed {
                reset += 1;
            }
            breaker.force_closed();
        }
        reset
    }

    /// Force a single breaker open; creates it if unknown
    pub fn force_open(&self, name: &str) {
        self.breaker(name).force_open();
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (CircuitBreakerRegistry, ManualClock) {
        let clock = ManualClock::starting_now();
        (
            CircuitBreakerRegistry::new(CircuitBreakerSettings::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_configured_components_preregistered() {
        let (registry, _clock) = registry();
        assert_eq!(
            registry.names(),
            vec!["crm_api", "llm_api", "notion_api", "scraper", "slack_api"]
        );
        assert_eq!(registry.snapshot().health_score(), 1.0);
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let (registry, _clock) = registry();

        let first = registry.breaker("geo_lookup");
        let second = registry.breaker("geo_lookup");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.config().failure_threshold, 5);
        assert_eq!(first.config().recovery_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_breakers_are_independent() {
        let (registry, _clock) = registry();

        for _ in 0..3 {
            let _ = registry
                .call("slack_api", || async { Err::<(), _>("503") })
                .await;
        }
        assert_eq!(registry.breaker("slack_api").state(), CircuitState::Open);

        let result = registry
            .call("notion_api", || async { Ok::<_, String>("page") })
            .await;
        assert_eq!(result.unwrap(), "page");
        assert_eq!(registry.snapshot().open_breakers(), vec!["slack_api"]);
    }

    #[tokio::test]
    async fn test_reset_all_closes_open_breakers() {
        let (registry, _clock) = registry();
        registry.force_open("llm_api");
        registry.force_open("crm_api");

        assert_eq!(registry.reset_all(), 2);
        let counts = registry.snapshot().count_by_state();
        assert_eq!(counts.get(&CircuitState::Closed), Some(&5));

        let result = registry.call("llm_api", || async { Ok::<_, String>(()) }).await;
        assert!(result.is_ok());
    }
}
