//! # Resilience Module
//!
//! Circuit breakers guarding every outbound dependency call.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use resilience_kernel::clock::SystemClock;
//! use resilience_kernel::config::CircuitBreakerSettings;
//! use resilience_kernel::resilience::CircuitBreakerRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings::default(), Arc::new(SystemClock));
//! let summary = registry
//!     .call("llm_api", || async { Ok::<_, std::io::Error>("summary") })
//!     .await;
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::{BreakerSnapshot, RegistrySnapshot};
pub use registry::CircuitBreakerRegistry;
