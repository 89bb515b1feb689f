#![allow(clippy::doc_markdown)] // Allow technical terms like DLQ, LLM in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Resilience Kernel
//!
//! In-process resilience and incident management for services that depend on
//! flaky external APIs and background queues.
//!
//! ## Overview
//!
//! Outbound calls are guarded by per-dependency circuit breakers. Calls that
//! fail transiently land in a dead-letter queue with a bounded retry schedule,
//! queue admission is governed by watermark-based backpressure, and repeated
//! work is deduplicated by an idempotency store. Alongside that, application
//! logs are scored in fixed-size windows and anomalous windows open incidents
//! with a root-cause narrative.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Circuit breakers and their registry
//! - [`dlq`] - Dead-letter queue and retry worker
//! - [`backpressure`] - Queue admission control
//! - [`idempotency`] - Exactly-once execution per key
//! - [`fallback`] - Last good results served while a dependency is down
//! - [`anomaly`] - Log parsing, windowing and scoring
//! - [`incident`] - Incident lifecycle and root-cause analysis
//! - [`kernel`] - Composition root wiring the components together
//! - [`web`] - HTTP monitoring and control surface
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use resilience_kernel::clock::SystemClock;
//! use resilience_kernel::config::KernelConfig;
//! use resilience_kernel::kernel::{GuardedCall, ResilienceKernel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kernel = ResilienceKernel::with_defaults(KernelConfig::default(), Arc::new(SystemClock))?;
//!
//! let call = GuardedCall::new("crm_api", "sync_crm", serde_json::json!({"deal_id": 42}));
//! let outcome = kernel
//!     .execute_guarded(call, || async { Ok::<_, String>("synced") }, |_| true)
//!     .await;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod anomaly;
pub mod backpressure;
pub mod clock;
pub mod config;
pub mod constants;
pub mod dlq;
pub mod error;
pub mod fallback;
pub mod idempotency;
pub mod incident;
pub mod kernel;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod web;

pub use error::{KernelError, Result};
pub use kernel::{GuardedCall, GuardedCallError, ResilienceKernel};
