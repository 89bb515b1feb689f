//! # Circuit Breaker Metrics
//!
//! Read-only snapshots of breaker state for monitoring endpoints and health
//! checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::resilience::CircuitState;

/// Point-in-time view of a single breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Lifetime successes
    pub success_count: u64,
    pub consecutive_half_open_successes: u32,
    pub last_transition_at: DateTime<Utc>,
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub half_open_trial_limit: u32,
    pub success_threshold: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    /// Calls rejected without invoking the dependency
    pub total_rejections: u64,
}

impl BreakerSnapshot {
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.total_calls as f64
    }

    /// Check if the snapshot indicates healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.state {
            CircuitState::Closed => self.total_calls < 10 || self.failure_rate() < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing dependency health",
        }
    }
}

/// Registry-wide snapshot, ordered by breaker name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub breakers: Vec<BreakerSnapshot>,
    pub collected_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn new(mut breakers: Vec<BreakerSnapshot>, collected_at: DateTime<Utc>) -> Self {
        breakers.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            breakers,
            collected_at,
        }
    }

    /// Get count of circuit breakers by state
    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for breaker in &self.breakers {
            *counts.entry(breaker.state).or_insert(0) += 1;
        }
        counts
    }

    /// Names of breakers currently rejecting calls
    pub fn open_breakers(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .map(|b| b.name.clone())
            .collect()
    }

    /// System-wide health score (0.0 to 1.0)
    pub fn health_score(&self) -> f64 {
        if self.breakers.is_empty() {
            return 1.0;
        }
        let healthy = self.breakers.iter().filter(|b| b.is_healthy()).count();
        healthy as f64 / self.breakers.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.breakers.iter().map(|b| b.total_calls).sum()
    }

    pub fn system_failure_rate(&self) -> f64 {
        let total_calls = self.total_calls();
        if total_calls == 0 {
            return 0.0;
        }
        let failures: u64 = self.breakers.iter().map(|b| b.total_failures).sum();
        failures as f64 / total_calls as f64
    }

    /// Format summary for logging
    pub fn format_summary(&self) -> String {
        let counts = self.count_by_state();
        format!(
            "Circuit Breakers: {} total | {} closed | {} open | {} half-open | Health: {:.1}%",
            self.breakers.len(),
            counts.get(&CircuitState::Closed).unwrap_or(&0),
            counts.get(&CircuitState::Open).unwrap_or(&0),
            counts.get(&CircuitState::HalfOpen).unwrap_or(&0),
            self.health_score() * 100.0,
        )
    }
}
