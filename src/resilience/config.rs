//! # Circuit Breaker Configuration
//!
//! Runtime configuration for a single breaker plus the per-dependency preset
//! table. File-based settings live in [`crate::config::CircuitBreakerSettings`]
//! and convert into this type.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::dependencies;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker
    pub failure_threshold: u32,

    /// Time spent open before a trial call is let through
    pub recovery_timeout: Duration,

    /// Trial calls admitted concurrently while half-open
    pub half_open_trial_limit: u32,

    /// Trial successes required to close again
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            ..Self::default()
        }
    }

    /// LLM completion endpoint
    pub fn for_llm_api() -> Self {
        Self::new(5, Duration::from_secs(60))
    }

    /// Messaging webhooks (Slack, Notion)
    pub fn for_messaging_webhook() -> Self {
        Self::new(3, Duration::from_secs(60))
    }

    pub fn for_crm() -> Self {
        Self::new(3, Duration::from_secs(120))
    }

    /// Scraping targets are flaky by nature, so they tolerate more failures
    pub fn for_scraper() -> Self {
        Self::new(10, Duration::from_secs(300))
    }

    /// Preset for a well-known dependency name
    pub fn preset_for(dependency: &str) -> Option<Self> {
        match dependency {
            dependencies::LLM_API => Some(Self::for_llm_api()),
            dependencies::SLACK_API | dependencies::NOTION_API => {
                Some(Self::for_messaging_webhook())
            }
            dependencies::CRM_API => Some(Self::for_crm()),
            dependencies::SCRAPER => Some(Self::for_scraper()),
            _ => None,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }

        if self.half_open_trial_limit == 0 {
            return Err("half_open_trial_limit must be greater than 0".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.success_threshold > self.half_open_trial_limit {
            return Err(format!(
                "success_threshold ({}) cannot exceed half_open_trial_limit ({})",
                self.success_threshold, self.half_open_trial_limit
            ));
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_trial_limit: 1,
            success_threshold: 1,
        }
    }
}
