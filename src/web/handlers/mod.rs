//! # Web API Request Handlers
//!
//! Handlers grouped by surface: liveness, the system control endpoints and
//! the log analysis endpoints.

pub mod health;
pub mod logs;
pub mod system;
