//! # Kernel Errors
//!
//! Component errors are defined next to the component that raises them; this
//! module aggregates the non-generic ones so callers that orchestrate several
//! components (the kernel, the web layer, the binary) can use a single
//! `Result` type with `?`.

use thiserror::Error;

use crate::backpressure::BackpressureError;
use crate::config::ConfigurationError;
use crate::dlq::DlqError;
use crate::incident::IncidentError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    DeadLetter(#[from] DlqError),

    #[error(transparent)]
    Backpressure(#[from] BackpressureError),

    #[error(transparent)]
    Incident(#[from] IncidentError),

    #[error("Invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
