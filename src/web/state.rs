//! # Web API Application State
//!
//! Shared state handed to every handler: the kernel and the web settings it
//! was started with.

use std::sync::Arc;

use crate::config::WebConfig;
use crate::kernel::ResilienceKernel;

#[derive(Debug, Clone)]
pub struct AppState {
    pub kernel: Arc<ResilienceKernel>,
    pub config: WebConfig,
}

impl AppState {
    pub fn new(kernel: Arc<ResilienceKernel>) -> Self {
        let config = kernel.config().web.clone();
        Self { kernel, config }
    }

    pub fn kernel(&self) -> &ResilienceKernel {
        &self.kernel
    }
}
