//! Per-instance stream byte counters.
//!
//! Four counters per codec leg: request and response, each measured on
//! the plaintext side (input) and the transformed side (output). The
//! difference is the bandwidth the codec saved. Printed when the daemon
//! stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StreamCounts {
    pub request_input: Arc<AtomicU64>,
    pub request_output: Arc<AtomicU64>,
    pub response_input: Arc<AtomicU64>,
    pub response_output: Arc<AtomicU64>,
}

impl StreamCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&self, proxy: &str, leg: &str) {
        tracing::info!(
            proxy,
            leg,
            request_input = self.request_input.load(Ordering::Relaxed),
            request_output = self.request_output.load(Ordering::Relaxed),
            response_input = self.response_input.load(Ordering::Relaxed),
            response_output = self.response_output.load(Ordering::Relaxed),
            "stream byte counts"
        );
    }
}
