//! Request context threaded through every service entrypoint
//!
//! The context is an explicit value, not ambient task-local state: it is
//! the first parameter of each orchestrator call and is cloned into any
//! background task spawned on behalf of the request.

use uuid::Uuid;

/// Per-request context carried across the service and into detached work
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller-supplied request id, minted when absent
    pub request_id: String,
    /// Project the request operates in
    pub project_id: String,
    /// Customer the request operates on
    pub customer_id: String,
    /// Request timestamp in epoch milliseconds
    pub now: i64,
    /// Monotonic start used for latency accounting, epoch milliseconds
    pub performance_start: i64,
}

impl RequestContext {
    /// Create a context for a request arriving at `now`
    #[must_use]
    pub fn new(project_id: &str, customer_id: &str, now: i64) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            customer_id: customer_id.to_string(),
            now,
            performance_start: now,
        }
    }

    /// Keep a caller-supplied request id instead of the minted one
    #[must_use]
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        if !request_id.is_empty() {
            self.request_id = request_id.to_string();
        }
        self
    }

    /// Override the latency baseline (edge ingress time)
    #[must_use]
    pub const fn with_performance_start(mut self, start: i64) -> Self {
        self.performance_start = start;
        self
    }

    /// Rebase the context on an event timestamp
    #[must_use]
    pub fn with_now(&self, now: i64) -> Self {
        let mut ctx = self.clone();
        ctx.now = now;
        ctx
    }

    /// Milliseconds elapsed since the latency baseline
    #[must_use]
    pub fn latency_ms(&self, now: i64) -> f64 {
        (now - self.performance_start).max(0) as f64
    }
}
