//! Tracked endpoint classes and their enforcement strategies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::window::TimeWindow;

/// What happens once a resource exceeds its limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Reject the request.
    #[default]
    Block,
    /// Reject the request, but let the caller wait for the bucket to reset.
    BlockWithQueue,
    /// Let the request through; only the limit callback fires.
    LogOnly,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Block => "block",
            Strategy::BlockWithQueue => "block_with_queue",
            Strategy::LogOnly => "log_only",
        };
        f.write_str(name)
    }
}

/// An external endpoint class with its own call budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Identity of the counter, e.g. `stripe-api`
    pub name: String,
    /// Host and path pattern, e.g. `api.stripe.com/*`
    pub pattern: String,
    /// Maximum calls allowed per window
    pub limit: u64,
    /// Bucketing scheme
    pub window: TimeWindow,
    /// Policy once `limit` is exceeded
    #[serde(default)]
    pub strategy: Strategy,
}

impl Resource {
    /// Create a resource with the default `Block` strategy.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        limit: u64,
        window: TimeWindow,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            limit,
            window,
            strategy: Strategy::Block,
        }
    }

    /// Set the enforcement strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Whether a request target falls under this resource.
    pub fn matches(&self, request_url: &str) -> bool {
        super::matcher::matches(request_url, &self.pattern)
    }
}
