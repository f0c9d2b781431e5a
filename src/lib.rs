//! Egress Limiter - per-resource call budgets for outgoing requests
//!
//! Register a [`Resource`] for each external API you call (a URL pattern, a
//! call limit, a time window, and a [`Strategy`]), then ask the [`Limiter`]
//! before every outgoing request. Counters live in a pluggable
//! [`store::Store`]: in memory, in SQLite, or in a tiered combination of
//! both.
//!
//! ```no_run
//! use egress_limiter::{Limiter, Resource, Strategy, TimeWindow};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> egress_limiter::Result<()> {
//! let limiter = Limiter::new();
//! limiter.register(
//!     Resource::new("stripe", "api.stripe.com/*", 100, TimeWindow::Minute)
//!         .with_strategy(Strategy::Block),
//! );
//!
//! limiter
//!     .check(&CancellationToken::new(), "https://api.stripe.com/v1/charges")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{LimiterError, Result};
pub use ratelimit::{
    LimitExceeded, Limiter, ResetWaiter, Resource, ResourceStatus, Strategy, TimeWindow, Window,
};
