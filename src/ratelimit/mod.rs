//! Rate limit accounting: bucketing, matching, and enforcement.

mod limiter;
pub mod matcher;
mod resource;
mod window;

pub use limiter::{LimitCallback, LimitExceeded, Limiter, ResetWaiter, ResourceStatus};
pub use resource::{Resource, Strategy};
pub use window::{TimeWindow, Window};
