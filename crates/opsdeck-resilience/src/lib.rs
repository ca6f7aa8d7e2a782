//! Admission control and retry for backend operations.
//!
//! - `RateLimiter` - sliding-window limiter keyed by resource
//! - `BackoffPolicy` / `Backoff` - exponential delay growth with jitter
//! - `ResilientInvoker` - runs an async operation through both

pub mod backoff;
pub mod invoker;
pub mod rate_limiter;

pub use backoff::{Backoff, BackoffPolicy};
pub use invoker::{InvokeError, InvokerConfig, ResilientInvoker};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
