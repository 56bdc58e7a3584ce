//! A rate-limiting stage for demand-driven dataflow pipelines.
//!
//! [`TokenBucket`] meters item costs against a monotonic clock, and
//! [`Throttle`] wraps it in a one-item-at-a-time push/pull protocol. Shaping
//! mode delays items that arrive too fast; enforcing mode fails on them.
//! [`driver::run_stage`] hosts a stage between tokio channels.

pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod rate_limit_config;
pub mod stage;
pub mod throttler;
pub mod token_bucket;

pub use clock::{Clock, ManualClock, MonotonicClock, TokioClock};
pub use error::{ThrottleError, ThrottleResult};
pub use rate_limit_config::{MaximumBurst, ThrottleConfig, ThrottleMode};
pub use stage::{Stage, StageContext, TimerToken};
pub use throttler::{Phase, Throttle};
pub use token_bucket::TokenBucket;
