//! Interface between a stage and the engine hosting it.
//!
//! A host delivers [`Stage`] callbacks one at a time, never concurrently, and
//! the stage answers by requesting effects through a [`StageContext`]. Because
//! of that discipline a stage keeps its state in plain owned fields.

use crate::error::ThrottleError;
use std::time::Duration;

/// Identifies one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The token issued after this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Effects a stage may ask its host to perform.
pub trait StageContext<T> {
    /// Signal upstream that the stage is ready for one item.
    fn request_upstream(&mut self);

    /// Push an item downstream. Only permitted after downstream demand.
    fn emit(&mut self, item: T);

    /// Finish the stage successfully.
    fn complete(&mut self);

    /// Finish the stage with an error.
    fn fail(&mut self, error: ThrottleError);

    /// Tell upstream that no more items will be requested.
    fn cancel_upstream(&mut self);

    /// Fire `on_timer(token)` once after `delay`.
    fn schedule_once(&mut self, delay: Duration, token: TimerToken);

    /// Drop a timer scheduled with `token`, if it has not fired yet.
    fn cancel_timer(&mut self, token: TimerToken);
}

/// Callbacks a host delivers to a stage.
pub trait Stage<T> {
    /// The pipeline started running.
    fn on_start<X: StageContext<T>>(&mut self, ctx: &mut X);

    /// Downstream is ready for one more item.
    fn on_downstream_demand<X: StageContext<T>>(&mut self, ctx: &mut X);

    /// An item arrived from upstream in answer to `request_upstream`.
    fn on_item<X: StageContext<T>>(&mut self, item: T, ctx: &mut X);

    /// A timer scheduled with `token` fired.
    fn on_timer<X: StageContext<T>>(&mut self, token: TimerToken, ctx: &mut X);

    /// Upstream completed normally.
    fn on_upstream_finish<X: StageContext<T>>(&mut self, ctx: &mut X);

    /// Upstream failed.
    fn on_upstream_failure<X: StageContext<T>>(&mut self, reason: String, ctx: &mut X);

    /// Downstream is no longer interested in items.
    fn on_downstream_cancel<X: StageContext<T>>(&mut self, ctx: &mut X);

    /// True once the stage has completed, failed or been cancelled.
    fn is_terminated(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_token_sequence() {
        let first = TimerToken::new(0);
        let second = first.next();

        assert_ne!(first, second);
        assert_eq!(second.id(), 1);
        assert_eq!(TimerToken::new(u64::MAX).next(), TimerToken::new(0));
    }
}
