use crate::clock::{Clock, MonotonicClock};
use crate::error::{ThrottleError, ThrottleResult};
use crate::rate_limit_config::{ThrottleConfig, ThrottleMode};
use crate::stage::{Stage, StageContext, TimerToken};
use crate::token_bucket::TokenBucket;
use std::mem;
use std::num::NonZeroU64;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Every item costs one unit.
pub fn unit_cost<T>(_item: &T) -> u64 {
    1
}

/// Items cost their length in bytes.
pub fn len_cost<T: AsRef<[u8]>>(item: &T) -> u64 {
    item.as_ref().len() as u64
}

/// Observable state of a [`Throttle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No item in flight and nothing requested from upstream.
    Idle,
    /// Waiting for the item requested from upstream.
    AwaitingUpstream,
    /// Holding an unmetered item until downstream signals demand.
    HaveItem,
    /// Holding a metered item until its timer fires.
    Delaying,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

enum State<T> {
    Idle,
    AwaitingUpstream,
    HaveItem {
        item: T,
        finishing: bool,
    },
    Delaying {
        item: T,
        timer: TimerToken,
        finishing: bool,
    },
    Completed,
    Failed,
    Cancelled,
}

/// Rate-limiting stage: admits at most `cost` units every `per`, with bursts
/// bounded by the bucket capacity.
///
/// One item is in flight at a time, so items leave in arrival order. In
/// shaping mode a non-conforming item is held and released by a timer; in
/// enforcing mode it fails the stage.
pub struct Throttle<T, F, C: Clock = MonotonicClock> {
    bucket: TokenBucket<C>,
    mode: ThrottleMode,
    cost_fn: F,
    state: State<T>,
    demand: u64,
    next_timer: TimerToken,
}

impl<T, F> Throttle<T, F, MonotonicClock>
where
    F: Fn(&T) -> u64,
{
    pub fn new(config: &ThrottleConfig, cost_fn: F) -> ThrottleResult<Self> {
        Self::with_clock(config, cost_fn, MonotonicClock)
    }
}

impl<T, F, C> Throttle<T, F, C>
where
    F: Fn(&T) -> u64,
    C: Clock,
{
    pub fn with_clock(config: &ThrottleConfig, cost_fn: F, clock: C) -> ThrottleResult<Self> {
        let resolved = config.resolve()?;
        let bucket = TokenBucket::with_clock(resolved.capacity, resolved.nanos_between_tokens, clock)?;

        Ok(Self {
            bucket,
            mode: config.mode,
            cost_fn,
            state: State::Idle,
            demand: 0,
            next_timer: TimerToken::new(0),
        })
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    pub fn bucket(&self) -> &TokenBucket<C> {
        &self.bucket
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Idle => Phase::Idle,
            State::AwaitingUpstream => Phase::AwaitingUpstream,
            State::HaveItem { .. } => Phase::HaveItem,
            State::Delaying { .. } => Phase::Delaying,
            State::Completed => Phase::Completed,
            State::Failed => Phase::Failed,
            State::Cancelled => Phase::Cancelled,
        }
    }

    /// Meters `item` and either emits it, delays it or fails the stage.
    /// Requires outstanding downstream demand.
    fn admit<X: StageContext<T>>(&mut self, item: T, finishing: bool, ctx: &mut X) {
        let Some(cost) = NonZeroU64::new((self.cost_fn)(&item)) else {
            warn!("cost function returned zero for an item");
            self.state = State::Failed;
            ctx.fail(ThrottleError::configuration(
                "cost function must return a positive cost for every item",
            ));
            return;
        };

        let wait = self.bucket.offer(cost);
        if wait == 0 {
            trace!(cost = cost.get(), "item admitted");
            self.push(item, finishing, ctx);
            return;
        }

        let wait = Duration::from_nanos(wait);
        match self.mode {
            ThrottleMode::Enforcing => {
                warn!(cost = cost.get(), ?wait, "throttle rate exceeded");
                self.state = State::Failed;
                ctx.fail(ThrottleError::RateExceeded {
                    cost: cost.get(),
                    wait,
                });
            }
            ThrottleMode::Shaping => {
                let timer = self.next_timer;
                self.next_timer = timer.next();
                trace!(cost = cost.get(), ?wait, timer = timer.id(), "item delayed");
                self.state = State::Delaying {
                    item,
                    timer,
                    finishing,
                };
                ctx.schedule_once(wait, timer);
            }
        }
    }

    fn push<X: StageContext<T>>(&mut self, item: T, finishing: bool, ctx: &mut X) {
        self.demand = self.demand.saturating_sub(1);
        ctx.emit(item);

        if finishing {
            debug!("throttle completed after flushing its last item");
            self.state = State::Completed;
            ctx.complete();
        } else if self.demand > 0 {
            self.state = State::AwaitingUpstream;
            ctx.request_upstream();
        } else {
            self.state = State::Idle;
        }
    }
}

impl<T, F, C> Stage<T> for Throttle<T, F, C>
where
    F: Fn(&T) -> u64,
    C: Clock,
{
    fn on_start<X: StageContext<T>>(&mut self, ctx: &mut X) {
        self.bucket.init();
        debug!(
            mode = %self.mode,
            capacity = self.bucket.capacity(),
            nanos_between_tokens = self.bucket.nanos_between_tokens(),
            "throttle started"
        );

        if let State::Idle = self.state {
            self.state = State::AwaitingUpstream;
            ctx.request_upstream();
        }
    }

    fn on_downstream_demand<X: StageContext<T>>(&mut self, ctx: &mut X) {
        if self.phase().is_terminal() {
            return;
        }
        self.demand = self.demand.saturating_add(1);

        match mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                self.state = State::AwaitingUpstream;
                ctx.request_upstream();
            }
            State::HaveItem { item, finishing } => self.admit(item, finishing, ctx),
            other => self.state = other,
        }
    }

    fn on_item<X: StageContext<T>>(&mut self, item: T, ctx: &mut X) {
        match mem::replace(&mut self.state, State::Idle) {
            State::AwaitingUpstream if self.demand > 0 => self.admit(item, false, ctx),
            State::AwaitingUpstream => {
                self.state = State::HaveItem {
                    item,
                    finishing: false,
                };
            }
            other => {
                self.state = other;
                if !self.phase().is_terminal() {
                    warn!(phase = ?self.phase(), "item arrived without upstream demand, dropping it");
                }
            }
        }
    }

    fn on_timer<X: StageContext<T>>(&mut self, token: TimerToken, ctx: &mut X) {
        match mem::replace(&mut self.state, State::Idle) {
            State::Delaying {
                item,
                timer,
                finishing,
            } if timer == token => self.push(item, finishing, ctx),
            other => {
                trace!(timer = token.id(), "ignoring stale timer");
                self.state = other;
            }
        }
    }

    fn on_upstream_finish<X: StageContext<T>>(&mut self, ctx: &mut X) {
        match mem::replace(&mut self.state, State::Idle) {
            State::Delaying { item, timer, .. } => {
                debug!("upstream finished while an item is delayed");
                self.state = State::Delaying {
                    item,
                    timer,
                    finishing: true,
                };
            }
            State::HaveItem { item, .. } => {
                self.state = State::HaveItem {
                    item,
                    finishing: true,
                };
            }
            State::Idle | State::AwaitingUpstream => {
                debug!("upstream finished, throttle completed");
                self.state = State::Completed;
                ctx.complete();
            }
            terminal => self.state = terminal,
        }
    }

    fn on_upstream_failure<X: StageContext<T>>(&mut self, reason: String, ctx: &mut X) {
        if self.phase().is_terminal() {
            return;
        }
        if let State::Delaying { timer, .. } = self.state {
            ctx.cancel_timer(timer);
        }

        debug!(%reason, "upstream failed, discarding any held item");
        self.state = State::Failed;
        ctx.fail(ThrottleError::UpstreamFailure(reason));
    }

    fn on_downstream_cancel<X: StageContext<T>>(&mut self, ctx: &mut X) {
        if self.phase().is_terminal() {
            return;
        }
        if let State::Delaying { timer, .. } = self.state {
            ctx.cancel_timer(timer);
        }

        debug!("downstream cancelled, discarding any held item");
        self.state = State::Cancelled;
        ctx.cancel_upstream();
    }

    fn is_terminated(&self) -> bool {
        self.phase().is_terminal()
    }
}
