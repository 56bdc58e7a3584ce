//! Runs a single [`Stage`] on the current tokio task, between two bounded
//! channels.
//!
//! Demand maps onto channel capacity: holding a reserved downstream slot is
//! the "ready for one item" signal. Upstream is read one item ahead of the
//! stage's requests, so a failure or completion is seen even while the stage
//! is holding a delayed item. A single `select!` loop delivers every
//! callback, so the stage never sees two at once.

use crate::clock::TokioClock;
use crate::error::{ThrottleError, ThrottleResult};
use crate::rate_limit_config::ThrottleConfig;
use crate::stage::{Stage, StageContext, TimerToken};
use crate::throttler::Throttle;
use std::time::Duration;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace};

/// How a stage ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The stage completed normally after upstream finished.
    Completed,
    /// Downstream went away and the stage stopped early.
    Cancelled,
}

enum Outcome {
    Completed,
    Failed(ThrottleError),
}

struct ChannelContext<T> {
    permit: Option<OwnedPermit<T>>,
    upstream_requested: bool,
    upstream_cancelled: bool,
    upstream_finished: bool,
    // Item read from upstream before the stage asked for it.
    lookahead: Option<T>,
    timer: Option<(Instant, TimerToken)>,
    outcome: Option<Outcome>,
}

impl<T> ChannelContext<T> {
    fn new() -> Self {
        Self {
            permit: None,
            upstream_requested: false,
            upstream_cancelled: false,
            upstream_finished: false,
            lookahead: None,
            timer: None,
            outcome: None,
        }
    }
}

impl<T> StageContext<T> for ChannelContext<T> {
    fn request_upstream(&mut self) {
        self.upstream_requested = true;
    }

    fn emit(&mut self, item: T) {
        match self.permit.take() {
            Some(permit) => {
                let _ = permit.send(item);
            }
            None => error!("stage emitted without downstream demand, item dropped"),
        }
    }

    fn complete(&mut self) {
        self.outcome.get_or_insert(Outcome::Completed);
    }

    fn fail(&mut self, error: ThrottleError) {
        self.outcome.get_or_insert(Outcome::Failed(error));
    }

    fn cancel_upstream(&mut self) {
        self.upstream_requested = false;
        self.upstream_cancelled = true;
        self.lookahead = None;
    }

    fn schedule_once(&mut self, delay: Duration, token: TimerToken) {
        self.timer = Some((Instant::now() + delay, token));
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        if matches!(self.timer, Some((_, armed)) if armed == token) {
            self.timer = None;
        }
    }
}

/// Hosts `stage` until it terminates.
///
/// Upstream sends `Ok(item)` for items and `Err(reason)` to fail; closing the
/// channel finishes it. At most one item is buffered ahead of the stage's
/// request, and failure or completion is delivered as soon as it is read.
/// Dropping the downstream receiver cancels the stage.
/// A stage failure is returned as the error, after the downstream channel has
/// been closed.
pub async fn run_stage<T, S>(
    mut stage: S,
    mut upstream: mpsc::Receiver<Result<T, String>>,
    downstream: mpsc::Sender<T>,
) -> ThrottleResult<Termination>
where
    S: Stage<T>,
{
    let mut ctx = ChannelContext::new();
    stage.on_start(&mut ctx);

    loop {
        if ctx.upstream_cancelled {
            upstream.close();
        }
        match ctx.outcome.take() {
            Some(Outcome::Completed) => return Ok(Termination::Completed),
            Some(Outcome::Failed(err)) => return Err(err),
            None if stage.is_terminated() => return Ok(Termination::Cancelled),
            None => {}
        }

        if ctx.upstream_requested {
            if let Some(item) = ctx.lookahead.take() {
                ctx.upstream_requested = false;
                stage.on_item(item, &mut ctx);
                continue;
            }
        }

        let want_demand = ctx.permit.is_none();
        let deadline = ctx.timer.map(|(at, _)| at);
        let read_upstream =
            ctx.lookahead.is_none() && !ctx.upstream_finished && !ctx.upstream_cancelled;

        tokio::select! {
            biased;

            _ = downstream.closed() => {
                debug!("downstream closed");
                stage.on_downstream_cancel(&mut ctx);
            }
            permit = downstream.clone().reserve_owned(), if want_demand => match permit {
                Ok(permit) => {
                    ctx.permit = Some(permit);
                    stage.on_downstream_demand(&mut ctx);
                }
                Err(_) => stage.on_downstream_cancel(&mut ctx),
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((_, token)) = ctx.timer.take() {
                    stage.on_timer(token, &mut ctx);
                }
            }
            msg = upstream.recv(), if read_upstream => match msg {
                Some(Ok(item)) if ctx.upstream_requested => {
                    ctx.upstream_requested = false;
                    stage.on_item(item, &mut ctx);
                }
                Some(Ok(item)) => {
                    trace!("buffered upstream item until the stage requests it");
                    ctx.lookahead = Some(item);
                }
                Some(Err(reason)) => stage.on_upstream_failure(reason, &mut ctx),
                None => {
                    ctx.upstream_finished = true;
                    stage.on_upstream_finish(&mut ctx);
                }
            },
        }
    }
}

/// Throttles `upstream` into `downstream` according to `config`, timing
/// against tokio's clock.
pub async fn run_throttle<T, F>(
    config: &ThrottleConfig,
    cost_fn: F,
    upstream: mpsc::Receiver<Result<T, String>>,
    downstream: mpsc::Sender<T>,
) -> ThrottleResult<Termination>
where
    F: Fn(&T) -> u64,
{
    let throttle = Throttle::with_clock(config, cost_fn, TokioClock)?;
    debug!(mode = %throttle.mode(), "hosting throttle on tokio");
    run_stage(throttle, upstream, downstream).await
}
