use crate::clock::{Clock, MonotonicClock};
use crate::error::{ThrottleError, ThrottleResult};
use std::num::NonZeroU64;
use std::time::{Duration, Instant};

/// Burst window used to size an automatic capacity: a full-rate consumer can
/// drain 100ms worth of tokens at once.
pub const AUTOMATIC_BURST_WINDOW_NANOS: u64 = 100_000_000;

/// Capacity that lets a full-rate consumer burst 100ms worth of tokens,
/// never less than one.
pub fn automatic_capacity(nanos_between_tokens: u64) -> u64 {
    (AUTOMATIC_BURST_WINDOW_NANOS / nanos_between_tokens.max(1)).max(1)
}

/// Integer token bucket metering cost units against a monotonic clock.
///
/// Tokens arrive one every `nanos_between_tokens`. A refill only ever moves
/// `last_refill` forward by whole token intervals, so partial progress toward
/// the next token is never lost to rounding.
///
/// `offer` takes `&mut self`; the reservation arithmetic relies on calls being
/// serialized and must be revisited before sharing a bucket between threads.
#[derive(Debug)]
pub struct TokenBucket<C: Clock = MonotonicClock> {
    capacity: u64,
    nanos_between_tokens: u64,
    available_tokens: u64,
    last_refill: Instant,
    clock: C,
}

impl TokenBucket<MonotonicClock> {
    pub fn new(capacity: u64, nanos_between_tokens: u64) -> ThrottleResult<Self> {
        Self::with_clock(capacity, nanos_between_tokens, MonotonicClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    pub fn with_clock(capacity: u64, nanos_between_tokens: u64, clock: C) -> ThrottleResult<Self> {
        if nanos_between_tokens == 0 {
            return Err(ThrottleError::configuration(
                "token interval must be at least one nanosecond",
            ));
        }

        let now = clock.now();
        Ok(Self {
            capacity,
            nanos_between_tokens,
            available_tokens: capacity,
            last_refill: now,
            clock,
        })
    }

    /// Establishes the clock baseline and fills the bucket.
    pub fn init(&mut self) {
        self.last_refill = self.clock.now();
        self.available_tokens = self.capacity;
    }

    /// Spends `cost` tokens and returns how many nanoseconds the caller must
    /// wait before acting on them. Zero means proceed now.
    pub fn offer(&mut self, cost: NonZeroU64) -> u64 {
        let now = self.clock.now();
        self.offer_at(now, cost)
    }

    /// Same as [`offer`](Self::offer) with an explicit current time.
    ///
    /// When the balance is short, the whole cost is committed anyway: the
    /// balance drops to zero and the refill baseline moves to the instant the
    /// deficit is paid off, so the next caller queues behind this one.
    pub fn offer_at(&mut self, now: Instant, cost: NonZeroU64) -> u64 {
        self.refill(now);

        let cost = cost.get();
        if cost <= self.available_tokens {
            self.available_tokens -= cost;
            return 0;
        }

        let deficit = cost - self.available_tokens;
        let debt = deficit.saturating_mul(self.nanos_between_tokens);
        // Tokens arrive on interval boundaries; time already accrued toward the
        // next one counts, while an outstanding reservation adds to the wait.
        let delay = match now.checked_duration_since(self.last_refill) {
            Some(since) => debt.saturating_sub(as_nanos(since)),
            None => debt.saturating_add(as_nanos(self.last_refill - now)),
        };

        self.available_tokens = 0;
        if let Some(paid_off) = now.checked_add(Duration::from_nanos(delay)) {
            self.last_refill = paid_off;
        }
        delay
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn nanos_between_tokens(&self) -> u64 {
        self.nanos_between_tokens
    }

    /// Balance as of the last `offer`, without accruing elapsed time.
    pub fn available_tokens(&self) -> u64 {
        self.available_tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = as_nanos(now.saturating_duration_since(self.last_refill));
        let arrived = elapsed / self.nanos_between_tokens;
        if arrived == 0 {
            return;
        }

        self.last_refill += Duration::from_nanos(arrived * self.nanos_between_tokens);
        self.available_tokens = self
            .available_tokens
            .saturating_add(arrived)
            .min(self.capacity);
    }
}

fn as_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TAU: u64 = 100_000_000;

    fn one() -> NonZeroU64 {
        NonZeroU64::new(1).unwrap()
    }

    fn bucket(capacity: u64, nanos: u64) -> (TokenBucket<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let mut bucket = TokenBucket::with_clock(capacity, nanos, clock.clone()).unwrap();
        bucket.init();
        (bucket, clock)
    }

    #[test]
    fn test_token_bucket_creation() {
        let (bucket, _) = bucket(10, 5);
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.nanos_between_tokens(), 5);
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = TokenBucket::new(10, 0);
        assert!(matches!(result, Err(ThrottleError::Configuration(_))));
    }

    #[test]
    fn test_automatic_capacity() {
        assert_eq!(automatic_capacity(TAU), 1);
        assert_eq!(automatic_capacity(1_000_000), 100);
        assert_eq!(automatic_capacity(1), 100_000_000);
        assert_eq!(automatic_capacity(10 * TAU), 1);
    }

    #[test]
    fn test_burst_then_wait() {
        let (mut bucket, _) = bucket(5, TAU);

        for _ in 0..5 {
            assert_eq!(bucket.offer(one()), 0);
        }
        assert_eq!(bucket.available_tokens(), 0);
        assert_eq!(bucket.offer(one()), TAU);
    }

    #[test]
    fn test_deficits_queue_behind_each_other() {
        let (mut bucket, _) = bucket(1, TAU);

        assert_eq!(bucket.offer(one()), 0);
        assert_eq!(bucket.offer(one()), TAU);
        assert_eq!(bucket.offer(one()), 2 * TAU);
    }

    #[test]
    fn test_wait_after_reservation_elapses() {
        let (mut bucket, clock) = bucket(1, TAU);

        assert_eq!(bucket.offer(one()), 0);
        let wait = bucket.offer(one());
        assert_eq!(wait, TAU);

        // Acting on the reservation leaves nothing for the next item.
        clock.advance(Duration::from_nanos(wait));
        assert_eq!(bucket.offer(one()), TAU);
    }

    #[test]
    fn test_partial_interval_counts_toward_wait() {
        let (mut bucket, clock) = bucket(1, TAU);

        assert_eq!(bucket.offer(one()), 0);
        clock.advance(Duration::from_millis(30));
        assert_eq!(bucket.offer(one()), TAU - 30_000_000);
    }

    #[test]
    fn test_fractional_progress_is_kept() {
        let (mut bucket, clock) = bucket(2, TAU);
        let two = NonZeroU64::new(2).unwrap();

        assert_eq!(bucket.offer(two), 0);

        // 1.5 intervals: one token credited, half an interval carried over.
        clock.advance(Duration::from_millis(150));
        assert_eq!(bucket.offer(one()), 0);

        // Another half interval completes the second token.
        clock.advance(Duration::from_millis(50));
        assert_eq!(bucket.offer(one()), 0);
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let (mut bucket, clock) = bucket(3, TAU);

        assert_eq!(bucket.offer(NonZeroU64::new(3).unwrap()), 0);
        clock.advance(Duration::from_secs(60));

        for _ in 0..3 {
            assert_eq!(bucket.offer(one()), 0);
        }
        assert!(bucket.offer(one()) > 0);
    }

    #[test]
    fn test_conforming_traffic_never_waits() {
        let (mut bucket, clock) = bucket(1, TAU);

        for _ in 0..50 {
            assert_eq!(bucket.offer(one()), 0);
            clock.advance(Duration::from_nanos(TAU));
        }
    }

    #[test]
    fn test_weighted_cost_deficit() {
        let (mut bucket, _) = bucket(4, 1_000);

        assert_eq!(bucket.offer(NonZeroU64::new(10).unwrap()), 6_000);
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn test_zero_capacity_always_waits() {
        let (mut bucket, clock) = bucket(0, TAU);

        assert_eq!(bucket.offer(one()), TAU);
        clock.advance(Duration::from_nanos(TAU));
        assert_eq!(bucket.offer(one()), TAU);
    }

    #[test]
    fn test_init_refills() {
        let (mut bucket, _) = bucket(2, TAU);

        bucket.offer(NonZeroU64::new(2).unwrap());
        assert_eq!(bucket.available_tokens(), 0);

        bucket.init();
        assert_eq!(bucket.available_tokens(), 2);
        assert_eq!(bucket.offer(one()), 0);
    }
}
