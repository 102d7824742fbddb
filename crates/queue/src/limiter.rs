//! Rate limiters deciding how long a requeued item waits.

use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub trait RateLimiter<K>: Send {
    /// Delay before `item` may be processed again. Records one more failure.
    fn when(&mut self, item: &K) -> Duration;
    /// Clear the failure history of `item`.
    fn forget(&mut self, item: &K);
    /// Consecutive failures recorded for `item`.
    fn num_requeues(&self, item: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailure<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K> ItemExponentialFailure<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: FxHashMap::default() }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialFailure<K> {
    fn when(&mut self, item: &K) -> Duration {
        let n = self.failures.entry(item.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    fn forget(&mut self, item: &K) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by all items: `qps` refill, `burst` capacity.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, tokens: burst, last: Instant::now() }
    }

    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    fn when(&mut self, _item: &K) -> Duration {
        self.reserve()
    }

    fn forget(&mut self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters: the longest delay and the highest requeue count win.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&mut self, item: &K) -> Duration {
        self.limiters.iter_mut().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, item: &K) {
        for l in self.limiters.iter_mut() {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// 5ms..1000s per-item exponential backoff, bounded overall by 10 qps / 100 burst.
pub fn default_controller_rate_limiter<K>() -> MaxOf<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOf::new(vec![
        Box::new(ItemExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(TokenBucket::new(10.0, 100)),
    ])
}
