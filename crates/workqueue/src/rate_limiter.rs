//! Rate limiters deciding how long a failed key waits before it is re-added.
//!
//! [`ItemExponentialLimiter`] tracks per-key failures and doubles the delay on
//! every call to [`RateLimiter::when`] until the cap; [`RateLimiter::forget`]
//! resets it. [`BucketLimiter`] bounds the overall retry rate.
//! [`default_controller_limiter`] combines both, taking the larger delay.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::lock;

/// Decides the requeue delay for an item.
pub trait RateLimiter<T>: Send + Sync {
    /// Record a failure for `item` and return how long it must wait.
    fn when(&self, item: &T) -> Duration;

    /// Drop the failure history of `item`.
    fn forget(&self, item: &T);

    /// Failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Eq + Hash + Clone> ItemExponentialLimiter<T> {
    /// Create a limiter with the given base and cap.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay for the n-th consecutive failure (0-indexed).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = self.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items.
#[derive(Debug)]
pub struct BucketLimiter {
    bucket: Mutex<Bucket>,
    qps: f64,
    burst: u32,
}

impl BucketLimiter {
    /// Allow `burst` immediate retries, refilling at `qps` per second.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
        }
    }

    fn reserve(&self) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed
            .mul_add(self.qps, bucket.tokens)
            .min(f64::from(self.burst));
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<T> RateLimiter<T> for BucketLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters; the longest delay wins.
pub struct MaxOfLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfLimiter<T> {
    /// Combine the given limiters.
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        self.limiters.iter().for_each(|limiter| limiter.forget(item));
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with an overall token bucket.
#[must_use]
pub fn controller_limiter<T>(
    base_delay: Duration,
    max_delay: Duration,
    qps: f64,
    burst: u32,
) -> MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(base_delay, max_delay)),
        Box::new(BucketLimiter::new(qps, burst)),
    ])
}

/// 5ms doubling to 1000s per item, and 10 qps with a burst of 100 overall.
#[must_use]
pub fn default_controller_limiter<T>() -> MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    controller_limiter(
        Duration::from_millis(5),
        Duration::from_secs(1000),
        10.0,
        100,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_until_cap() {
        let limiter = ItemExponentialLimiter::new(Duration::from_millis(10), Duration::from_millis(50));
        let key = "default/foo".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.when(&key), Duration::from_millis(20));
        assert_eq!(limiter.when(&key), Duration::from_millis(40));
        assert_eq!(limiter.when(&key), Duration::from_millis(50));
        assert_eq!(limiter.when(&key), Duration::from_millis(50));
        assert_eq!(limiter.num_requeues(&key), 5);
    }

    #[test]
    fn test_exponential_forget_resets() {
        let limiter = ItemExponentialLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "default/foo".to_string();

        limiter.when(&key);
        limiter.when(&key);
        limiter.forget(&key);

        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_tracks_keys_independently() {
        let limiter = ItemExponentialLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        let a = "a".to_string();
        let b = "b".to_string();

        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(limiter.when(&b), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&a), 2);
    }

    #[test]
    fn test_exponential_huge_exponent_hits_cap() {
        let limiter: ItemExponentialLimiter<String> =
            ItemExponentialLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(limiter.delay_for(40), Duration::from_secs(1000));
        assert_eq!(limiter.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_spaces_out() {
        let limiter = BucketLimiter::new(10.0, 2);

        assert_eq!(RateLimiter::<u8>::when(&limiter, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u8>::when(&limiter, &0), Duration::ZERO);
        let third = RateLimiter::<u8>::when(&limiter, &0);
        assert!(third >= Duration::from_millis(99) && third <= Duration::from_millis(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_takes_longest() {
        let limiter: MaxOfLimiter<String> = controller_limiter(
            Duration::from_millis(5),
            Duration::from_secs(1),
            1000.0,
            100,
        );
        let key = "k".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&key), 2);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
