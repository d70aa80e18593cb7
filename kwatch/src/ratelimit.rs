use crate::key::ObjectKey;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::time::Instant;

/*
 * A RateLimiter decides how long a failed key has to wait before it is
 * handed out again.
 */
pub trait RateLimiter: Send + Sync {

    /* Delay before `key` may be retried. Counts as one more failure. */
    fn when(&self, key: &ObjectKey) -> Duration;

    /* Stop tracking `key`, its next failure starts from scratch. */
    fn forget(&self, key: &ObjectKey);

    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/*
 * Per-key exponential backoff: base * 2^failures, capped at max.
 */
pub struct ItemExponentialFailureRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl ItemExponentialFailureRateLimiter {

    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
	Self{
	    base_delay: base_delay,
	    max_delay: max_delay,
	    failures: Mutex::new(HashMap::new()),
	}
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {

    fn when(&self, key: &ObjectKey) -> Duration {
	let exp = {
	    let mut failures = lock(&self.failures);
	    let count = failures.entry(key.clone()).or_insert(0);
	    let exp = *count;
	    *count = count.saturating_add(1);
	    exp
	};

	let backoff = 2u32.checked_pow(exp)
	    .and_then(|factor| self.base_delay.checked_mul(factor));

	match backoff {
	    Some(backoff) if backoff <= self.max_delay => backoff,
	    _ => self.max_delay,
	}
    }

    fn forget(&self, key: &ObjectKey) {
	lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
	lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/*
 * Overall token bucket shared by every key: `burst` retries go out right
 * away, after that they are paced at `qps`.
 */
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {

    pub fn new(qps: f64, burst: u32) -> Self {
	let burst = f64::from(burst);

	Self{
	    qps: qps,
	    burst: burst,
	    bucket: Mutex::new(Bucket{
		tokens: burst,
		last: Instant::now(),
	    }),
	}
    }
}

impl RateLimiter for BucketRateLimiter {

    fn when(&self, _key: &ObjectKey) -> Duration {
	let mut bucket = lock(&self.bucket);
	let now = Instant::now();

	let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
	bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
	bucket.last = now;

	// reserve a token, possibly one that only exists in the future
	bucket.tokens -= 1.0;
	if bucket.tokens >= 0.0 || self.qps <= 0.0 {
	    return Duration::ZERO;
	}

	Duration::from_secs_f64(-bucket.tokens / self.qps)
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
	0
    }
}

/*
 * Combines several limiters, the longest delay wins.
 */
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {

    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
	Self{
	    limiters: limiters,
	}
    }
}

impl RateLimiter for MaxOfRateLimiter {

    fn when(&self, key: &ObjectKey) -> Duration {
	// every limiter has to see the failure, so no short-circuit here
	self.limiters.iter()
	    .map(|limiter| limiter.when(key))
	    .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &ObjectKey) {
	for limiter in &self.limiters {
	    limiter.forget(key);
	}
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
	self.limiters.iter()
	    .map(|limiter| limiter.num_requeues(key))
	    .max()
	    .unwrap_or(0)
    }
}

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/*
 * Per-key exponential backoff from 5ms up to 1000s, together with an
 * overall 10 qps / 100 burst bucket.
 */
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
	Box::new(ItemExponentialFailureRateLimiter::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)),
	Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}
