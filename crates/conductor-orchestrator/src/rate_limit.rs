use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Global token bucket shared by all queue workers.
///
/// The bucket holds at most `capacity` tokens and is topped up to full once
/// per `refill_interval`. A capacity of zero disables limiting.
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A full bucket of `capacity` tokens.
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never blocks.
    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Whether `acquire` never waits.
    pub fn is_unlimited(&self) -> bool {
        self.capacity == 0 || self.refill_interval.is_zero()
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed >= self.refill_interval {
            let interval = self.refill_interval.as_nanos();
            let remainder = Duration::from_nanos((elapsed.as_nanos() % interval) as u64);
            bucket.tokens = self.capacity;
            bucket.last_refill = now - remainder;
        }
    }

    /// Take one token if available.
    pub async fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping until the next refill while the bucket is empty.
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }
        loop {
            let wake_at = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                self.refill(&mut bucket, now);
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                bucket.last_refill + self.refill_interval
            };
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Return a token that was acquired but not spent. Never exceeds capacity.
    pub async fn release(&self) {
        if self.is_unlimited() {
            return;
        }
        let mut bucket = self.bucket.lock().await;
        bucket.tokens = (bucket.tokens + 1).min(self.capacity);
    }

    /// Tokens left in the current interval.
    pub async fn available(&self) -> u32 {
        if self.is_unlimited() {
            return u32::MAX;
        }
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }
}
