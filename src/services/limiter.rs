//! Process-wide rate limiting for outbound racing-API calls.
//!
//! A single token bucket (capacity 2, refill 2 tokens/second) is shared by
//! every fetcher; the limiter, not the scheduler, is the global bottleneck,
//! so the externally visible request rate stays at 2 rps no matter how many
//! workers run inside the process.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;

/// Sustained refill rate (tokens per second).
const REFILL_PER_SECOND: u32 = 2;
/// Bucket capacity (maximum burst).
const BURST_CAPACITY: u32 = 2;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket governing all outbound API calls.
///
/// Cheap to share behind an `Arc`; `acquire` suspends the caller until a
/// token is available and never busy-waits.
pub struct ApiRateLimiter {
    inner: DirectRateLimiter,
}

impl std::fmt::Debug for ApiRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRateLimiter")
            .field("refill_per_second", &REFILL_PER_SECOND)
            .field("burst_capacity", &BURST_CAPACITY)
            .finish()
    }
}

impl ApiRateLimiter {
    pub fn new() -> Self {
        let refill = NonZeroU32::new(REFILL_PER_SECOND).unwrap();
        let burst = NonZeroU32::new(BURST_CAPACITY).unwrap();
        Self {
            inner: RateLimiter::direct(Quota::per_second(refill).allow_burst(burst)),
        }
    }

    /// Block (asynchronously) until a token is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
