//! Broker-wide request rate limiting.
//!
//! Bounds the cost of signature verification under a flood of polls. A
//! single unkeyed bucket covers every RPC on the broker service.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tonic::{Request, Status};

const DEFAULT_PER_SECOND: NonZeroU32 = match NonZeroU32::new(20) {
    Some(n) => n,
    None => unreachable!(),
};
const DEFAULT_BURST: NonZeroU32 = match NonZeroU32::new(100) {
    Some(n) => n,
    None => unreachable!(),
};

/// Token bucket shared by every clone.
#[derive(Clone)]
pub struct PollRateLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl PollRateLimiter {
    /// `per_second` is the sustained rate, `burst_size` the bucket depth.
    /// Zero falls back to the defaults (20/s, burst 100).
    pub fn new(per_second: u32, burst_size: u32) -> Self {
        let per_second = NonZeroU32::new(per_second).unwrap_or(DEFAULT_PER_SECOND);
        let burst_size = NonZeroU32::new(burst_size).unwrap_or(DEFAULT_BURST);

        let quota = Quota::per_second(per_second).allow_burst(burst_size);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// `Err(Status::resource_exhausted)` once the bucket is empty.
    pub fn check(&self) -> Result<(), Status> {
        match self.limiter.check() {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::warn!("Broker rate limit exceeded");
                Err(Status::resource_exhausted(
                    "too many requests, retry later",
                ))
            }
        }
    }
}

impl Default for PollRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SECOND.get(), DEFAULT_BURST.get())
    }
}

impl tonic::service::Interceptor for PollRateLimiter {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        self.check()?;
        Ok(request)
    }
}
