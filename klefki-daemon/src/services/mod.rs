//! gRPC service implementations.

mod broker;
mod rate_limit;

pub use broker::KlefkiBroker;
pub use rate_limit::PollRateLimiter;
