//! # tungate
//!
//! Admission control for the tunnel server's accept path.
//!
//! - [`RateLimiter`]: one token bucket per key, created on first use, with
//!   non-blocking ([`allow`](RateLimiter::allow),
//!   [`reserve`](RateLimiter::reserve)) and blocking
//!   ([`wait`](RateLimiter::wait)) acquisition
//! - [`ConnectionLimiter`]: a rate limit plus a per-key ceiling on
//!   concurrently held connections
//! - [`RateLimitMiddleware`]: request-level adapter answering
//!   `429 Too Many Requests`
//!
//! Only `wait` ever suspends; everything else is a bounded, lock-protected
//! decision.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod bucket;
mod connection;
mod error;
mod limiter;
mod middleware;

pub use bucket::{Reservation, TokenBucket};
pub use connection::{ConnectionLimiter, ConnectionPermit};
pub use error::WaitError;
pub use limiter::{
    IpRateLimiter, RateLimiter, RateLimiterOptions, ReclaimPolicy, DEFAULT_RECLAIM_INTERVAL,
};
pub use middleware::{
    service_fn, RateLimitMiddleware, RemoteAddr, Service, ServiceFn, TooManyRequests,
    RATE_LIMIT_EXCEEDED, TOO_MANY_REQUESTS,
};
