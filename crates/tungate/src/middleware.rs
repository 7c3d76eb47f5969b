//! Request-level rate limiting adapter.
//!
//! Framework-neutral: anything that can turn a request into a response is a
//! [`Service`], and the adapter only needs a way to build the rejection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::limiter::RateLimiter;

/// HTTP status sent when a request is rejected
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Body sent with a rejection
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

/// Something that handles a request
pub trait Service<Req> {
    /// Response produced for each request
    type Response;

    /// Handle one request
    fn call(&self, req: Req) -> Self::Response;
}

/// Requests that know their peer address, used when no key can be derived
pub trait RemoteAddr {
    /// Address of the peer that sent the request
    fn remote_addr(&self) -> SocketAddr;
}

/// Responses that can express a rate-limit rejection
pub trait TooManyRequests {
    /// Build a rejection with [`TOO_MANY_REQUESTS`] status and `message`
    fn too_many_requests(message: &str) -> Self;
}

impl TooManyRequests for (u16, String) {
    fn too_many_requests(message: &str) -> Self {
        (TOO_MANY_REQUESTS, message.to_string())
    }
}

/// [`Service`] built from a closure
#[derive(Clone)]
pub struct ServiceFn<F> {
    f: F,
}

/// Wrap a closure as a [`Service`]
pub fn service_fn<F>(f: F) -> ServiceFn<F> {
    ServiceFn { f }
}

impl<Req, Resp, F> Service<Req> for ServiceFn<F>
where
    F: Fn(Req) -> Resp,
{
    type Response = Resp;

    fn call(&self, req: Req) -> Resp {
        (self.f)(req)
    }
}

/// Rejects requests whose key has no token left, forwards the rest
pub struct RateLimitMiddleware<K, S> {
    limiter: Arc<RateLimiter>,
    key_fn: K,
    next: S,
}

impl<K, S> RateLimitMiddleware<K, S> {
    /// Wrap `next`, keying each request with `key_fn`.
    ///
    /// An empty key falls back to the request's remote address.
    pub fn new(limiter: Arc<RateLimiter>, key_fn: K, next: S) -> Self {
        Self {
            limiter,
            key_fn,
            next,
        }
    }
}

impl<Req, K, S> Service<Req> for RateLimitMiddleware<K, S>
where
    Req: RemoteAddr,
    K: Fn(&Req) -> String,
    S: Service<Req>,
    S::Response: TooManyRequests,
{
    type Response = S::Response;

    fn call(&self, req: Req) -> S::Response {
        let mut key = (self.key_fn)(&req);
        if key.is_empty() {
            key = req.remote_addr().to_string();
        }

        if !self.limiter.allow(&key) {
            return S::Response::too_many_requests(RATE_LIMIT_EXCEEDED);
        }

        self.next.call(req)
    }
}

impl RateLimiter {
    /// Wrap `next` in a [`RateLimitMiddleware`] backed by this limiter
    pub fn middleware<K, S>(self: &Arc<Self>, key_fn: K, next: S) -> RateLimitMiddleware<K, S> {
        RateLimitMiddleware::new(Arc::clone(self), key_fn, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::RateLimiterOptions;

    struct Request {
        peer: SocketAddr,
        api_key: String,
    }

    impl RemoteAddr for Request {
        fn remote_addr(&self) -> SocketAddr {
            self.peer
        }
    }

    fn request(peer: &str, api_key: &str) -> Request {
        Request {
            peer: peer.parse().unwrap(),
            api_key: api_key.to_string(),
        }
    }

    fn ok_service() -> ServiceFn<impl Fn(Request) -> (u16, String)> {
        service_fn(|req: Request| (200u16, format!("hello {}", req.api_key)))
    }

    #[test]
    fn test_forwards_until_limited() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterOptions::new(0.0, 2)));
        let svc = limiter.middleware(|req: &Request| req.api_key.clone(), ok_service());

        assert_eq!(svc.call(request("10.0.0.1:1000", "abc")).0, 200);
        assert_eq!(svc.call(request("10.0.0.2:1000", "abc")).0, 200);

        let rejected = svc.call(request("10.0.0.3:1000", "abc"));
        assert_eq!(rejected, (TOO_MANY_REQUESTS, RATE_LIMIT_EXCEEDED.to_string()));

        assert_eq!(svc.call(request("10.0.0.1:1000", "other")).0, 200);
    }

    #[test]
    fn test_empty_key_uses_remote_addr() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterOptions::new(0.0, 1)));
        let svc = RateLimitMiddleware::new(
            Arc::clone(&limiter),
            |_: &Request| String::new(),
            ok_service(),
        );

        assert_eq!(svc.call(request("10.0.0.1:1000", "")).0, 200);
        assert_eq!(svc.call(request("10.0.0.1:1000", "")).0, TOO_MANY_REQUESTS);
        assert_eq!(svc.call(request("10.0.0.1:2000", "")).0, 200);
        assert!(!limiter.allow("10.0.0.1:1000"));
    }
}
