//! Per-client-IP rate limiting using governor.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::error::ApiError;

/// Keyed limiter shared by all requests. `None` disables limiting.
#[derive(Clone)]
pub struct ClientRateLimiter {
    inner: Option<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
}

impl ClientRateLimiter {
    pub fn per_minute(requests: u32) -> Self {
        let inner = NonZeroU32::new(requests)
            .map(|n| Arc::new(RateLimiter::keyed(Quota::per_minute(n))));
        Self { inner }
    }

    /// `Err(retry_after_secs)` when the client is over budget.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let Some(limiter) = &self.inner else {
            return Ok(());
        };
        limiter.check_key(&ip).map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            wait.as_secs().max(1)
        })
    }

    /// Drop state for clients that are back under budget.
    pub fn prune(&self) {
        if let Some(limiter) = &self.inner {
            limiter.retain_recent();
        }
    }
}

/// Requests without connection info (in-process tests) share one bucket.
fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn limit_by_client_ip(
    State(limiter): State<ClientRateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(&req);
    match limiter.check(ip) {
        Ok(()) => Ok(next.run(req).await),
        Err(retry_after_secs) => {
            tracing::warn!(client_ip = %ip, retry_after_secs, "Rate limit exceeded");
            limiter.prune();
            Err(ApiError::RateLimited { retry_after_secs })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_disables_limiting() {
        let limiter = ClientRateLimiter::per_minute(0);
        for _ in 0..1000 {
            assert!(limiter.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_ok());
        }
    }

    #[test]
    fn test_budget_is_per_client() {
        let limiter = ClientRateLimiter::per_minute(2);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_ok());
        let retry = limiter.check(a).unwrap_err();
        assert!(retry >= 1);

        assert!(limiter.check(b).is_ok());
    }
}
