//! Connection and message rate limiting.
//!
//! A LAN session has a handful of peers, so the limits are generous; they
//! only exist to stop a misbehaving device from flooding the session actor.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

pub type SimpleRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Upper bound of tracked IPs before stale entries are evicted.
const MAX_TRACKED_IPS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Max new connections per IP per second (0 = disabled).
    pub conn_per_ip_per_sec: u32,
    /// Max frames per connection per second (0 = disabled).
    pub msg_per_conn_per_sec: u32,
    /// Burst allowance as a multiple of the per-second rate.
    pub burst_multiplier: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            conn_per_ip_per_sec: 10,
            msg_per_conn_per_sec: 50,
            burst_multiplier: 3,
        }
    }
}

fn quota(per_sec: u32, burst_multiplier: u32) -> Option<Quota> {
    let burst = per_sec.saturating_mul(burst_multiplier.max(1));
    Some(Quota::per_second(NonZeroU32::new(per_sec)?).allow_burst(NonZeroU32::new(burst)?))
}

/// Rejects IPs that open connections faster than configured.
pub struct IpRateLimiter {
    limiters: DashMap<IpAddr, SimpleRateLimiter>,
    quota: Option<Quota>,
}

impl IpRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            quota: quota(config.conn_per_ip_per_sec, config.burst_multiplier),
        }
    }

    /// `true` if a connection from `ip` may proceed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        if self.limiters.len() > MAX_TRACKED_IPS {
            self.evict(MAX_TRACKED_IPS / 2);
        }
        self.limiters
            .entry(ip)
            .or_insert_with(|| RateLimiter::direct(quota))
            .check()
            .is_ok()
    }

    // DashMap keeps no insertion order; evict arbitrary entries.
    fn evict(&self, keep: usize) {
        let excess = self.limiters.len().saturating_sub(keep);
        let keys: Vec<IpAddr> = self
            .limiters
            .iter()
            .take(excess)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            self.limiters.remove(&key);
        }
    }
}

/// Per-connection frame rate limiter.
#[derive(Clone)]
pub struct ConnRateLimiter {
    limiter: Arc<SimpleRateLimiter>,
}

impl ConnRateLimiter {
    /// `None` when message limiting is disabled.
    pub fn new(config: &RateLimitConfig) -> Option<Self> {
        let quota = quota(config.msg_per_conn_per_sec, config.burst_multiplier)?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn ip_limiter_allows_burst_then_rejects() {
        let limiter = IpRateLimiter::new(&RateLimitConfig {
            conn_per_ip_per_sec: 2,
            msg_per_conn_per_sec: 100,
            burst_multiplier: 2,
        });
        for _ in 0..4 {
            assert!(limiter.check(LOCALHOST));
        }
        assert!(!limiter.check(LOCALHOST));
        assert!(limiter.check(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn conn_limiter_rejects_flood() {
        let limiter = ConnRateLimiter::new(&RateLimitConfig {
            conn_per_ip_per_sec: 10,
            msg_per_conn_per_sec: 5,
            burst_multiplier: 1,
        })
        .unwrap();
        let allowed = (0..20).filter(|_| limiter.check()).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn zero_rates_disable_limiting() {
        let config = RateLimitConfig {
            conn_per_ip_per_sec: 0,
            msg_per_conn_per_sec: 0,
            burst_multiplier: 3,
        };
        let ip_limiter = IpRateLimiter::new(&config);
        assert!((0..1000).all(|_| ip_limiter.check(LOCALHOST)));
        assert!(ConnRateLimiter::new(&config).is_none());
    }
}
