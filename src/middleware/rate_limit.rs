use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroU32,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::error::AppError;
use crate::AppState;

pub type IpRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-IP request throttle.
///
/// One limiter per client address, sized from the configured window and
/// request budget.
#[derive(Clone)]
pub struct RateLimitState {
    limiters: Arc<RwLock<HashMap<String, Arc<IpRateLimiter>>>>,
    quota: Quota,
}

impl RateLimitState {
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        let max = NonZeroU32::new(max_requests.max(1)).unwrap_or(NonZeroU32::MIN);
        let per_request = Duration::from_millis((window_ms / u64::from(max.get())).max(1));
        let quota = Quota::with_period(per_request)
            .unwrap_or_else(|| Quota::per_minute(max))
            .allow_burst(max);

        Self {
            limiters: Arc::new(RwLock::new(HashMap::new())),
            quota,
        }
    }

    fn limiter_for(&self, ip: &str) -> Arc<IpRateLimiter> {
        {
            let read_guard = self.limiters.read().unwrap();
            if let Some(limiter) = read_guard.get(ip) {
                return limiter.clone();
            }
        }

        let mut write_guard = self.limiters.write().unwrap();
        if let Some(limiter) = write_guard.get(ip) {
            return limiter.clone();
        }

        let limiter = Arc::new(RateLimiter::direct(self.quota));
        write_guard.insert(ip.to_string(), limiter.clone());
        limiter
    }

    pub fn check(&self, ip: &str) -> bool {
        self.limiter_for(ip).check().is_ok()
    }
}

/// Rate limiting middleware keyed by client IP.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.rate_limit.check(&addr.ip().to_string()) {
        return Err(AppError::RateLimited);
    }
    Ok(next.run(request).await)
}
