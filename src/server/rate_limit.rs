//! Per-client sliding-window limits for the upload and submission routes.
//!
//! Each limiter keeps the instants of a client's recent requests. A request
//! is admitted while fewer than `max_requests` fall inside the window; a
//! refused request is not recorded, so a client that backs off regains
//! capacity as soon as its oldest request ages out.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::routes::ErrorResponse;
use super::AppState;
use crate::models::RateLimitConfig;

/// Clients are swept for empty histories once the map grows past this.
const SWEEP_THRESHOLD: usize = 1024;

/// Key used when the connection address is not available.
const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    name: &'static str,
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(name: &'static str, max_requests: usize, window: Duration) -> Self {
        Self {
            name,
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Admit or refuse one request from `client` at `now`.
    ///
    /// Returns the remaining allowance on success, or how long until the
    /// oldest request in the window expires.
    pub fn check_at(&self, client: &str, now: Instant) -> Result<usize, Duration> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());

        if hits.len() > SWEEP_THRESHOLD {
            let window = self.window;
            hits.retain(|_, times| {
                expire(times, now, window);
                !times.is_empty()
            });
        }

        let times = hits.entry(client.to_string()).or_default();
        expire(times, now, self.window);

        if times.len() >= self.max_requests {
            let retry_after = times
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default();
            return Err(retry_after);
        }

        times.push_back(now);
        Ok(self.max_requests - times.len())
    }

    pub fn check(&self, client: &str) -> Result<usize, Duration> {
        self.check_at(client, Instant::now())
    }
}

fn expire(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = times.front() {
        if now.saturating_duration_since(*oldest) < window {
            break;
        }
        times.pop_front();
    }
}

/// The limiters the router consults. `None` when limiting is disabled.
#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    pub uploads: Option<Arc<SlidingWindowLimiter>>,
    pub submissions: Option<Arc<SlidingWindowLimiter>>,
}

impl RateLimits {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        Self {
            uploads: Some(Arc::new(SlidingWindowLimiter::new(
                "uploads",
                config.max_uploads,
                Duration::from_secs(config.upload_window_secs),
            ))),
            submissions: Some(Arc::new(SlidingWindowLimiter::new(
                "submissions",
                config.max_submissions,
                Duration::from_secs(config.submission_window_secs),
            ))),
        }
    }
}

fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

async fn enforce(
    limiter: Option<&SlidingWindowLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = limiter else {
        return next.run(request).await;
    };
    let client = client_key(&request);
    match limiter.check(&client) {
        Ok(_) => next.run(request).await,
        Err(retry_after) => {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            tracing::warn!(
                "Rate limit on {} exceeded by {}, retry in {}s",
                limiter.name(),
                client,
                secs
            );
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse {
                    error: "rate_limited".to_string(),
                    message: format!(
                        "Too many {} requests. Try again in {} seconds.",
                        limiter.name(),
                        secs
                    ),
                }),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            response
        }
    }
}

pub async fn limit_uploads(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    enforce(state.limits.uploads.as_deref(), request, next).await
}

pub async fn limit_submissions(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    enforce(state.limits.submissions.as_deref(), request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_admits_up_to_limit() {
        let limiter = SlidingWindowLimiter::new("uploads", 3, Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.check_at("10.0.0.1", start), Ok(2));
        assert_eq!(limiter.check_at("10.0.0.1", start), Ok(1));
        assert_eq!(limiter.check_at("10.0.0.1", start), Ok(0));

        let retry = limiter
            .check_at("10.0.0.1", start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(retry, Duration::from_secs(40));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = SlidingWindowLimiter::new("submissions", 1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at("10.0.0.1", now).is_ok());
        assert!(limiter.check_at("10.0.0.1", now).is_err());
        assert!(limiter.check_at("10.0.0.2", now).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new("uploads", 2, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.check_at("c", start).is_ok());
        assert!(limiter.check_at("c", start + Duration::from_secs(5)).is_ok());
        assert!(limiter.check_at("c", start + Duration::from_secs(9)).is_err());

        // The first request has aged out; the second still counts.
        assert_eq!(limiter.check_at("c", start + Duration::from_secs(10)), Ok(0));
        assert!(limiter.check_at("c", start + Duration::from_secs(12)).is_err());
    }

    #[test]
    fn test_refused_requests_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new("uploads", 1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.check_at("c", start).is_ok());
        for i in 1..5 {
            assert!(limiter.check_at("c", start + Duration::from_secs(i)).is_err());
        }
        assert!(limiter.check_at("c", start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_disabled_config_builds_no_limiters() {
        let limits = RateLimits::from_config(&RateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(limits.uploads.is_none());
        assert!(limits.submissions.is_none());

        let limits = RateLimits::from_config(&RateLimitConfig::default());
        assert_eq!(limits.uploads.as_ref().map(|l| l.name()), Some("uploads"));
    }
}
