//! Per-host politeness delays for artifact and page requests.
//!
//! Consecutive requests to the *same* host are separated by a random delay
//! drawn from a configured range. Requests to different hosts never wait for
//! each other, and a worker waiting on one host does not hold any lock that
//! another host's workers need.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(1500), Duration::from_millis(3500));
//!
//! // First request proceeds immediately
//! limiter.acquire("https://aclanthology.org/a.pdf").await;
//!
//! // Second request to the same host waits 1.5-3.5s
//! limiter.acquire("https://aclanthology.org/b.pdf").await;
//!
//! // Request to a different host proceeds immediately
//! limiter.acquire("https://proceedings.mlr.press/c.pdf").await;
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative delay per host (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-host politeness limiter.
///
/// Shared between workers behind an `Arc`. Per-host state lives in a
/// `DashMap`; the map shard lock is released before any await.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// `None` until the first request to this host (first request is immediate).
    last_request: Mutex<Option<Instant>>,

    /// Set from a server `Retry-After`; no request to the host starts before it.
    blocked_until: std::sync::Mutex<Option<Instant>>,

    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            blocked_until: std::sync::Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }

    fn blocked_until(&self) -> Option<Instant> {
        *self
            .blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimiter {
    /// Creates a limiter drawing delays uniformly from `min_delay..=max_delay`.
    ///
    /// The bounds are swapped if given in reverse order.
    #[must_use]
    #[instrument(skip_all, fields(min_ms = min_delay.as_millis(), max_ms = max_delay.as_millis()))]
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        debug!("creating politeness limiter");
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };
        Self {
            min_delay,
            max_delay,
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that never delays (except for server `Retry-After`).
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.max_delay.is_zero()
    }

    #[must_use]
    pub fn delay_range(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }

    /// Waits until a request to `url`'s host is allowed, then records it.
    ///
    /// Same-host callers queue on the host's mutex; other hosts are unaffected.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", &host);

        let state = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone();

        let mut last_request = state.last_request.lock().await;

        let politeness_deadline = match *last_request {
            Some(last) if !self.is_disabled() => Some(last + self.sample_delay()),
            Some(_) => None,
            None => {
                debug!(host = %host, "first request to host - no delay");
                None
            }
        };
        let deadline = match (politeness_deadline, state.blocked_until()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        if let Some(deadline) = deadline {
            let delay = deadline.saturating_duration_since(Instant::now());
            if !delay.is_zero() {
                let cumulative = state.add_cumulative_delay(delay);
                debug!(
                    host = %host,
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying politeness delay"
                );
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        host = %host,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive delays for host - consider a smaller run"
                    );
                }
                tokio::time::sleep_until(deadline).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    /// Records a server-mandated delay (from `Retry-After`) for `url`'s host.
    ///
    /// Subsequent [`acquire`](Self::acquire) calls for that host wait at least
    /// until the delay has elapsed.
    #[instrument(skip(self), fields(host))]
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", &host);

        let delay = delay.min(MAX_RETRY_AFTER);
        let state = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone();

        let until = Instant::now() + delay;
        {
            let mut blocked = state
                .blocked_until
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *blocked = Some(blocked.map_or(until, |current| current.max(until)));
        }

        debug!(host = %host, delay_ms = delay.as_millis(), "recorded server rate limit");
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample_delay(&self) -> Duration {
        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        if min_ms == max_ms {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

/// Extracts the lowercase host from a URL.
///
/// Returns "unknown" for malformed URLs so they are still rate limited.
///
/// ```
/// use harvester_core::download::extract_domain;
///
/// assert_eq!(extract_domain("https://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds (`120`) and HTTP-date
/// (`Wed, 21 Oct 2025 07:28:00 GMT`). Dates in the past yield zero; values
/// above one hour are capped.
///
/// ```
/// use std::time::Duration;
/// use harvester_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => Some(
            datetime
                .duration_since(std::time::SystemTime::now())
                .map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER)),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}
