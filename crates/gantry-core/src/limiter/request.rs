//! Per-endpoint sliding-window request limiter with lockout.
//!
//! Each endpoint carries a FIFO of recent request timestamps. A check trims
//! timestamps older than the window, rejects and locks the endpoint out when
//! the budget is exhausted, and otherwise records the request. Expired
//! entries are removed by a channel-driven background consumer that works in
//! small batches and yields between them, so cleanup never stalls dispatch.
//!
//! Timestamps use `tokio::time::Instant` so tests can drive the clock with
//! the paused runtime.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{error::ConfigError, handler::RateLimitLevel};

/// Entries examined between cooperative yields during cleanup.
const CLEANUP_BATCH: usize = 100;

/// Bound on the wait for the cleanup consumer during dispose.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sliding-window configuration; all values validated at construction.
#[derive(Debug, Clone)]
pub struct RequestLimitConfig {
    /// Requests allowed inside one window.
    pub max_allowed_requests: usize,
    /// Window length.
    pub time_window: Duration,
    /// Lockout applied when the budget is exhausted.
    pub lockout_duration: Duration,
}

impl Default for RequestLimitConfig {
    fn default() -> Self {
        Self {
            max_allowed_requests: 50,
            time_window: Duration::from_millis(1000),
            lockout_duration: Duration::from_secs(10),
        }
    }
}

impl RequestLimitConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_allowed_requests == 0 {
            return Err(ConfigError::must_be_positive("max_allowed_requests"));
        }
        if self.time_window.is_zero() {
            return Err(ConfigError::must_be_positive("time_window_milliseconds"));
        }
        if self.lockout_duration.is_zero() {
            return Err(ConfigError::must_be_positive("lockout_duration_seconds"));
        }
        Ok(())
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestLimiterMetrics {
    /// Checks performed.
    pub total_checks: u64,
    /// Checks rejected (budget exhausted or lockout active).
    pub total_rejections: u64,
    /// Entries removed by cleanup since startup.
    pub total_cleaned_entries: u64,
    /// Endpoints currently tracked.
    pub tracked_endpoints: usize,
}

/// Per-endpoint sliding window state.
#[derive(Debug)]
struct RateEntry {
    /// One timestamp per request still inside the window, oldest first.
    timestamps: VecDeque<Instant>,
    /// Lockout deadline; all requests rejected until it elapses.
    blocked_until: Option<Instant>,
    /// Last observed request, for diagnostics.
    last_request: Instant,
}

impl RateEntry {
    fn new(now: Instant) -> Self {
        Self { timestamps: VecDeque::new(), blocked_until: None, last_request: now }
    }
}

/// Per-endpoint sliding-window rate limiter.
///
/// Construction is synchronous; call [`RequestLimiter::spawn_cleanup`] once
/// a runtime is available to start the background consumer.
#[derive(Debug)]
pub struct RequestLimiter {
    entries: DashMap<IpAddr, RateEntry>,
    config: RequestLimitConfig,
    cleanup_tx: mpsc::Sender<()>,
    cleanup_rx: Mutex<Option<mpsc::Receiver<()>>>,
    cleanup_running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    total_checks: AtomicU64,
    total_rejections: AtomicU64,
    total_cleaned: AtomicU64,
}

impl RequestLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: RequestLimitConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        // Capacity 1 makes triggers idempotent: a pending request absorbs
        // every further trigger until the consumer runs.
        let (cleanup_tx, cleanup_rx) = mpsc::channel(1);

        Ok(Arc::new(Self {
            entries: DashMap::new(),
            config,
            cleanup_tx,
            cleanup_rx: Mutex::new(Some(cleanup_rx)),
            cleanup_running: AtomicBool::new(false),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            total_checks: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_cleaned: AtomicU64::new(0),
        }))
    }

    /// Start the background cleanup consumer. Idempotent; requires a tokio
    /// runtime.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        #[allow(clippy::unwrap_used)] // limiter mutexes are never poisoned: no panics while held
        let Some(mut rx) = self.cleanup_rx.lock().unwrap().take() else {
            return;
        };

        let limiter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = limiter.shutdown.cancelled() => {
                        // Drain pending triggers so senders never observe a
                        // wedged channel, then stop.
                        while rx.try_recv().is_ok() {}
                        break;
                    }
                    request = rx.recv() => {
                        match request {
                            Some(()) => limiter.run_cleanup().await,
                            None => break,
                        }
                    }
                }
            }
        });

        #[allow(clippy::unwrap_used)] // limiter mutexes are never poisoned: no panics while held
        let mut worker = self.worker.lock().unwrap();
        *worker = Some(handle);
    }

    /// Sliding-window check: `true` admits the request.
    pub fn check_limit(&self, endpoint: IpAddr) -> bool {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let allowed = {
            let mut entry = self.entries.entry(endpoint).or_insert_with(|| RateEntry::new(now));
            self.apply(&mut entry, now)
        };

        if !allowed {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
        }

        self.maybe_request_cleanup();
        allowed
    }

    /// Batch form of [`Self::check_limit`]; one result per endpoint.
    #[must_use]
    pub fn check_limits(&self, endpoints: &[IpAddr]) -> HashMap<IpAddr, bool> {
        endpoints.iter().map(|&endpoint| (endpoint, self.check_limit(endpoint))).collect()
    }

    /// Queue a cleanup run now. Idempotent while one is pending.
    pub fn trigger_cleanup(&self) {
        let _ = self.cleanup_tx.try_send(());
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> RequestLimiterMetrics {
        RequestLimiterMetrics {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_cleaned_entries: self.total_cleaned.load(Ordering::Relaxed),
            tracked_endpoints: self.entries.len(),
        }
    }

    /// Lockout deadline for `endpoint`, if one is active.
    #[must_use]
    pub fn blocked_until(&self, endpoint: IpAddr) -> Option<Instant> {
        self.entries.get(&endpoint).and_then(|e| e.blocked_until)
    }

    /// Cooperative shutdown: cancel the consumer, wait up to five seconds,
    /// release entries. Double-dispose is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return;
        }

        self.shutdown.cancel();

        let handle = {
            #[allow(clippy::unwrap_used)] // limiter mutexes are never poisoned: no panics while held
            let mut worker = self.worker.lock().unwrap();
            worker.take()
        };

        if let Some(handle) = handle {
            if tokio::time::timeout(DISPOSE_TIMEOUT, handle).await.is_err() {
                tracing::warn!("request limiter cleanup consumer did not stop in time");
            }
        }

        self.entries.clear();
    }

    fn apply(&self, entry: &mut RateEntry, now: Instant) -> bool {
        // Active lockout short-circuits without touching the queue.
        if let Some(blocked_until) = entry.blocked_until {
            if blocked_until > now {
                return false;
            }
        }
        entry.blocked_until = None;

        while let Some(&front) = entry.timestamps.front() {
            if now.duration_since(front) > self.config.time_window {
                entry.timestamps.pop_front();
            } else {
                break;
            }
        }

        if entry.timestamps.len() >= self.config.max_allowed_requests {
            entry.blocked_until = Some(now + self.config.lockout_duration);
            entry.last_request = now;
            return false;
        }

        entry.timestamps.push_back(now);
        entry.last_request = now;
        true
    }

    fn maybe_request_cleanup(&self) {
        if self.entries.len() > self.config.max_allowed_requests * 10 {
            self.trigger_cleanup();
        }
    }

    async fn run_cleanup(&self) {
        // 0/1 latch: only one run at a time even if triggers pile up.
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let now = Instant::now();
        let keys: Vec<IpAddr> = self.entries.iter().map(|e| *e.key()).collect();
        let mut removed: u64 = 0;

        for batch in keys.chunks(CLEANUP_BATCH) {
            for &endpoint in batch {
                let was_removed = self
                    .entries
                    .remove_if(&endpoint, |_, entry| {
                        entry.timestamps.is_empty()
                            && entry.blocked_until.is_none_or(|blocked| blocked <= now)
                    })
                    .is_some();
                if was_removed {
                    removed += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        if removed > 0 {
            self.total_cleaned.fetch_add(removed, Ordering::Relaxed);
            tracing::debug!(removed, "request limiter cleanup");
        }

        self.cleanup_running.store(false, Ordering::Release);
    }
}

/// Per-tier limit configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestLimiterSetConfig {
    /// Budget for [`RateLimitLevel::Lenient`] opcodes.
    pub lenient: RequestLimitConfig,
    /// Budget for [`RateLimitLevel::Standard`] opcodes.
    pub standard: RequestLimitConfig,
    /// Budget for [`RateLimitLevel::Strict`] opcodes.
    pub strict: RequestLimitConfig,
}

impl RequestLimiterSetConfig {
    /// Conventional tiering: lenient is 4x the standard budget, strict a
    /// quarter of it (rounded up), with the standard window and lockout.
    #[must_use]
    pub fn tiered(standard: RequestLimitConfig) -> Self {
        let lenient = RequestLimitConfig {
            max_allowed_requests: standard.max_allowed_requests * 4,
            ..standard.clone()
        };
        let strict = RequestLimitConfig {
            max_allowed_requests: standard.max_allowed_requests.div_ceil(4),
            ..standard.clone()
        };
        Self { lenient, standard, strict }
    }
}

/// One [`RequestLimiter`] per [`RateLimitLevel`].
#[derive(Debug)]
pub struct RequestLimiterSet {
    lenient: Arc<RequestLimiter>,
    standard: Arc<RequestLimiter>,
    strict: Arc<RequestLimiter>,
}

impl RequestLimiterSet {
    /// Build all three tiers from validated configuration.
    pub fn new(config: RequestLimiterSetConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            lenient: RequestLimiter::new(config.lenient)?,
            standard: RequestLimiter::new(config.standard)?,
            strict: RequestLimiter::new(config.strict)?,
        })
    }

    /// Limiter backing one tier.
    #[must_use]
    pub fn limiter(&self, level: RateLimitLevel) -> &Arc<RequestLimiter> {
        match level {
            RateLimitLevel::Lenient => &self.lenient,
            RateLimitLevel::Standard => &self.standard,
            RateLimitLevel::Strict => &self.strict,
        }
    }

    /// Check `endpoint` against the limiter for `level`.
    pub fn check(&self, endpoint: IpAddr, level: RateLimitLevel) -> bool {
        self.limiter(level).check_limit(endpoint)
    }

    /// Start every tier's cleanup consumer.
    pub fn spawn_cleanup(&self) {
        self.lenient.spawn_cleanup();
        self.standard.spawn_cleanup();
        self.strict.spawn_cleanup();
    }

    /// Dispose every tier.
    pub async fn dispose(&self) {
        self.lenient.dispose().await;
        self.standard.dispose().await;
        self.strict.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, window_ms: u64, lockout_ms: u64) -> RequestLimitConfig {
        RequestLimitConfig {
            max_allowed_requests: max,
            time_window: Duration::from_millis(window_ms),
            lockout_duration: Duration::from_millis(lockout_ms),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn zero_config_values_are_rejected() {
        assert!(RequestLimiter::new(config(0, 1000, 2000)).is_err());
        assert!(RequestLimiter::new(config(3, 0, 2000)).is_err());
        assert!(RequestLimiter::new(config(3, 1000, 0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_scenario() {
        // max 3 in 1000 ms, lockout 2000 ms; the canonical timing walk.
        let limiter = RequestLimiter::new(config(3, 1000, 2000)).unwrap();
        let endpoint = ip("10.0.0.1");

        assert!(limiter.check_limit(endpoint)); // t = 0
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.check_limit(endpoint)); // t = 100
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.check_limit(endpoint)); // t = 200

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!limiter.check_limit(endpoint)); // t = 300: budget spent
        assert!(limiter.blocked_until(endpoint).is_some());

        tokio::time::advance(Duration::from_millis(1900)).await;
        assert!(!limiter.check_limit(endpoint)); // t = 2200: still locked out

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.check_limit(endpoint)); // t = 2400: lockout elapsed
        assert!(limiter.blocked_until(endpoint).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn window_trims_to_recent_requests() {
        let limiter = RequestLimiter::new(config(2, 1000, 5000)).unwrap();
        let endpoint = ip("10.0.0.1");

        assert!(limiter.check_limit(endpoint)); // t = 0
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(limiter.check_limit(endpoint)); // t = 1500: t=0 expired
        assert!(limiter.check_limit(endpoint)); // t = 1500: second in window
        assert!(!limiter.check_limit(endpoint)); // budget spent
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_max_requests_are_accepted() {
        let limiter = RequestLimiter::new(config(5, 1000, 2000)).unwrap();
        let endpoint = ip("10.0.0.1");

        for _ in 0..5 {
            assert!(limiter.check_limit(endpoint));
        }
        assert!(!limiter.check_limit(endpoint));
        assert_eq!(limiter.metrics().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoints_do_not_share_budgets() {
        let limiter = RequestLimiter::new(config(1, 1000, 2000)).unwrap();

        assert!(limiter.check_limit(ip("10.0.0.1")));
        assert!(limiter.check_limit(ip("10.0.0.2")));
        assert!(!limiter.check_limit(ip("10.0.0.1")));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_check_collects_per_endpoint_results() {
        let limiter = RequestLimiter::new(config(1, 1000, 2000)).unwrap();
        let a = ip("10.0.0.1");
        let b = ip("10.0.0.2");

        assert!(limiter.check_limit(a));

        let results = limiter.check_limits(&[a, b]);
        assert_eq!(results.get(&a), Some(&false));
        assert_eq!(results.get(&b), Some(&true));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_keeps_entries_with_recent_requests() {
        let limiter = RequestLimiter::new(config(3, 100, 100)).unwrap();
        limiter.spawn_cleanup();

        assert!(limiter.check_limit(ip("10.0.0.1")));
        assert!(limiter.check_limit(ip("10.0.0.2")));
        assert_eq!(limiter.metrics().tracked_endpoints, 2);

        // Timestamps are still inside the window; nothing may be removed.
        limiter.trigger_cleanup();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(limiter.metrics().tracked_endpoints, 2);
        assert_eq!(limiter.metrics().total_cleaned_entries, 0);

        limiter.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_empty_unblocked_entries() {
        let limiter = RequestLimiter::new(config(3, 100, 100)).unwrap();
        limiter.spawn_cleanup();
        let endpoint = ip("10.0.0.1");

        assert!(limiter.check_limit(endpoint));
        tokio::time::advance(Duration::from_millis(200)).await;

        // Trimming happens on the next check; drain the queue by hand via
        // the entry's own trim path.
        {
            let mut entry = limiter.entries.get_mut(&endpoint).unwrap();
            entry.timestamps.clear();
        }

        limiter.trigger_cleanup();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(limiter.metrics().tracked_endpoints, 0);
        assert_eq!(limiter.metrics().total_cleaned_entries, 1);

        limiter.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent_and_stops_consumer() {
        let limiter = RequestLimiter::new(config(3, 100, 100)).unwrap();
        limiter.spawn_cleanup();

        assert!(limiter.check_limit(ip("10.0.0.1")));

        limiter.dispose().await;
        limiter.dispose().await;

        assert_eq!(limiter.metrics().tracked_endpoints, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_set_routes_levels_independently() {
        let set = RequestLimiterSet::new(RequestLimiterSetConfig {
            lenient: config(10, 1000, 2000),
            standard: config(3, 1000, 2000),
            strict: config(1, 1000, 2000),
        })
        .unwrap();
        let endpoint = ip("10.0.0.1");

        assert!(set.check(endpoint, RateLimitLevel::Strict));
        assert!(!set.check(endpoint, RateLimitLevel::Strict));
        // Other tiers keep their own budgets.
        assert!(set.check(endpoint, RateLimitLevel::Standard));
        assert!(set.check(endpoint, RateLimitLevel::Lenient));
    }

    #[test]
    fn tiered_config_scales_around_standard() {
        let tiers = RequestLimiterSetConfig::tiered(config(8, 1000, 2000));
        assert_eq!(tiers.lenient.max_allowed_requests, 32);
        assert_eq!(tiers.standard.max_allowed_requests, 8);
        assert_eq!(tiers.strict.max_allowed_requests, 2);
    }
}
