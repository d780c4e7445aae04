//! Per-endpoint concurrent-connection limiter.
//!
//! Admission control at `on_accept` time: each endpoint (IP) may hold at
//! most `max_connections_per_endpoint` live connections. Entries are atomic
//! records in a concurrent map, updated with bounded CAS loops; when the
//! retry budget is exhausted under pathological contention the limiter
//! fails safe and rejects. A background sweep removes entries that have
//! been idle with zero connections past the inactivity threshold.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;

use crate::error::ConfigError;

/// Retry budget for one CAS update before failing safe.
pub const MAX_CAS_RETRIES: u32 = 100;

/// Upper bound on entries examined per cleanup run.
pub const MAX_CLEANUP_KEYS_PER_RUN: usize = 1000;

/// Limiter configuration; all values validated at construction.
#[derive(Debug, Clone)]
pub struct ConnectionLimitConfig {
    /// Maximum live connections per endpoint.
    pub max_connections_per_endpoint: u32,
    /// Idle time after which a zero-connection entry may be removed.
    pub inactivity_threshold: Duration,
    /// Interval between background cleanup runs.
    pub cleanup_interval: Duration,
}

impl Default for ConnectionLimitConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: 20,
            inactivity_threshold: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ConnectionLimitConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_endpoint == 0 {
            return Err(ConfigError::must_be_positive("max_connections_per_endpoint"));
        }
        if self.inactivity_threshold.is_zero() {
            return Err(ConfigError::must_be_positive("inactivity_threshold"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::must_be_positive("cleanup_interval"));
        }
        Ok(())
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionLimiterMetrics {
    /// Admission attempts observed.
    pub total_connection_attempts: u64,
    /// Attempts rejected (cap reached or CAS budget exhausted).
    pub total_rejections: u64,
    /// Entries removed by cleanup since startup.
    pub total_cleaned_entries: u64,
    /// Endpoints currently tracked.
    pub tracked_endpoints: usize,
}

/// Per-endpoint record. All fields atomic; the record itself never moves
/// once inserted, so updates contend only on the fields.
#[derive(Debug)]
struct ConnectionEntry {
    /// Live connections right now. Never below zero.
    current_connections: AtomicI32,
    /// Unix milliseconds of the last admit/close touch.
    last_connection_ms: AtomicI64,
    /// Packed day-keyed daily counter: day number in the high 32 bits,
    /// count in the low 32. One CAS replaces both on day rollover.
    total_today: AtomicU64,
}

impl ConnectionEntry {
    fn new(now_ms: i64) -> Self {
        Self {
            current_connections: AtomicI32::new(0),
            last_connection_ms: AtomicI64::new(now_ms),
            total_today: AtomicU64::new(0),
        }
    }
}

fn unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as i64)
}

const MS_PER_DAY: i64 = 86_400_000;

fn day_of(ms: i64) -> u32 {
    (ms / MS_PER_DAY) as u32
}

/// Per-endpoint concurrent-connection cap.
#[derive(Debug)]
pub struct ConnectionLimiter {
    entries: DashMap<IpAddr, Arc<ConnectionEntry>>,
    config: ConnectionLimitConfig,
    total_attempts: AtomicU64,
    total_rejections: AtomicU64,
    total_cleaned: AtomicU64,
}

impl ConnectionLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: ConnectionLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            entries: DashMap::new(),
            config,
            total_attempts: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_cleaned: AtomicU64::new(0),
        })
    }

    /// Cleanup cadence the embedder should schedule [`Self::cleanup_stale`]
    /// at.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// Admission check: `true` admits one connection for `endpoint`.
    ///
    /// Lock-free on the hot path: the per-endpoint count is advanced with a
    /// bounded CAS loop. Exhausting the retry budget rejects (fail-safe).
    pub fn is_connection_allowed(&self, endpoint: IpAddr) -> bool {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);

        let now_ms = unix_ms();
        let entry = self
            .entries
            .entry(endpoint)
            .or_insert_with(|| Arc::new(ConnectionEntry::new(now_ms)))
            .value()
            .clone();

        let max = self.config.max_connections_per_endpoint as i32;
        for _ in 0..MAX_CAS_RETRIES {
            let current = entry.current_connections.load(Ordering::Acquire);
            if current >= max {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%endpoint, current, max, "connection rejected: endpoint at cap");
                return false;
            }

            if entry
                .current_connections
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                entry.last_connection_ms.store(now_ms, Ordering::Release);
                self.bump_daily(&entry, now_ms);
                return true;
            }
        }

        // Contention exhausted the retry budget; reject rather than guess.
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%endpoint, "connection rejected: CAS retry budget exhausted");
        false
    }

    /// Release one connection slot for `endpoint`.
    ///
    /// Decrements with the same bounded CAS loop, clamped at zero.
    pub fn on_connection_closed(&self, endpoint: IpAddr) {
        let Some(entry) = self.entries.get(&endpoint).map(|e| e.value().clone()) else {
            return;
        };

        let now_ms = unix_ms();
        for _ in 0..MAX_CAS_RETRIES {
            let current = entry.current_connections.load(Ordering::Acquire);
            let next = (current - 1).max(0);
            if current == next
                || entry
                    .current_connections
                    .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                entry.last_connection_ms.store(now_ms, Ordering::Release);
                return;
            }
        }
        tracing::warn!(%endpoint, "connection close: CAS retry budget exhausted");
    }

    /// Live connections for `endpoint` (0 if untracked).
    #[must_use]
    pub fn current_connections(&self, endpoint: IpAddr) -> i32 {
        self.entries
            .get(&endpoint)
            .map_or(0, |e| e.current_connections.load(Ordering::Acquire))
    }

    /// Connections admitted for `endpoint` today (0 if untracked).
    #[must_use]
    pub fn connections_today(&self, endpoint: IpAddr) -> u32 {
        self.entries.get(&endpoint).map_or(0, |e| {
            let packed = e.total_today.load(Ordering::Acquire);
            if (packed >> 32) as u32 == day_of(unix_ms()) { packed as u32 } else { 0 }
        })
    }

    /// Remove entries with zero connections idle past the threshold.
    ///
    /// Examines at most [`MAX_CLEANUP_KEYS_PER_RUN`] entries per run; meant
    /// to be driven by a recurring task at [`Self::cleanup_interval`].
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self) -> usize {
        let threshold_ms = unix_ms() - self.config.inactivity_threshold.as_millis() as i64;

        let candidates: Vec<IpAddr> = self
            .entries
            .iter()
            .take(MAX_CLEANUP_KEYS_PER_RUN)
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for endpoint in candidates {
            let was_removed = self
                .entries
                .remove_if(&endpoint, |_, entry| {
                    entry.current_connections.load(Ordering::Acquire) <= 0
                        && entry.last_connection_ms.load(Ordering::Acquire) < threshold_ms
                })
                .is_some();
            if was_removed {
                removed += 1;
            }
        }

        if removed > 0 {
            self.total_cleaned.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "connection limiter cleanup");
        }
        removed
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> ConnectionLimiterMetrics {
        ConnectionLimiterMetrics {
            total_connection_attempts: self.total_attempts.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_cleaned_entries: self.total_cleaned.load(Ordering::Relaxed),
            tracked_endpoints: self.entries.len(),
        }
    }

    /// Human-readable report: totals plus the top `top_n` endpoints by live
    /// connection count.
    #[must_use]
    pub fn generate_report(&self, top_n: usize) -> String {
        use std::fmt::Write as _;

        let metrics = self.metrics();
        let mut loads: Vec<(IpAddr, i32)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.current_connections.load(Ordering::Acquire)))
            .collect();
        loads.sort_by(|a, b| b.1.cmp(&a.1));
        loads.truncate(top_n);

        let mut report = format!(
            "connection limiter: {} tracked, {} attempts, {} rejections, {} cleaned\n",
            metrics.tracked_endpoints,
            metrics.total_connection_attempts,
            metrics.total_rejections,
            metrics.total_cleaned_entries,
        );
        for (endpoint, current) in loads {
            let _ = writeln!(report, "  {endpoint}: {current} connections");
        }
        report
    }

    fn bump_daily(&self, entry: &ConnectionEntry, now_ms: i64) {
        let today = day_of(now_ms);
        for _ in 0..MAX_CAS_RETRIES {
            let packed = entry.total_today.load(Ordering::Acquire);
            let (day, count) = ((packed >> 32) as u32, packed as u32);
            let next = if day == today {
                (u64::from(today) << 32) | u64::from(count.saturating_add(1))
            } else {
                (u64::from(today) << 32) | 1
            };
            if entry
                .total_today
                .compare_exchange(packed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
        // Daily totals are advisory; losing one increment under extreme
        // contention is acceptable.
    }
}
