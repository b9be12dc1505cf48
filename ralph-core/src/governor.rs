use crate::types::{RepoId, TokenId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::{Clock as GovernorClock, DefaultClock};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    Critical,
    Important,
    BestEffort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cost {
    Read,
    Write,
}

impl Cost {
    fn tokens(self) -> NonZeroU32 {
        match self {
            Cost::Read => nonzero!(1u32),
            Cost::Write => nonzero!(2u32),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Defer { until: DateTime<Utc> },
}

type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    DefaultClock,
>;

struct LaneLimiter {
    important: Limiter,
    best_effort: Limiter,
}

impl LaneLimiter {
    fn new(important_quota: Quota, best_effort_quota: Quota) -> Self {
        Self {
            important: RateLimiter::direct(important_quota),
            best_effort: RateLimiter::direct(best_effort_quota),
        }
    }
}

/// Per-token/per-repo lane-scheduling token bucket in front of the hosting
/// client (spec.md §4.3). `critical` is never refused. `check_n` from the
/// `governor` crate is synchronous and non-blocking, returning the exact
/// resume instant — matching the "defer(until), never block" requirement.
pub struct BudgetGovernor {
    lanes: DashMap<(RepoId, TokenId), LaneLimiter>,
    important_quota: Quota,
    best_effort_quota: Quota,
    global_cooldown_until: AtomicI64,
    pressure: AtomicBool,
    pressure_threshold: u32,
}

impl BudgetGovernor {
    pub fn new(important_capacity: NonZeroU32, best_effort_capacity: NonZeroU32, pressure_threshold: u32) -> Self {
        Self {
            lanes: DashMap::new(),
            important_quota: Quota::per_minute(important_capacity),
            best_effort_quota: Quota::per_minute(best_effort_capacity),
            global_cooldown_until: AtomicI64::new(0),
            pressure: AtomicBool::new(false),
            pressure_threshold,
        }
    }

    /// Fed by C2's rate-limit classifier: every non-critical lane is
    /// deferred until `until` regardless of local bucket state.
    pub fn set_global_cooldown(&self, until: DateTime<Utc>) {
        let millis = until.timestamp_millis();
        let mut current = self.global_cooldown_until.load(Ordering::SeqCst);
        while millis > current {
            match self.global_cooldown_until.compare_exchange_weak(
                current,
                millis,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set_pressure(&self, active: bool) {
        self.pressure.store(active, Ordering::SeqCst);
    }

    pub fn acquire(&self, repo: &RepoId, token: &TokenId, lane: Lane, cost: Cost) -> Decision {
        if lane == Lane::Critical {
            return Decision::Proceed;
        }

        let now_millis = Utc::now().timestamp_millis();
        let cooldown_until = self.global_cooldown_until.load(Ordering::SeqCst);
        if cooldown_until > now_millis {
            return Decision::Defer {
                until: DateTime::from_timestamp_millis(cooldown_until).unwrap_or_else(Utc::now),
            };
        }

        if lane == Lane::BestEffort && self.pressure.load(Ordering::SeqCst) {
            return Decision::Defer { until: Utc::now() + chrono::Duration::seconds(5) };
        }

        let key = (repo.clone(), token.clone());
        let entry = self
            .lanes
            .entry(key)
            .or_insert_with(|| LaneLimiter::new(self.important_quota, self.best_effort_quota));

        let limiter = match lane {
            Lane::Important => &entry.important,
            Lane::BestEffort => &entry.best_effort,
            Lane::Critical => unreachable!(),
        };

        match limiter.check_n(cost.tokens()) {
            Ok(Ok(())) => Decision::Proceed,
            Ok(Err(not_until)) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Decision::Defer {
                    until: Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default(),
                }
            }
            // The bucket can never hold this many tokens even when full —
            // treat as a long defer rather than proceeding unbounded.
            Err(_insufficient_capacity) => Decision::Defer {
                until: Utc::now() + chrono::Duration::seconds(60),
            },
        }
    }

    /// Observed remaining quota in a lane has dropped below
    /// `pressure_threshold` (a starvation counter, spec.md §4.3).
    pub fn observe_remaining(&self, remaining: u32) {
        self.set_pressure(remaining < self.pressure_threshold);
    }

    pub fn summary(&self) -> GovernorSummary {
        GovernorSummary {
            pressure: self.pressure.load(Ordering::SeqCst),
            global_cooldown_until: {
                let millis = self.global_cooldown_until.load(Ordering::SeqCst);
                if millis > 0 {
                    DateTime::from_timestamp_millis(millis)
                } else {
                    None
                }
            },
            tracked_lanes: self.lanes.len(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernorSummary {
    pub pressure: bool,
    pub global_cooldown_until: Option<DateTime<Utc>>,
    pub tracked_lanes: usize,
}

/// Persists `summary()` through the `Store`'s runtime-snapshot slot, no
/// more often than the write-interval floor (spec.md §4.3, "≥1 s").
pub struct SummaryWriteGate {
    last_write: Arc<AtomicI64>,
    min_interval_ms: i64,
}

impl SummaryWriteGate {
    pub fn new(min_interval_ms: i64) -> Self {
        Self {
            last_write: Arc::new(AtomicI64::new(0)),
            min_interval_ms,
        }
    }

    pub fn should_write(&self, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let last = self.last_write.load(Ordering::SeqCst);
        if now_ms - last >= self.min_interval_ms {
            self.last_write.store(now_ms, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}
