//! Admission controller: the per-request allow/deny decision.
//!
//! `check_and_admit` sits on the critical path of every metered write, so the
//! flow is two batched store round-trips plus one marker read: resolve the
//! plan's policy, gate on cooldown, batch-read the minute/hour/day counters,
//! compare against limits, and only then increment. Denials are values, not
//! errors; only a store fault is an `Err`, and it fails closed.
//!
//! Concurrency note: the three window counters are incremented as three
//! separate atomic operations after a batched read. Concurrent requests from
//! one tenant can each pass the read check on the same counts and all
//! proceed, transiently over-admitting by at most (concurrency - 1) per
//! bucket. That bound is accepted in exchange for keeping the store contract
//! a plain INCR, portable across backends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, StoreError};
use crate::ledger::{DeltaQueue, ResourceType, UsageDelta};
use crate::policy::{PolicyTable, QuotaPolicy};
use crate::store::CounterStore;
use crate::window::{self, Granularity};

/// Which limit blocked a denied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MinuteLimit,
    HourLimit,
    DayLimit,
    Cooldown,
}

impl DenyReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DenyReason::MinuteLimit => "minute_limit",
            DenyReason::HourLimit => "hour_limit",
            DenyReason::DayLimit => "day_limit",
            DenyReason::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage against one window's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    /// Admit ceiling for this window. For the minute window this includes the
    /// burst allowance, since that is the count a tenant can actually reach.
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    /// Unix timestamp when this window's counter resets.
    pub resets_at: u64,
}

/// Point-in-time view of a tenant's usage across all windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub minute: WindowUsage,
    pub hour: WindowUsage,
    pub day: WindowUsage,
    /// Highest utilization across the three windows, clamped to 100.
    pub utilization_percent: u8,
    /// Seconds of cooldown left, if the cooldown gate would block right now.
    pub cooldown_remaining: Option<u64>,
    /// Whether a request issued now would pass every check.
    pub can_proceed: bool,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        /// Usage after this request's increments.
        snapshot: UsageSnapshot,
    },
    Denied {
        reason: DenyReason,
        /// How long until the binding constraint clears.
        retry_after: Duration,
        /// Current usage; absent for cooldown denials, which return before
        /// any counter is read.
        snapshot: Option<UsageSnapshot>,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Admission::Denied { reason, .. } => Some(*reason),
            Admission::Allowed { .. } => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Denied { retry_after, .. } => Some(*retry_after),
            Admission::Allowed { .. } => None,
        }
    }

    pub fn snapshot(&self) -> Option<&UsageSnapshot> {
        match self {
            Admission::Allowed { snapshot } => Some(snapshot),
            Admission::Denied { snapshot, .. } => snapshot.as_ref(),
        }
    }
}

/// Default per-call deadline for counter store operations.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Builder for [`AdmissionController`].
#[derive(Debug)]
pub struct AdmissionControllerBuilder<S> {
    store: Arc<S>,
    policies: Arc<PolicyTable>,
    queue: DeltaQueue,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl<S: CounterStore> AdmissionControllerBuilder<S> {
    /// Override the wall clock (tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Per-call store deadline; an elapsed deadline is treated as a store
    /// outage and fails closed.
    pub fn store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn build(self) -> AdmissionController<S> {
        AdmissionController {
            store: self.store,
            policies: self.policies,
            queue: self.queue,
            clock: self.clock,
            store_timeout: self.store_timeout,
        }
    }
}

/// Decides allow/deny for each metered operation.
///
/// Cheap to clone; clones share the store, policy table, and delta queue.
#[derive(Debug)]
pub struct AdmissionController<S> {
    store: Arc<S>,
    policies: Arc<PolicyTable>,
    queue: DeltaQueue,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl<S> Clone for AdmissionController<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policies: self.policies.clone(),
            queue: self.queue.clone(),
            clock: self.clock.clone(),
            store_timeout: self.store_timeout,
        }
    }
}

impl<S: CounterStore> AdmissionController<S> {
    pub fn builder(
        store: Arc<S>,
        policies: Arc<PolicyTable>,
        queue: DeltaQueue,
    ) -> AdmissionControllerBuilder<S> {
        AdmissionControllerBuilder {
            store,
            policies,
            queue,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Decide whether one operation may proceed, and if so, count it.
    ///
    /// On allow, all three window counters are incremented, the cooldown
    /// marker is updated, and a usage delta for `resource` is queued for the
    /// ledger sync. A cooldown denial touches no counter at all.
    pub async fn check_and_admit(
        &self,
        tenant: &str,
        plan: &str,
        resource: ResourceType,
    ) -> Result<Admission, AdmissionError> {
        let policy = self.policies.resolve(plan);
        let now = self.clock.now_unix();

        // Cooldown gate runs before any counter read so a spaced-out denial
        // never consumes quota.
        if policy.cooldown_seconds > 0 {
            if let Some(last) = self.store_call(self.store.marker(tenant)).await? {
                let elapsed = now.saturating_sub(last);
                if elapsed < policy.cooldown_seconds {
                    debug!(tenant = %tenant, plan = %plan, "denied: cooldown active");
                    return Ok(Admission::Denied {
                        reason: DenyReason::Cooldown,
                        retry_after: Duration::from_secs(policy.cooldown_seconds - elapsed),
                        snapshot: None,
                    });
                }
            }
        }

        let keys = window_keys(tenant, now);
        let counts = three_counts(self.store_call(self.store.get_many(&keys)).await?)?;
        let [minute, hour, day] = counts;

        if let Some((reason, retry_after)) = binding_denial(policy, minute, hour, day, now) {
            debug!(tenant = %tenant, plan = %plan, reason = %reason, "denied: quota exhausted");
            return Ok(Admission::Denied {
                reason,
                retry_after,
                snapshot: Some(build_snapshot(policy, [minute, hour, day], now, None)),
            });
        }

        // Three separate atomic increments; see the module docs for the
        // accepted over-admission bound.
        let mut post = [0u64; 3];
        for (i, granularity) in Granularity::ALL.iter().enumerate() {
            post[i] = self
                .store_call(self.store.incr(&keys[i], window::counter_ttl(*granularity)))
                .await?;
        }
        self.store_call(self.store.set_marker(tenant, now)).await?;

        self.queue.push(UsageDelta { tenant: tenant.to_string(), resource, amount: 1 });
        debug!(tenant = %tenant, plan = %plan, resource = %resource, "admitted");

        // The marker was just set to `now`, so on cooldown-bearing plans the
        // full cooldown applies to whatever comes next.
        let cooldown_remaining = (policy.cooldown_seconds > 0).then_some(policy.cooldown_seconds);
        Ok(Admission::Allowed { snapshot: build_snapshot(policy, post, now, cooldown_remaining) })
    }

    /// Read-only view of current usage; increments nothing and never extends
    /// a counter's life.
    pub async fn usage_snapshot(
        &self,
        tenant: &str,
        plan: &str,
    ) -> Result<UsageSnapshot, AdmissionError> {
        let policy = self.policies.resolve(plan);
        let now = self.clock.now_unix();

        let keys = window_keys(tenant, now);
        let counts = three_counts(self.store_call(self.store.get_many(&keys)).await?)?;

        let cooldown_remaining = if policy.cooldown_seconds > 0 {
            self.store_call(self.store.marker(tenant)).await?.and_then(|last| {
                let elapsed = now.saturating_sub(last);
                (elapsed < policy.cooldown_seconds).then(|| policy.cooldown_seconds - elapsed)
            })
        } else {
            None
        };

        Ok(build_snapshot(policy, counts, now, cooldown_remaining))
    }

    async fn store_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, AdmissionError> {
        match timeout(self.store_timeout, call).await {
            Ok(result) => result.map_err(AdmissionError::from),
            Err(_) => Err(AdmissionError::StoreUnavailable(StoreError::Unavailable(
                format!("store call exceeded {:?} deadline", self.store_timeout),
            ))),
        }
    }
}

/// A misbehaving store that answers a three-key batch read with anything but
/// three counts is treated as an outage, so the caller fails closed rather
/// than panicking on the admission path.
fn three_counts(counts: Vec<u64>) -> Result<[u64; 3], AdmissionError> {
    <[u64; 3]>::try_from(counts).map_err(|got| {
        AdmissionError::StoreUnavailable(StoreError::Unavailable(format!(
            "batched read returned {} counters, expected 3",
            got.len()
        )))
    })
}

fn window_keys(tenant: &str, now: u64) -> [String; 3] {
    [
        window::bucket_key(tenant, Granularity::Minute, now),
        window::bucket_key(tenant, Granularity::Hour, now),
        window::bucket_key(tenant, Granularity::Day, now),
    ]
}

/// The tightest binding constraint if the next request would bust a limit.
/// Day outranks hour outranks minute: the longer window is the contractual
/// ceiling, so it names the denial when several fail at once.
fn binding_denial(
    policy: &QuotaPolicy,
    minute: u64,
    hour: u64,
    day: u64,
    now: u64,
) -> Option<(DenyReason, Duration)> {
    let until = |g: Granularity| Duration::from_secs(window::next_reset(g, now) - now);

    if day + 1 > policy.events_per_day {
        return Some((DenyReason::DayLimit, until(Granularity::Day)));
    }
    if hour + 1 > policy.events_per_hour {
        return Some((DenyReason::HourLimit, until(Granularity::Hour)));
    }
    if minute + 1 > policy.effective_minute_limit() {
        return Some((DenyReason::MinuteLimit, until(Granularity::Minute)));
    }
    None
}

fn build_snapshot(
    policy: &QuotaPolicy,
    counts: [u64; 3],
    now: u64,
    cooldown_remaining: Option<u64>,
) -> UsageSnapshot {
    let make = |granularity: Granularity, limit: u64, used: u64| WindowUsage {
        limit,
        used,
        remaining: limit.saturating_sub(used),
        resets_at: window::next_reset(granularity, now),
    };
    let minute = make(Granularity::Minute, policy.effective_minute_limit(), counts[0]);
    let hour = make(Granularity::Hour, policy.events_per_hour, counts[1]);
    let day = make(Granularity::Day, policy.events_per_day, counts[2]);

    let utilization = |w: &WindowUsage| {
        if w.limit == 0 {
            100
        } else {
            (w.used.saturating_mul(100) / w.limit).min(100)
        }
    };
    let utilization_percent =
        utilization(&minute).max(utilization(&hour)).max(utilization(&day)) as u8;

    let can_proceed = cooldown_remaining.is_none()
        && minute.remaining > 0
        && hour.remaining > 0
        && day.remaining > 0;

    UsageSnapshot { minute, hour, day, utilization_percent, cooldown_remaining, can_proceed }
}
