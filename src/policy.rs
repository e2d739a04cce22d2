//! Quota policy table: per-plan limits, frozen at startup.
//!
//! The table is built once — from the compiled-in tiers or an operator
//! supplied JSON document — and only read afterwards. Lookup never fails: an
//! unrecognized plan resolves to the most restrictive tier with a warning, so
//! a misconfigured tenant record degrades service instead of breaking it.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::error::PolicyError;
use crate::ledger::ResourceType;

/// Tier every unknown plan falls back to. Must exist in every table.
pub const DEFAULT_TIER: &str = "free";

/// Contractual monthly caps per resource. Absent fields deserialize to
/// "unlimited" so a table only lists the resources it actually caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonthlyLimits {
    pub api_calls: u64,
    pub certificates: u64,
    pub votes: u64,
    pub events: u64,
}

impl Default for MonthlyLimits {
    fn default() -> Self {
        Self { api_calls: u64::MAX, certificates: u64::MAX, votes: u64::MAX, events: u64::MAX }
    }
}

impl MonthlyLimits {
    pub fn limit_for(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::ApiCalls => self.api_calls,
            ResourceType::Certificates => self.certificates,
            ResourceType::Votes => self.votes,
            ResourceType::Events => self.events,
        }
    }
}

/// Per-unit overage price in cents for usage past the monthly cap.
/// A zero rate means the resource is not billed for overage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverageRates {
    pub api_calls: u64,
    pub certificates: u64,
    pub votes: u64,
    pub events: u64,
}

impl OverageRates {
    pub fn rate_for(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::ApiCalls => self.api_calls,
            ResourceType::Certificates => self.certificates,
            ResourceType::Votes => self.votes,
            ResourceType::Events => self.events,
        }
    }
}

/// Limits for one plan tier. Immutable after table construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaPolicy {
    pub events_per_minute: u64,
    pub events_per_hour: u64,
    pub events_per_day: u64,
    /// Minimum spacing between admitted operations; 0 disables the gate.
    #[serde(default)]
    pub cooldown_seconds: u64,
    /// Extra headroom above the per-minute limit, still bounded by the hour
    /// and day limits.
    #[serde(default)]
    pub burst_allowance: u64,
    #[serde(default)]
    pub monthly_limits: MonthlyLimits,
    #[serde(default)]
    pub overage_rates: OverageRates,
}

impl QuotaPolicy {
    /// The ceiling a tenant can actually reach within one minute bucket.
    pub fn effective_minute_limit(&self) -> u64 {
        self.events_per_minute.saturating_add(self.burst_allowance)
    }
}

/// Frozen plan-tier → limits lookup.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    tiers: HashMap<String, QuotaPolicy>,
}

impl PolicyTable {
    /// Build a table from explicit tiers. The [`DEFAULT_TIER`] must be
    /// present since it backs the unknown-plan fallback.
    pub fn new(tiers: HashMap<String, QuotaPolicy>) -> Result<Self, PolicyError> {
        if !tiers.contains_key(DEFAULT_TIER) {
            return Err(PolicyError::MissingDefaultTier(DEFAULT_TIER));
        }
        Ok(Self { tiers })
    }

    /// Parse an operator-supplied table, a JSON object of tier name → policy.
    pub fn from_json_str(json: &str) -> Result<Self, PolicyError> {
        let tiers: HashMap<String, QuotaPolicy> = serde_json::from_str(json)?;
        Self::new(tiers)
    }

    /// Compiled-in defaults covering the standard subscription tiers.
    pub fn builtin() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            QuotaPolicy {
                events_per_minute: 2,
                events_per_hour: 30,
                events_per_day: 100,
                cooldown_seconds: 30,
                burst_allowance: 0,
                monthly_limits: MonthlyLimits {
                    api_calls: 1_000,
                    certificates: 5,
                    votes: 100,
                    events: 500,
                },
                overage_rates: OverageRates::default(), // free tier is hard-capped
            },
        );
        tiers.insert(
            "starter".to_string(),
            QuotaPolicy {
                events_per_minute: 5,
                events_per_hour: 60,
                events_per_day: 300,
                cooldown_seconds: 10,
                burst_allowance: 1,
                monthly_limits: MonthlyLimits {
                    api_calls: 10_000,
                    certificates: 25,
                    votes: 1_000,
                    events: 2_000,
                },
                overage_rates: OverageRates { api_calls: 1, certificates: 50, votes: 1, events: 2 },
            },
        );
        tiers.insert(
            "growth".to_string(),
            QuotaPolicy {
                events_per_minute: 10,
                events_per_hour: 100,
                events_per_day: 500,
                cooldown_seconds: 0,
                burst_allowance: 2,
                monthly_limits: MonthlyLimits {
                    api_calls: 50_000,
                    certificates: 100,
                    votes: 5_000,
                    events: 10_000,
                },
                overage_rates: OverageRates { api_calls: 1, certificates: 40, votes: 1, events: 2 },
            },
        );
        tiers.insert(
            "business".to_string(),
            QuotaPolicy {
                events_per_minute: 30,
                events_per_hour: 600,
                events_per_day: 3_000,
                cooldown_seconds: 0,
                burst_allowance: 10,
                monthly_limits: MonthlyLimits {
                    api_calls: 500_000,
                    certificates: 1_000,
                    votes: 50_000,
                    events: 100_000,
                },
                overage_rates: OverageRates { api_calls: 1, certificates: 25, votes: 1, events: 1 },
            },
        );
        tiers.insert(
            "enterprise".to_string(),
            QuotaPolicy {
                events_per_minute: 120,
                events_per_hour: 3_000,
                events_per_day: 20_000,
                cooldown_seconds: 0,
                burst_allowance: 30,
                monthly_limits: MonthlyLimits::default(), // negotiated, unmetered here
                overage_rates: OverageRates::default(),
            },
        );
        Self { tiers }
    }

    /// Resolve a plan to its policy. Unknown plans fall back to the most
    /// restrictive tier and log a warning; this never fails.
    pub fn resolve(&self, plan: &str) -> &QuotaPolicy {
        match self.tiers.get(plan) {
            Some(policy) => policy,
            None => {
                warn!(plan = %plan, fallback = DEFAULT_TIER, "unknown plan, using most restrictive tier");
                &self.tiers[DEFAULT_TIER]
            }
        }
    }

    pub fn tier_names(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }
}
