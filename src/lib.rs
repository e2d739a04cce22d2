#![forbid(unsafe_code)]

//! # metergate
//!
//! Usage-based admission control for multi-tenant services: per-plan quotas
//! enforced over rolling minute/hour/day windows, with cooldown spacing,
//! burst allowances, and asynchronous reconciliation into a durable monthly
//! ledger that drives overage billing.
//!
//! ## Architecture
//!
//! - **Window clock** ([`window`]): pure arithmetic from wall-clock time to
//!   bucket keys and reset times.
//! - **Counter store** ([`store`]): the atomic INCR-with-TTL primitive all
//!   correctness rests on; swap in a clustered backend via [`CounterStore`].
//! - **Policy table** ([`policy`]): frozen plan-tier → limits lookup.
//! - **Admission controller** ([`admission`]): the synchronous allow/deny
//!   decision on every metered write.
//! - **Ledger sync** ([`ledger`]): bounded queue + background task batching
//!   usage into the billing-owned ledger.
//! - **Overage trigger** ([`overage`]): prices threshold crossings and hands
//!   them to the payment collaborator.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use metergate::{
//!     AdmissionController, DeltaQueue, MemoryStore, PolicyTable, ResourceType, SystemClock,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
//!     let policies = Arc::new(PolicyTable::builtin());
//!     let queue = DeltaQueue::default();
//!
//!     let controller = AdmissionController::builder(store, policies, queue).build();
//!
//!     let decision = controller
//!         .check_and_admit("tenant-1", "growth", ResourceType::Events)
//!         .await
//!         .expect("store reachable");
//!     assert!(decision.is_allowed());
//! }
//! ```

pub mod admission;
pub mod clock;
pub mod error;
pub mod ledger;
pub mod overage;
pub mod policy;
pub mod retry;
pub mod store;
pub mod window;

// Re-exports
pub use admission::{
    Admission, AdmissionController, AdmissionControllerBuilder, DenyReason, UsageSnapshot,
    WindowUsage, DEFAULT_STORE_TIMEOUT,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmissionError, BillingError, LedgerError, PolicyError, StoreError};
pub use ledger::{
    DeltaQueue, LedgerSync, LedgerSyncConfig, MemoryLedger, MonthlyUsage, PlanResolver,
    ResourceType, UsageBatch, UsageDelta, UsageLedger, DEFAULT_QUEUE_CAPACITY,
};
pub use overage::{BillingClient, ChargeReceipt, OverageDispatcher};
pub use policy::{MonthlyLimits, OverageRates, PolicyTable, QuotaPolicy, DEFAULT_TIER};
pub use retry::Backoff;
pub use store::{CounterStore, MemoryStore};
pub use window::{BillingMonth, Granularity};
