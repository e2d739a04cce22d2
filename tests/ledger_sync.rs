//! Ledger sync behavior: batching, idempotency, retries, overage dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use metergate::{
    Backoff, BillingClient, BillingError, ChargeReceipt, Clock, DeltaQueue, LedgerError,
    LedgerSync, LedgerSyncConfig, ManualClock, MemoryLedger, MonthlyUsage, OverageDispatcher,
    PlanResolver, PolicyTable, ResourceType, UsageBatch, UsageDelta, UsageLedger,
};

const BASE: u64 = 19_675 * 86_400; // 2023-11-14

/// Plan resolver that puts every tenant on the same plan.
#[derive(Debug)]
struct StaticPlans(&'static str);

#[async_trait]
impl PlanResolver for StaticPlans {
    async fn plan_for(&self, _tenant: &str) -> String {
        self.0.to_string()
    }
}

#[derive(Debug, Default)]
struct RecordingBilling {
    charges: Mutex<Vec<(String, u64)>>,
    fail_next: AtomicUsize,
}

impl RecordingBilling {
    fn charges(&self) -> Vec<(String, u64)> {
        self.charges.lock().unwrap().clone()
    }
}

#[async_trait]
impl BillingClient for RecordingBilling {
    async fn create_overage_charge(
        &self,
        tenant: &str,
        amount_cents: u64,
        _description: &str,
    ) -> Result<ChargeReceipt, BillingError> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(BillingError::Unavailable("billing api down".into()));
        }
        let mut charges = self.charges.lock().unwrap();
        charges.push((tenant.to_string(), amount_cents));
        Ok(ChargeReceipt { charge_id: format!("ch_{}", charges.len()), amount_cents })
    }
}

/// Ledger wrapper that counts `apply` calls and can fail the first N of them.
#[derive(Debug)]
struct FlakyLedger {
    inner: MemoryLedger,
    apply_calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FlakyLedger {
    fn new(clock: &ManualClock, failures: usize) -> Self {
        Self {
            inner: MemoryLedger::new(Arc::new(clock.clone())),
            apply_calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl UsageLedger for FlakyLedger {
    async fn apply(&self, batch: &UsageBatch) -> Result<MonthlyUsage, LedgerError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerError::Unavailable("ledger write timeout".into()));
        }
        self.inner.apply(batch).await
    }

    async fn monthly_usage(
        &self,
        tenant: &str,
        month: metergate::BillingMonth,
    ) -> Result<MonthlyUsage, LedgerError> {
        self.inner.monthly_usage(tenant, month).await
    }

    async fn mark_threshold_crossed(
        &self,
        tenant: &str,
        month: metergate::BillingMonth,
        resource: ResourceType,
    ) -> Result<(), LedgerError> {
        self.inner.mark_threshold_crossed(tenant, month, resource).await
    }
}

fn capped_events_table() -> PolicyTable {
    PolicyTable::from_json_str(
        r#"{
            "free": { "events_per_minute": 1, "events_per_hour": 10, "events_per_day": 20 },
            "growth": {
                "events_per_minute": 10,
                "events_per_hour": 100,
                "events_per_day": 500,
                "monthly_limits": { "events": 5 },
                "overage_rates": { "events": 10 }
            }
        }"#,
    )
    .unwrap()
}

fn fast_config() -> LedgerSyncConfig {
    LedgerSyncConfig {
        flush_interval: Duration::from_secs(5),
        max_attempts: 3,
        // jitter off so sleep assertions stay deterministic
        backoff: Backoff::exponential(Duration::from_millis(200), Duration::from_secs(5)),
    }
}

struct Harness {
    queue: DeltaQueue,
    ledger: Arc<FlakyLedger>,
    billing: Arc<RecordingBilling>,
    clock: ManualClock,
    sync: LedgerSync<FlakyLedger, StaticPlans, RecordingBilling>,
}

fn harness(table: PolicyTable, ledger_failures: usize) -> Harness {
    let clock = ManualClock::new(BASE);
    let queue = DeltaQueue::new(1_024);
    let ledger = Arc::new(FlakyLedger::new(&clock, ledger_failures));
    let billing = Arc::new(RecordingBilling::default());
    let sync = LedgerSync::new(
        queue.clone(),
        ledger.clone(),
        Arc::new(StaticPlans("growth")),
        Arc::new(table),
        OverageDispatcher::new(billing.clone()),
        Arc::new(clock.clone()),
        fast_config(),
    );
    Harness { queue, ledger, billing, clock, sync }
}

fn push(queue: &DeltaQueue, tenant: &str, resource: ResourceType, n: u64) {
    for _ in 0..n {
        queue.push(UsageDelta { tenant: tenant.to_string(), resource, amount: 1 });
    }
}

#[tokio::test]
async fn flush_batches_one_apply_per_tenant() {
    let h = harness(PolicyTable::builtin(), 0);

    push(&h.queue, "acme", ResourceType::Events, 3);
    push(&h.queue, "acme", ResourceType::Votes, 2);
    push(&h.queue, "globex", ResourceType::Events, 1);

    h.sync.flush_pending().await;

    assert_eq!(h.ledger.apply_calls.load(Ordering::SeqCst), 2, "one batch per tenant");
    assert!(h.queue.is_empty());

    let month = metergate::BillingMonth::from_unix(h.clock.now_unix());
    let acme = h.ledger.monthly_usage("acme", month).await.unwrap();
    assert_eq!(acme.count(ResourceType::Events), 3);
    assert_eq!(acme.count(ResourceType::Votes), 2);
    let globex = h.ledger.monthly_usage("globex", month).await.unwrap();
    assert_eq!(globex.count(ResourceType::Events), 1);
}

#[tokio::test]
async fn empty_queue_flush_is_a_no_op() {
    let h = harness(PolicyTable::builtin(), 0);
    h.sync.flush_pending().await;
    assert_eq!(h.ledger.apply_calls.load(Ordering::SeqCst), 0);
}

// P5: the idempotent-apply contract — replaying a batch cannot double count.
#[tokio::test]
async fn replayed_batch_does_not_double_count() {
    let clock = ManualClock::new(BASE);
    let ledger = MemoryLedger::new(Arc::new(clock.clone()));
    let month = metergate::BillingMonth::from_unix(BASE);
    let batch = UsageBatch {
        id: 42,
        tenant: "acme".to_string(),
        month,
        amounts: HashMap::from([(ResourceType::Events, 4)]),
    };

    ledger.apply(&batch).await.unwrap();
    ledger.apply(&batch).await.unwrap(); // retry after an ambiguous failure

    assert_eq!(ledger.monthly_usage("acme", month).await.unwrap().count(ResourceType::Events), 4);
}

#[tokio::test(start_paused = true)]
async fn flush_retries_with_backoff_then_succeeds() {
    let h = harness(PolicyTable::builtin(), 2);

    push(&h.queue, "acme", ResourceType::Events, 1);
    h.sync.flush_pending().await;

    assert_eq!(h.ledger.apply_calls.load(Ordering::SeqCst), 3, "two failures then success");
    let month = metergate::BillingMonth::from_unix(BASE);
    assert_eq!(
        h.ledger.monthly_usage("acme", month).await.unwrap().count(ResourceType::Events),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn batch_is_dropped_after_retry_exhaustion() {
    // more failures than max_attempts: the batch is lost, not retried forever
    let h = harness(PolicyTable::builtin(), 10);

    push(&h.queue, "acme", ResourceType::Events, 1);
    h.sync.flush_pending().await;

    assert_eq!(h.ledger.apply_calls.load(Ordering::SeqCst), 3);
    assert!(h.queue.is_empty(), "lost deltas do not linger in the queue");

    let month = metergate::BillingMonth::from_unix(BASE);
    assert_eq!(
        h.ledger.monthly_usage("acme", month).await.unwrap().count(ResourceType::Events),
        0
    );
}

// P6: overage fires exactly once per crossing, across multiple flushes.
#[tokio::test]
async fn overage_fires_once_per_crossing() {
    let h = harness(capped_events_table(), 0);

    // first flush stays under the 5-event monthly cap
    push(&h.queue, "acme", ResourceType::Events, 4);
    h.sync.flush_pending().await;
    assert!(h.billing.charges().is_empty());

    // second flush crosses it: 7 total, 2 units over at 10 cents each
    push(&h.queue, "acme", ResourceType::Events, 3);
    h.sync.flush_pending().await;
    assert_eq!(h.billing.charges(), vec![("acme".to_string(), 20)]);

    // further usage past the same threshold stays silent
    push(&h.queue, "acme", ResourceType::Events, 2);
    h.sync.flush_pending().await;
    assert_eq!(h.billing.charges().len(), 1);
}

#[tokio::test]
async fn failed_charge_is_retried_on_next_flush() {
    let h = harness(capped_events_table(), 0);
    h.billing.fail_next.store(1, Ordering::SeqCst);

    push(&h.queue, "acme", ResourceType::Events, 7);
    h.sync.flush_pending().await;
    assert!(h.billing.charges().is_empty(), "dispatch failed");

    // flag stayed unset, so the next flush re-attempts the charge with the
    // updated overage amount (8 over the cap of 5 now)
    push(&h.queue, "acme", ResourceType::Events, 6);
    h.sync.flush_pending().await;
    assert_eq!(h.billing.charges(), vec![("acme".to_string(), 80)]);
}

#[tokio::test]
async fn usage_under_the_monthly_cap_never_triggers_overage() {
    let h = harness(PolicyTable::builtin(), 0);

    push(&h.queue, "acme", ResourceType::Events, 10);
    h.sync.flush_pending().await;

    assert!(h.billing.charges().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_flushes_on_interval_and_drains_on_shutdown() {
    let h = harness(PolicyTable::builtin(), 0);
    let shutdown = Arc::new(Notify::new());

    push(&h.queue, "acme", ResourceType::Events, 2);
    let task = tokio::spawn(h.sync.run(shutdown.clone()));

    // first interval tick fires immediately and flushes the backlog
    tokio::time::sleep(Duration::from_millis(10)).await;
    let month = metergate::BillingMonth::from_unix(BASE);
    assert_eq!(
        h.ledger.monthly_usage("acme", month).await.unwrap().count(ResourceType::Events),
        2
    );

    // deltas queued after the last tick are drained by the shutdown flush
    push(&h.queue, "acme", ResourceType::Votes, 1);
    shutdown.notify_one();
    task.await.unwrap();

    assert_eq!(
        h.ledger.monthly_usage("acme", month).await.unwrap().count(ResourceType::Votes),
        1
    );
    assert!(h.queue.is_empty());
}
