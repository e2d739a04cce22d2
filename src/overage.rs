//! Overage trigger: turns a crossed monthly threshold into a billing charge.
//!
//! Stateless by design. Exactly-once behavior lives with the caller (the
//! ledger sync's crossed flag); this component only prices the overage and
//! hands it to the payment collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::BillingError;
use crate::ledger::ResourceType;
use crate::policy::QuotaPolicy;

/// Confirmation returned by the payment provider for a one-time charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub charge_id: String,
    pub amount_cents: u64,
}

/// Payment-provider collaborator: creates one-time charges.
#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn create_overage_charge(
        &self,
        tenant: &str,
        amount_cents: u64,
        description: &str,
    ) -> Result<ChargeReceipt, BillingError>;
}

/// Prices overage and dispatches the charge.
#[derive(Debug, Clone)]
pub struct OverageDispatcher<B> {
    billing: Arc<B>,
}

impl<B: BillingClient> OverageDispatcher<B> {
    pub fn new(billing: Arc<B>) -> Self {
        Self { billing }
    }

    /// Charge for `overage_units` past the monthly limit at the plan's
    /// per-unit rate. Resources with a zero rate are hard-capped rather than
    /// billed, and dispatch nothing.
    pub async fn on_threshold_crossed(
        &self,
        tenant: &str,
        policy: &QuotaPolicy,
        resource: ResourceType,
        overage_units: u64,
    ) -> Result<Option<ChargeReceipt>, BillingError> {
        let rate = policy.overage_rates.rate_for(resource);
        if rate == 0 {
            return Ok(None);
        }
        let amount_cents = overage_units.saturating_mul(rate);
        let description =
            format!("{resource} overage: {overage_units} units past monthly limit");
        let receipt =
            self.billing.create_overage_charge(tenant, amount_cents, &description).await?;
        info!(
            tenant = %tenant,
            resource = %resource,
            amount_cents,
            charge_id = %receipt.charge_id,
            "overage charge created"
        );
        Ok(Some(receipt))
    }
}
