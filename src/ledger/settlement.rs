//! Order Settlement Hook
//!
//! Translates checkout, refund and cancellation events into ledger debits
//! and compensating credits. The ledger debit is the authoritative gate for
//! checkout: the client-side quote means nothing, because the balance can
//! move between quote and checkout.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::actor::Actor;
use crate::ledger::engine::{LimitPolicy, MutationEngine};
use crate::ledger::error::LedgerError;
use crate::models::{CausalKind, CausalRef, PointChange, SponsorLimits};

/// Order fulfillment status as reported by the order system. The ledger does
/// not own orders; the caller passes the current status and the hook decides
/// whether a cancellation credit is still legal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Placed,
    Processing,
    Shipped,
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
        }
    }

    /// Cancellation is only legal before fulfillment begins.
    pub fn is_pre_fulfillment(&self) -> bool {
        matches!(self, OrderStatus::Placed | OrderStatus::Processing)
    }
}

pub struct SettlementHook<'a> {
    engine: &'a MutationEngine,
}

impl<'a> SettlementHook<'a> {
    pub fn new(engine: &'a MutationEngine) -> Self {
        Self { engine }
    }

    /// Debit a relationship for an order at checkout.
    ///
    /// Fails with `InsufficientBalance` before any order side effect is
    /// allowed to commit; the caller must abort order creation on error.
    pub async fn debit_for_order(
        &self,
        relationship_id: i64,
        total_points: i64,
        order_ref: &str,
    ) -> Result<PointChange, LedgerError> {
        if total_points <= 0 {
            return Err(LedgerError::InvalidDelta);
        }
        let causal = CausalRef::new(CausalKind::Order, order_ref);
        let record = self
            .engine
            .apply_change(
                relationship_id,
                -total_points,
                &format!("order {} checkout", order_ref),
                &Actor::system("order-settlement"),
                Some(&causal),
                LimitPolicy::Exempt,
            )
            .await?;
        info!(order_ref, total_points, relationship_id, "order debited");
        Ok(record)
    }

    /// Credit back an order's points after a refund.
    ///
    /// Idempotent by order reference: the second attempt fails with
    /// `AlreadyRefunded` instead of double-crediting. The sponsor's refund
    /// window is enforced here, measured from the original debit.
    pub async fn credit_for_refund(
        &self,
        order_ref: &str,
        amount: i64,
        reason: &str,
    ) -> Result<PointChange, LedgerError> {
        let debit = self.find_refundable_debit(order_ref, amount).await?;

        let window_days = self.refund_window_days(debit.relationship_id).await?;
        let deadline = debit.created_at + Duration::days(window_days);
        if Utc::now() > deadline {
            return Err(LedgerError::RefundWindowExpired {
                order_ref: order_ref.to_string(),
                window_days,
            });
        }

        let causal = CausalRef::new(CausalKind::Refund, order_ref);
        let record = self
            .engine
            .apply_change(
                debit.relationship_id,
                amount,
                reason,
                &Actor::system("order-settlement"),
                Some(&causal),
                LimitPolicy::Exempt,
            )
            .await?;
        info!(order_ref, amount, "order refunded");
        Ok(record)
    }

    /// Credit back an order's points after a cancellation.
    ///
    /// Same idempotency pattern as refund, but only legal while the order is
    /// still pre-fulfillment; no window applies.
    pub async fn credit_for_cancellation(
        &self,
        order_ref: &str,
        amount: i64,
        order_status: OrderStatus,
    ) -> Result<PointChange, LedgerError> {
        if !order_status.is_pre_fulfillment() {
            return Err(LedgerError::OrderNotCancellable {
                order_ref: order_ref.to_string(),
                status: order_status.as_str().to_string(),
            });
        }

        let debit = self.find_refundable_debit(order_ref, amount).await?;

        let causal = CausalRef::new(CausalKind::Cancellation, order_ref);
        let record = self
            .engine
            .apply_change(
                debit.relationship_id,
                amount,
                &format!("order {} cancelled", order_ref),
                &Actor::system("order-settlement"),
                Some(&causal),
                LimitPolicy::Exempt,
            )
            .await?;
        info!(order_ref, amount, "order cancellation credited");
        Ok(record)
    }

    /// Locate the original debit and reject double or oversized compensation.
    async fn find_refundable_debit(
        &self,
        order_ref: &str,
        amount: i64,
    ) -> Result<PointChange, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidDelta);
        }

        let debit = self
            .engine
            .db()
            .find_order_debit(order_ref)
            .await?
            .ok_or_else(|| LedgerError::OrderNotFound {
                order_ref: order_ref.to_string(),
            })?;

        if self.engine.db().order_compensated(order_ref).await? {
            return Err(LedgerError::AlreadyRefunded {
                order_ref: order_ref.to_string(),
            });
        }

        let original = -debit.delta;
        if amount > original {
            return Err(LedgerError::RefundExceedsDebit {
                requested: amount,
                original,
            });
        }

        Ok(debit)
    }

    async fn refund_window_days(&self, relationship_id: i64) -> Result<i64, LedgerError> {
        let rel = self
            .engine
            .db()
            .get_relationship(relationship_id)
            .await?
            .ok_or(LedgerError::RelationshipNotFound { relationship_id })?;
        let limits = self
            .engine
            .db()
            .get_limits(&rel.sponsor_id)
            .await?
            .unwrap_or_else(|| SponsorLimits::defaults_for(&rel.sponsor_id));
        Ok(limits.refund_window_days)
    }
}
