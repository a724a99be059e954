//! Points Ledger Core
//!
//! Owns all mutations to a driver's per-sponsor point balance. Upstream
//! flows (checkout, sponsor admin actions, challenge evaluators, dispute
//! resolution) call through `LedgerService`; nothing else touches balance
//! storage.
//!
//! Layout:
//! - `store`: SQLite persistence, append-only point change table
//! - `engine`: the one authorized balance mutation pathway
//! - `settlement`: order debit / refund / cancellation hooks
//! - `disputes`: dispute state machine with compensating reversals
//! - `replay`: audit trail fold and consistency verification

pub mod actor;
pub mod disputes;
pub mod engine;
pub mod error;
pub mod replay;
pub mod settlement;
pub mod store;

use serde::{Deserialize, Serialize};

pub use actor::Actor;
pub use disputes::Resolution;
pub use error::LedgerError;
pub use replay::Replay;
pub use settlement::OrderStatus;
pub use store::LedgerDb;

use anyhow::Result;

use crate::models::{
    CausalKind, CausalRef, Dispute, PointChange, Relationship, SponsorLimits,
};
use disputes::DisputeWorkflow;
use engine::{LimitPolicy, MutationEngine};
use replay::AuditReplay;
use settlement::SettlementHook;

/// Kind of pre-validated reward credited by an automated evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Challenge,
    Achievement,
}

impl RewardKind {
    fn causal_kind(&self) -> CausalKind {
        match self {
            RewardKind::Challenge => CausalKind::Challenge,
            RewardKind::Achievement => CausalKind::Achievement,
        }
    }
}

/// Facade over the ledger core. Cheap to clone-by-Arc and share across
/// request handlers.
pub struct LedgerService {
    engine: MutationEngine,
}

impl LedgerService {
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self {
            engine: MutationEngine::new(LedgerDb::open(db_path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            engine: MutationEngine::new(LedgerDb::open_in_memory()?),
        })
    }

    // ===== Enrollment =====

    pub async fn enroll(
        &self,
        driver_id: &str,
        sponsor_id: &str,
    ) -> Result<Relationship, LedgerError> {
        self.engine.db().enroll(driver_id, sponsor_id).await
    }

    pub async fn deactivate(&self, relationship_id: i64) -> Result<(), LedgerError> {
        self.engine.db().deactivate(relationship_id).await
    }

    pub async fn get_relationship(
        &self,
        relationship_id: i64,
    ) -> Result<Relationship, LedgerError> {
        self.engine
            .db()
            .get_relationship(relationship_id)
            .await?
            .ok_or(LedgerError::RelationshipNotFound { relationship_id })
    }

    // ===== Balance mutation (sponsor/admin initiated) =====

    /// Apply a signed delta on behalf of a human actor. Sponsor limits are
    /// enforced; use the settlement/dispute/reward paths for system credits.
    pub async fn apply_change(
        &self,
        relationship_id: i64,
        delta: i64,
        reason: &str,
        actor: &Actor,
        causal_ref: Option<&CausalRef>,
    ) -> Result<PointChange, LedgerError> {
        self.engine
            .apply_change(
                relationship_id,
                delta,
                reason,
                actor,
                causal_ref,
                LimitPolicy::Enforce,
            )
            .await
    }

    // ===== Order settlement =====

    pub async fn debit_for_order(
        &self,
        relationship_id: i64,
        total_points: i64,
        order_ref: &str,
    ) -> Result<PointChange, LedgerError> {
        SettlementHook::new(&self.engine)
            .debit_for_order(relationship_id, total_points, order_ref)
            .await
    }

    pub async fn credit_for_refund(
        &self,
        order_ref: &str,
        amount: i64,
        reason: &str,
    ) -> Result<PointChange, LedgerError> {
        SettlementHook::new(&self.engine)
            .credit_for_refund(order_ref, amount, reason)
            .await
    }

    pub async fn credit_for_cancellation(
        &self,
        order_ref: &str,
        amount: i64,
        order_status: OrderStatus,
    ) -> Result<PointChange, LedgerError> {
        SettlementHook::new(&self.engine)
            .credit_for_cancellation(order_ref, amount, order_status)
            .await
    }

    // ===== Challenge / achievement rewards =====

    /// Credit a pre-validated reward. The amount was validated by the
    /// challenge/achievement definition, so sponsor transaction limits do
    /// not apply here.
    pub async fn credit_for_reward(
        &self,
        relationship_id: i64,
        amount: i64,
        kind: RewardKind,
        reward_ref: &str,
    ) -> Result<PointChange, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidDelta);
        }
        let causal = CausalRef::new(kind.causal_kind(), reward_ref);
        self.engine
            .apply_change(
                relationship_id,
                amount,
                &format!("{:?} reward", kind).to_lowercase(),
                &Actor::system("reward-evaluator"),
                Some(&causal),
                LimitPolicy::Exempt,
            )
            .await
    }

    // ===== Disputes =====

    pub async fn file_dispute(
        &self,
        record_id: &str,
        driver_reason: &str,
    ) -> Result<Dispute, LedgerError> {
        DisputeWorkflow::new(&self.engine)
            .file(record_id, driver_reason)
            .await
    }

    pub async fn begin_dispute_review(&self, dispute_id: &str) -> Result<Dispute, LedgerError> {
        DisputeWorkflow::new(&self.engine).begin_review(dispute_id).await
    }

    pub async fn resolve_dispute(
        &self,
        dispute_id: &str,
        resolution: Resolution,
        resolved_by: &Actor,
        note: &str,
    ) -> Result<(Dispute, Option<PointChange>), LedgerError> {
        DisputeWorkflow::new(&self.engine)
            .resolve(dispute_id, resolution, resolved_by, note)
            .await
    }

    pub async fn get_dispute(&self, dispute_id: &str) -> Result<Dispute, LedgerError> {
        self.engine
            .db()
            .get_dispute(dispute_id)
            .await?
            .ok_or_else(|| LedgerError::DisputeNotFound {
                dispute_id: dispute_id.to_string(),
            })
    }

    // ===== Audit =====

    pub async fn replay_balance(&self, relationship_id: i64) -> Result<Replay, LedgerError> {
        AuditReplay::new(self.engine.db())
            .replay_balance(relationship_id)
            .await
    }

    pub async fn verify_balance(&self, relationship_id: i64) -> Result<i64, LedgerError> {
        AuditReplay::new(self.engine.db())
            .verify_balance(relationship_id)
            .await
    }

    pub async fn history(
        &self,
        relationship_id: i64,
        limit: usize,
    ) -> Result<Vec<PointChange>, LedgerError> {
        AuditReplay::new(self.engine.db())
            .history(relationship_id, limit)
            .await
    }

    // ===== Sponsor limits =====

    /// Effective limits for a sponsor; defaults when never configured.
    pub async fn get_limits(&self, sponsor_id: &str) -> Result<SponsorLimits, LedgerError> {
        Ok(self
            .engine
            .db()
            .get_limits(sponsor_id)
            .await?
            .unwrap_or_else(|| SponsorLimits::defaults_for(sponsor_id)))
    }

    /// Whether the sponsor has ever stored its own limits (as opposed to
    /// running on defaults).
    pub async fn limits_configured(&self, sponsor_id: &str) -> Result<bool, LedgerError> {
        Ok(self.engine.db().get_limits(sponsor_id).await?.is_some())
    }

    pub async fn set_limits(&self, limits: &SponsorLimits) -> Result<(), LedgerError> {
        self.engine.db().upsert_limits(limits).await
    }
}
