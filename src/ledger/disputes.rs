//! Dispute Workflow
//!
//! State machine: `open -> under_review -> {resolved_upheld, resolved_reversed}`.
//! A reversal never edits the disputed record; it asks the mutation engine
//! for a new compensating record with the negated delta, keyed to the
//! dispute id. That keeps the audit trail append-only and lets the original
//! record and its reversal sit side by side in history views.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::ledger::actor::Actor;
use crate::ledger::engine::{LimitPolicy, MutationEngine};
use crate::ledger::error::LedgerError;
use crate::models::{CausalKind, CausalRef, Dispute, DisputeStatus, PointChange};

/// Outcome requested by the resolving sponsor/admin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Upheld,
    Reversed,
}

pub struct DisputeWorkflow<'a> {
    engine: &'a MutationEngine,
}

impl<'a> DisputeWorkflow<'a> {
    pub fn new(engine: &'a MutationEngine) -> Self {
        Self { engine }
    }

    /// File a dispute against a point change record.
    ///
    /// Compensating records from earlier disputes are not disputable (no
    /// nested reversal chains), and a record can carry at most one
    /// non-terminal dispute.
    pub async fn file(
        &self,
        record_id: &str,
        driver_reason: &str,
    ) -> Result<Dispute, LedgerError> {
        let record = self
            .engine
            .db()
            .get_record(record_id)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound {
                record_id: record_id.to_string(),
            })?;

        if record.causal_ref.as_ref().map(|c| c.kind) == Some(CausalKind::Dispute) {
            return Err(LedgerError::NonDisputableRecord {
                record_id: record_id.to_string(),
            });
        }

        if self.engine.db().find_open_dispute(record_id).await?.is_some() {
            return Err(LedgerError::DisputeAlreadyExists {
                record_id: record_id.to_string(),
            });
        }

        let dispute = Dispute {
            id: Uuid::new_v4().to_string(),
            record_id: record_id.to_string(),
            relationship_id: record.relationship_id,
            driver_reason: driver_reason.to_string(),
            status: DisputeStatus::Open,
            resolved_by: None,
            resolution_note: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.engine.db().insert_dispute(&dispute).await?;
        info!(dispute_id = %dispute.id, record_id, "dispute filed");
        Ok(dispute)
    }

    /// `open -> under_review`. No ledger side effect.
    ///
    /// The transition is a conditional update in the store; losing the
    /// condition (wrong state, or a parallel caller got there first) is an
    /// invalid transition.
    pub async fn begin_review(&self, dispute_id: &str) -> Result<Dispute, LedgerError> {
        if !self.engine.db().mark_under_review(dispute_id).await? {
            let current = self.get(dispute_id).await?;
            return Err(LedgerError::InvalidDisputeTransition {
                dispute_id: dispute_id.to_string(),
                from: current.status.as_str().to_string(),
                to: DisputeStatus::UnderReview.as_str().to_string(),
            });
        }
        self.get(dispute_id).await
    }

    /// `under_review -> resolved_*`.
    ///
    /// `Reversed` produces one compensating record whose delta is the
    /// negation of the disputed delta; the original record is untouched.
    /// `Upheld` closes the dispute with no ledger mutation.
    pub async fn resolve(
        &self,
        dispute_id: &str,
        resolution: Resolution,
        resolved_by: &Actor,
        note: &str,
    ) -> Result<(Dispute, Option<PointChange>), LedgerError> {
        let dispute = self.get(dispute_id).await?;
        let target = match resolution {
            Resolution::Upheld => DisputeStatus::ResolvedUpheld,
            Resolution::Reversed => DisputeStatus::ResolvedReversed,
        };

        // Win the conditional state transition before touching the ledger;
        // of N concurrent resolvers exactly one passes, so at most one
        // compensating record is ever applied.
        let won = self
            .engine
            .db()
            .mark_resolved(dispute_id, target, resolved_by, note, Utc::now())
            .await?;
        if !won {
            let current = self.get(dispute_id).await?;
            return Err(LedgerError::InvalidDisputeTransition {
                dispute_id: dispute_id.to_string(),
                from: current.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        let compensation = match resolution {
            Resolution::Upheld => None,
            Resolution::Reversed => {
                let record = self
                    .engine
                    .db()
                    .get_record(&dispute.record_id)
                    .await?
                    .ok_or_else(|| LedgerError::RecordNotFound {
                        record_id: dispute.record_id.clone(),
                    })?;
                let causal = CausalRef::new(CausalKind::Dispute, dispute_id);
                let compensating = self
                    .engine
                    .apply_change(
                        dispute.relationship_id,
                        -record.delta,
                        &format!("reversal of disputed record {}", dispute.record_id),
                        &Actor::system("dispute-resolution"),
                        Some(&causal),
                        LimitPolicy::Exempt,
                    )
                    .await?;
                Some(compensating)
            }
        };
        info!(
            dispute_id,
            resolution = target.as_str(),
            reversed = compensation.is_some(),
            "dispute resolved"
        );
        Ok((self.get(dispute_id).await?, compensation))
    }

    async fn get(&self, dispute_id: &str) -> Result<Dispute, LedgerError> {
        self.engine
            .db()
            .get_dispute(dispute_id)
            .await?
            .ok_or_else(|| LedgerError::DisputeNotFound {
                dispute_id: dispute_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::LedgerDb;

    async fn setup() -> (MutationEngine, i64, PointChange) {
        let engine = MutationEngine::new(LedgerDb::open_in_memory().unwrap());
        let rel = engine.db().enroll("driver-1", "sponsor-a").await.unwrap();
        engine
            .apply_change(
                rel.id,
                100,
                "seed",
                &Actor::system("test"),
                None,
                LimitPolicy::Exempt,
            )
            .await
            .unwrap();
        let debit = engine
            .apply_change(
                rel.id,
                -30,
                "order debit",
                &Actor::system("test"),
                None,
                LimitPolicy::Exempt,
            )
            .await
            .unwrap();
        (engine, rel.id, debit)
    }

    #[tokio::test]
    async fn test_full_reversal_flow_preserves_original() {
        let (engine, rel_id, debit) = setup().await;
        let workflow = DisputeWorkflow::new(&engine);

        let dispute = workflow.file(&debit.id, "I never placed this order").await.unwrap();
        assert_eq!(dispute.status, DisputeStatus::Open);

        workflow.begin_review(&dispute.id).await.unwrap();

        let resolver = Actor::Sponsor {
            user_id: "sponsor-user-1".into(),
        };
        let (resolved, compensation) = workflow
            .resolve(&dispute.id, Resolution::Reversed, &resolver, "driver is right")
            .await
            .unwrap();
        assert_eq!(resolved.status, DisputeStatus::ResolvedReversed);
        assert_eq!(resolved.resolved_by, Some(resolver));

        let compensation = compensation.unwrap();
        assert_eq!(compensation.delta, 30);
        assert_eq!(
            compensation.causal_ref,
            Some(CausalRef::new(CausalKind::Dispute, dispute.id.clone()))
        );

        // The disputed record is byte-for-byte unchanged.
        let original = engine.db().get_record(&debit.id).await.unwrap().unwrap();
        assert_eq!(original.delta, debit.delta);
        assert_eq!(original.balance_before, debit.balance_before);
        assert_eq!(original.balance_after, debit.balance_after);
        assert_eq!(original.seq, debit.seq);

        let rel = engine.db().get_relationship(rel_id).await.unwrap().unwrap();
        assert_eq!(rel.balance, 100);
    }

    #[tokio::test]
    async fn test_upheld_leaves_ledger_untouched() {
        let (engine, rel_id, debit) = setup().await;
        let workflow = DisputeWorkflow::new(&engine);

        let dispute = workflow.file(&debit.id, "seems wrong").await.unwrap();
        workflow.begin_review(&dispute.id).await.unwrap();
        let (resolved, compensation) = workflow
            .resolve(
                &dispute.id,
                Resolution::Upheld,
                &Actor::Admin {
                    user_id: "admin-1".into(),
                },
                "charge is legitimate",
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, DisputeStatus::ResolvedUpheld);
        assert!(compensation.is_none());

        let rel = engine.db().get_relationship(rel_id).await.unwrap().unwrap();
        assert_eq!(rel.balance, 70);
    }

    #[tokio::test]
    async fn test_only_one_open_dispute_per_record() {
        let (engine, _, debit) = setup().await;
        let workflow = DisputeWorkflow::new(&engine);

        workflow.file(&debit.id, "first").await.unwrap();
        let err = workflow.file(&debit.id, "second").await.unwrap_err();
        assert!(matches!(err, LedgerError::DisputeAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_resolved_record_can_be_disputed_again() {
        let (engine, _, debit) = setup().await;
        let workflow = DisputeWorkflow::new(&engine);

        let d1 = workflow.file(&debit.id, "first").await.unwrap();
        workflow.begin_review(&d1.id).await.unwrap();
        workflow
            .resolve(
                &d1.id,
                Resolution::Upheld,
                &Actor::Admin {
                    user_id: "admin-1".into(),
                },
                "stands",
            )
            .await
            .unwrap();

        // Terminal disputes do not block a fresh filing.
        workflow.file(&debit.id, "try again").await.unwrap();
    }

    #[tokio::test]
    async fn test_compensating_record_not_disputable() {
        let (engine, _, debit) = setup().await;
        let workflow = DisputeWorkflow::new(&engine);

        let dispute = workflow.file(&debit.id, "wrong").await.unwrap();
        workflow.begin_review(&dispute.id).await.unwrap();
        let (_, compensation) = workflow
            .resolve(
                &dispute.id,
                Resolution::Reversed,
                &Actor::Admin {
                    user_id: "admin-1".into(),
                },
                "reversed",
            )
            .await
            .unwrap();

        let err = workflow
            .file(&compensation.unwrap().id, "dispute the reversal")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NonDisputableRecord { .. }));
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let (engine, _, debit) = setup().await;
        let workflow = DisputeWorkflow::new(&engine);
        let resolver = Actor::Admin {
            user_id: "admin-1".into(),
        };

        let dispute = workflow.file(&debit.id, "wrong").await.unwrap();

        // Cannot resolve straight from open.
        let err = workflow
            .resolve(&dispute.id, Resolution::Upheld, &resolver, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDisputeTransition { .. }));

        workflow.begin_review(&dispute.id).await.unwrap();

        // Cannot begin review twice.
        let err = workflow.begin_review(&dispute.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDisputeTransition { .. }));

        workflow
            .resolve(&dispute.id, Resolution::Upheld, &resolver, "done")
            .await
            .unwrap();

        // Terminal states are final.
        let err = workflow
            .resolve(&dispute.id, Resolution::Reversed, &resolver, "changed my mind")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDisputeTransition { .. }));
    }
}
