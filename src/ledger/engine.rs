//! Balance Mutation Engine
//!
//! The single authorized pathway for changing a relationship's balance.
//! Every mutation validates its inputs, passes the sponsor limit check
//! (unless the caller is a system path restoring prior state), applies the
//! delta and appends exactly one audit record, atomically.
//!
//! # Concurrency
//!
//! Serializability is per relationship, never global. Two layers:
//!
//! 1. A keyed async lock serializes in-process callers touching the same
//!    relationship; operations on different relationships share nothing and
//!    proceed in parallel.
//! 2. The relationship row carries a `version` token; the storage layer's
//!    conditional update catches writers outside this process. Conflicts
//!    retry a bounded number of times.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::ledger::actor::Actor;
use crate::ledger::error::LedgerError;
use crate::ledger::store::{ApplyOutcome, LedgerDb};
use crate::models::{CausalRef, PointChange, SponsorLimits};

/// Whether the sponsor's per-transaction limits apply to a mutation.
///
/// `Exempt` is selected internally by the settlement, dispute and reward
/// paths; it is never caller-supplied. Reversals and refunds restore prior
/// state, so re-checking limits against them would block legitimate
/// corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitPolicy {
    Enforce,
    Exempt,
}

/// Retries for the optimistic version check before giving up. Conflicts can
/// only come from a second process sharing the database file.
const CAS_MAX_RETRIES: u32 = 5;

pub struct MutationEngine {
    db: LedgerDb,
    /// Per-relationship locks, created on first touch and evicted once the
    /// last in-flight mutation releases them.
    locks: parking_lot::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl MutationEngine {
    pub fn new(db: LedgerDb) -> Self {
        Self {
            db,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    /// Apply a signed delta to one relationship's balance.
    ///
    /// On success exactly one point change record has been appended; on any
    /// error nothing has been written.
    pub(crate) async fn apply_change(
        &self,
        relationship_id: i64,
        delta: i64,
        reason: &str,
        actor: &Actor,
        causal_ref: Option<&CausalRef>,
        policy: LimitPolicy,
    ) -> Result<PointChange, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidDelta);
        }

        // The limit check reads sponsor configuration as of now; a later
        // limits change never re-validates a committed record.
        if policy == LimitPolicy::Enforce {
            let rel = self
                .db
                .get_relationship(relationship_id)
                .await?
                .ok_or(LedgerError::RelationshipNotFound { relationship_id })?;
            let limits = self
                .db
                .get_limits(&rel.sponsor_id)
                .await?
                .unwrap_or_else(|| SponsorLimits::defaults_for(&rel.sponsor_id));
            check_limits(delta, &limits)?;
        }

        let lock = self.lock_for(relationship_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_with_retry(relationship_id, delta, reason, actor, causal_ref)
                .await
        };
        self.release_lock(relationship_id, &lock);
        result
    }

    async fn apply_with_retry(
        &self,
        relationship_id: i64,
        delta: i64,
        reason: &str,
        actor: &Actor,
        causal_ref: Option<&CausalRef>,
    ) -> Result<PointChange, LedgerError> {
        for attempt in 0..CAS_MAX_RETRIES {
            match self
                .db
                .apply_change(relationship_id, delta, reason, actor, causal_ref)
                .await?
            {
                ApplyOutcome::Applied(record) => {
                    counter!("ledger_changes_applied", 1);
                    debug!(
                        relationship_id,
                        delta,
                        seq = record.seq,
                        balance_after = record.balance_after,
                        actor = actor.kind(),
                        "point change applied"
                    );
                    return Ok(record);
                }
                ApplyOutcome::VersionConflict => {
                    warn!(
                        relationship_id,
                        attempt, "version conflict on balance update, retrying"
                    );
                }
            }
        }

        counter!("ledger_changes_rejected", 1);
        Err(LedgerError::Storage(anyhow::anyhow!(
            "balance update for relationship {} lost the version race {} times",
            relationship_id,
            CAS_MAX_RETRIES
        )))
    }

    fn lock_for(&self, relationship_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(relationship_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the registry entry once no other task holds a clone. Waiters
    /// keep the Arc alive, so contended entries survive; idle ones are
    /// evicted and the map stays proportional to in-flight mutations.
    fn release_lock(&self, relationship_id: i64, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // Registry entry plus our clone; clones are only created while
        // holding the registry mutex, so this count cannot race upward.
        if Arc::strong_count(lock) == 2 {
            locks.remove(&relationship_id);
        }
    }
}

fn check_limits(delta: i64, limits: &SponsorLimits) -> Result<(), LedgerError> {
    let magnitude = delta.abs();
    if magnitude < limits.min_points_per_txn || magnitude > limits.max_points_per_txn {
        counter!("ledger_changes_rejected", 1);
        return Err(LedgerError::LimitExceeded {
            delta,
            min: limits.min_points_per_txn,
            max: limits.max_points_per_txn,
        });
    }
    Ok(())
}
