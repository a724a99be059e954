//! Audit Replay
//!
//! Balances are derived state: folding a relationship's full record history
//! in sequence order must land exactly on the stored balance. This module
//! exposes that check for admin review and for the periodic verification
//! job. A mismatch is never corrected here; it is reported loudly and left
//! for a human.

use metrics::counter;
use serde::Serialize;
use tracing::error;

use crate::ledger::error::LedgerError;
use crate::ledger::store::LedgerDb;
use crate::models::PointChange;

/// Result of replaying a relationship's history.
#[derive(Debug, Clone, Serialize)]
pub struct Replay {
    pub relationship_id: i64,
    /// Balance computed by folding every record's delta from zero.
    pub computed_balance: i64,
    /// Balance currently stored on the relationship row.
    pub stored_balance: i64,
    pub records_checked: usize,
    /// False when the fold disagrees with the stored balance, a record's
    /// before/after snapshot breaks `after == before + delta`, or adjacent
    /// records do not chain.
    pub consistent: bool,
}

pub struct AuditReplay<'a> {
    db: &'a LedgerDb,
}

impl<'a> AuditReplay<'a> {
    pub fn new(db: &'a LedgerDb) -> Self {
        Self { db }
    }

    /// Fold the full ordered history and compare against the stored balance.
    ///
    /// Records are ordered by per-relationship `seq`, assigned at write time;
    /// wall-clock timestamps are never trusted for ordering.
    pub async fn replay_balance(&self, relationship_id: i64) -> Result<Replay, LedgerError> {
        let rel = self
            .db
            .get_relationship(relationship_id)
            .await?
            .ok_or(LedgerError::RelationshipNotFound { relationship_id })?;
        let records = self.db.list_changes_for_replay(relationship_id).await?;

        let mut computed: i64 = 0;
        let mut chain_ok = true;
        for record in &records {
            if record.balance_before != computed
                || record.balance_after != record.balance_before + record.delta
            {
                chain_ok = false;
            }
            computed += record.delta;
        }

        let replay = Replay {
            relationship_id,
            computed_balance: computed,
            stored_balance: rel.balance,
            records_checked: records.len(),
            consistent: chain_ok && computed == rel.balance,
        };

        if !replay.consistent {
            counter!("ledger_replay_mismatches", 1);
            error!(
                relationship_id,
                stored = rel.balance,
                computed,
                records = records.len(),
                "ledger replay mismatch: audit trail does not reconstruct stored balance"
            );
        }

        Ok(replay)
    }

    /// Checked variant: consistent replay returns the balance, mismatch
    /// becomes a `ConsistencyMismatch` error for escalation paths.
    pub async fn verify_balance(&self, relationship_id: i64) -> Result<i64, LedgerError> {
        let replay = self.replay_balance(relationship_id).await?;
        if !replay.consistent {
            return Err(LedgerError::ConsistencyMismatch {
                relationship_id,
                stored: replay.stored_balance,
                computed: replay.computed_balance,
            });
        }
        Ok(replay.computed_balance)
    }

    /// Raw record listing for history views, newest first.
    pub async fn history(
        &self,
        relationship_id: i64,
        limit: usize,
    ) -> Result<Vec<PointChange>, LedgerError> {
        if self.db.get_relationship(relationship_id).await?.is_none() {
            return Err(LedgerError::RelationshipNotFound { relationship_id });
        }
        self.db.list_changes(relationship_id, limit).await
    }
}
