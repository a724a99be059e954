//! Ledger Storage
//! Mission: Persist relationships, point changes, disputes and sponsor
//! limits in SQLite, with the point-change table enforced append-only at
//! the storage layer.
//!
//! Point changes are guarded by `BEFORE UPDATE` / `BEFORE DELETE` triggers
//! that abort the statement, so history cannot be edited even by code that
//! bypasses this module's API.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ledger::actor::Actor;
use crate::ledger::error::LedgerError;
use crate::models::{
    CausalKind, CausalRef, Dispute, DisputeStatus, PointChange, Relationship, RelationshipStatus,
    SponsorLimits,
};

/// Outcome of a conditional balance write.
#[derive(Debug)]
pub(crate) enum ApplyOutcome {
    Applied(PointChange),
    /// The relationship row's version moved under us (external writer).
    VersionConflict,
}

/// SQLite-backed ledger storage.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                driver_id TEXT NOT NULL,
                sponsor_id TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                status TEXT NOT NULL DEFAULT 'active',
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (driver_id, sponsor_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS point_changes (
                id TEXT PRIMARY KEY,
                relationship_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                delta INTEGER NOT NULL CHECK (delta != 0),
                balance_before INTEGER NOT NULL,
                balance_after INTEGER NOT NULL,
                reason TEXT NOT NULL,
                actor_kind TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                actor_on_behalf_of TEXT,
                causal_kind TEXT,
                causal_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (relationship_id, seq),
                FOREIGN KEY (relationship_id) REFERENCES relationships(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS disputes (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                relationship_id INTEGER NOT NULL,
                driver_reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                resolved_by_kind TEXT,
                resolved_by_id TEXT,
                resolved_by_on_behalf_of TEXT,
                resolution_note TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                FOREIGN KEY (record_id) REFERENCES point_changes(id),
                FOREIGN KEY (relationship_id) REFERENCES relationships(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sponsor_limits (
                sponsor_id TEXT PRIMARY KEY,
                min_points_per_txn INTEGER NOT NULL,
                max_points_per_txn INTEGER NOT NULL,
                point_value_cents INTEGER NOT NULL,
                refund_window_days INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_point_changes_rel_seq
             ON point_changes(relationship_id, seq ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_point_changes_causal
             ON point_changes(causal_kind, causal_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_disputes_record
             ON disputes(record_id, status)",
            [],
        )?;

        // At most one compensating credit per order, enforced inside the
        // write transaction so concurrent refund/cancellation attempts
        // cannot both land.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_point_changes_one_compensation
             ON point_changes(causal_id) WHERE causal_kind IN ('refund', 'cancellation')",
            [],
        )?;
        // At most one non-terminal dispute per record.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_disputes_one_open
             ON disputes(record_id) WHERE status IN ('open', 'under_review')",
            [],
        )?;

        // Append-only enforcement: history is corrected by compensating
        // records, never by editing rows.
        conn.execute(
            "CREATE TRIGGER IF NOT EXISTS point_changes_no_update
             BEFORE UPDATE ON point_changes
             BEGIN
                 SELECT RAISE(ABORT, 'point_changes is append-only');
             END",
            [],
        )?;
        conn.execute(
            "CREATE TRIGGER IF NOT EXISTS point_changes_no_delete
             BEFORE DELETE ON point_changes
             BEGIN
                 SELECT RAISE(ABORT, 'point_changes is append-only');
             END",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ===== Relationships =====

    /// Enroll a driver with a sponsor. Balance starts at zero.
    pub async fn enroll(
        &self,
        driver_id: &str,
        sponsor_id: &str,
    ) -> Result<Relationship, LedgerError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO relationships (driver_id, sponsor_id, balance, status, version, created_at)
             VALUES (?1, ?2, 0, 'active', 0, ?3)",
            params![driver_id, sponsor_id, now.to_rfc3339()],
        );

        match inserted {
            Ok(_) => Ok(Relationship {
                id: conn.last_insert_rowid(),
                driver_id: driver_id.to_string(),
                sponsor_id: sponsor_id.to_string(),
                balance: 0,
                status: RelationshipStatus::Active,
                version: 0,
                created_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(LedgerError::RelationshipExists {
                    driver_id: driver_id.to_string(),
                    sponsor_id: sponsor_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_relationship(&self, id: i64) -> Result<Option<Relationship>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, driver_id, sponsor_id, balance, status, version, created_at
             FROM relationships WHERE id = ?1",
        )?;
        let rel = stmt
            .query_row(params![id], map_relationship)
            .optional()?;
        Ok(rel)
    }

    /// Soft-deactivate. The row and its audit history are preserved.
    pub async fn deactivate(&self, id: i64) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE relationships SET status = 'inactive', version = version + 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(LedgerError::RelationshipNotFound { relationship_id: id });
        }
        Ok(())
    }

    // ===== Balance mutation =====

    /// Read-check-write of one balance mutation as a single transaction.
    ///
    /// The relationship update is conditional on the version read at the top
    /// of the transaction; a lost race against an external writer reports
    /// `VersionConflict` with nothing written. On success exactly one audit
    /// record is appended.
    pub(crate) async fn apply_change(
        &self,
        relationship_id: i64,
        delta: i64,
        reason: &str,
        actor: &Actor,
        causal_ref: Option<&CausalRef>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(LedgerError::from)?;

        let row = tx
            .query_row(
                "SELECT balance, status, version FROM relationships WHERE id = ?1",
                params![relationship_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(LedgerError::from)?;

        let (balance, status, version) = match row {
            Some(r) => r,
            None => return Err(LedgerError::RelationshipNotFound { relationship_id }),
        };

        if RelationshipStatus::from_str(&status) != Some(RelationshipStatus::Active) {
            return Err(LedgerError::RelationshipInactive { relationship_id });
        }

        let balance_after = balance + delta;
        if balance_after < 0 {
            return Err(LedgerError::InsufficientBalance {
                balance,
                requested: -delta,
            });
        }

        let changed = tx
            .execute(
                "UPDATE relationships SET balance = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![balance_after, relationship_id, version],
            )
            .map_err(LedgerError::from)?;
        if changed == 0 {
            return Ok(ApplyOutcome::VersionConflict);
        }

        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM point_changes WHERE relationship_id = ?1",
                params![relationship_id],
                |row| row.get(0),
            )
            .map_err(LedgerError::from)?;

        let record = PointChange {
            id: Uuid::new_v4().to_string(),
            relationship_id,
            seq,
            delta,
            balance_before: balance,
            balance_after,
            reason: reason.to_string(),
            actor: actor.clone(),
            causal_ref: causal_ref.cloned(),
            created_at: Utc::now(),
        };

        let (actor_kind, actor_id, on_behalf_of) = record.actor.to_columns();
        let inserted = tx.execute(
            "INSERT INTO point_changes
             (id, relationship_id, seq, delta, balance_before, balance_after, reason,
              actor_kind, actor_id, actor_on_behalf_of, causal_kind, causal_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id,
                record.relationship_id,
                record.seq,
                record.delta,
                record.balance_before,
                record.balance_after,
                record.reason,
                actor_kind,
                actor_id,
                on_behalf_of,
                record.causal_ref.as_ref().map(|c| c.kind.as_str()),
                record.causal_ref.as_ref().map(|c| c.id.as_str()),
                record.created_at.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => {}
            // The one-compensation-per-order unique index fired: a parallel
            // refund/cancellation won. The transaction rolls back on drop,
            // so the balance update above is undone too.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && matches!(
                        causal_ref.map(|c| c.kind),
                        Some(CausalKind::Refund) | Some(CausalKind::Cancellation)
                    ) =>
            {
                return Err(LedgerError::AlreadyRefunded {
                    order_ref: causal_ref
                        .map(|c| c.id.clone())
                        .unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().map_err(LedgerError::from)?;
        Ok(ApplyOutcome::Applied(record))
    }

    // ===== Point change queries =====

    pub async fn get_record(&self, record_id: &str) -> Result<Option<PointChange>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM point_changes WHERE id = ?1",
            CHANGE_COLUMNS
        ))?;
        let rec = stmt.query_row(params![record_id], map_change).optional()?;
        Ok(rec)
    }

    /// The original debit for an order, if one was ever applied.
    pub async fn find_order_debit(
        &self,
        order_ref: &str,
    ) -> Result<Option<PointChange>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM point_changes
             WHERE causal_kind = 'order' AND causal_id = ?1 AND delta < 0
             ORDER BY created_at ASC LIMIT 1",
            CHANGE_COLUMNS
        ))?;
        let rec = stmt.query_row(params![order_ref], map_change).optional()?;
        Ok(rec)
    }

    /// Whether a refund or cancellation credit already exists for an order.
    pub async fn order_compensated(&self, order_ref: &str) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM point_changes
             WHERE causal_kind IN ('refund', 'cancellation') AND causal_id = ?1",
            params![order_ref],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Full history in sequence order, oldest first. Replay input.
    pub async fn list_changes_for_replay(
        &self,
        relationship_id: i64,
    ) -> Result<Vec<PointChange>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM point_changes
             WHERE relationship_id = ?1 ORDER BY seq ASC",
            CHANGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![relationship_id], map_change)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Recent history, newest first, for driver/sponsor/admin views.
    pub async fn list_changes(
        &self,
        relationship_id: i64,
        limit: usize,
    ) -> Result<Vec<PointChange>, LedgerError> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM point_changes
             WHERE relationship_id = ?1 ORDER BY seq DESC LIMIT ?2",
            CHANGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![relationship_id, limit], map_change)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ===== Disputes =====

    pub async fn insert_dispute(&self, dispute: &Dispute) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO disputes
             (id, record_id, relationship_id, driver_reason, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                dispute.id,
                dispute.record_id,
                dispute.relationship_id,
                dispute.driver_reason,
                dispute.status.as_str(),
                dispute.created_at.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            // The one-open-dispute unique index fired: a parallel filing won.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(LedgerError::DisputeAlreadyExists {
                    record_id: dispute.record_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_dispute(&self, dispute_id: &str) -> Result<Option<Dispute>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, record_id, relationship_id, driver_reason, status,
                    resolved_by_kind, resolved_by_id, resolved_by_on_behalf_of,
                    resolution_note, created_at, resolved_at
             FROM disputes WHERE id = ?1",
        )?;
        let dispute = stmt.query_row(params![dispute_id], map_dispute).optional()?;
        Ok(dispute)
    }

    /// A non-terminal dispute already filed against this record, if any.
    pub async fn find_open_dispute(
        &self,
        record_id: &str,
    ) -> Result<Option<Dispute>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, record_id, relationship_id, driver_reason, status,
                    resolved_by_kind, resolved_by_id, resolved_by_on_behalf_of,
                    resolution_note, created_at, resolved_at
             FROM disputes
             WHERE record_id = ?1 AND status IN ('open', 'under_review')
             LIMIT 1",
        )?;
        let dispute = stmt.query_row(params![record_id], map_dispute).optional()?;
        Ok(dispute)
    }

    /// Conditional `open -> under_review` transition. Returns false when the
    /// dispute is not currently open (missing, already in review, terminal).
    pub async fn mark_under_review(&self, dispute_id: &str) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE disputes SET status = 'under_review'
             WHERE id = ?1 AND status = 'open'",
            params![dispute_id],
        )?;
        Ok(changed > 0)
    }

    /// Conditional `under_review -> resolved_*` transition. Returns false
    /// when the dispute is not currently under review, so exactly one of
    /// several concurrent resolvers wins.
    pub async fn mark_resolved(
        &self,
        dispute_id: &str,
        status: DisputeStatus,
        resolved_by: &Actor,
        note: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let (kind, id, on_behalf_of) = resolved_by.to_columns();
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE disputes
             SET status = ?1, resolved_by_kind = ?2, resolved_by_id = ?3,
                 resolved_by_on_behalf_of = ?4, resolution_note = ?5, resolved_at = ?6
             WHERE id = ?7 AND status = 'under_review'",
            params![
                status.as_str(),
                kind,
                id,
                on_behalf_of,
                note,
                resolved_at.to_rfc3339(),
                dispute_id,
            ],
        )?;
        Ok(changed > 0)
    }

    // ===== Sponsor limits =====

    pub async fn get_limits(
        &self,
        sponsor_id: &str,
    ) -> Result<Option<SponsorLimits>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT sponsor_id, min_points_per_txn, max_points_per_txn,
                    point_value_cents, refund_window_days, updated_at
             FROM sponsor_limits WHERE sponsor_id = ?1",
        )?;
        let limits = stmt
            .query_row(params![sponsor_id], |row| {
                Ok(SponsorLimits {
                    sponsor_id: row.get(0)?,
                    min_points_per_txn: row.get(1)?,
                    max_points_per_txn: row.get(2)?,
                    point_value_cents: row.get(3)?,
                    refund_window_days: row.get(4)?,
                    updated_at: parse_ts(5, row.get::<_, String>(5)?)?,
                })
            })
            .optional()?;
        Ok(limits)
    }

    /// Direct SQL escape hatch for corrupting state in tests.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        conn.execute(sql, [])?;
        Ok(())
    }

    pub async fn upsert_limits(&self, limits: &SponsorLimits) -> Result<(), LedgerError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sponsor_limits
             (sponsor_id, min_points_per_txn, max_points_per_txn, point_value_cents,
              refund_window_days, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(sponsor_id) DO UPDATE SET
                min_points_per_txn = excluded.min_points_per_txn,
                max_points_per_txn = excluded.max_points_per_txn,
                point_value_cents = excluded.point_value_cents,
                refund_window_days = excluded.refund_window_days,
                updated_at = excluded.updated_at",
            params![
                limits.sponsor_id,
                limits.min_points_per_txn,
                limits.max_points_per_txn,
                limits.point_value_cents,
                limits.refund_window_days,
                limits.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

const CHANGE_COLUMNS: &str = "id, relationship_id, seq, delta, balance_before, balance_after, \
     reason, actor_kind, actor_id, actor_on_behalf_of, causal_kind, causal_id, created_at";

fn map_relationship(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    let status_str: String = row.get(4)?;
    Ok(Relationship {
        id: row.get(0)?,
        driver_id: row.get(1)?,
        sponsor_id: row.get(2)?,
        balance: row.get(3)?,
        status: RelationshipStatus::from_str(&status_str)
            .unwrap_or(RelationshipStatus::Inactive),
        version: row.get(5)?,
        created_at: parse_ts(6, row.get::<_, String>(6)?)?,
    })
}

fn map_change(row: &Row<'_>) -> rusqlite::Result<PointChange> {
    let actor_kind: String = row.get(7)?;
    let actor_id: String = row.get(8)?;
    let on_behalf_of: Option<String> = row.get(9)?;
    let causal_kind: Option<String> = row.get(10)?;
    let causal_id: Option<String> = row.get(11)?;

    let causal_ref = match (causal_kind, causal_id) {
        (Some(kind), Some(id)) => CausalKind::from_str(&kind).map(|k| CausalRef::new(k, id)),
        _ => None,
    };

    Ok(PointChange {
        id: row.get(0)?,
        relationship_id: row.get(1)?,
        seq: row.get(2)?,
        delta: row.get(3)?,
        balance_before: row.get(4)?,
        balance_after: row.get(5)?,
        reason: row.get(6)?,
        actor: Actor::from_columns(&actor_kind, actor_id, on_behalf_of),
        causal_ref,
        created_at: parse_ts(12, row.get::<_, String>(12)?)?,
    })
}

fn map_dispute(row: &Row<'_>) -> rusqlite::Result<Dispute> {
    let status_str: String = row.get(4)?;
    let resolved_by_kind: Option<String> = row.get(5)?;
    let resolved_by_id: Option<String> = row.get(6)?;
    let resolved_obo: Option<String> = row.get(7)?;
    let resolved_at: Option<String> = row.get(10)?;

    let resolved_by = match (resolved_by_kind, resolved_by_id) {
        (Some(kind), Some(id)) => Some(Actor::from_columns(&kind, id, resolved_obo)),
        _ => None,
    };
    let resolved_at = match resolved_at {
        Some(s) => Some(parse_ts(10, s)?),
        None => None,
    };

    Ok(Dispute {
        id: row.get(0)?,
        record_id: row.get(1)?,
        relationship_id: row.get(2)?,
        driver_reason: row.get(3)?,
        status: DisputeStatus::from_str(&status_str).unwrap_or(DisputeStatus::Open),
        resolved_by,
        resolution_note: row.get(8)?,
        created_at: parse_ts(9, row.get::<_, String>(9)?)?,
        resolved_at,
    })
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
