//! Ledger Error Taxonomy
//!
//! Every failure mode of the ledger core is a distinct variant so callers
//! (checkout, admin forms, dispute workflow) can translate them into
//! user-facing messages. All variants except `ConsistencyMismatch` and
//! `Storage` are recoverable by the caller; a consistency mismatch is a
//! data-integrity bug and must be escalated, never silently corrected.

use std::fmt;

/// Errors returned by ledger operations.
#[derive(Debug)]
pub enum LedgerError {
    /// A zero delta was requested; every mutation must move the balance.
    InvalidDelta,
    /// |delta| is outside the sponsor's configured per-transaction bounds.
    LimitExceeded {
        delta: i64,
        min: i64,
        max: i64,
    },
    /// Applying the debit would drive the balance below zero.
    InsufficientBalance {
        balance: i64,
        requested: i64,
    },
    /// The relationship exists but has been deactivated.
    RelationshipInactive {
        relationship_id: i64,
    },
    RelationshipNotFound {
        relationship_id: i64,
    },
    /// A (driver, sponsor) pair can only be enrolled once.
    RelationshipExists {
        driver_id: String,
        sponsor_id: String,
    },
    /// No debit record exists for the given order reference.
    OrderNotFound {
        order_ref: String,
    },
    /// A refund or cancellation credit was already applied for this order.
    AlreadyRefunded {
        order_ref: String,
    },
    /// The refund was attempted after the sponsor's refund window closed.
    RefundWindowExpired {
        order_ref: String,
        window_days: i64,
    },
    /// Cancellation requested after the order left its pre-fulfillment status.
    OrderNotCancellable {
        order_ref: String,
        status: String,
    },
    /// A refund/cancellation credit larger than the original debit.
    RefundExceedsDebit {
        requested: i64,
        original: i64,
    },
    RecordNotFound {
        record_id: String,
    },
    /// Compensating records (dispute reversals) cannot themselves be disputed.
    NonDisputableRecord {
        record_id: String,
    },
    /// Only one non-terminal dispute per point change record.
    DisputeAlreadyExists {
        record_id: String,
    },
    DisputeNotFound {
        dispute_id: String,
    },
    /// Requested transition not permitted from the dispute's current state.
    InvalidDisputeTransition {
        dispute_id: String,
        from: String,
        to: String,
    },
    /// Replay of the audit trail disagrees with the stored balance.
    /// Indicates corruption or a bug; escalate, do not correct.
    ConsistencyMismatch {
        relationship_id: i64,
        stored: i64,
        computed: i64,
    },
    /// Underlying storage failure. Opaque to API consumers.
    Storage(anyhow::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InvalidDelta => write!(f, "delta must be a non-zero integer"),
            LedgerError::LimitExceeded { delta, min, max } => write!(
                f,
                "transaction of {} points is outside sponsor limits [{}, {}]",
                delta, min, max
            ),
            LedgerError::InsufficientBalance { balance, requested } => write!(
                f,
                "insufficient balance: have {} points, attempted to deduct {}",
                balance, requested
            ),
            LedgerError::RelationshipInactive { relationship_id } => {
                write!(f, "relationship {} is inactive", relationship_id)
            }
            LedgerError::RelationshipNotFound { relationship_id } => {
                write!(f, "relationship {} not found", relationship_id)
            }
            LedgerError::RelationshipExists {
                driver_id,
                sponsor_id,
            } => write!(
                f,
                "driver {} is already enrolled with sponsor {}",
                driver_id, sponsor_id
            ),
            LedgerError::OrderNotFound { order_ref } => {
                write!(f, "no debit record found for order {}", order_ref)
            }
            LedgerError::AlreadyRefunded { order_ref } => {
                write!(f, "order {} has already been refunded", order_ref)
            }
            LedgerError::RefundWindowExpired {
                order_ref,
                window_days,
            } => write!(
                f,
                "refund window of {} days has expired for order {}",
                window_days, order_ref
            ),
            LedgerError::OrderNotCancellable { order_ref, status } => write!(
                f,
                "order {} cannot be cancelled in status {}",
                order_ref, status
            ),
            LedgerError::RefundExceedsDebit {
                requested,
                original,
            } => write!(
                f,
                "refund of {} points exceeds original debit of {}",
                requested, original
            ),
            LedgerError::RecordNotFound { record_id } => {
                write!(f, "point change record {} not found", record_id)
            }
            LedgerError::NonDisputableRecord { record_id } => write!(
                f,
                "record {} is a compensating record and cannot be disputed",
                record_id
            ),
            LedgerError::DisputeAlreadyExists { record_id } => {
                write!(f, "an open dispute already exists for record {}", record_id)
            }
            LedgerError::DisputeNotFound { dispute_id } => {
                write!(f, "dispute {} not found", dispute_id)
            }
            LedgerError::InvalidDisputeTransition { dispute_id, from, to } => write!(
                f,
                "dispute {} cannot transition from {} to {}",
                dispute_id, from, to
            ),
            LedgerError::ConsistencyMismatch {
                relationship_id,
                stored,
                computed,
            } => write!(
                f,
                "CONSISTENCY MISMATCH on relationship {}: stored balance {} but replay computed {}",
                relationship_id, stored, computed
            ),
            LedgerError::Storage(err) => write!(f, "storage error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Storage(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Storage(err.into())
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        LedgerError::Storage(err)
    }
}

impl LedgerError {
    /// True for errors the immediate caller is expected to handle and
    /// translate into a user-facing message.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            LedgerError::ConsistencyMismatch { .. } | LedgerError::Storage(_)
        )
    }
}
