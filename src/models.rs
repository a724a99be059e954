//! Domain Models
//! Mission: Define the core data structures of the points ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::actor::Actor;

/// A driver's enrollment with one sponsor company.
///
/// The unit of balance isolation: every point mutation is scoped to exactly
/// one relationship. Uniquely keyed by (driver_id, sponsor_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub driver_id: String,
    pub sponsor_id: String,
    /// Current point balance. Never negative after a committed mutation.
    pub balance: i64,
    pub status: RelationshipStatus,
    /// Optimistic concurrency token, bumped on every balance mutation.
    #[serde(skip_serializing, default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Enrollment status. Relationships are soft-deactivated, never deleted,
/// so their audit history survives a driver leaving a sponsor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelationshipStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "inactive")]
    Inactive,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RelationshipStatus::Active => "active",
            RelationshipStatus::Inactive => "inactive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RelationshipStatus::Active),
            "inactive" => Some(RelationshipStatus::Inactive),
            _ => None,
        }
    }
}

/// One immutable, append-only ledger entry.
///
/// Invariant: `balance_after == balance_before + delta`. Replaying all
/// records for a relationship in `seq` order must reconstruct the stored
/// balance exactly. Corrections are new compensating records, never edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointChange {
    pub id: String,
    pub relationship_id: i64,
    /// Per-relationship monotonic sequence, assigned inside the write
    /// transaction. Total-order tie-breaker when timestamps collide.
    pub seq: i64,
    /// Signed point amount. Positive = credit, negative = debit. Never zero.
    pub delta: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub reason: String,
    pub actor: Actor,
    pub causal_ref: Option<CausalRef>,
    pub created_at: DateTime<Utc>,
}

/// Reference to the entity that triggered a point change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CausalRef {
    pub kind: CausalKind,
    pub id: String,
}

impl CausalRef {
    pub fn new(kind: CausalKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CausalKind {
    #[serde(rename = "order")]
    Order,
    #[serde(rename = "refund")]
    Refund,
    #[serde(rename = "cancellation")]
    Cancellation,
    #[serde(rename = "challenge")]
    Challenge,
    #[serde(rename = "achievement")]
    Achievement,
    #[serde(rename = "dispute")]
    Dispute,
}

impl CausalKind {
    pub fn as_str(&self) -> &str {
        match self {
            CausalKind::Order => "order",
            CausalKind::Refund => "refund",
            CausalKind::Cancellation => "cancellation",
            CausalKind::Challenge => "challenge",
            CausalKind::Achievement => "achievement",
            CausalKind::Dispute => "dispute",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "order" => Some(CausalKind::Order),
            "refund" => Some(CausalKind::Refund),
            "cancellation" => Some(CausalKind::Cancellation),
            "challenge" => Some(CausalKind::Challenge),
            "achievement" => Some(CausalKind::Achievement),
            "dispute" => Some(CausalKind::Dispute),
            _ => None,
        }
    }
}

/// A driver's contestation of a specific point change record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub record_id: String,
    pub relationship_id: i64,
    pub driver_reason: String,
    pub status: DisputeStatus,
    pub resolved_by: Option<Actor>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Dispute lifecycle: `open -> under_review -> {resolved_upheld, resolved_reversed}`.
/// The two `resolved_*` states are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisputeStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "under_review")]
    UnderReview,
    #[serde(rename = "resolved_upheld")]
    ResolvedUpheld,
    #[serde(rename = "resolved_reversed")]
    ResolvedReversed,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::ResolvedUpheld => "resolved_upheld",
            DisputeStatus::ResolvedReversed => "resolved_reversed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(DisputeStatus::Open),
            "under_review" => Some(DisputeStatus::UnderReview),
            "resolved_upheld" => Some(DisputeStatus::ResolvedUpheld),
            "resolved_reversed" => Some(DisputeStatus::ResolvedReversed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisputeStatus::ResolvedUpheld | DisputeStatus::ResolvedReversed
        )
    }
}

/// Sponsor-level limits consulted before accepting award/deduct operations.
///
/// Read at the moment the triggering action executes; a later change never
/// re-validates committed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SponsorLimits {
    pub sponsor_id: String,
    /// Minimum |delta| for a sponsor-initiated transaction.
    pub min_points_per_txn: i64,
    /// Maximum |delta| for a sponsor-initiated transaction.
    pub max_points_per_txn: i64,
    /// Points-to-currency conversion rate, in cents per point.
    pub point_value_cents: i64,
    /// How long after the original debit a refund is accepted.
    pub refund_window_days: i64,
    pub updated_at: DateTime<Utc>,
}

impl SponsorLimits {
    /// Fallback limits for sponsors that never configured their own.
    pub fn defaults_for(sponsor_id: &str) -> Self {
        Self {
            sponsor_id: sponsor_id.to_string(),
            min_points_per_txn: 1,
            max_points_per_txn: 10_000,
            point_value_cents: 1,
            refund_window_days: 30,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in ["active", "inactive"] {
            assert_eq!(RelationshipStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(RelationshipStatus::from_str("deleted").is_none());
    }

    #[test]
    fn test_dispute_status_terminality() {
        assert!(!DisputeStatus::Open.is_terminal());
        assert!(!DisputeStatus::UnderReview.is_terminal());
        assert!(DisputeStatus::ResolvedUpheld.is_terminal());
        assert!(DisputeStatus::ResolvedReversed.is_terminal());
    }

    #[test]
    fn test_causal_kind_round_trip() {
        for k in [
            CausalKind::Order,
            CausalKind::Refund,
            CausalKind::Cancellation,
            CausalKind::Challenge,
            CausalKind::Achievement,
            CausalKind::Dispute,
        ] {
            assert_eq!(CausalKind::from_str(k.as_str()), Some(k));
        }
    }
}
