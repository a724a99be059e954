//! Actor Identification
//!
//! Who (or what) triggered a balance mutation. Stored in a structured,
//! queryable form in the audit record rather than as free text, so admin
//! tooling can filter by actor kind without string parsing.

use serde::{Deserialize, Serialize};

/// The initiator of a point change, recorded on every audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// A sponsor company user acting through the sponsor dashboard.
    Sponsor { user_id: String },
    /// A platform administrator acting directly.
    Admin { user_id: String },
    /// An administrator performing an action on behalf of another user.
    AdminImpersonating {
        admin_id: String,
        target_user_id: String,
    },
    /// An automated rule or internal workflow (settlement, dispute reversal,
    /// challenge evaluator).
    System { process: String },
}

impl Actor {
    pub fn system(process: impl Into<String>) -> Self {
        Actor::System {
            process: process.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Actor::Sponsor { .. } => "sponsor",
            Actor::Admin { .. } => "admin",
            Actor::AdminImpersonating { .. } => "admin_impersonating",
            Actor::System { .. } => "system",
        }
    }

    /// Flatten into (kind, id, on_behalf_of) storage columns.
    pub fn to_columns(&self) -> (&'static str, String, Option<String>) {
        match self {
            Actor::Sponsor { user_id } => ("sponsor", user_id.clone(), None),
            Actor::Admin { user_id } => ("admin", user_id.clone(), None),
            Actor::AdminImpersonating {
                admin_id,
                target_user_id,
            } => (
                "admin_impersonating",
                admin_id.clone(),
                Some(target_user_id.clone()),
            ),
            Actor::System { process } => ("system", process.clone(), None),
        }
    }

    /// Rebuild from storage columns. Unknown kinds map to a system actor so
    /// a forward-compatible row never fails a read path.
    pub fn from_columns(kind: &str, id: String, on_behalf_of: Option<String>) -> Self {
        match kind {
            "sponsor" => Actor::Sponsor { user_id: id },
            "admin" => Actor::Admin { user_id: id },
            "admin_impersonating" => Actor::AdminImpersonating {
                admin_id: id,
                target_user_id: on_behalf_of.unwrap_or_default(),
            },
            _ => Actor::System { process: id },
        }
    }
}
