//! Conflict strategies and the intent-level resolution helper.

use crate::messages::{CurrentSnapshot, RemoteError, WriteReject};
use crate::write::{WriteAction, WriteIntent};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Policy applied when the authority rejects a write with `CONFLICT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The authority's current value replaces the local one.
    #[default]
    ServerWins,
    /// The local write is rebased onto the current version and retried.
    ClientWins,
    /// The local write is dropped and reported as an error.
    Reject,
    /// The conflict is handed to the caller untouched.
    Manual,
}

impl ConflictStrategy {
    /// Returns true if this strategy settles conflicts without the caller.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictStrategy::Manual)
    }

    /// Returns the strategy name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::Reject => "reject",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-wins" => Ok(ConflictStrategy::ServerWins),
            "client-wins" => Ok(ConflictStrategy::ClientWins),
            "reject" => Ok(ConflictStrategy::Reject),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// A rejected write together with the authority's view of the entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// The local write that was rejected.
    pub intent: WriteIntent,
    /// The reject reason.
    pub error: RemoteError,
    /// The authority's current copy, if it sent one.
    pub current: Option<CurrentSnapshot>,
}

impl Conflict {
    /// Creates a conflict from a rejected intent.
    pub fn new(intent: WriteIntent, reject: &WriteReject) -> Self {
        Self {
            intent,
            error: reject.error.clone(),
            current: reject.current.clone(),
        }
    }

    /// Returns the entity the conflict is about.
    pub fn entity_id(&self) -> Option<&str> {
        self.intent.entity_id()
    }
}

/// What to do with a rejected write.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictDecision {
    /// Replace the local entity with the authority's copy and drop the write.
    ApplyServer {
        /// The entity to overwrite.
        entity_id: String,
        /// The authority's copy. A `None` value means the entity is gone.
        current: CurrentSnapshot,
    },
    /// Send this rebased write instead.
    Retry(WriteIntent),
    /// Drop the write and report the conflict as an error.
    Reject(Conflict),
    /// Leave local state alone and hand the conflict to the caller.
    Manual(Conflict),
}

/// Decides how a `CONFLICT` reject is handled under `strategy`.
///
/// Used uniformly by outbox replay and by callers that handle rejects
/// themselves. Rejects that are not conflicts, or that lack the snapshot a
/// strategy needs, are decided as `Reject`.
pub fn resolve_conflict(
    strategy: ConflictStrategy,
    intent: &WriteIntent,
    reject: &WriteReject,
) -> ConflictDecision {
    let conflict = Conflict::new(intent.clone(), reject);
    if !reject.error.is_conflict() {
        return ConflictDecision::Reject(conflict);
    }

    match strategy {
        ConflictStrategy::ServerWins => match (intent.entity_id(), &reject.current) {
            (Some(entity_id), Some(current)) => ConflictDecision::ApplyServer {
                entity_id: entity_id.to_string(),
                current: current.clone(),
            },
            _ => ConflictDecision::Reject(conflict),
        },
        ConflictStrategy::ClientWins => {
            match reject.current.as_ref().and_then(|c| c.version) {
                Some(version) => ConflictDecision::Retry(rebase(intent, version)),
                None => ConflictDecision::Reject(conflict),
            }
        }
        ConflictStrategy::Reject => ConflictDecision::Reject(conflict),
        ConflictStrategy::Manual => ConflictDecision::Manual(conflict),
    }
}

/// Rebases `intent` onto `version` under a fresh idempotency key.
fn rebase(intent: &WriteIntent, version: i64) -> WriteIntent {
    let mut rebased = intent.clone();
    if rebased.action == WriteAction::Create {
        // the id is taken on the authority: overwrite it instead
        rebased.action = WriteAction::Upsert;
        rebased.options.replace = true;
    }
    rebased.item.base_version = Some(version);
    rebased.item.meta.idempotency_key =
        format!("{}:rebase:{version}", intent.item.meta.idempotency_key);
    rebased
}
