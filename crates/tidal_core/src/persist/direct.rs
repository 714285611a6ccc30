//! Direct persistence against a remote authority.

use super::{CreatedEntity, PersistResult, PersistStatus, Persister, VersionUpdate, Writeback};
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::operation::PersistMode;
use crate::plan::PlannedWrite;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tidal_protocol::{
    OpOutput, RemoteAuthority, RemoteError, RemoteOp, RemoteOpResult, TransportError,
    WriteAction, WriteIntent, WriteItemOutcome, WriteOptions, WriteReject,
};
use tracing::debug;

/// Groups intents into write operations sharing collection, action and
/// options, in order of first appearance.
///
/// Returns the operations and, per operation, the indices of the intents
/// it carries.
pub fn batch_writes(intents: &[&WriteIntent]) -> (Vec<RemoteOp>, Vec<Vec<usize>>) {
    let mut keys: Vec<(&str, WriteAction, WriteOptions)> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (index, intent) in intents.iter().enumerate() {
        let key = (intent.collection.as_str(), intent.action, intent.options);
        match keys.iter().position(|k| *k == key) {
            Some(group) => groups[group].push(index),
            None => {
                keys.push(key);
                groups.push(vec![index]);
            }
        }
    }

    let ops = keys
        .iter()
        .zip(&groups)
        .map(|((collection, action, options), members)| RemoteOp::Write {
            collection: collection.to_string(),
            action: *action,
            options: *options,
            items: members.iter().map(|&i| intents[i].item.clone()).collect(),
        })
        .collect();
    (ops, groups)
}

/// Maps per-operation results back to per-intent outcomes.
///
/// A failed operation rejects each of its items with the operation's error.
pub fn unbatch_outcomes(
    results: Vec<RemoteOpResult>,
    groups: &[Vec<usize>],
    count: usize,
) -> Result<Vec<WriteItemOutcome>, TransportError> {
    if results.len() != groups.len() {
        return Err(TransportError::fatal(format!(
            "authority returned {} results for {} operations",
            results.len(),
            groups.len()
        )));
    }

    let mut outcomes: Vec<Option<WriteItemOutcome>> = vec![None; count];
    for (result, members) in results.into_iter().zip(groups) {
        match result {
            Ok(OpOutput::Write { outcomes: items }) => {
                if items.len() != members.len() {
                    return Err(TransportError::fatal(format!(
                        "authority returned {} outcomes for {} items",
                        items.len(),
                        members.len()
                    )));
                }
                for (outcome, &index) in items.into_iter().zip(members) {
                    outcomes[index] = Some(outcome);
                }
            }
            Ok(_) => {
                return Err(TransportError::fatal("authority answered a write with a non-write output"))
            }
            Err(error) => {
                for &index in members {
                    outcomes[index] = Some(WriteItemOutcome::Err(WriteReject {
                        error: error.clone(),
                        current: None,
                    }));
                }
            }
        }
    }
    outcomes
        .into_iter()
        .map(|o| o.ok_or_else(|| TransportError::fatal("missing write outcome")))
        .collect()
}

/// Runs an authority call under an optional deadline.
pub(crate) async fn execute_with_timeout(
    authority: &dyn RemoteAuthority,
    ops: Vec<RemoteOp>,
    timeout: Option<Duration>,
) -> Result<Vec<RemoteOpResult>, TransportError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, authority.execute(ops))
            .await
            .map_err(|_| TransportError::retryable(format!("request timed out after {limit:?}")))?,
        None => authority.execute(ops).await,
    }
}

/// Executes writes against an authority and waits for the outcome.
///
/// Same-action, same-option items travel in one operation. Any rejected
/// item fails the whole segment.
#[derive(Clone)]
pub struct DirectPersister {
    authority: Arc<dyn RemoteAuthority>,
    timeout: Option<Duration>,
}

impl DirectPersister {
    /// Creates a persister for `authority`.
    pub fn new(authority: Arc<dyn RemoteAuthority>) -> Self {
        Self {
            authority,
            timeout: None,
        }
    }

    /// Bounds every authority call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for DirectPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectPersister")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Persister for DirectPersister {
    async fn persist(&self, collection: &str, writes: &[PlannedWrite]) -> CoreResult<PersistResult> {
        let mut result = PersistResult::empty(PersistMode::Direct, PersistStatus::Confirmed);
        if writes.is_empty() {
            return Ok(result);
        }

        let intents: Vec<&WriteIntent> = writes.iter().map(|w| &w.intent).collect();
        let (ops, groups) = batch_writes(&intents);
        debug!(collection, items = writes.len(), ops = ops.len(), "executing writes");

        let results = execute_with_timeout(self.authority.as_ref(), ops, self.timeout).await?;
        let outcomes = unbatch_outcomes(results, &groups, writes.len())?;

        let mut writeback = Writeback::default();
        for (write, outcome) in writes.iter().zip(outcomes) {
            let ack = match outcome {
                WriteItemOutcome::Ok(ack) => ack,
                WriteItemOutcome::Err(reject) => {
                    debug!(collection, entity_id = ?write.intent.entity_id(), error = %reject.error, "write rejected");
                    return Err(CoreError::persistence(reject.error, reject.current));
                }
            };

            if write.creates {
                let entity = created_entity(write, ack.entity_id, ack.version, ack.data)?;
                result.created.push(CreatedEntity {
                    op_index: write.op_index,
                    client_id: write.client_id.clone(),
                    entity,
                });
            } else if let Some(data) = ack.data {
                let mut entity = Entity::from_value(data)?;
                entity.set_id(ack.entity_id);
                writeback.upserts.push(entity);
            } else if !(write.intent.action == WriteAction::Delete && !write.intent.options.soft_delete) {
                writeback.version_updates.push(VersionUpdate {
                    key: ack.entity_id,
                    version: ack.version,
                });
            }
        }
        result.writeback = writeback;
        Ok(result)
    }
}

/// Builds the confirmed entity of a create.
///
/// Server-assigned creates need the authority's data; client-assigned ones
/// fall back to the submitted value.
fn created_entity(
    write: &PlannedWrite,
    entity_id: String,
    version: i64,
    data: Option<serde_json::Value>,
) -> CoreResult<Entity> {
    let mut entity = match (data, write.client_id.is_some()) {
        (Some(data), _) => Entity::from_value(data)?,
        (None, true) => match &write.intent.item.value {
            Some(value) => Entity::from_value(value.clone())?,
            None => Entity::new(),
        },
        (None, false) => {
            return Err(CoreError::persistence(
                RemoteError::new("MISSING_DATA", "server-assigned create returned no entity"),
                None,
            ))
        }
    };
    entity.set_id(entity_id);
    if entity.version().is_none() {
        entity.set_version(version);
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidal_protocol::{WriteItem, WriteMeta};

    fn intent(action: WriteAction, id: &str, soft: bool) -> WriteIntent {
        WriteIntent::new(
            "todos",
            action,
            WriteOptions {
                soft_delete: soft,
                replace: false,
            },
            WriteItem {
                entity_id: Some(id.into()),
                base_version: Some(1),
                value: None,
                meta: WriteMeta::new(id, 0),
            },
        )
    }

    #[test]
    fn batches_by_action_and_options() {
        let a = intent(WriteAction::Update, "a", false);
        let b = intent(WriteAction::Delete, "b", true);
        let c = intent(WriteAction::Update, "c", false);
        let d = intent(WriteAction::Delete, "d", false);
        let (ops, groups) = batch_writes(&[&a, &b, &c, &d]);
        assert_eq!(groups, vec![vec![0, 2], vec![1], vec![3]]);
        match &ops[0] {
            RemoteOp::Write { action, items, .. } => {
                assert_eq!(*action, WriteAction::Update);
                assert_eq!(items.len(), 2);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn operation_errors_reject_every_item() {
        let groups = vec![vec![1], vec![0, 2]];
        let results = vec![
            Ok(OpOutput::Write {
                outcomes: vec![WriteItemOutcome::ok("b", 2, None)],
            }),
            Err(RemoteError::new("FORBIDDEN", "no")),
        ];
        let outcomes = unbatch_outcomes(results, &groups, 3).unwrap();
        assert!(matches!(outcomes[1], WriteItemOutcome::Ok(_)));
        assert!(matches!(&outcomes[0], WriteItemOutcome::Err(r) if r.error.code == "FORBIDDEN"));
        assert!(matches!(outcomes[2], WriteItemOutcome::Err(_)));
    }

    #[test]
    fn outcome_count_mismatch_is_fatal() {
        let groups = vec![vec![0, 1]];
        let results = vec![Ok(OpOutput::Write {
            outcomes: vec![WriteItemOutcome::ok("a", 1, Some(json!({"id": "a"})))],
        })];
        let err = unbatch_outcomes(results, &groups, 2).unwrap_err();
        assert!(!err.retryable);
    }
}
