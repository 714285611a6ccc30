//! Write intents.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of write sent to the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    /// Entity is created. Without an entity id the authority assigns one.
    Create,
    /// Entity fields are updated under a version precondition.
    Update,
    /// Entity is created or replaced, optionally under a precondition.
    Upsert,
    /// Entity is deleted under a version precondition.
    Delete,
}

impl WriteAction {
    /// Returns the lowercase action name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Upsert => "upsert",
            WriteAction::Delete => "delete",
        }
    }

    /// Returns true if the action needs a positive `base_version`.
    pub fn requires_base_version(&self) -> bool {
        matches!(self, WriteAction::Update | WriteAction::Delete)
    }
}

/// Options that change how the authority applies a write.
///
/// Items are only batched together when their action and options match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Delete marks the entity instead of erasing it.
    #[serde(default)]
    pub soft_delete: bool,
    /// Upsert replaces the stored value instead of merging fields.
    #[serde(default)]
    pub replace: bool,
}

/// Idempotency metadata attached to every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMeta {
    /// Key the authority uses to recognise a replayed write.
    pub idempotency_key: String,
    /// Client wall-clock time when the write was issued.
    pub client_time_ms: i64,
}

impl WriteMeta {
    /// Creates write metadata.
    pub fn new(idempotency_key: impl Into<String>, client_time_ms: i64) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            client_time_ms,
        }
    }
}

/// A single protocol-neutral write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteItem {
    /// Target entity. `None` only for server-assigned creates.
    pub entity_id: Option<String>,
    /// Optimistic-concurrency precondition.
    pub base_version: Option<i64>,
    /// Value to write (full entity or changed fields).
    pub value: Option<Value>,
    /// Idempotency metadata.
    pub meta: WriteMeta,
}

/// A write item bound to its collection and action.
///
/// This is the unit the outbox stores and replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteIntent {
    /// Target collection.
    pub collection: String,
    /// Write action.
    pub action: WriteAction,
    /// Write options.
    #[serde(default)]
    pub options: WriteOptions,
    /// The item itself.
    pub item: WriteItem,
}

impl WriteIntent {
    /// Creates a write intent.
    pub fn new(
        collection: impl Into<String>,
        action: WriteAction,
        options: WriteOptions,
        item: WriteItem,
    ) -> Self {
        Self {
            collection: collection.into(),
            action,
            options,
            item,
        }
    }

    /// Returns the target entity id, if known.
    pub fn entity_id(&self) -> Option<&str> {
        self.item.entity_id.as_deref()
    }

    /// Returns the idempotency key.
    pub fn idempotency_key(&self) -> &str {
        &self.item.meta.idempotency_key
    }

    /// Returns true if the authority must assign the entity id.
    pub fn is_server_assigned_create(&self) -> bool {
        self.action == WriteAction::Create && self.item.entity_id.is_none()
    }

    /// Checks the version and identity preconditions of this intent.
    ///
    /// `queued` is true when the intent is destined for a durable replay
    /// queue, where server-assigned creates are not allowed.
    pub fn validate(&self, queued: bool) -> ProtocolResult<()> {
        match self.action {
            WriteAction::Create => {
                if self.item.entity_id.is_none() {
                    if self.item.base_version.is_some() {
                        return Err(ProtocolError::UnexpectedBaseVersion);
                    }
                    if queued {
                        return Err(ProtocolError::UnreplayableCreate {
                            collection: self.collection.clone(),
                        });
                    }
                }
            }
            WriteAction::Upsert => {
                if self.item.entity_id.is_none() {
                    return Err(ProtocolError::MissingEntityId {
                        action: self.action.as_str().into(),
                    });
                }
            }
            WriteAction::Update | WriteAction::Delete => {
                let entity_id =
                    self.item
                        .entity_id
                        .as_ref()
                        .ok_or_else(|| ProtocolError::MissingEntityId {
                            action: self.action.as_str().into(),
                        })?;
                if !matches!(self.item.base_version, Some(v) if v > 0) {
                    return Err(ProtocolError::MissingBaseVersion {
                        action: self.action.as_str().into(),
                        entity_id: entity_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(action: WriteAction, entity_id: Option<&str>, base: Option<i64>) -> WriteIntent {
        WriteIntent::new(
            "todos",
            action,
            WriteOptions::default(),
            WriteItem {
                entity_id: entity_id.map(String::from),
                base_version: base,
                value: Some(json!({"title": "a"})),
                meta: WriteMeta::new("k1", 1),
            },
        )
    }

    #[test]
    fn update_and_delete_need_positive_version() {
        for action in [WriteAction::Update, WriteAction::Delete] {
            assert!(matches!(
                intent(action, Some("t1"), None).validate(false),
                Err(ProtocolError::MissingBaseVersion { .. })
            ));
            assert!(intent(action, Some("t1"), Some(0)).validate(false).is_err());
            assert!(intent(action, Some("t1"), Some(-3)).validate(false).is_err());
            assert!(intent(action, Some("t1"), Some(2)).validate(true).is_ok());
        }
    }

    #[test]
    fn upsert_version_is_optional() {
        assert!(intent(WriteAction::Upsert, Some("t1"), None).validate(true).is_ok());
        assert!(intent(WriteAction::Upsert, Some("t1"), Some(4)).validate(true).is_ok());
        assert!(intent(WriteAction::Upsert, None, None).validate(false).is_err());
    }

    #[test]
    fn server_assigned_create_rules() {
        let create = intent(WriteAction::Create, None, None);
        assert!(create.is_server_assigned_create());
        assert!(create.validate(false).is_ok());
        assert!(matches!(
            create.validate(true),
            Err(ProtocolError::UnreplayableCreate { .. })
        ));
        assert_eq!(
            intent(WriteAction::Create, None, Some(1)).validate(false),
            Err(ProtocolError::UnexpectedBaseVersion)
        );

        let client_create = intent(WriteAction::Create, Some("tmp_1"), None);
        assert!(!client_create.is_server_assigned_create());
        assert!(client_create.validate(true).is_ok());
    }

    #[test]
    fn action_names() {
        assert_eq!(WriteAction::Create.as_str(), "create");
        assert_eq!(WriteAction::Delete.as_str(), "delete");
        assert!(!WriteAction::Upsert.requires_base_version());
    }
}
