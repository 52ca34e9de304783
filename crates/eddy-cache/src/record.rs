//! Normalized entity records.
//!
//! A record is the flattened JSON object for one entity after decomposition:
//! embedded entities have been replaced by their ids. Records are immutable
//! once stored; an update produces a new record via [`Record::merge`], so a
//! snapshot taken before an update never observes the update.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{CacheError, EntityKey, EntityKind, Snowflake};

/// One normalized entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    kind: EntityKind,
    #[serde(skip)]
    key: EntityKey,
    fields: Map<String, Value>,
}

impl Record {
    /// Build a record from normalized fields.
    pub fn new(kind: EntityKind, key: EntityKey, fields: Map<String, Value>) -> Self {
        Self { kind, key, fields }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// The entity's own id.
    pub fn id(&self) -> Snowflake {
        self.key.id()
    }

    /// The owning guild, for guild-scoped records.
    pub fn guild_id(&self) -> Option<Snowflake> {
        self.key
            .guild_id()
            .or_else(|| self.relation_id("guild_id"))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.fields.get(field).and_then(Value::as_u64)
    }

    /// A single-id relation field, e.g. `owner_id`.
    pub fn relation_id(&self, field: &str) -> Option<Snowflake> {
        self.fields.get(field).and_then(Snowflake::from_value)
    }

    /// A multi-id relation field, e.g. `channel_ids`. Unparseable entries
    /// are skipped.
    pub fn relation_ids(&self, field: &str) -> Vec<Snowflake> {
        self.fields
            .get(field)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Snowflake::from_value).collect())
            .unwrap_or_default()
    }

    /// Produce the record that results from applying `update` on top of this
    /// one. Fields absent from `update` keep their current value.
    pub fn merge(&self, update: Map<String, Value>) -> Record {
        let mut fields = self.fields.clone();
        merge_into(&mut fields, update);
        Record {
            kind: self.kind,
            key: self.key,
            fields,
        }
    }

    /// Deserialize into a typed model.
    pub fn to_model<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// The record's fields as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Merge `update` into `target`: nested objects merge recursively, every
/// other value (scalars, arrays, null) replaces.
pub(crate) fn merge_into(target: &mut Map<String, Value>, update: Map<String, Value>) {
    for (key, value) in update {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn guild(fields: Value) -> Record {
        Record::new(
            EntityKind::Guild,
            EntityKey::Global(Snowflake::new(42)),
            obj(fields),
        )
    }

    #[test]
    fn test_merge_preserves_absent_fields() {
        let before = guild(json!({"id": "42", "name": "Old", "icon": "abc"}));
        let after = before.merge(obj(json!({"name": "New"})));

        assert_eq!(after.get_str("name"), Some("New"));
        assert_eq!(after.get_str("icon"), Some("abc"));
        // The old record is untouched.
        assert_eq!(before.get_str("name"), Some("Old"));
    }

    #[test]
    fn test_merge_nested_objects() {
        let before = guild(json!({"welcome_screen": {"description": "hi", "channels": [1]}}));
        let after = before.merge(obj(json!({"welcome_screen": {"channels": [2, 3]}})));

        assert_eq!(
            after.get("welcome_screen"),
            Some(&json!({"description": "hi", "channels": [2, 3]}))
        );
    }

    #[test]
    fn test_merge_explicit_null_replaces() {
        let before = guild(json!({"icon": "abc"}));
        let after = before.merge(obj(json!({"icon": null})));
        assert_eq!(after.get("icon"), Some(&Value::Null));
    }

    #[test]
    fn test_relation_accessors() {
        let record = guild(json!({
            "owner_id": 7,
            "channel_ids": ["100", "101", "bogus"],
        }));
        assert_eq!(record.relation_id("owner_id"), Some(Snowflake::new(7)));
        assert_eq!(
            record.relation_ids("channel_ids"),
            vec![Snowflake::new(100), Snowflake::new(101)]
        );
        assert!(record.relation_ids("role_ids").is_empty());
    }
}
