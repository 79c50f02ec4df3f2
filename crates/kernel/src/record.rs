use crate::model::{EntityModel, FieldKind};
use revisionable_common::{Identity, KeyPart, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-field assignment failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    #[error("{entity_type} has no field `{field}`")]
    Unknown { entity_type: String, field: String },
    #[error("field `{field}` of {entity_type} is read-only")]
    ReadOnly { entity_type: String, field: String },
    #[error("field `{field}` expects {expected:?}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },
}

/// Lifecycle of an in-memory record relative to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    New,
    Persisted,
    Destroyed,
}

/// Validation and restoration messages keyed by field or association name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Errors {
    entries: BTreeMap<String, Vec<String>>,
}

impl Errors {
    pub fn add(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.entries.entry(name.into()).or_default().push(message.into());
    }

    /// Messages recorded against `name`.
    pub fn on(&self, name: &str) -> &[String] {
        self.entries.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of messages.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(name, msgs)| msgs.iter().map(move |m| (name.as_str(), m.as_str())))
    }

    /// `"<name> <message>"` for every message.
    pub fn full_messages(&self) -> Vec<String> {
        self.iter().map(|(name, msg)| format!("{name} {msg}")).collect()
    }
}

/// In-memory target of an association, held on the owning record.
#[derive(Debug, Clone)]
pub enum Loaded {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
    Members(Vec<Identity>),
}

/// A mutable entity held in memory.
///
/// Tracks the original value of every changed field so stores can address
/// the persisted row, and holds association targets that have been loaded
/// or assigned in memory.
#[derive(Debug, Clone)]
pub struct Record {
    model: Arc<EntityModel>,
    values: BTreeMap<String, Value>,
    changes: BTreeMap<String, Value>,
    loaded: BTreeMap<String, Loaded>,
    errors: Errors,
    state: RecordState,
}

impl Record {
    /// A fresh, unsaved record. Subtypes get their discriminator written.
    pub fn new(model: Arc<EntityModel>) -> Self {
        let values = model
            .fields()
            .iter()
            .map(|f| (f.name.clone(), Value::Null))
            .collect();
        let mut record = Self {
            model,
            values,
            changes: BTreeMap::new(),
            loaded: BTreeMap::new(),
            errors: Errors::default(),
            state: RecordState::New,
        };
        if record.model.parent().is_some() {
            if let Some(column) = record.model.inheritance_column_name().map(str::to_owned) {
                let discriminator = Value::Text(record.model.discriminator().to_owned());
                record.track(&column, discriminator);
            }
        }
        record
    }

    /// A record loaded from storage: persisted, with no pending changes.
    pub fn hydrate(model: Arc<EntityModel>, stored: BTreeMap<String, Value>) -> Self {
        let mut values: BTreeMap<String, Value> = model
            .fields()
            .iter()
            .map(|f| (f.name.clone(), Value::Null))
            .collect();
        values.extend(stored);
        Self {
            model,
            values,
            changes: BTreeMap::new(),
            loaded: BTreeMap::new(),
            errors: Errors::default(),
            state: RecordState::Persisted,
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    pub fn entity_type(&self) -> &str {
        self.model.name()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Public assignment: the field must exist, be writable and accept the value.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), FieldError> {
        let def = self.checked_def(field)?;
        if def.read_only {
            return Err(FieldError::ReadOnly {
                entity_type: self.entity_type().to_owned(),
                field: field.to_owned(),
            });
        }
        self.write_checked(field, value.into())
    }

    /// Internal write that bypasses the read-only guard.
    pub fn write(&mut self, field: &str, value: impl Into<Value>) -> Result<(), FieldError> {
        self.checked_def(field)?;
        self.write_checked(field, value.into())
    }

    /// Assign several fields through public assignment, stopping at the first failure.
    pub fn assign<I, K, V>(&mut self, pairs: I) -> Result<(), FieldError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (field, value) in pairs {
            self.set(field.as_ref(), value)?;
        }
        Ok(())
    }

    fn checked_def(&self, field: &str) -> Result<&crate::model::FieldDef, FieldError> {
        self.model.field_def(field).ok_or_else(|| FieldError::Unknown {
            entity_type: self.entity_type().to_owned(),
            field: field.to_owned(),
        })
    }

    fn write_checked(&mut self, field: &str, value: Value) -> Result<(), FieldError> {
        let kind = self.checked_def(field)?.kind;
        if !kind.accepts(&value) {
            return Err(FieldError::TypeMismatch {
                field: field.to_owned(),
                expected: kind,
                found: value.kind_name(),
            });
        }
        self.track(field, value);
        Ok(())
    }

    fn track(&mut self, field: &str, value: Value) {
        let old = self
            .values
            .insert(field.to_owned(), value.clone())
            .unwrap_or_default();
        match self.changes.get(field).cloned() {
            Some(original) => {
                if original == value {
                    self.changes.remove(field);
                }
            }
            None => {
                if old != value {
                    self.changes.insert(field.to_owned(), old);
                }
            }
        }
    }

    /// Current identity; `None` while any key column is null.
    pub fn identity(&self) -> Option<Identity> {
        let parts = self
            .model
            .primary_key()
            .iter()
            .map(|col| self.values.get(col).and_then(KeyPart::from_value))
            .collect::<Option<Vec<_>>>()?;
        Identity::from_parts(parts)
    }

    /// Identity of the persisted row an update should address.
    ///
    /// Single keys are addressed by their current value. Composite keys are
    /// addressed by the original value of every changed key column, so a
    /// record rebuilt in memory (key columns changed from null) addresses no
    /// row until [`Record::mark_identity_clean`] has been applied.
    pub fn update_target(&self) -> Option<Identity> {
        if !self.model.has_composite_key() {
            return self.identity();
        }
        let parts = self
            .model
            .primary_key()
            .iter()
            .map(|col| {
                let value = self.changes.get(col).or_else(|| self.values.get(col))?;
                KeyPart::from_value(value)
            })
            .collect::<Option<Vec<_>>>()?;
        Identity::from_parts(parts)
    }

    /// Treat the current key values as the persisted ones.
    ///
    /// All-or-nothing: when any key column is null nothing is cleared and
    /// `false` is returned.
    pub fn mark_identity_clean(&mut self) -> bool {
        let key = self.model.primary_key().to_vec();
        if key.iter().any(|col| self.values.get(col).is_none_or(Value::is_null)) {
            return false;
        }
        for col in &key {
            self.changes.remove(col);
        }
        true
    }

    pub fn is_changed(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Changed fields with their original values.
    pub fn changes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == RecordState::New
    }

    pub fn is_persisted(&self) -> bool {
        self.state == RecordState::Persisted
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == RecordState::Destroyed
    }

    pub fn mark_persisted(&mut self) {
        self.state = RecordState::Persisted;
    }

    pub fn mark_destroyed(&mut self) {
        self.state = RecordState::Destroyed;
    }

    pub fn errors(&self) -> &Errors {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut Errors {
        &mut self.errors
    }

    pub fn loaded(&self, association: &str) -> Option<&Loaded> {
        self.loaded.get(association)
    }

    pub fn set_loaded(&mut self, association: &str, target: Loaded) {
        self.loaded.insert(association.to_owned(), target);
    }

    pub fn take_loaded(&mut self, association: &str) -> Option<Loaded> {
        self.loaded.remove(association)
    }

    pub fn loaded_mut(&mut self, association: &str) -> Option<&mut Loaded> {
        self.loaded.get_mut(association)
    }

    /// In-memory children of a to-many association.
    pub fn children(&self, association: &str) -> Option<&[Record]> {
        match self.loaded.get(association) {
            Some(Loaded::Many(children)) => Some(children),
            _ => None,
        }
    }

    /// In-memory target of a to-one association.
    pub fn one(&self, association: &str) -> Option<&Record> {
        match self.loaded.get(association) {
            Some(Loaded::One(Some(child))) => Some(child),
            _ => None,
        }
    }

    /// In-memory membership of a to-many-through association.
    pub fn members(&self, association: &str) -> Option<&[Identity]> {
        match self.loaded.get(association) {
            Some(Loaded::Members(ids)) => Some(ids),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldKind, Schema};

    fn schema() -> Schema {
        Schema::new()
            .with(
                EntityModel::new("Attachment")
                    .composite_key(&[("post_id", FieldKind::Int), ("slot", FieldKind::Int)])
                    .field("name", FieldKind::Text)
                    .read_only("secret", FieldKind::Int),
            )
            .unwrap()
            .with(EntityModel::new("Post").key("id", FieldKind::Int).field("title", FieldKind::Text))
            .unwrap()
    }

    #[test]
    fn set_validates_field() {
        let mut rec = schema().new_record("Attachment").unwrap();
        assert!(rec.set("name", "a").is_ok());
        assert!(matches!(rec.set("missing", 1), Err(FieldError::Unknown { .. })));
        assert!(matches!(rec.set("secret", 1), Err(FieldError::ReadOnly { .. })));
        assert!(matches!(rec.set("name", 5), Err(FieldError::TypeMismatch { .. })));
        assert!(rec.write("secret", 9).is_ok());
        assert_eq!(rec.get("secret"), Some(&Value::Int(9)));
    }

    #[test]
    fn changes_track_original_values() {
        let schema = schema();
        let model = schema.model("Post").unwrap();
        let stored = BTreeMap::from([("id".to_owned(), Value::Int(1)), ("title".to_owned(), Value::from("a"))]);
        let mut rec = Record::hydrate(model, stored);
        assert!(!rec.has_changes());

        rec.set("title", "b").unwrap();
        rec.set("title", "c").unwrap();
        assert_eq!(rec.changes().collect::<Vec<_>>(), vec![("title", &Value::from("a"))]);

        rec.set("title", "a").unwrap();
        assert!(!rec.has_changes());
    }

    #[test]
    fn mark_identity_clean_when_all_key_values_set() {
        let mut rec = schema().new_record("Attachment").unwrap();
        rec.set("post_id", 123).unwrap();
        rec.set("slot", 456).unwrap();
        rec.set("name", "foobar").unwrap();
        assert_eq!(rec.update_target(), None);

        assert!(rec.mark_identity_clean());
        assert_eq!(rec.changes().map(|(k, _)| k).collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(rec.update_target(), Some(Identity::from((123, 456))));
    }

    #[test]
    fn mark_identity_clean_is_all_or_nothing() {
        let mut rec = schema().new_record("Attachment").unwrap();
        rec.set("post_id", 123).unwrap();
        rec.set("name", "foobar").unwrap();

        assert!(!rec.mark_identity_clean());
        let changed: Vec<&str> = rec.changes().map(|(k, _)| k).collect();
        assert_eq!(changed, vec!["name", "post_id"]);
        assert_eq!(rec.get("slot"), Some(&Value::Null));
    }

    #[test]
    fn single_key_update_target_is_current_identity() {
        let mut rec = schema().new_record("Post").unwrap();
        rec.set("id", 5).unwrap();
        assert_eq!(rec.update_target(), Some(Identity::from(5)));
    }

    #[test]
    fn errors_collect_messages() {
        let mut errors = Errors::default();
        errors.add("name", "can't be blank");
        errors.add("name", "is too short");
        errors.add("tags", "could not be restored");
        assert_eq!(errors.len(), 3);
        assert_eq!(errors.on("name").len(), 2);
        assert!(errors.on("other").is_empty());
        assert_eq!(errors.full_messages()[2], "tags could not be restored");
    }
}
