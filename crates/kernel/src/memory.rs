use crate::clock::{Clock, SystemClock};
use crate::model::{AssociationDef, FieldKind, Removal, Schema};
use crate::record::Record;
use crate::store::{EntityStore, SnapshotStore, StoreError, Transactional};
use chrono::{DateTime, Utc};
use revisionable_common::{AssociationKind, Identity, KeyPart, Snapshot, SnapshotDraft, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Row {
    /// Concrete type of the stored record.
    entity_type: String,
    values: BTreeMap<String, Value>,
}

type MemberKey = (String, Identity, String);
type SnapshotKey = (String, Identity);

#[derive(Debug, Clone, Default)]
struct Tables {
    /// Rows per base type, keyed by identity.
    rows: BTreeMap<String, BTreeMap<Identity, Row>>,
    /// Membership lists keyed by (owner base type, owner id, association).
    members: BTreeMap<MemberKey, Vec<Identity>>,
    snapshots: BTreeMap<SnapshotKey, BTreeMap<u64, Snapshot>>,
}

/// Reference substrate holding everything in ordered maps.
///
/// Subtypes share their base type's table. Transactions are savepoints: each
/// `begin` clones the tables and `rollback` restores the clone. A store built
/// with [`MemoryStore::non_transactional`] tracks nesting but never discards
/// writes.
#[derive(Debug)]
pub struct MemoryStore {
    schema: Schema,
    tables: Tables,
    savepoints: Vec<Option<Tables>>,
    transactional: bool,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            tables: Tables::default(),
            savepoints: Vec::new(),
            transactional: true,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn non_transactional(schema: Schema) -> Self {
        Self {
            transactional: false,
            ..Self::new(schema)
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Stored rows of `entity_type` and its subtypes.
    pub fn count(&self, entity_type: &str) -> usize {
        let Ok(base) = self.schema.base_type(entity_type) else {
            return 0;
        };
        self.tables.rows.get(base).map_or(0, |table| {
            table
                .values()
                .filter(|row| self.schema.is_a(&row.entity_type, entity_type))
                .count()
        })
    }

    /// Snapshots held for one entity.
    pub fn snapshot_count(&self, entity_type: &str, id: &Identity) -> usize {
        self.tables
            .snapshots
            .get(&(entity_type.to_owned(), id.clone()))
            .map_or(0, BTreeMap::len)
    }

    pub fn transaction_depth(&self) -> usize {
        self.savepoints.len()
    }

    fn base(&self, entity_type: &str) -> Result<String, StoreError> {
        self.schema.base_type(entity_type).map(str::to_owned)
    }

    fn association(&self, owner: &Record, name: &str) -> Result<AssociationDef, StoreError> {
        owner
            .model()
            .association_def(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownAssociation {
                entity_type: owner.entity_type().to_owned(),
                association: name.to_owned(),
            })
    }

    fn require_kind(
        owner: &Record,
        def: &AssociationDef,
        kind: AssociationKind,
        operation: &'static str,
    ) -> Result<(), StoreError> {
        if def.kind == kind {
            Ok(())
        } else {
            Err(StoreError::WrongAssociationKind {
                entity_type: owner.entity_type().to_owned(),
                association: def.name.clone(),
                operation,
            })
        }
    }

    fn hydrate(&self, row: &Row) -> Result<Record, StoreError> {
        let model = self.schema.model(&row.entity_type)?;
        Ok(Record::hydrate(model, row.values.clone()))
    }

    fn next_id(&self, base: &str) -> i64 {
        self.tables
            .rows
            .get(base)
            .and_then(|table| {
                table
                    .keys()
                    .filter_map(|id| match id {
                        Identity::Single(KeyPart::Int(n)) => Some(*n),
                        _ => None,
                    })
                    .max()
            })
            .map_or(1, |max| max + 1)
    }

    fn validate(record: &mut Record) -> bool {
        record.errors_mut().clear();
        let blank: Vec<String> = record
            .model()
            .fields()
            .iter()
            .filter(|def| !def.nullable && record.get(&def.name).is_none_or(Value::is_null))
            .map(|def| def.name.clone())
            .collect();
        for field in blank {
            record.errors_mut().add(field, "can't be blank");
        }
        record.errors().is_empty()
    }

    fn insert(&mut self, base: &str, record: &mut Record) -> Result<(), StoreError> {
        let model = Arc::clone(record.model());
        if record.identity().is_none() {
            match model.primary_key() {
                [column] if model.field_def(column).is_some_and(|def| def.kind == FieldKind::Int) => {
                    let next = self.next_id(base);
                    record.write(column, next)?;
                }
                _ => {
                    return Err(StoreError::MissingIdentity {
                        entity_type: record.entity_type().to_owned(),
                    });
                }
            }
        }
        let id = record.identity().ok_or_else(|| StoreError::MissingIdentity {
            entity_type: record.entity_type().to_owned(),
        })?;
        let table = self.tables.rows.entry(base.to_owned()).or_default();
        if table.contains_key(&id) {
            return Err(StoreError::DuplicateKey {
                entity_type: record.entity_type().to_owned(),
                id: id.to_string(),
            });
        }
        table.insert(id, row_of(record));
        Ok(())
    }

    fn update(&mut self, base: &str, record: &Record) -> Result<(), StoreError> {
        let missing = || StoreError::MissingIdentity {
            entity_type: record.entity_type().to_owned(),
        };
        let target = record.update_target().ok_or_else(missing)?;
        let id = record.identity().ok_or_else(missing)?;
        let table = self.tables.rows.entry(base.to_owned()).or_default();
        if !table.contains_key(&target) {
            return Err(StoreError::RecordNotFound {
                entity_type: record.entity_type().to_owned(),
                id: target.to_string(),
            });
        }
        if id != target {
            if table.contains_key(&id) {
                return Err(StoreError::DuplicateKey {
                    entity_type: record.entity_type().to_owned(),
                    id: id.to_string(),
                });
            }
            table.remove(&target);
            self.rekey_members(base, &target, &id);
        }
        self.tables
            .rows
            .entry(base.to_owned())
            .or_default()
            .insert(id, row_of(record));
        Ok(())
    }

    fn rekey_members(&mut self, base: &str, from: &Identity, to: &Identity) {
        let moved: Vec<MemberKey> = self
            .tables
            .members
            .keys()
            .filter(|(owner_type, owner_id, _)| owner_type == base && owner_id == from)
            .cloned()
            .collect();
        for key in moved {
            if let Some(list) = self.tables.members.remove(&key) {
                self.tables.members.insert((key.0, to.clone(), key.2), list);
            }
        }
    }
}

fn row_of(record: &Record) -> Row {
    Row {
        entity_type: record.entity_type().to_owned(),
        values: record.values().map(|(k, v)| (k.to_owned(), v.clone())).collect(),
    }
}

impl EntityStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn exists(&self, entity_type: &str, id: &Identity) -> Result<bool, StoreError> {
        let base = self.base(entity_type)?;
        Ok(self
            .tables
            .rows
            .get(&base)
            .and_then(|table| table.get(id))
            .is_some_and(|row| self.schema.is_a(&row.entity_type, entity_type)))
    }

    fn fetch(&self, entity_type: &str, id: &Identity) -> Result<Option<Record>, StoreError> {
        let base = self.base(entity_type)?;
        match self.tables.rows.get(&base).and_then(|table| table.get(id)) {
            Some(row) if self.schema.is_a(&row.entity_type, entity_type) => self.hydrate(row).map(Some),
            _ => Ok(None),
        }
    }

    fn children(&self, owner: &Record, association: &str) -> Result<Vec<Record>, StoreError> {
        let def = self.association(owner, association)?;
        if def.kind == AssociationKind::ToManyThrough {
            let mut records = Vec::new();
            for id in self.members(owner, association)? {
                if let Some(record) = self.fetch(&def.target, &id)? {
                    records.push(record);
                }
            }
            return Ok(records);
        }
        let Some(owner_id) = owner.identity() else {
            return Ok(Vec::new());
        };
        let base = self.base(&def.target)?;
        let Some(table) = self.tables.rows.get(&base) else {
            return Ok(Vec::new());
        };
        let wanted: Vec<(&String, Value)> = def
            .foreign_key
            .iter()
            .zip(owner_id.parts().iter().cloned().map(Value::from))
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for row in table.values() {
            let matches = self.schema.is_a(&row.entity_type, &def.target)
                && wanted.iter().all(|(col, value)| row.values.get(*col) == Some(value));
            if matches {
                records.push(self.hydrate(row)?);
                if def.kind == AssociationKind::ToOne {
                    break;
                }
            }
        }
        Ok(records)
    }

    fn members(&self, owner: &Record, association: &str) -> Result<Vec<Identity>, StoreError> {
        let def = self.association(owner, association)?;
        Self::require_kind(owner, &def, AssociationKind::ToManyThrough, "membership")?;
        let Some(owner_id) = owner.identity() else {
            return Ok(Vec::new());
        };
        let key = (self.base(owner.entity_type())?, owner_id, def.name);
        Ok(self.tables.members.get(&key).cloned().unwrap_or_default())
    }

    fn save(&mut self, record: &mut Record) -> Result<bool, StoreError> {
        if record.is_destroyed() {
            return Err(StoreError::RecordDestroyed {
                entity_type: record.entity_type().to_owned(),
                id: record.identity().map(|id| id.to_string()).unwrap_or_default(),
            });
        }
        if !Self::validate(record) {
            tracing::debug!(entity_type = record.entity_type(), errors = record.errors().len(), "save rejected");
            return Ok(false);
        }
        let base = self.base(record.entity_type())?;
        if record.is_new() {
            self.insert(&base, record)?;
            record.mark_persisted();
        } else {
            self.update(&base, record)?;
        }
        record.clear_changes();
        Ok(true)
    }

    fn destroy(&mut self, record: &mut Record) -> Result<bool, StoreError> {
        let base = self.base(record.entity_type())?;
        let Some(id) = record.update_target() else {
            return Ok(false);
        };
        let removed = self
            .tables
            .rows
            .get_mut(&base)
            .and_then(|table| table.remove(&id))
            .is_some();
        if removed {
            self.tables
                .members
                .retain(|(owner_type, owner_id, _), _| !(owner_type == &base && owner_id == &id));
            record.mark_destroyed();
        }
        Ok(removed)
    }

    fn replace_members(
        &mut self,
        owner: &Record,
        association: &str,
        members: &[Identity],
    ) -> Result<(), StoreError> {
        let def = self.association(owner, association)?;
        Self::require_kind(owner, &def, AssociationKind::ToManyThrough, "membership")?;
        let owner_id = owner.identity().ok_or_else(|| StoreError::MissingIdentity {
            entity_type: owner.entity_type().to_owned(),
        })?;
        let key = (self.base(owner.entity_type())?, owner_id, def.name);
        if members.is_empty() {
            self.tables.members.remove(&key);
        } else {
            self.tables.members.insert(key, members.to_vec());
        }
        Ok(())
    }

    fn detach(&mut self, owner: &Record, association: &str, child: &mut Record) -> Result<(), StoreError> {
        let def = self.association(owner, association)?;
        Self::require_kind(owner, &def, AssociationKind::ToMany, "detach")?;
        match def.removal {
            Removal::Delete => {
                self.destroy(child)?;
            }
            Removal::Nullify => {
                let Some(id) = child.update_target() else {
                    return Ok(());
                };
                let base = self.base(child.entity_type())?;
                if let Some(row) = self.tables.rows.get_mut(&base).and_then(|table| table.get_mut(&id)) {
                    for column in &def.foreign_key {
                        row.values.insert(column.clone(), Value::Null);
                    }
                }
                for column in &def.foreign_key {
                    child.write(column, Value::Null)?;
                }
            }
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn insert_snapshot(&mut self, draft: SnapshotDraft) -> Result<Snapshot, StoreError> {
        let now = self.clock.now();
        let revisions = self
            .tables
            .snapshots
            .entry((draft.entity_type.clone(), draft.entity_id.clone()))
            .or_default();
        let revision = revisions.keys().next_back().map_or(1, |max| max + 1);
        if revisions.contains_key(&revision) {
            return Err(StoreError::DuplicateRevision {
                entity_type: draft.entity_type,
                id: draft.entity_id.to_string(),
                revision,
            });
        }
        let snapshot = draft.into_snapshot(revision, now);
        revisions.insert(revision, snapshot.clone());
        Ok(snapshot)
    }

    fn find_snapshot(
        &self,
        entity_type: &str,
        id: &Identity,
        revision: u64,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .tables
            .snapshots
            .get(&(entity_type.to_owned(), id.clone()))
            .and_then(|revisions| revisions.get(&revision))
            .cloned())
    }

    fn latest_snapshot(&self, entity_type: &str, id: &Identity) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .tables
            .snapshots
            .get(&(entity_type.to_owned(), id.clone()))
            .and_then(|revisions| revisions.values().next_back())
            .cloned())
    }

    fn snapshots_for(&self, entity_type: &str, id: &Identity) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self
            .tables
            .snapshots
            .get(&(entity_type.to_owned(), id.clone()))
            .map(|revisions| revisions.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_snapshots_through(
        &mut self,
        entity_type: &str,
        id: &Identity,
        through: u64,
    ) -> Result<usize, StoreError> {
        let key = (entity_type.to_owned(), id.clone());
        let Some(revisions) = self.tables.snapshots.get_mut(&key) else {
            return Ok(0);
        };
        let before = revisions.len();
        revisions.retain(|revision, _| *revision > through);
        let removed = before - revisions.len();
        if revisions.is_empty() {
            self.tables.snapshots.remove(&key);
        }
        Ok(removed)
    }

    fn delete_snapshot(&mut self, entity_type: &str, id: &Identity, revision: u64) -> Result<bool, StoreError> {
        let key = (entity_type.to_owned(), id.clone());
        let Some(revisions) = self.tables.snapshots.get_mut(&key) else {
            return Ok(false);
        };
        let removed = revisions.remove(&revision).is_some();
        if revisions.is_empty() {
            self.tables.snapshots.remove(&key);
        }
        Ok(removed)
    }

    fn mark_trash(&mut self, entity_type: &str, id: &Identity, revision: u64) -> Result<(), StoreError> {
        let snapshot = self
            .tables
            .snapshots
            .get_mut(&(entity_type.to_owned(), id.clone()))
            .and_then(|revisions| revisions.get_mut(&revision))
            .ok_or_else(|| StoreError::SnapshotNotFound {
                entity_type: entity_type.to_owned(),
                id: id.to_string(),
                revision,
            })?;
        snapshot.trash = true;
        Ok(())
    }

    fn delete_trashed(&mut self, entity_type: &str, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let doomed: Vec<SnapshotKey> = self
            .tables
            .snapshots
            .iter()
            .filter(|((ty, _), revisions)| {
                ty == entity_type && revisions.values().any(|s| s.trash && s.created_at <= cutoff)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in doomed {
            removed += self.tables.snapshots.remove(&key).map_or(0, |revisions| revisions.len());
        }
        Ok(removed)
    }
}

impl Transactional for MemoryStore {
    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        let savepoint = self.transactional.then(|| self.tables.clone());
        self.savepoints.push(savepoint);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.savepoints.pop().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tables) = self.savepoints.pop().ok_or(StoreError::NoTransaction)? {
            self.tables = tables;
        }
        Ok(())
    }
}
