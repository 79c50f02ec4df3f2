use crate::model::Schema;
use crate::record::{FieldError, Record};
use chrono::{DateTime, Utc};
use revisionable_common::{Identity, Snapshot, SnapshotDraft};

/// Errors raised by a host substrate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),
    #[error("entity type `{0}` is already registered")]
    DuplicateEntityType(String),
    #[error("{entity_type} has no association `{association}`")]
    UnknownAssociation {
        entity_type: String,
        association: String,
    },
    #[error("association `{association}` of {entity_type} does not support {operation}")]
    WrongAssociationKind {
        entity_type: String,
        association: String,
        operation: &'static str,
    },
    #[error("{entity_type} {id} not found")]
    RecordNotFound { entity_type: String, id: String },
    #[error("{entity_type} record has no complete identity")]
    MissingIdentity { entity_type: String },
    #[error("{entity_type} {id} already exists")]
    DuplicateKey { entity_type: String, id: String },
    #[error("{entity_type} {id} has been destroyed")]
    RecordDestroyed { entity_type: String, id: String },
    #[error("revision {revision} already exists for {entity_type} {id}")]
    DuplicateRevision {
        entity_type: String,
        id: String,
        revision: u64,
    },
    #[error("revision {revision} of {entity_type} {id} not found")]
    SnapshotNotFound {
        entity_type: String,
        id: String,
        revision: u64,
    },
    #[error("no open transaction")]
    NoTransaction,
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Entity access: identity-based fetch, association reflection and
/// traversal, saving and deletion.
pub trait EntityStore {
    fn schema(&self) -> &Schema;

    fn exists(&self, entity_type: &str, id: &Identity) -> Result<bool, StoreError>;

    /// Fresh read of the persisted state of an entity.
    fn fetch(&self, entity_type: &str, id: &Identity) -> Result<Option<Record>, StoreError>;

    /// Persisted targets of a to-one or to-many association, in the store's
    /// default iteration order. For to-many-through, the member records.
    fn children(&self, owner: &Record, association: &str) -> Result<Vec<Record>, StoreError>;

    /// Persisted membership of a to-many-through association.
    fn members(&self, owner: &Record, association: &str) -> Result<Vec<Identity>, StoreError>;

    /// Insert or update. Returns `false` and attaches errors to the record
    /// when validation fails.
    fn save(&mut self, record: &mut Record) -> Result<bool, StoreError>;

    /// Delete the record's row. Returns `false` when nothing was deleted.
    fn destroy(&mut self, record: &mut Record) -> Result<bool, StoreError>;

    /// Replace a to-many-through membership list wholesale.
    fn replace_members(
        &mut self,
        owner: &Record,
        association: &str,
        members: &[Identity],
    ) -> Result<(), StoreError>;

    /// Drop a persisted child from a to-many association, honoring the
    /// association's removal policy.
    fn detach(&mut self, owner: &Record, association: &str, child: &mut Record) -> Result<(), StoreError>;

    /// Mark a reconstructed record's key columns as unchanged so an update
    /// addresses the persisted row. Required before committing a restored
    /// record with a composite identity.
    fn mark_identity_clean(&self, record: &mut Record) -> bool {
        record.mark_identity_clean()
    }
}

/// Storage of snapshot rows. Revision numbers are assigned by the store as
/// `max(existing) + 1` per `(entity_type, entity_id)`.
pub trait SnapshotStore {
    /// Current time as seen by the store; `created_at` is stamped with it.
    fn now(&self) -> DateTime<Utc>;

    fn insert_snapshot(&mut self, draft: SnapshotDraft) -> Result<Snapshot, StoreError>;

    fn find_snapshot(
        &self,
        entity_type: &str,
        id: &Identity,
        revision: u64,
    ) -> Result<Option<Snapshot>, StoreError>;

    fn latest_snapshot(&self, entity_type: &str, id: &Identity) -> Result<Option<Snapshot>, StoreError>;

    /// All snapshots of one entity, ascending by revision.
    fn snapshots_for(&self, entity_type: &str, id: &Identity) -> Result<Vec<Snapshot>, StoreError>;

    /// Delete every snapshot of the entity with `revision <= through`.
    fn delete_snapshots_through(
        &mut self,
        entity_type: &str,
        id: &Identity,
        through: u64,
    ) -> Result<usize, StoreError>;

    fn delete_snapshot(&mut self, entity_type: &str, id: &Identity, revision: u64) -> Result<bool, StoreError>;

    fn mark_trash(&mut self, entity_type: &str, id: &Identity, revision: u64) -> Result<(), StoreError>;

    /// Delete all snapshots of every entity of `entity_type` that has a
    /// trashed snapshot created at or before `cutoff`.
    fn delete_trashed(&mut self, entity_type: &str, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Transaction control. `begin` may nest; each level commits or rolls back
/// independently of its parent.
pub trait Transactional {
    /// Whether `rollback` actually discards writes.
    fn supports_transactions(&self) -> bool;
    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Everything the revision engine needs from its host.
pub trait Substrate: EntityStore + SnapshotStore + Transactional {}

impl<T: EntityStore + SnapshotStore + Transactional> Substrate for T {}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
pub fn transaction<S, T, E, F>(store: &mut S, f: F) -> Result<T, E>
where
    S: Transactional + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&mut S) -> Result<T, E>,
{
    store.begin()?;
    match f(store) {
        Ok(value) => {
            store.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = store.rollback() {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
