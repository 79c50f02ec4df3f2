use crate::capture;
use crate::commit;
use crate::config::{Dependent, MetaValue, RevisionOptions};
use crate::error::RevisionError;
use crate::protocol::{self, RevisionContext};
use crate::restore;
use crate::retention::{self, RetentionPolicy};
use chrono::Duration;
use revisionable_common::{AssociationKind, AssociationSpec, Identity, Snapshot};
use revisionable_kernel::{EntityModel, Record, Schema, Substrate, transaction};

/// Revision history of one entity type and everything the options select
/// beneath it.
///
/// A `Revisioner` is stateless apart from its options; every operation takes
/// the store it runs against.
#[derive(Debug, Clone)]
pub struct Revisioner {
    entity_type: String,
    declared_type: String,
    options: RevisionOptions,
}

impl Revisioner {
    /// Checks every association path and meta field reference against the
    /// schema. Snapshots are filed under the base type of `entity_type`;
    /// restoring a snapshot without a discriminator yields `entity_type`.
    pub fn new(schema: &Schema, entity_type: &str, options: RevisionOptions) -> Result<Self, RevisionError> {
        let model = schema.model(entity_type)?;
        validate_spec(schema, &model, &options.associations)?;
        for source in options.meta.values() {
            if let MetaValue::Field(field) = source
                && model.field_def(field).is_none()
            {
                return Err(RevisionError::UnknownField {
                    entity_type: entity_type.to_owned(),
                    field: field.clone(),
                });
            }
        }
        Ok(Self {
            entity_type: schema.base_type(entity_type)?.to_owned(),
            declared_type: model.name().to_owned(),
            options,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn declared_type(&self) -> &str {
        &self.declared_type
    }

    pub fn options(&self) -> &RevisionOptions {
        &self.options
    }

    /// Run `mutation` under the revision protocol with these options.
    pub fn with_revision<S, T, E, F>(
        &self,
        store: &mut S,
        record: &mut Record,
        ctx: RevisionContext,
        mutation: F,
    ) -> Result<T, E>
    where
        S: Substrate + ?Sized,
        E: From<RevisionError>,
        F: FnOnce(&mut S, &mut Record, RevisionContext) -> Result<T, E>,
    {
        self.check_type(store.schema(), record)?;
        protocol::with_revision(store, record, &self.options, ctx, mutation)
    }

    /// Snapshot `record` as it is in memory, without retention.
    pub fn create_revision<S: Substrate + ?Sized>(&self, store: &mut S, record: &Record) -> Result<Snapshot, RevisionError> {
        self.check_type(store.schema(), record)?;
        let draft = capture::draft(&*store, record, &self.options)?;
        let snapshot = store.insert_snapshot(draft)?;
        tracing::debug!(entity_type = %snapshot.entity_type, id = %snapshot.entity_id, revision = snapshot.revision, "revision created");
        Ok(snapshot)
    }

    pub fn find_revision<S: Substrate + ?Sized>(
        &self,
        store: &S,
        id: &Identity,
        revision: u64,
    ) -> Result<Option<Snapshot>, RevisionError> {
        Ok(store.find_snapshot(&self.entity_type, id, revision)?)
    }

    pub fn last_revision<S: Substrate + ?Sized>(&self, store: &S, id: &Identity) -> Result<Option<Snapshot>, RevisionError> {
        Ok(store.latest_snapshot(&self.entity_type, id)?)
    }

    /// All snapshots of one entity, newest first.
    pub fn revisions<S: Substrate + ?Sized>(&self, store: &S, id: &Identity) -> Result<Vec<Snapshot>, RevisionError> {
        let mut snapshots = store.snapshots_for(&self.entity_type, id)?;
        snapshots.reverse();
        Ok(snapshots)
    }

    /// Rebuild the entity as of `revision`, in memory only.
    pub fn restore_revision<S: Substrate + ?Sized>(
        &self,
        store: &S,
        id: &Identity,
        revision: u64,
    ) -> Result<Option<Record>, RevisionError> {
        self.find_revision(store, id, revision)?
            .map(|snapshot| restore::restore(store, &snapshot, Some(self.declared_type.as_str())))
            .transpose()
    }

    pub fn restore_last_revision<S: Substrate + ?Sized>(
        &self,
        store: &S,
        id: &Identity,
    ) -> Result<Option<Record>, RevisionError> {
        self.last_revision(store, id)?
            .map(|snapshot| restore::restore(store, &snapshot, Some(self.declared_type.as_str())))
            .transpose()
    }

    /// Rebuild the entity as of `revision` and write it back, snapshotting
    /// the state it replaces.
    pub fn restore_revision_and_commit<S: Substrate + ?Sized>(
        &self,
        store: &mut S,
        id: &Identity,
        revision: u64,
        ctx: RevisionContext,
    ) -> Result<Option<Record>, RevisionError> {
        let Some(mut record) = self.restore_revision(&*store, id, revision)? else {
            return Ok(None);
        };
        self.commit_restored(store, &mut record, ctx)?;
        Ok(Some(record))
    }

    pub fn restore_last_revision_and_commit<S: Substrate + ?Sized>(
        &self,
        store: &mut S,
        id: &Identity,
        ctx: RevisionContext,
    ) -> Result<Option<Record>, RevisionError> {
        let Some(mut record) = self.restore_last_revision(&*store, id)? else {
            return Ok(None);
        };
        self.commit_restored(store, &mut record, ctx)?;
        Ok(Some(record))
    }

    /// Apply the configured retention policy to one entity.
    pub fn truncate<S: Substrate + ?Sized>(&self, store: &mut S, id: &Identity) -> Result<usize, RevisionError> {
        self.truncate_with(store, id, &self.options.retention())
    }

    pub fn truncate_with<S: Substrate + ?Sized>(
        &self,
        store: &mut S,
        id: &Identity,
        policy: &RetentionPolicy,
    ) -> Result<usize, RevisionError> {
        Ok(retention::truncate(store, &self.entity_type, id, policy)?)
    }

    /// Delete the whole history of every entity of this type trashed at
    /// least `max_age` ago.
    pub fn empty_trash<S: Substrate + ?Sized>(&self, store: &mut S, max_age: Duration) -> Result<usize, RevisionError> {
        let cutoff = store.now() - max_age;
        let removed = store.delete_trashed(&self.entity_type, cutoff)?;
        if removed > 0 {
            tracing::info!(entity_type = %self.entity_type, %cutoff, removed, "emptied revision trash");
        }
        Ok(removed)
    }

    /// Save `record`, under the revision protocol when `on_update` is set.
    pub fn update<S: Substrate + ?Sized>(
        &self,
        store: &mut S,
        record: &mut Record,
        ctx: RevisionContext,
    ) -> Result<bool, RevisionError> {
        self.check_type(store.schema(), record)?;
        if self.options.on_update {
            self.with_revision(store, record, ctx, |store, record, _| Ok(store.save(record)?))
        } else {
            Ok(store.save(record)?)
        }
    }

    /// Destroy `record`, under the revision protocol when `on_destroy` is
    /// set. With [`Dependent::Destroy`] the entity's history goes with it.
    pub fn destroy<S: Substrate + ?Sized>(
        &self,
        store: &mut S,
        record: &mut Record,
        ctx: RevisionContext,
    ) -> Result<bool, RevisionError> {
        self.check_type(store.schema(), record)?;
        let id = record.update_target().or_else(|| record.identity());
        transaction::<_, _, RevisionError, _>(store, |store| {
            let destroyed = if self.options.on_destroy {
                self.with_revision(store, record, ctx, |store, record, _| {
                    Ok::<_, RevisionError>(store.destroy(record)?)
                })?
            } else {
                store.destroy(record)?
            };
            if destroyed
                && self.options.dependent == Dependent::Destroy
                && let Some(id) = &id
            {
                let removed = store.delete_snapshots_through(&self.entity_type, id, u64::MAX)?;
                tracing::debug!(entity_type = %self.entity_type, %id, removed, "deleted revisions of destroyed record");
            }
            Ok(destroyed)
        })
    }

    fn commit_restored<S: Substrate + ?Sized>(
        &self,
        store: &mut S,
        record: &mut Record,
        ctx: RevisionContext,
    ) -> Result<(), RevisionError> {
        if !record.errors().is_empty() {
            return Err(RevisionError::CommitFailed {
                entity_type: record.entity_type().to_owned(),
                id: record.identity().map(|id| id.to_string()).unwrap_or_default(),
                messages: record.errors().full_messages(),
            });
        }
        let spec = &self.options.associations;
        self.with_revision(store, record, ctx, |store, record, _| commit::commit(store, record, spec))
    }

    fn check_type(&self, schema: &Schema, record: &Record) -> Result<(), RevisionError> {
        if schema.is_a(record.entity_type(), &self.entity_type) {
            Ok(())
        } else {
            Err(RevisionError::WrongEntityType {
                expected: self.entity_type.clone(),
                found: record.entity_type().to_owned(),
            })
        }
    }
}

fn validate_spec(schema: &Schema, model: &EntityModel, spec: &AssociationSpec) -> Result<(), RevisionError> {
    for (name, inclusion) in spec.iter() {
        let def = model
            .association_def(name)
            .ok_or_else(|| RevisionError::UnknownAssociation {
                entity_type: model.name().to_owned(),
                association: name.to_owned(),
            })?;
        let target = schema.model(&def.target)?;
        // Members are captured by identity only, so nesting below them is inert.
        if let Some(nested) = inclusion.nested()
            && def.kind != AssociationKind::ToManyThrough
        {
            validate_spec(schema, &target, nested)?;
        }
    }
    Ok(())
}
