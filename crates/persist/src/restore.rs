//! Rebuilds in-memory records from snapshots.
//!
//! Restoration never writes to the store. Per-field and per-association
//! failures are recorded on the record's errors and restoration carries on;
//! only an unresolvable subtype fails the whole restore.

use crate::codec::SnapshotPayload;
use crate::error::RevisionError;
use revisionable_common::{AssociationKind, Attribute, AttributeTree, Snapshot, Value};
use revisionable_kernel::{EntityModel, EntityStore, Loaded, Record, Schema};
use std::sync::Arc;

/// Choose the concrete type for a captured tree.
///
/// A non-empty discriminator in the base type's inheritance column wins.
/// When the base type stores short names, a discriminator not starting with
/// `::` is qualified with the base type's namespace. Without a
/// discriminator, `fallback` (or the base type itself) is used.
pub fn resolve_type(
    schema: &Schema,
    base_type: &str,
    tree: &AttributeTree,
    fallback: Option<&str>,
) -> Result<Arc<EntityModel>, RevisionError> {
    let base = schema.model(base_type)?;
    let discriminator = base
        .inheritance_column_name()
        .and_then(|column| tree.scalar(column))
        .and_then(Value::as_text)
        .filter(|d| !d.is_empty());
    let Some(discriminator) = discriminator else {
        return Ok(match fallback {
            Some(name) => schema.model(name)?,
            None => base,
        });
    };

    let name = match (discriminator.strip_prefix("::"), base.namespace()) {
        (Some(absolute), _) => absolute.to_owned(),
        (None, Some(namespace)) if !base.stores_full_type_name() => format!("{namespace}::{discriminator}"),
        (None, _) => discriminator.to_owned(),
    };
    match schema.get(&name) {
        Some(model) if schema.is_a(&name, base.name()) => Ok(Arc::clone(model)),
        _ => Err(RevisionError::UnknownSubtype {
            base_type: base.name().to_owned(),
            discriminator: discriminator.to_owned(),
        }),
    }
}

/// Rebuild the record captured in `snapshot`.
pub fn restore<S: EntityStore + ?Sized>(
    store: &S,
    snapshot: &Snapshot,
    fallback: Option<&str>,
) -> Result<Record, RevisionError> {
    let tree = snapshot.attributes()?;
    let model = resolve_type(store.schema(), &snapshot.entity_type, &tree, fallback)?;
    let mut record = Record::new(model);
    restore_record(store, &mut record, &tree)?;
    tracing::debug!(
        entity_type = record.entity_type(),
        revision = snapshot.revision,
        errors = record.errors().len(),
        "restored revision"
    );
    Ok(record)
}

fn restore_record<S: EntityStore + ?Sized>(
    store: &S,
    record: &mut Record,
    tree: &AttributeTree,
) -> Result<(), RevisionError> {
    let model = Arc::clone(record.model());

    for column in model.primary_key() {
        if let Some(Attribute::Scalar(value)) = tree.get(column)
            && record.write(column, value.clone()).is_err()
        {
            record.errors_mut().add(column.as_str(), format!("could not be restored to {value}"));
        }
    }

    for (name, attribute) in tree.iter() {
        if model.association_def(name).is_some() || model.primary_key().iter().any(|c| c == name) {
            continue;
        }
        match attribute {
            Attribute::Scalar(value) => {
                if record.write(name, value.clone()).is_err() {
                    record.errors_mut().add(name, format!("could not be restored to {value}"));
                }
            }
            _ => record.errors_mut().add(name, "could not be restored from the revision"),
        }
    }

    for (name, attribute) in tree.iter() {
        if model.association_def(name).is_none() {
            continue;
        }
        match restore_association(store, record, name, attribute) {
            Ok(true) => {}
            Ok(false) => record.errors_mut().add(name, "could not be restored from the revision"),
            Err(e) => record
                .errors_mut()
                .add(name, format!("could not be restored from the revision: {e}")),
        }
    }

    // Must stay after association assignment.
    if let Some(id) = record.identity()
        && store.exists(record.entity_type(), &id)?
    {
        record.mark_persisted();
    }
    Ok(())
}

/// Restore one association onto `record`. `Ok(false)` when a restored child
/// carries errors of its own.
fn restore_association<S: EntityStore + ?Sized>(
    store: &S,
    record: &mut Record,
    name: &str,
    attribute: &Attribute,
) -> Result<bool, RevisionError> {
    let entity_type = record.entity_type().to_owned();
    let def = record
        .model()
        .association_def(name)
        .cloned()
        .ok_or_else(|| RevisionError::UnknownAssociation {
            entity_type: entity_type.clone(),
            association: name.to_owned(),
        })?;
    let malformed = |expected| RevisionError::Malformed {
        entity_type: entity_type.clone(),
        attribute: name.to_owned(),
        expected,
    };

    match (def.kind, attribute) {
        (AssociationKind::ToMany, Attribute::Many(trees)) => {
            let mut children = Vec::with_capacity(trees.len());
            let mut clean = true;
            let mut failures = Vec::new();
            for tree in trees {
                match restore_child(store, &def.target, tree) {
                    Ok(child) => {
                        clean &= child.errors().is_empty();
                        children.push(child);
                    }
                    Err(e) => failures.push(e),
                }
            }
            record.set_loaded(name, Loaded::Many(children));
            for e in failures {
                record
                    .errors_mut()
                    .add(name, format!("could not be restored from the revision: {e}"));
            }
            Ok(clean)
        }
        (AssociationKind::ToOne, Attribute::One(tree)) => match tree {
            Some(tree) => {
                let child = restore_child(store, &def.target, tree)?;
                let clean = child.errors().is_empty();
                record.set_loaded(name, Loaded::One(Some(Box::new(child))));
                Ok(clean)
            }
            None => {
                record.set_loaded(name, Loaded::One(None));
                Ok(true)
            }
        },
        (AssociationKind::ToManyThrough, Attribute::Members(ids)) => {
            record.set_loaded(name, Loaded::Members(ids.clone()));
            Ok(true)
        }
        (AssociationKind::ToMany, _) => Err(malformed("a sequence of records")),
        (AssociationKind::ToOne, _) => Err(malformed("a single record")),
        (AssociationKind::ToManyThrough, _) => Err(malformed("a membership list")),
    }
}

fn restore_child<S: EntityStore + ?Sized>(
    store: &S,
    target: &str,
    tree: &AttributeTree,
) -> Result<Record, RevisionError> {
    let base = store.schema().base_type(target)?;
    let model = resolve_type(store.schema(), base, tree, Some(target))?;
    let mut child = Record::new(model);
    restore_record(store, &mut child, tree)?;
    Ok(child)
}
