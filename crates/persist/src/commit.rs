use crate::error::RevisionError;
use revisionable_common::{AssociationKind, AssociationSpec, Identity};
use revisionable_kernel::{EntityStore, Loaded, Record, Substrate, transaction};
use std::collections::BTreeSet;

/// Write a restored record graph back to the store in one transaction.
///
/// For each association in `spec`: to-many children held in memory become
/// the complete membership (persisted children missing from memory are
/// detached per the association's removal policy) and are committed
/// recursively; a to-one target is committed recursively; a to-many-through
/// membership is replaced wholesale. The record itself is saved last.
///
/// Each entity is committed once per graph. An entity already committed or
/// still being committed further up is never detached, so the truncated
/// child lists a cyclic capture leaves behind do not remove it.
pub fn commit<S: Substrate + ?Sized>(
    store: &mut S,
    record: &mut Record,
    spec: &AssociationSpec,
) -> Result<(), RevisionError> {
    let mut seen = Seen::new();
    transaction(store, |store| commit_record(store, record, Some(spec), &mut seen))
}

/// Entities reached in one commit, by base type and identity.
type Seen = BTreeSet<(String, Identity)>;

fn entity_key<S: EntityStore + ?Sized>(store: &S, record: &Record) -> Result<Option<(String, Identity)>, RevisionError> {
    let Some(id) = record.identity() else {
        return Ok(None);
    };
    Ok(Some((store.schema().base_type(record.entity_type())?.to_owned(), id)))
}

fn commit_record<S: EntityStore + ?Sized>(
    store: &mut S,
    record: &mut Record,
    spec: Option<&AssociationSpec>,
    seen: &mut Seen,
) -> Result<(), RevisionError> {
    if let Some(key) = entity_key(&*store, record)?
        && !seen.insert(key)
    {
        return Ok(());
    }

    for (name, inclusion) in spec.into_iter().flat_map(AssociationSpec::iter) {
        let kind = record
            .model()
            .association_def(name)
            .map(|def| def.kind)
            .ok_or_else(|| RevisionError::UnknownAssociation {
                entity_type: record.entity_type().to_owned(),
                association: name.to_owned(),
            })?;
        let nested = inclusion.nested();
        match kind {
            AssociationKind::ToMany => {
                let mut children = match record.take_loaded(name) {
                    Some(Loaded::Many(children)) => children,
                    Some(other) => {
                        record.set_loaded(name, other);
                        continue;
                    }
                    None => continue,
                };
                let keep: BTreeSet<Identity> = children.iter().filter_map(Record::identity).collect();
                let result = (|| {
                    for mut existing in store.children(record, name)? {
                        let kept = existing.identity().is_some_and(|id| keep.contains(&id));
                        let reached = entity_key(&*store, &existing)?.is_some_and(|key| seen.contains(&key));
                        if !kept && !reached {
                            store.detach(record, name, &mut existing)?;
                        }
                    }
                    for child in &mut children {
                        commit_record(store, child, nested, seen)?;
                    }
                    Ok::<_, RevisionError>(())
                })();
                record.set_loaded(name, Loaded::Many(children));
                result?;
            }
            AssociationKind::ToOne => {
                let mut child = match record.take_loaded(name) {
                    Some(Loaded::One(Some(child))) => child,
                    Some(other) => {
                        record.set_loaded(name, other);
                        continue;
                    }
                    None => continue,
                };
                let result = commit_record(store, &mut child, nested, seen);
                record.set_loaded(name, Loaded::One(Some(child)));
                result?;
            }
            AssociationKind::ToManyThrough => {
                if let Some(members) = record.members(name).map(<[Identity]>::to_vec) {
                    store.replace_members(record, name, &members)?;
                }
            }
        }
    }

    if record.is_persisted() && record.model().has_composite_key() && !store.mark_identity_clean(record) {
        tracing::warn!(entity_type = record.entity_type(), "composite identity left dirty before update");
    }
    if !store.save(record)? {
        return Err(RevisionError::CommitFailed {
            entity_type: record.entity_type().to_owned(),
            id: record.identity().map(|id| id.to_string()).unwrap_or_default(),
            messages: record.errors().full_messages(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::capture;
    use crate::fixtures;
    use crate::restore::restore;
    use crate::codec::{self, Encoding};
    use revisionable_common::{SnapshotDraft, Value};
    use revisionable_kernel::{MemoryStore, SnapshotStore};
    use std::collections::BTreeMap;

    fn snapshot(store: &mut MemoryStore, record: &Record, spec: &AssociationSpec) -> revisionable_common::Snapshot {
        let tree = capture(&*store, record, spec).unwrap();
        store
            .insert_snapshot(SnapshotDraft {
                entity_type: record.entity_type().to_owned(),
                entity_id: record.identity().unwrap(),
                payload: codec::encode(&tree, Encoding::Cbor).unwrap(),
                extensions: BTreeMap::new(),
            })
            .unwrap()
    }

    fn names(records: &[Record]) -> Vec<String> {
        let mut names: Vec<String> = records
            .iter()
            .filter_map(|r| r.get("body").and_then(Value::as_text).map(str::to_owned))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn commit_reconciles_to_many_membership() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = fixtures::post_options().associations;
        let snap = snapshot(&mut store, &post, &spec);

        // Edit: rename one comment, drop the other, add a new one.
        let mut first = store.fetch("Comment", &Identity::from(1)).unwrap().unwrap();
        first.set("body", "edited").unwrap();
        store.save(&mut first).unwrap();
        let mut second = store.fetch("Comment", &Identity::from(2)).unwrap().unwrap();
        store.destroy(&mut second).unwrap();
        fixtures::add_comment(&mut store, 1, "late");

        let mut restored = restore(&store, &snap, None).unwrap();
        commit(&mut store, &mut restored, &spec).unwrap();

        let post = store.fetch("Post", &Identity::from(1)).unwrap().unwrap();
        let comments = store.children(&post, "comments").unwrap();
        assert_eq!(names(&comments), vec!["first", "second"]);
        assert_eq!(store.count("Comment"), 2);
    }

    #[test]
    fn nullify_removal_orphans_children() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = fixtures::post_options().associations;
        let snap = snapshot(&mut store, &post, &spec);

        let comment = store.fetch("Comment", &Identity::from(1)).unwrap().unwrap();
        let extra = fixtures::add_rating(&mut store, &comment, 1);

        let mut restored = restore(&store, &snap, None).unwrap();
        commit(&mut store, &mut restored, &spec).unwrap();

        let orphan = store.fetch("Rating", &extra).unwrap().unwrap();
        assert_eq!(orphan.get("comment_id"), Some(&Value::Null));
        assert_eq!(store.children(&comment, "ratings").unwrap().len(), 2);
    }

    #[test]
    fn commit_replaces_membership_and_one_target() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = fixtures::post_options().associations;
        let snap = snapshot(&mut store, &post, &spec);

        store.replace_members(&post, "tags", &[Identity::from(3)]).unwrap();
        let mut summary = store.children(&post, "summary").unwrap().remove(0);
        summary.set("text", "long").unwrap();
        store.save(&mut summary).unwrap();

        let mut restored = restore(&store, &snap, None).unwrap();
        commit(&mut store, &mut restored, &spec).unwrap();

        assert_eq!(
            store.members(&post, "tags").unwrap(),
            vec![Identity::from(1), Identity::from(2)]
        );
        let summary = store.children(&post, "summary").unwrap().remove(0);
        assert_eq!(summary.get("text"), Some(&Value::from("short")));
        assert_eq!(store.count("Tag"), 3);
    }

    #[test]
    fn composite_children_update_in_place() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = fixtures::post_options().associations;
        let snap = snapshot(&mut store, &post, &spec);

        let mut att = store.fetch("Attachment", &Identity::from((1, 1))).unwrap().unwrap();
        att.set("name", "renamed").unwrap();
        store.save(&mut att).unwrap();

        let mut restored = restore(&store, &snap, None).unwrap();
        commit(&mut store, &mut restored, &spec).unwrap();

        let att = store.fetch("Attachment", &Identity::from((1, 1))).unwrap().unwrap();
        assert_eq!(att.get("name"), Some(&Value::from("cover.png")));
        assert_eq!(store.count("Attachment"), 2);
    }

    #[test]
    fn failed_save_rolls_back_everything() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = fixtures::post_options().associations;
        let snap = snapshot(&mut store, &post, &spec);
        let mut second = store.fetch("Comment", &Identity::from(2)).unwrap().unwrap();
        store.destroy(&mut second).unwrap();

        let mut restored = restore(&store, &snap, None).unwrap();
        restored.set("title", Value::Null).unwrap();
        let err = commit(&mut store, &mut restored, &spec).unwrap_err();

        assert!(matches!(err, RevisionError::CommitFailed { ref messages, .. } if messages == &["title can't be blank"]));
        assert_eq!(store.count("Comment"), 1);
        assert_eq!(store.transaction_depth(), 0);
    }

    #[test]
    fn deleted_record_is_recreated() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let spec = fixtures::post_options().associations;
        let snap = snapshot(&mut store, &post, &spec);
        store.destroy(&mut post).unwrap();

        let mut restored = restore(&store, &snap, None).unwrap();
        assert!(restored.is_new());
        commit(&mut store, &mut restored, &spec).unwrap();
        assert!(store.exists("Post", &Identity::from(1)).unwrap());
        assert!(restored.is_persisted());
    }

    #[test]
    fn cycle_commits_each_node_once() {
        let mut store = MemoryStore::new(fixtures::schema());
        let (mut a, _) = fixtures::seed_cycle(&mut store);
        let spec = AssociationSpec::new().nest("peers", AssociationSpec::new().include("peers"));
        let snap = snapshot(&mut store, &a, &spec);
        a.set("name", "a2").unwrap();
        store.save(&mut a).unwrap();

        let mut restored = restore(&store, &snap, None).unwrap();
        commit(&mut store, &mut restored, &spec).unwrap();

        let a = store.fetch("Node", &Identity::from(1)).unwrap().unwrap();
        assert_eq!(a.get("name"), Some(&Value::from("a")));
        let peers = store.children(&a, "peers").unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].get("name"), Some(&Value::from("b")));
        assert_eq!(store.count("Node"), 2);
    }
}
