//! Walks a record and its selected associations into an [`AttributeTree`].

use crate::codec;
use crate::config::RevisionOptions;
use crate::error::RevisionError;
use revisionable_common::{AssociationKind, AssociationSpec, Attribute, AttributeTree, Identity, SnapshotDraft};
use revisionable_kernel::{EntityStore, Loaded, Record};
use std::collections::BTreeSet;

/// Entities already captured in one walk, by base type and identity.
type Visited = BTreeSet<(String, Identity)>;

/// Capture `record` and the associations named in `spec`.
///
/// Association targets already held on a record are used as they are;
/// anything else is read from the store. An entity reached a second time is
/// left out: dropped from to-many sequences, `None` for to-one.
pub fn capture<S: EntityStore + ?Sized>(
    store: &S,
    record: &Record,
    spec: &AssociationSpec,
) -> Result<AttributeTree, RevisionError> {
    let mut visited = Visited::new();
    Ok(capture_record(store, record, Some(spec), &mut visited)?.unwrap_or_default())
}

/// Capture a record into a snapshot ready for insertion.
pub fn draft<S: EntityStore + ?Sized>(
    store: &S,
    record: &Record,
    options: &RevisionOptions,
) -> Result<SnapshotDraft, RevisionError> {
    let entity_id = record.identity().ok_or_else(|| revisionable_kernel::StoreError::MissingIdentity {
        entity_type: record.entity_type().to_owned(),
    })?;
    let tree = capture(store, record, &options.associations)?;
    Ok(SnapshotDraft {
        entity_type: store.schema().base_type(record.entity_type())?.to_owned(),
        entity_id,
        payload: codec::encode(&tree, options.encoding)?,
        extensions: options.extensions(record)?,
    })
}

fn capture_record<S: EntityStore + ?Sized>(
    store: &S,
    record: &Record,
    spec: Option<&AssociationSpec>,
    visited: &mut Visited,
) -> Result<Option<AttributeTree>, RevisionError> {
    if let Some(id) = record.identity() {
        let base = store.schema().base_type(record.entity_type())?.to_owned();
        if !visited.insert((base, id)) {
            return Ok(None);
        }
    }

    let mut tree: AttributeTree = record
        .values()
        .map(|(name, value)| (name.to_owned(), Attribute::Scalar(value.clone())))
        .collect();

    for (name, inclusion) in spec.into_iter().flat_map(AssociationSpec::iter) {
        let def = record
            .model()
            .association_def(name)
            .ok_or_else(|| RevisionError::UnknownAssociation {
                entity_type: record.entity_type().to_owned(),
                association: name.to_owned(),
            })?;
        let nested = inclusion.nested();
        let attribute = match def.kind {
            AssociationKind::ToOne => {
                let fetched;
                let target = match record.loaded(name) {
                    Some(Loaded::One(child)) => child.as_deref(),
                    _ => {
                        fetched = store.children(record, name)?;
                        fetched.first()
                    }
                };
                let child = match target {
                    Some(child) => capture_record(store, child, nested, visited)?,
                    None => None,
                };
                Attribute::One(child.map(Box::new))
            }
            AssociationKind::ToMany => {
                let fetched;
                let children: &[Record] = match record.loaded(name) {
                    Some(Loaded::Many(children)) => children,
                    _ => {
                        fetched = store.children(record, name)?;
                        &fetched
                    }
                };
                let mut trees = Vec::with_capacity(children.len());
                for child in children {
                    if let Some(tree) = capture_record(store, child, nested, visited)? {
                        trees.push(tree);
                    }
                }
                Attribute::Many(trees)
            }
            AssociationKind::ToManyThrough => match record.loaded(name) {
                Some(Loaded::Members(ids)) => Attribute::Members(ids.clone()),
                _ => Attribute::Members(store.members(record, name)?),
            },
        };
        tree.insert(name, attribute);
    }
    Ok(Some(tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use pretty_assertions::assert_eq;
    use revisionable_common::Value;
    use revisionable_kernel::MemoryStore;

    fn spec() -> AssociationSpec {
        fixtures::post_options().associations
    }

    #[test]
    fn captures_scalars_and_nested_associations() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);

        let tree = capture(&store, &post, &spec()).unwrap();
        assert_eq!(tree.scalar("title"), Some(&Value::from("hello")));
        assert_eq!(tree.scalar("secret"), Some(&Value::Int(42)));

        let Some(Attribute::Many(comments)) = tree.get("comments") else {
            panic!("comments not captured");
        };
        assert_eq!(comments.len(), 2);
        let Some(Attribute::Many(ratings)) = comments[0].get("ratings") else {
            panic!("ratings not captured");
        };
        assert_eq!(ratings.len(), 2);
        assert!(comments[1].get("ratings").is_some());

        let Some(Attribute::One(Some(summary))) = tree.get("summary") else {
            panic!("summary not captured");
        };
        assert_eq!(summary.scalar("text"), Some(&Value::from("short")));

        assert_eq!(
            tree.get("tags"),
            Some(&Attribute::Members(vec![Identity::from(1), Identity::from(2)]))
        );
        assert!(tree.get("attachments").is_some());
    }

    #[test]
    fn unselected_associations_are_skipped() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let tree = capture(&store, &post, &AssociationSpec::new()).unwrap();
        assert!(tree.get("comments").is_none());
        assert!(tree.get("tags").is_none());
    }

    #[test]
    fn members_never_recurse() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = AssociationSpec::new().nest("tags", AssociationSpec::new().include("posts"));
        let tree = capture(&store, &post, &spec).unwrap();
        assert!(matches!(tree.get("tags"), Some(Attribute::Members(ids)) if ids.len() == 2));
    }

    #[test]
    fn in_memory_targets_win_over_storage() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        post.set_loaded("comments", Loaded::Many(Vec::new()));
        post.set_loaded("tags", Loaded::Members(vec![Identity::from(2)]));

        let tree = capture(&store, &post, &spec()).unwrap();
        assert_eq!(tree.get("comments"), Some(&Attribute::Many(Vec::new())));
        assert_eq!(tree.get("tags"), Some(&Attribute::Members(vec![Identity::from(2)])));
    }

    #[test]
    fn cycles_terminate_without_duplicates() {
        let mut store = MemoryStore::new(fixtures::schema());
        let (a, _b) = fixtures::seed_cycle(&mut store);
        let spec = AssociationSpec::new().nest(
            "peers",
            AssociationSpec::new().nest("peers", AssociationSpec::new().include("peers")),
        );
        let tree = capture(&store, &a, &spec).unwrap();

        let Some(Attribute::Many(peers)) = tree.get("peers") else {
            panic!("peers not captured");
        };
        assert_eq!(peers.len(), 1);
        // b links back to a, which is already captured.
        assert_eq!(peers[0].get("peers"), Some(&Attribute::Many(Vec::new())));
    }

    #[test]
    fn unknown_association_is_an_error() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let spec = AssociationSpec::new().include("nonexistent");
        assert!(matches!(
            capture(&store, &post, &spec),
            Err(RevisionError::UnknownAssociation { association, .. }) if association == "nonexistent"
        ));
    }

    #[test]
    fn draft_resolves_meta_and_base_type() {
        let mut store = MemoryStore::new(fixtures::schema());
        let post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options()
            .with_meta("label", crate::MetaValue::computed(|r| {
                Value::Text(format!("title was '{}'", r.get("title").and_then(Value::as_text).unwrap_or("")))
            }))
            .with_meta("version", crate::MetaValue::literal(1));
        let draft = draft(&store, &post, &options).unwrap();
        assert_eq!(draft.entity_type, "Post");
        assert_eq!(draft.entity_id, Identity::from(1));
        assert_eq!(draft.extensions["label"], Value::from("title was 'hello'"));
        assert_eq!(draft.extensions["version"], Value::Int(1));
        assert!(store.exists("Post", &draft.entity_id).unwrap());
    }
}
