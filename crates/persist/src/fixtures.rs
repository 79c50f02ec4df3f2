//! Shared schema and seed data for the engine tests.

use crate::config::{Dependent, RevisionOptions};
use revisionable_common::{AssociationSpec, Identity, Value};
use revisionable_kernel::{AssociationDef, EntityModel, EntityStore, FieldKind, MemoryStore, Record, Schema};

pub(crate) fn schema() -> Schema {
    let models = [
        EntityModel::new("Post")
            .key("id", FieldKind::Int)
            .required("title", FieldKind::Text)
            .field("body", FieldKind::Text)
            .read_only("secret", FieldKind::Int)
            .field("updated_by", FieldKind::Text)
            .has_many("comments", "Comment", &["post_id"])
            .has_one("summary", "Summary", &["post_id"])
            .has_many_through("tags", "Tag")
            .has_many("attachments", "Attachment", &["post_id"]),
        EntityModel::new("Comment")
            .key("id", FieldKind::Int)
            .field("post_id", FieldKind::Int)
            .field("body", FieldKind::Text)
            .association(AssociationDef::to_many("ratings", "Rating", &["comment_id"]).nullify_on_remove()),
        EntityModel::new("Rating")
            .key("id", FieldKind::Int)
            .field("comment_id", FieldKind::Int)
            .field("stars", FieldKind::Int),
        EntityModel::new("Summary")
            .key("id", FieldKind::Int)
            .field("post_id", FieldKind::Int)
            .field("text", FieldKind::Text),
        EntityModel::new("Tag").key("id", FieldKind::Int).field("name", FieldKind::Text),
        EntityModel::new("Attachment")
            .composite_key(&[("post_id", FieldKind::Int), ("slot", FieldKind::Int)])
            .field("name", FieldKind::Text),
        EntityModel::new("Node")
            .key("id", FieldKind::Int)
            .field("peer_id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .has_many("peers", "Node", &["peer_id"]),
        EntityModel::new("Archive::Document")
            .key("id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .inheritance_column("kind")
            .store_full_type_name(false),
        EntityModel::new("Archive::Memo").inherits("Archive::Document"),
        EntityModel::new("Shape")
            .key("id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .inheritance_column("type"),
        EntityModel::new("Circle").inherits("Shape").field("radius", FieldKind::Int),
    ];
    let mut schema = Schema::new();
    for model in models {
        schema.register(model).unwrap();
    }
    schema
}

pub(crate) fn post_options() -> RevisionOptions {
    RevisionOptions::new()
        .with_associations(
            AssociationSpec::new()
                .nest("comments", AssociationSpec::new().include("ratings"))
                .include("summary")
                .include("tags")
                .include("attachments"),
        )
        .with_limit(3)
        .with_dependent(Dependent::Keep)
}

fn insert(store: &mut MemoryStore, entity_type: &str, values: &[(&str, Value)]) -> Record {
    let mut record = store.schema().new_record(entity_type).unwrap();
    for (field, value) in values {
        record.write(field, value.clone()).unwrap();
    }
    assert!(store.save(&mut record).unwrap(), "{:?}", record.errors());
    record
}

/// Post 1 with two comments (the first rated twice), a summary, two of three
/// tags and two attachments.
pub(crate) fn seed_post(store: &mut MemoryStore) -> Record {
    let post = insert(
        store,
        "Post",
        &[("title", "hello".into()), ("body", "text".into()), ("secret", Value::Int(42))],
    );
    let first = add_comment(store, 1, "first");
    add_comment(store, 1, "second");
    add_rating(store, &first, 5);
    add_rating(store, &first, 3);
    insert(store, "Summary", &[("post_id", Value::Int(1)), ("text", "short".into())]);
    for name in ["rust", "sql", "yaml"] {
        insert(store, "Tag", &[("name", name.into())]);
    }
    store
        .replace_members(&post, "tags", &[Identity::from(1), Identity::from(2)])
        .unwrap();
    insert(
        store,
        "Attachment",
        &[("post_id", Value::Int(1)), ("slot", Value::Int(1)), ("name", "cover.png".into())],
    );
    insert(
        store,
        "Attachment",
        &[("post_id", Value::Int(1)), ("slot", Value::Int(2)), ("name", "appendix.pdf".into())],
    );
    store.fetch("Post", &Identity::from(1)).unwrap().unwrap()
}

pub(crate) fn add_comment(store: &mut MemoryStore, post_id: i64, body: &str) -> Record {
    insert(store, "Comment", &[("post_id", post_id.into()), ("body", body.into())])
}

pub(crate) fn add_rating(store: &mut MemoryStore, comment: &Record, stars: i64) -> Identity {
    let comment_id = comment.get("id").cloned().unwrap_or(Value::Null);
    insert(store, "Rating", &[("comment_id", comment_id), ("stars", stars.into())])
        .identity()
        .unwrap()
}

/// Two nodes pointing at each other.
pub(crate) fn seed_cycle(store: &mut MemoryStore) -> (Record, Record) {
    let a = insert(store, "Node", &[("peer_id", Value::Int(2)), ("name", "a".into())]);
    let b = insert(store, "Node", &[("peer_id", Value::Int(1)), ("name", "b".into())]);
    (a, b)
}
