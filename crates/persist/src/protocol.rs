//! The revision transaction: snapshot the persisted state, run a mutation,
//! then commit or roll back both together.

use crate::capture;
use crate::config::RevisionOptions;
use crate::error::RevisionError;
use crate::retention;
use revisionable_common::Snapshot;
use revisionable_kernel::{Record, StoreError, Substrate};

/// Call context threaded through revisioned operations.
///
/// Revisioning is switched off by passing a disabled context down; nothing
/// is stored on the record or in process state, so leaving a scope restores
/// the caller's context whether or not the scope failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevisionContext {
    disabled: bool,
}

impl RevisionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// This context with snapshot capture switched off.
    pub fn disabled(self) -> Self {
        Self { disabled: true }
    }

    /// Run `f` with capture switched off for every `with_revision` it reaches.
    pub fn without_revisioning<T>(self, f: impl FnOnce(Self) -> T) -> T {
        f(self.disabled())
    }
}

/// Run `mutation` against `record` with a snapshot of the record's persisted
/// state taken first, inside one transaction.
///
/// New records and disabled contexts run the mutation directly. A snapshot
/// that cannot be taken is logged and skipped. The mutation receives a
/// disabled context, so nested calls do not snapshot again. If the mutation
/// fails or leaves errors on the record, the transaction rolls back, snapshot
/// included; on a store without rollback the snapshot is deleted directly.
/// A record left destroyed marks its snapshot as trash.
pub fn with_revision<S, T, E, F>(
    store: &mut S,
    record: &mut Record,
    options: &RevisionOptions,
    ctx: RevisionContext,
    mutation: F,
) -> Result<T, E>
where
    S: Substrate + ?Sized,
    E: From<RevisionError>,
    F: FnOnce(&mut S, &mut Record, RevisionContext) -> Result<T, E>,
{
    if record.is_new() || ctx.is_disabled() {
        return mutation(store, record, ctx);
    }

    store.begin().map_err(RevisionError::from)?;
    let captured = capture_current(store, record, options);
    tracing::debug!(
        entity_type = record.entity_type(),
        revision = captured.as_ref().map(|s| s.revision),
        "running revisioned mutation"
    );

    let value = match mutation(store, record, ctx.disabled()) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(entity_type = record.entity_type(), "mutation failed, rolling back");
            abort(store, captured.as_ref());
            return Err(err);
        }
    };

    if !record.errors().is_empty() {
        tracing::debug!(
            entity_type = record.entity_type(),
            errors = record.errors().len(),
            "mutation left errors, rolling back"
        );
        abort(store, captured.as_ref());
        return Ok(value);
    }

    if let Err(err) = finish(store, record, captured.as_ref()) {
        abort(store, captured.as_ref());
        return Err(RevisionError::from(err).into());
    }
    tracing::debug!(entity_type = record.entity_type(), "revisioned mutation committed");
    Ok(value)
}

/// Snapshot the persisted state behind `record` and apply retention.
/// Failures are logged and yield `None`.
fn capture_current<S: Substrate + ?Sized>(
    store: &mut S,
    record: &Record,
    options: &RevisionOptions,
) -> Option<Snapshot> {
    match try_capture(store, record, options) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::warn!(entity_type = record.entity_type(), error = %err, "could not capture revision");
            None
        }
    }
}

fn try_capture<S: Substrate + ?Sized>(
    store: &mut S,
    record: &Record,
    options: &RevisionOptions,
) -> Result<Snapshot, RevisionError> {
    // A record rebuilt from a snapshot has no update target yet; its current
    // key names the row it will overwrite.
    let id = record
        .update_target()
        .or_else(|| record.identity())
        .ok_or_else(|| StoreError::MissingIdentity {
            entity_type: record.entity_type().to_owned(),
        })?;
    let current = store
        .fetch(record.entity_type(), &id)?
        .ok_or_else(|| StoreError::RecordNotFound {
            entity_type: record.entity_type().to_owned(),
            id: id.to_string(),
        })?;
    let draft = capture::draft(&*store, &current, options)?;
    let snapshot = store.insert_snapshot(draft)?;
    if let Err(err) = retention::truncate(store, &snapshot.entity_type, &snapshot.entity_id, &options.retention()) {
        tracing::warn!(entity_type = %snapshot.entity_type, id = %snapshot.entity_id, error = %err, "truncation failed");
    }
    Ok(snapshot)
}

fn finish<S: Substrate + ?Sized>(
    store: &mut S,
    record: &Record,
    captured: Option<&Snapshot>,
) -> Result<(), StoreError> {
    if record.is_destroyed()
        && let Some(snapshot) = captured
    {
        // Retention may already have removed it; nothing is left to trash.
        match store.mark_trash(&snapshot.entity_type, &snapshot.entity_id, snapshot.revision) {
            Ok(()) | Err(StoreError::SnapshotNotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    store.commit()
}

fn abort<S: Substrate + ?Sized>(store: &mut S, captured: Option<&Snapshot>) {
    if let Err(err) = store.rollback() {
        tracing::warn!(error = %err, "rollback failed");
    }
    if store.supports_transactions() {
        return;
    }
    if let Some(snapshot) = captured
        && let Err(err) = store.delete_snapshot(&snapshot.entity_type, &snapshot.entity_id, snapshot.revision)
    {
        tracing::warn!(
            entity_type = %snapshot.entity_type,
            id = %snapshot.entity_id,
            revision = snapshot.revision,
            error = %err,
            "could not remove revision after failed mutation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaValue;
    use crate::fixtures;
    use revisionable_common::{Identity, Value};
    use revisionable_kernel::{EntityStore, MemoryStore, SnapshotStore};

    fn retitle(
        store: &mut MemoryStore,
        record: &mut Record,
        options: &RevisionOptions,
        ctx: RevisionContext,
        title: &'static str,
    ) -> Result<bool, RevisionError> {
        with_revision(store, record, options, ctx, |store, record, _| {
            record.set("title", title).map_err(StoreError::from)?;
            Ok(store.save(record)?)
        })
    }

    fn post_count(store: &MemoryStore) -> usize {
        store.snapshot_count("Post", &Identity::from(1))
    }

    #[test]
    fn snapshot_holds_state_before_mutation() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();

        assert!(retitle(&mut store, &mut post, &options, RevisionContext::new(), "changed").unwrap());
        let snapshot = store.latest_snapshot("Post", &Identity::from(1)).unwrap().unwrap();
        let tree = crate::codec::decode(&snapshot.payload).unwrap();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(tree.scalar("title"), Some(&Value::from("hello")));
        assert_eq!(store.transaction_depth(), 0);
    }

    #[test]
    fn new_records_are_not_snapshotted() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = store.schema().new_record("Post").unwrap();
        assert!(retitle(&mut store, &mut post, &fixtures::post_options(), RevisionContext::new(), "first").unwrap());
        assert_eq!(post_count(&store), 0);
    }

    #[test]
    fn nested_calls_do_not_snapshot_again() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();

        let result: Result<bool, RevisionError> =
            with_revision(&mut store, &mut post, &options, RevisionContext::new(), |store, record, ctx| {
                assert!(ctx.is_disabled());
                retitle(store, record, &options, ctx, "inner")
            });
        assert!(result.unwrap());
        assert_eq!(post_count(&store), 1);
    }

    #[test]
    fn disabled_scope_skips_capture() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();
        let ctx = RevisionContext::new();

        let saved = ctx.without_revisioning(|ctx| retitle(&mut store, &mut post, &options, ctx, "quiet"));
        assert!(saved.unwrap());
        assert_eq!(post_count(&store), 0);
        assert!(!ctx.is_disabled());

        retitle(&mut store, &mut post, &options, ctx, "loud").unwrap();
        assert_eq!(post_count(&store), 1);
    }

    #[test]
    fn failing_mutation_rolls_back_snapshot_and_changes() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();

        let result: Result<(), RevisionError> =
            with_revision(&mut store, &mut post, &options, RevisionContext::new(), |store, record, _| {
                record.set("title", "lost").map_err(StoreError::from)?;
                store.save(record)?;
                Err(StoreError::Unavailable("disk full".into()).into())
            });
        assert!(matches!(result, Err(RevisionError::Store(StoreError::Unavailable(_)))));
        assert_eq!(post_count(&store), 0);
        let stored = store.fetch("Post", &Identity::from(1)).unwrap().unwrap();
        assert_eq!(stored.get("title"), Some(&Value::from("hello")));
    }

    #[test]
    fn validation_errors_roll_back_snapshot() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();

        let saved = with_revision(&mut store, &mut post, &options, RevisionContext::new(), |store, record, _| {
            record.set("title", Value::Null).map_err(StoreError::from)?;
            Ok::<_, RevisionError>(store.save(record)?)
        });
        assert!(!saved.unwrap());
        assert_eq!(post.errors().on("title"), ["can't be blank".to_owned()]);
        assert_eq!(post_count(&store), 0);
    }

    #[test]
    fn capture_failure_does_not_block_mutation() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options().with_meta("who", MetaValue::field("no_such_field"));

        assert!(retitle(&mut store, &mut post, &options, RevisionContext::new(), "changed").unwrap());
        assert_eq!(post_count(&store), 0);
        let stored = store.fetch("Post", &Identity::from(1)).unwrap().unwrap();
        assert_eq!(stored.get("title"), Some(&Value::from("changed")));
    }

    #[test]
    fn non_transactional_store_deletes_snapshot_on_failure() {
        let mut store = MemoryStore::non_transactional(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();

        let result: Result<(), RevisionError> =
            with_revision(&mut store, &mut post, &options, RevisionContext::new(), |_, _, _| {
                Err(StoreError::Unavailable("boom".into()).into())
            });
        assert!(result.is_err());
        assert_eq!(post_count(&store), 0);
        assert_eq!(store.transaction_depth(), 0);
    }

    #[test]
    fn destroyed_record_leaves_trashed_snapshot() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options();

        let destroyed = with_revision(&mut store, &mut post, &options, RevisionContext::new(), |store, record, _| {
            Ok::<_, RevisionError>(store.destroy(record)?)
        });
        assert!(destroyed.unwrap());
        let snapshot = store.latest_snapshot("Post", &Identity::from(1)).unwrap().unwrap();
        assert!(snapshot.trash);
        assert!(!store.exists("Post", &Identity::from(1)).unwrap());
    }

    #[test]
    fn destroy_with_zero_limit_has_nothing_to_trash() {
        let mut store = MemoryStore::new(fixtures::schema());
        let mut post = fixtures::seed_post(&mut store);
        let options = fixtures::post_options().with_limit(0);

        let destroyed = with_revision(&mut store, &mut post, &options, RevisionContext::new(), |store, record, _| {
            Ok::<_, RevisionError>(store.destroy(record)?)
        });
        assert!(destroyed.unwrap());
        assert!(!store.exists("Post", &Identity::from(1)).unwrap());
        assert_eq!(post_count(&store), 0);
    }
}
