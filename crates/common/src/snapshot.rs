use crate::types::{Identity, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A persisted point-in-time capture of one entity.
///
/// Immutable once written except for `trash`, which is set at most once on
/// the deletion path. `revision` starts at 1 and is unique within
/// `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Base type name of the captured entity.
    pub entity_type: String,
    pub entity_id: Identity,
    pub revision: u64,
    /// Compressed, encoded attribute tree.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub trash: bool,
    /// Caller-defined extension columns.
    pub extensions: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }
}

/// A snapshot awaiting insertion. The store assigns `revision` and
/// `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDraft {
    pub entity_type: String,
    pub entity_id: Identity,
    pub payload: Vec<u8>,
    pub extensions: BTreeMap<String, Value>,
}

impl SnapshotDraft {
    /// Materialize the draft with store-assigned fields.
    pub fn into_snapshot(self, revision: u64, created_at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            revision,
            payload: self.payload,
            created_at,
            trash: false,
            extensions: self.extensions,
        }
    }
}
