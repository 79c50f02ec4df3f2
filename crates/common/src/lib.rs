//! Shared value types: scalar values, entity identities, attribute trees,
//! association specs and the persisted snapshot record.
//!
//! Everything here is a pure value with no live references into storage.

pub mod snapshot;
pub mod spec;
pub mod tree;
pub mod types;

pub use snapshot::{Snapshot, SnapshotDraft};
pub use spec::{AssociationKind, AssociationSpec, Inclusion};
pub use tree::{Attribute, AttributeTree};
pub use types::{Identity, KeyPart, Value};
