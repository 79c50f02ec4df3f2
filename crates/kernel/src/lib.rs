//! Host substrate: the statically declared entity model, in-memory records,
//! the storage traits the revision engine runs against, and `MemoryStore`,
//! a transactional reference implementation.
//!
//! # Invariants
//! - Records are values; association targets held in memory never touch
//!   storage until explicitly saved.
//! - Snapshot revisions are unique within `(entity_type, entity_id)`.
//! - A rolled-back transaction leaves no trace in any table, snapshots included.

pub mod clock;
pub mod memory;
pub mod model;
pub mod record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use model::{AssociationDef, EntityModel, FieldDef, FieldKind, Removal, Schema};
pub use record::{Errors, FieldError, Loaded, Record, RecordState};
pub use store::{EntityStore, SnapshotStore, StoreError, Substrate, Transactional, transaction};
