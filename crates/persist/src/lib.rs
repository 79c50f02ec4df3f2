//! Revision engine: snapshot an entity and a selected slice of its
//! association graph before each change, keep a bounded history, and rebuild
//! or roll back to any stored revision.
//!
//! # Invariants
//! - Revision numbers of one entity are `1..N` in capture order.
//! - A mutation that fails or leaves errors on its record leaves no snapshot.
//! - Restoring never writes; committing writes the whole graph or nothing.
//! - Snapshots younger than the minimum age survive truncation.

pub mod capture;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod layout;
pub mod protocol;
pub mod restore;
pub mod retention;
pub mod revisioner;
mod xml;

#[cfg(test)]
mod fixtures;

pub use codec::{CodecError, Encoding, SnapshotPayload};
pub use config::{ConfigError, Dependent, MetaConfig, MetaSource, MetaValue, RevisionConfig, RevisionOptions};
pub use error::RevisionError;
pub use layout::{Backend, SnapshotTable};
pub use protocol::{RevisionContext, with_revision};
pub use retention::RetentionPolicy;
pub use revisioner::Revisioner;
