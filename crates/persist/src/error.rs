use crate::codec::CodecError;
use crate::config::ConfigError;
use revisionable_kernel::StoreError;

/// Errors raised by the revision engine.
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A stored discriminator names a type that is not registered as a
    /// subtype of the snapshot's base type.
    #[error("cannot resolve subtype `{discriminator}` of {base_type}")]
    UnknownSubtype {
        base_type: String,
        discriminator: String,
    },
    #[error("{entity_type} has no association `{association}`")]
    UnknownAssociation {
        entity_type: String,
        association: String,
    },
    #[error("{entity_type} has no field `{field}`")]
    UnknownField { entity_type: String, field: String },
    #[error("attribute `{attribute}` of {entity_type} is not {expected}")]
    Malformed {
        entity_type: String,
        attribute: String,
        expected: &'static str,
    },
    #[error("{found} is not a {expected}")]
    WrongEntityType { expected: String, found: String },
    #[error("{entity_type} {id} could not be saved: {}", .messages.join(", "))]
    CommitFailed {
        entity_type: String,
        id: String,
        messages: Vec<String>,
    },
}
