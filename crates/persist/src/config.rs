//! Per-type revisioning options.
//!
//! [`RevisionOptions`] is the runtime form. It can be built in code or
//! loaded from a [`RevisionConfig`] document:
//!
//! ```yaml
//! associations: [one_thing, tags, {many_things: [sub_things]}]
//! limit: 3
//! minimum_age: 3600
//! on_update: true
//! on_destroy: true
//! dependent: keep
//! encoding: json
//! meta:
//!   updated_by: {field: updated_by}
//!   version: {literal: 1}
//! ```

use crate::codec::Encoding;
use crate::error::RevisionError;
use crate::retention::RetentionPolicy;
use chrono::Duration;
use revisionable_common::{AssociationSpec, Value};
use revisionable_kernel::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Errors from loading revisioning configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("meta literal `{name}` must be a scalar")]
    NonScalarLiteral { name: String },
    #[error("minimum_age of {0} seconds is out of range")]
    AgeOutOfRange(u64),
}

/// What happens to an entity's snapshots when the entity is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependent {
    /// Delete every snapshot along with the entity.
    #[default]
    Destroy,
    /// Keep history; with `on_destroy` the final state becomes a trashed snapshot.
    Keep,
}

type ComputeFn = dyn Fn(&Record) -> Value + Send + Sync;

/// Source of an extension column value, resolved at capture time.
#[derive(Clone)]
pub enum MetaValue {
    /// Copy the named field of the captured record.
    Field(String),
    Computed(Arc<ComputeFn>),
    Literal(Value),
}

impl MetaValue {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn computed(f: impl Fn(&Record) -> Value + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn resolve(&self, record: &Record) -> Result<Value, RevisionError> {
        match self {
            Self::Field(name) => record.get(name).cloned().ok_or_else(|| RevisionError::UnknownField {
                entity_type: record.entity_type().to_owned(),
                field: name.clone(),
            }),
            Self::Computed(f) => Ok(f(record)),
            Self::Literal(value) => Ok(value.clone()),
        }
    }
}

impl fmt::Debug for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.debug_tuple("Field").field(name).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
        }
    }
}

/// Revisioning behavior of one entity type.
#[derive(Debug, Clone, Default)]
pub struct RevisionOptions {
    pub associations: AssociationSpec,
    /// Number of eligible snapshots kept by truncation.
    pub limit: Option<usize>,
    /// Snapshots younger than this are never truncated.
    pub minimum_age: Option<Duration>,
    /// Wrap [`crate::Revisioner::update`] in the revision protocol.
    pub on_update: bool,
    /// Wrap [`crate::Revisioner::destroy`] in the revision protocol.
    pub on_destroy: bool,
    pub dependent: Dependent,
    pub encoding: Encoding,
    /// Extension column name to value source.
    pub meta: BTreeMap<String, MetaValue>,
}

impl RevisionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_associations(mut self, spec: AssociationSpec) -> Self {
        self.associations = spec;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_minimum_age(mut self, age: Duration) -> Self {
        self.minimum_age = Some(age);
        self
    }

    pub fn with_on_update(mut self, on: bool) -> Self {
        self.on_update = on;
        self
    }

    pub fn with_on_destroy(mut self, on: bool) -> Self {
        self.on_destroy = on;
        self
    }

    pub fn with_dependent(mut self, dependent: Dependent) -> Self {
        self.dependent = dependent;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_meta(mut self, column: impl Into<String>, value: MetaValue) -> Self {
        self.meta.insert(column.into(), value);
        self
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            limit: self.limit,
            minimum_age: self.minimum_age,
        }
    }

    /// Resolve every meta entry against a record.
    pub fn extensions(&self, record: &Record) -> Result<BTreeMap<String, Value>, RevisionError> {
        self.meta
            .iter()
            .map(|(column, source)| Ok((column.clone(), source.resolve(record)?)))
            .collect()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str::<RevisionConfig>(text)?.try_into()
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<RevisionConfig>(text)?.try_into()
    }
}

/// Declarative form of [`RevisionOptions`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RevisionConfig {
    pub associations: AssociationSpec,
    pub limit: Option<usize>,
    /// Seconds.
    pub minimum_age: Option<u64>,
    pub on_update: bool,
    pub on_destroy: bool,
    pub dependent: Dependent,
    pub encoding: Encoding,
    pub meta: Option<MetaConfig>,
}

/// `meta` accepts one field name, a list of field names, or a map of
/// extension column to source.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MetaConfig {
    Field(String),
    Fields(Vec<String>),
    Map(BTreeMap<String, MetaSource>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaSource {
    Field(String),
    Literal(serde_json::Value),
}

impl TryFrom<RevisionConfig> for RevisionOptions {
    type Error = ConfigError;

    fn try_from(config: RevisionConfig) -> Result<Self, ConfigError> {
        let minimum_age = config
            .minimum_age
            .map(|secs| {
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or(ConfigError::AgeOutOfRange(secs))
            })
            .transpose()?;
        let meta = match config.meta {
            None => BTreeMap::new(),
            Some(MetaConfig::Field(name)) => BTreeMap::from([(name.clone(), MetaValue::Field(name))]),
            Some(MetaConfig::Fields(names)) => names
                .into_iter()
                .map(|name| (name.clone(), MetaValue::Field(name)))
                .collect(),
            Some(MetaConfig::Map(map)) => map
                .into_iter()
                .map(|(column, source)| {
                    let value = match source {
                        MetaSource::Field(field) => MetaValue::Field(field),
                        MetaSource::Literal(literal) => MetaValue::Literal(scalar(&column, literal)?),
                    };
                    Ok((column, value))
                })
                .collect::<Result<_, ConfigError>>()?,
        };
        Ok(Self {
            associations: config.associations,
            limit: config.limit,
            minimum_age,
            on_update: config.on_update,
            on_destroy: config.on_destroy,
            dependent: config.dependent,
            encoding: config.encoding,
            meta,
        })
    }
}

fn scalar(column: &str, literal: serde_json::Value) -> Result<Value, ConfigError> {
    use serde_json::Value as Json;
    match literal {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::String(s) => Ok(Value::Text(s)),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .ok_or_else(|| ConfigError::NonScalarLiteral { name: column.to_owned() }),
        Json::Array(_) | Json::Object(_) => Err(ConfigError::NonScalarLiteral { name: column.to_owned() }),
    }
}
