use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a declared association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    ToOne,
    ToMany,
    /// Membership only; the related entities are never walked.
    ToManyThrough,
}

/// How an association named in a spec is included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inclusion {
    Included,
    Nested(AssociationSpec),
}

impl Inclusion {
    pub fn nested(&self) -> Option<&AssociationSpec> {
        match self {
            Self::Included => None,
            Self::Nested(spec) => Some(spec),
        }
    }
}

/// Immutable selection of the associations revisioned with an entity, and of
/// their own associations, recursively.
///
/// Deserializes from the declarative list form used in configuration files:
///
/// ```yaml
/// associations: [one_thing, tags, {many_things: [sub_things]}]
/// ```
///
/// A bare name is a leaf; a map nests; a nested value may be one name or a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "SpecInput")]
pub struct AssociationSpec {
    entries: BTreeMap<String, Inclusion>,
}

impl AssociationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include `name` as a leaf.
    pub fn include(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), Inclusion::Included);
        self
    }

    /// Include `name` and recurse into its associations per `spec`.
    pub fn nest(mut self, name: impl Into<String>, spec: AssociationSpec) -> Self {
        self.entries.insert(name.into(), Inclusion::Nested(spec));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Inclusion> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Inclusion)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nesting depth: 0 for an empty spec, 1 for leaves only.
    pub fn depth(&self) -> usize {
        self.entries
            .values()
            .map(|inclusion| 1 + inclusion.nested().map_or(0, AssociationSpec::depth))
            .max()
            .unwrap_or(0)
    }

    fn merge(&mut self, other: AssociationSpec) {
        self.entries.extend(other.entries);
    }
}

impl fmt::Display for AssociationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, inclusion)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            if let Inclusion::Nested(spec) = inclusion {
                if !spec.is_empty() {
                    write!(f, "({spec})")?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpecInput {
    Name(String),
    List(Vec<SpecInput>),
    Map(BTreeMap<String, SpecInput>),
}

impl From<SpecInput> for AssociationSpec {
    fn from(input: SpecInput) -> Self {
        match input {
            SpecInput::Name(name) => AssociationSpec::new().include(name),
            SpecInput::List(items) => {
                let mut spec = AssociationSpec::new();
                for item in items {
                    spec.merge(item.into());
                }
                spec
            }
            SpecInput::Map(map) => {
                let mut spec = AssociationSpec::new();
                for (name, nested) in map {
                    spec = spec.nest(name, nested.into());
                }
                spec
            }
        }
    }
}
