use crate::types::{Identity, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Captured state of one entity: field name to scalar, nested entity,
/// sequence of nested entities, or membership identities.
///
/// Field order is canonical (BTreeMap), so two captures of the same state
/// encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeTree {
    fields: BTreeMap<String, Attribute>,
}

/// A single entry of an [`AttributeTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Scalar(Value),
    /// To-one association; `None` when no related entity exists.
    One(Option<Box<AttributeTree>>),
    /// To-many association in the host's iteration order.
    Many(Vec<AttributeTree>),
    /// To-many-through association: member identities only.
    Members(Vec<Identity>),
}

impl AttributeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, attribute: Attribute) {
        self.fields.insert(name.into(), attribute);
    }

    pub fn set_scalar(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.insert(name, Attribute::Scalar(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.fields.get(name)
    }

    /// The scalar stored under `name`, if the entry exists and is a scalar.
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.fields.get(name) {
            Some(Attribute::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        self.fields.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl IntoIterator for AttributeTree {
    type Item = (String, Attribute);
    type IntoIter = std::collections::btree_map::IntoIter<String, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(String, Attribute)> for AttributeTree {
    fn from_iter<I: IntoIterator<Item = (String, Attribute)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_lookup_ignores_associations() {
        let mut tree = AttributeTree::new();
        tree.set_scalar("name", "post");
        tree.insert("comments", Attribute::Many(vec![]));
        assert_eq!(tree.scalar("name"), Some(&Value::Text("post".into())));
        assert_eq!(tree.scalar("comments"), None);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn iteration_is_sorted_by_name() {
        let mut tree = AttributeTree::new();
        tree.set_scalar("zeta", 1);
        tree.set_scalar("alpha", 2);
        let names: Vec<&str> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut tree = AttributeTree::new();
        tree.set_scalar("id", 1);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json, serde_json::json!({"id": {"scalar": {"int": 1}}}));
    }
}
