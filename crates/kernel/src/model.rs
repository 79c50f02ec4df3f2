use crate::record::Record;
use crate::store::StoreError;
use revisionable_common::{AssociationKind, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Uuid,
    Timestamp,
    Any,
}

impl FieldKind {
    /// Whether a value may be stored in a column of this kind. Null is always
    /// accepted here; nullability is checked on save.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Any, _)
                | (Self::Bool, Value::Bool(_))
                | (Self::Int, Value::Int(_))
                | (Self::Float, Value::Float(_))
                | (Self::Text, Value::Text(_))
                | (Self::Bytes, Value::Bytes(_))
                | (Self::Uuid, Value::Uuid(_))
                | (Self::Timestamp, Value::Timestamp(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Not assignable through public assignment (protected attribute).
    pub read_only: bool,
}

/// What happens to a to-many child that is dropped from its owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Removal {
    #[default]
    Delete,
    /// Clear the foreign key and keep the row.
    Nullify,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssociationDef {
    pub name: String,
    pub kind: AssociationKind,
    pub target: String,
    /// Columns on the target referencing the owner's key, in key order.
    /// Empty for to-many-through.
    pub foreign_key: Vec<String>,
    pub removal: Removal,
}

impl AssociationDef {
    pub fn to_one(name: &str, target: &str, foreign_key: &[&str]) -> Self {
        Self::keyed(name, AssociationKind::ToOne, target, foreign_key)
    }

    pub fn to_many(name: &str, target: &str, foreign_key: &[&str]) -> Self {
        Self::keyed(name, AssociationKind::ToMany, target, foreign_key)
    }

    pub fn to_many_through(name: &str, target: &str) -> Self {
        Self::keyed(name, AssociationKind::ToManyThrough, target, &[])
    }

    pub fn nullify_on_remove(mut self) -> Self {
        self.removal = Removal::Nullify;
        self
    }

    fn keyed(name: &str, kind: AssociationKind, target: &str, foreign_key: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            target: target.to_owned(),
            foreign_key: foreign_key.iter().map(|c| (*c).to_owned()).collect(),
            removal: Removal::Delete,
        }
    }
}

/// Static description of one entity type.
///
/// Type names may be namespaced with `::` (`Archive::Document`); the
/// namespace is everything before the last separator.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityModel {
    name: String,
    parent: Option<String>,
    primary_key: Vec<String>,
    fields: Vec<FieldDef>,
    associations: Vec<AssociationDef>,
    inheritance_column: Option<String>,
    store_full_type_name: Option<bool>,
}

impl EntityModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            parent: None,
            primary_key: Vec::new(),
            fields: Vec::new(),
            associations: Vec::new(),
            inheritance_column: None,
            store_full_type_name: None,
        }
    }

    /// Declare a single-column primary key.
    pub fn key(self, name: &str, kind: FieldKind) -> Self {
        self.composite_key(&[(name, kind)])
    }

    /// Declare a primary key spanning several columns, in key order.
    pub fn composite_key(mut self, columns: &[(&str, FieldKind)]) -> Self {
        for (name, kind) in columns {
            self.push_field(name, *kind, true, false);
            self.primary_key.push((*name).to_owned());
        }
        self
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.push_field(name, kind, true, false);
        self
    }

    /// A non-nullable field; saving a record with this field null fails validation.
    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.push_field(name, kind, false, false);
        self
    }

    pub fn read_only(mut self, name: &str, kind: FieldKind) -> Self {
        self.push_field(name, kind, true, true);
        self
    }

    pub fn association(mut self, def: AssociationDef) -> Self {
        self.associations.retain(|a| a.name != def.name);
        self.associations.push(def);
        self
    }

    pub fn has_one(self, name: &str, target: &str, foreign_key: &[&str]) -> Self {
        self.association(AssociationDef::to_one(name, target, foreign_key))
    }

    pub fn has_many(self, name: &str, target: &str, foreign_key: &[&str]) -> Self {
        self.association(AssociationDef::to_many(name, target, foreign_key))
    }

    pub fn has_many_through(self, name: &str, target: &str) -> Self {
        self.association(AssociationDef::to_many_through(name, target))
    }

    /// Declare this type a subtype stored in its parent's table.
    pub fn inherits(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_owned());
        self
    }

    /// Column holding the subtype discriminator.
    pub fn inheritance_column(mut self, column: &str) -> Self {
        self.inheritance_column = Some(column.to_owned());
        if self.field_def(column).is_none() {
            self.push_field(column, FieldKind::Text, true, false);
        }
        self
    }

    /// Whether discriminators are stored fully qualified (default) or
    /// relative to the base type's namespace.
    pub fn store_full_type_name(mut self, full: bool) -> Self {
        self.store_full_type_name = Some(full);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.name.rsplit_once("::").map(|(ns, _)| ns)
    }

    /// Type name without its namespace.
    pub fn short_name(&self) -> &str {
        self.name.rsplit_once("::").map_or(&self.name, |(_, n)| n)
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn has_composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn associations(&self) -> &[AssociationDef] {
        &self.associations
    }

    pub fn association_def(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn inheritance_column_name(&self) -> Option<&str> {
        self.inheritance_column.as_deref()
    }

    pub fn stores_full_type_name(&self) -> bool {
        self.store_full_type_name.unwrap_or(true)
    }

    /// Discriminator value written for records of this type.
    pub fn discriminator(&self) -> &str {
        if self.stores_full_type_name() {
            &self.name
        } else {
            self.short_name()
        }
    }

    fn push_field(&mut self, name: &str, kind: FieldKind, nullable: bool, read_only: bool) {
        self.fields.retain(|f| f.name != name);
        self.fields.push(FieldDef {
            name: name.to_owned(),
            kind,
            nullable,
            read_only,
        });
    }

    /// Fill in everything this subtype does not declare itself from its parent.
    fn inherit_from(mut self, parent: &EntityModel) -> Self {
        let own_fields = std::mem::take(&mut self.fields);
        let own_associations = std::mem::take(&mut self.associations);
        self.fields = parent.fields.clone();
        for field in own_fields {
            self.fields.retain(|f| f.name != field.name);
            self.fields.push(field);
        }
        self.associations = parent.associations.clone();
        for assoc in own_associations {
            self = self.association(assoc);
        }
        if self.primary_key.is_empty() {
            self.primary_key = parent.primary_key.clone();
        }
        if self.inheritance_column.is_none() {
            self.inheritance_column = parent.inheritance_column.clone();
        }
        if self.store_full_type_name.is_none() {
            self.store_full_type_name = parent.store_full_type_name;
        }
        self
    }
}

/// Registry of entity models: name to model, used both for reflection and
/// as the constructor table when resolving stored discriminators.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: BTreeMap<String, Arc<EntityModel>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. Subtypes must be registered after their parent.
    pub fn register(&mut self, model: EntityModel) -> Result<Arc<EntityModel>, StoreError> {
        if self.models.contains_key(&model.name) {
            return Err(StoreError::DuplicateEntityType(model.name));
        }
        let model = match model.parent.clone() {
            Some(parent) => {
                let parent = self.model(&parent)?;
                model.inherit_from(&parent)
            }
            None => model,
        };
        let model = Arc::new(model);
        self.models.insert(model.name.clone(), Arc::clone(&model));
        Ok(model)
    }

    /// Builder form of [`Schema::register`].
    pub fn with(mut self, model: EntityModel) -> Result<Self, StoreError> {
        self.register(model)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityModel>> {
        self.models.get(name)
    }

    pub fn model(&self, name: &str) -> Result<Arc<EntityModel>, StoreError> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntityType(name.to_owned()))
    }

    /// Root of the inheritance chain of `name`.
    pub fn base_type<'a>(&'a self, name: &'a str) -> Result<&'a str, StoreError> {
        let mut current = self
            .models
            .get(name)
            .ok_or_else(|| StoreError::UnknownEntityType(name.to_owned()))?;
        while let Some(parent) = current.parent() {
            current = self.models.get(parent).ok_or_else(|| StoreError::UnknownEntityType(parent.to_owned()))?;
        }
        Ok(current.name())
    }

    /// Whether `name` is `ancestor` or one of its subtypes.
    pub fn is_a(&self, name: &str, ancestor: &str) -> bool {
        let mut current = Some(name);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.models.get(n).and_then(|m| m.parent());
        }
        false
    }

    /// Construct a fresh, unsaved record of the named type.
    pub fn new_record(&self, name: &str) -> Result<Record, StoreError> {
        Ok(Record::new(self.model(name)?))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
