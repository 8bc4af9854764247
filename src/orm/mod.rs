//! Entity metadata and the generic row mapper.
//!
//! Entity types describe themselves through an explicit, ordered field list
//! ([`EntityDescriptor`]), normally generated by `#[derive(Entity)]`. The
//! [`EntityMapper`] turns that list into SQL and converts rows both ways.

pub mod field;
pub mod mapper;

use crate::core::{Result, Value};

pub use field::FieldValue;
pub use mapper::EntityMapper;

/// Storage class of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    /// Stored by variant name
    Enum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Column name
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind, nullable: bool) -> Self {
        Self {
            name,
            kind,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Simple type name, the default table name
    pub type_name: &'static str,
    /// Table override from `#[entity(table = "...")]`
    pub table: Option<&'static str>,
    /// Target database understands `replace into`
    pub replace_supported: bool,
    /// Target database understands `insert ignore`
    pub ignore_supported: bool,
    pub fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    pub fn new(type_name: &'static str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            type_name,
            table: None,
            replace_supported: false,
            ignore_supported: false,
            fields,
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.table.unwrap_or(self.type_name)
    }
}

/// A record type stored in the sharded tables.
///
/// Field indexes refer to positions in [`Entity::entity_descriptor`]'s field
/// list. Mapping starts from `T::default()`, so columns absent from a result
/// keep their default value.
pub trait Entity: Default + Send + Sync + 'static {
    fn entity_descriptor() -> EntityDescriptor;

    fn read_field(&self, index: usize) -> Value;

    fn write_field(&mut self, index: usize, value: Value) -> Result<()>;
}
