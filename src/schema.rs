use crate::descriptor::{
    AggregateDescriptor, CollectionField, CollectionShape, ElementKind, EmbeddedField,
    EntityDescriptor, ScalarField, ScalarType, ValueObjectDescriptor,
};
use crate::dialect::Dialect;
use std::fmt;

pub const ID_COLUMN: &str = "id";
pub const ORDER_INDEX_COLUMN: &str = "order_index";
pub const MAP_KEY_COLUMN: &str = "map_key";
pub const VALUE_COLUMN: &str = "value";
/// Prefix of flattened value-object and entity columns in junction tables.
pub const VALUE_PREFIX: &str = "value_";

/// Column holding the owning aggregate's id in child tables.
pub fn owner_column(aggregate: &str) -> String {
    format!("{}_id", aggregate)
}

/// `price` + `amount` => `price_amount`.
pub fn prefixed(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnDelete::Cascade => write!(f, "CASCADE"),
        }
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub sql_type: String,
    pub semantic_type: ScalarType,
    pub nullable: bool,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDefinition {
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub on_delete: OnDelete,
}

/// What a table stores, used to route rows during flatten/unflatten.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRole {
    AggregateRoot,
    OwnedEntity { field: String },
    Collection { field: String },
}

/// Table schema
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    pub unique_constraints: Vec<Vec<String>>,
    pub role: TableRole,
    pub is_aggregate_root: bool,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Column referencing the aggregate root, for child tables.
    pub fn owner_column(&self) -> Option<&str> {
        self.foreign_keys.first().map(|fk| fk.column_name.as_str())
    }
}

/// Output of the compiler: the descriptor and its tables, root first.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub descriptor: AggregateDescriptor,
    pub tables: Vec<TableDefinition>,
}

impl CompiledSchema {
    pub fn aggregate_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn root(&self) -> &TableDefinition {
        // The compiler always emits the root first.
        &self.tables[0]
    }

    pub fn children(&self) -> &[TableDefinition] {
        &self.tables[1..]
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn entity_table(&self, field: &str) -> Option<&TableDefinition> {
        self.tables
            .iter()
            .find(|t| matches!(&t.role, TableRole::OwnedEntity { field: f } if f == field))
    }

    pub fn collection_table(&self, field: &str) -> Option<&TableDefinition> {
        self.tables
            .iter()
            .find(|t| matches!(&t.role, TableRole::Collection { field: f } if f == field))
    }

    /// CREATE TABLE IF NOT EXISTS statements, parents before children.
    pub fn create_statements(&self, dialect: &dyn Dialect) -> Vec<String> {
        self.tables
            .iter()
            .map(|t| dialect.create_table_if_not_exists(t))
            .collect()
    }

    /// DROP TABLE IF EXISTS statements, children before parents.
    pub fn drop_statements(&self, dialect: &dyn Dialect) -> Vec<String> {
        self.tables
            .iter()
            .rev()
            .map(|t| dialect.drop_table_if_exists(&t.name))
            .collect()
    }

    /// All DDL joined into one script.
    pub fn generate_ddl(&self, dialect: &dyn Dialect) -> String {
        self.create_statements(dialect).join("\n\n")
    }
}

/// Turns an aggregate descriptor into table definitions.
///
/// Pure: the same descriptor and dialect always produce the same tables
/// in the same order.
pub struct SchemaCompiler<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SchemaCompiler<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn compile(&self, descriptor: &AggregateDescriptor) -> CompiledSchema {
        let mut tables = vec![self.root_table(descriptor)];

        for field in &descriptor.entities {
            tables.push(self.entity_table(descriptor, &field.name, &field.entity));
        }

        for field in &descriptor.collections {
            tables.push(self.collection_table(descriptor, field));
        }

        CompiledSchema {
            descriptor: descriptor.clone(),
            tables,
        }
    }

    fn column(&self, name: String, ty: ScalarType, nullable: bool, keyed: bool) -> ColumnDefinition {
        ColumnDefinition {
            name,
            sql_type: self.dialect.column_type(ty, keyed),
            semantic_type: ty,
            nullable,
            is_primary_key: false,
        }
    }

    fn primary_key(&self, name: &str) -> ColumnDefinition {
        ColumnDefinition {
            is_primary_key: true,
            ..self.column(name.to_string(), ScalarType::Uuid, false, true)
        }
    }

    fn scalar_columns(&self, prefix: &str, fields: &[ScalarField], keyed: bool) -> Vec<ColumnDefinition> {
        fields
            .iter()
            .map(|f| self.column(prefixed(prefix, &f.name), f.scalar_type, f.nullable, keyed))
            .collect()
    }

    /// Columns of a value object; every column is nullable when the
    /// value object itself is.
    fn value_object_columns(
        &self,
        prefix: &str,
        vo: &ValueObjectDescriptor,
        nullable: bool,
        keyed: bool,
    ) -> Vec<ColumnDefinition> {
        vo.fields
            .iter()
            .map(|f| {
                self.column(
                    prefixed(prefix, &f.name),
                    f.scalar_type,
                    nullable || f.nullable,
                    keyed,
                )
            })
            .collect()
    }

    fn embedded_columns(&self, prefix: &str, embedded: &[EmbeddedField]) -> Vec<ColumnDefinition> {
        embedded
            .iter()
            .flat_map(|e| {
                let group = format!("{}{}_", prefix, e.name);
                self.value_object_columns(&group, &e.value_object, e.nullable, false)
            })
            .collect()
    }

    fn entity_columns(&self, prefix: &str, entity: &EntityDescriptor) -> Vec<ColumnDefinition> {
        let mut columns = self.scalar_columns(prefix, &entity.fields, false);
        columns.extend(self.embedded_columns(prefix, &entity.embedded));
        columns
    }

    fn owner_foreign_key(&self, descriptor: &AggregateDescriptor) -> ForeignKeyDefinition {
        ForeignKeyDefinition {
            column_name: owner_column(&descriptor.name),
            referenced_table: descriptor.name.clone(),
            referenced_column: ID_COLUMN.to_string(),
            on_delete: OnDelete::Cascade,
        }
    }

    fn root_table(&self, descriptor: &AggregateDescriptor) -> TableDefinition {
        let mut columns = vec![self.primary_key(ID_COLUMN)];
        columns.extend(self.scalar_columns("", &descriptor.scalars, false));
        columns.extend(self.embedded_columns("", &descriptor.embedded));

        TableDefinition {
            name: descriptor.name.clone(),
            columns,
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            role: TableRole::AggregateRoot,
            is_aggregate_root: true,
        }
    }

    fn entity_table(
        &self,
        descriptor: &AggregateDescriptor,
        field: &str,
        entity: &EntityDescriptor,
    ) -> TableDefinition {
        let owner = owner_column(&descriptor.name);
        let mut columns = vec![
            self.primary_key(ID_COLUMN),
            self.column(owner.clone(), ScalarType::Uuid, false, true),
        ];
        columns.extend(self.entity_columns("", entity));

        TableDefinition {
            name: format!("{}_{}", descriptor.name, field),
            columns,
            foreign_keys: vec![self.owner_foreign_key(descriptor)],
            unique_constraints: vec![vec![owner]],
            role: TableRole::OwnedEntity {
                field: field.to_string(),
            },
            is_aggregate_root: false,
        }
    }

    fn collection_table(
        &self,
        descriptor: &AggregateDescriptor,
        field: &CollectionField,
    ) -> TableDefinition {
        let owner = owner_column(&descriptor.name);
        let mut columns = vec![self.column(owner.clone(), ScalarType::Uuid, false, true)];
        let mut unique = vec![owner];

        // Set elements participate in the uniqueness constraint.
        let element_keyed = matches!(field.shape, CollectionShape::Set(_));

        match &field.shape {
            CollectionShape::List(_) => {
                columns.push(self.column(
                    ORDER_INDEX_COLUMN.to_string(),
                    ScalarType::Integer,
                    false,
                    true,
                ));
                unique.push(ORDER_INDEX_COLUMN.to_string());
            }
            CollectionShape::Map { key, .. } => {
                columns.push(self.column(MAP_KEY_COLUMN.to_string(), *key, false, true));
                unique.push(MAP_KEY_COLUMN.to_string());
            }
            CollectionShape::Set(_) => {}
        }

        let element_columns = match field.shape.element() {
            ElementKind::Primitive(ty) => {
                vec![self.column(VALUE_COLUMN.to_string(), *ty, false, element_keyed)]
            }
            ElementKind::ValueObject(vo) => {
                self.value_object_columns(VALUE_PREFIX, vo, false, element_keyed)
            }
            ElementKind::Entity(entity) => {
                let mut cols = vec![self.column(
                    prefixed(VALUE_PREFIX, ID_COLUMN),
                    ScalarType::Uuid,
                    false,
                    element_keyed,
                )];
                cols.extend(self.entity_columns(VALUE_PREFIX, entity));
                cols
            }
        };

        if element_keyed {
            match field.shape.element() {
                // Entities are unique by identity.
                ElementKind::Entity(_) => unique.push(prefixed(VALUE_PREFIX, ID_COLUMN)),
                _ => unique.extend(element_columns.iter().map(|c| c.name.clone())),
            }
        }
        columns.extend(element_columns);

        TableDefinition {
            name: format!("{}_{}_items", descriptor.name, field.name),
            columns,
            foreign_keys: vec![self.owner_foreign_key(descriptor)],
            unique_constraints: vec![unique],
            role: TableRole::Collection {
                field: field.name.clone(),
            },
            is_aggregate_root: false,
        }
    }
}
