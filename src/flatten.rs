//! Aggregate graph <-> table rows.
//!
//! [`Flattener`] turns one [`Aggregate`] into a [`RowBatch`] holding a row
//! for the root table, one per present owned entity and one per
//! collection element. [`Unflattener`] is its inverse over rows read back
//! from the database.

use crate::backend::Row;
use crate::codec::SqlValue;
use crate::descriptor::{
    AggregateDescriptor, CollectionField, CollectionShape, ElementKind, EmbeddedField,
    EntityDescriptor, ScalarField, ScalarType, ValueObjectDescriptor,
};
use crate::dialect::Dialect;
use crate::error::{RepositoryError, Result};
use crate::model::{Aggregate, CollectionValue, Element, Entity, Fields, Scalar, ValueObject};
use crate::schema::{
    owner_column, prefixed, CompiledSchema, TableRole, ID_COLUMN, MAP_KEY_COLUMN,
    ORDER_INDEX_COLUMN, VALUE_COLUMN, VALUE_PREFIX,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Rows destined for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
    pub table: String,
    pub role: TableRole,
    pub rows: Vec<Row>,
}

/// Everything one aggregate writes, root table first.
///
/// Every child table of the schema is present, possibly with no rows, so
/// a save can clear rows that are no longer part of the aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub tables: Vec<TableRows>,
}

impl RowBatch {
    pub fn root(&self) -> Option<&Row> {
        self.tables.first().and_then(|t| t.rows.first())
    }

    pub fn children(&self) -> &[TableRows] {
        self.tables.get(1..).unwrap_or(&[])
    }

    pub fn table(&self, name: &str) -> Option<&TableRows> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Total number of rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

fn invalid(aggregate: &str, field: &str, reason: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Argument(format!("{}.{}: {}", aggregate, field, reason))
}

/// NaN and infinities do not survive every backend (SQLite stores NaN as NULL).
fn ensure_finite(aggregate: &str, field: &str, scalar: &Scalar) -> Result<()> {
    match scalar {
        Scalar::Real(v) if !v.is_finite() => {
            Err(invalid(aggregate, field, format!("{} is not a finite real", v)))
        }
        _ => Ok(()),
    }
}

/// Converts aggregates into rows for a compiled schema.
pub struct Flattener<'a> {
    schema: &'a CompiledSchema,
    dialect: &'a dyn Dialect,
}

impl<'a> Flattener<'a> {
    pub fn new(schema: &'a CompiledSchema, dialect: &'a dyn Dialect) -> Self {
        Self { schema, dialect }
    }

    fn descriptor(&self) -> &AggregateDescriptor {
        &self.schema.descriptor
    }

    fn name(&self) -> &str {
        &self.schema.descriptor.name
    }

    /// Flatten `aggregate`, validating it against the descriptor first.
    pub fn flatten(&self, aggregate: &Aggregate) -> Result<RowBatch> {
        self.reject_unknown_fields(aggregate)?;

        let owner_id = self.dialect.encode_uuid(&aggregate.id);
        let mut tables = Vec::with_capacity(self.schema.tables.len());

        let mut root = Row::new().with(ID_COLUMN, owner_id.clone());
        self.write_scalars(&mut root, "", &self.descriptor().scalars, &aggregate.scalars, "")?;
        for field in &self.descriptor().embedded {
            let value = aggregate.embedded.get(&field.name).and_then(Option::as_ref);
            self.write_embedded(&mut root, "", field, value, "")?;
        }
        tables.push(TableRows {
            table: self.schema.root().name.clone(),
            role: TableRole::AggregateRoot,
            rows: vec![root],
        });

        for field in &self.descriptor().entities {
            let table = self.schema.entity_table(&field.name).ok_or_else(|| {
                RepositoryError::Schema(format!("no table for entity '{}'", field.name))
            })?;

            let mut rows = Vec::new();
            match aggregate.entities.get(&field.name).and_then(Option::as_ref) {
                Some(entity) => {
                    let mut row = Row::new()
                        .with(ID_COLUMN, self.dialect.encode_uuid(&entity.id))
                        .with(owner_column(self.name()), owner_id.clone());
                    self.write_entity(&mut row, "", &field.entity, entity, &field.name)?;
                    rows.push(row);
                }
                None if !field.nullable => {
                    return Err(invalid(self.name(), &field.name, "required entity is missing"));
                }
                None => {}
            }

            tables.push(TableRows {
                table: table.name.clone(),
                role: table.role.clone(),
                rows,
            });
        }

        for field in &self.descriptor().collections {
            let table = self.schema.collection_table(&field.name).ok_or_else(|| {
                RepositoryError::Schema(format!("no table for collection '{}'", field.name))
            })?;

            let rows = match aggregate.collections.get(&field.name).and_then(Option::as_ref) {
                Some(value) => self.collection_rows(field, value, &owner_id)?,
                None => Vec::new(),
            };

            tables.push(TableRows {
                table: table.name.clone(),
                role: table.role.clone(),
                rows,
            });
        }

        Ok(RowBatch { tables })
    }

    fn reject_unknown_fields(&self, aggregate: &Aggregate) -> Result<()> {
        let descriptor = self.descriptor();
        let unknown = aggregate
            .scalars
            .keys()
            .find(|k| descriptor.scalar(k).is_none())
            .or_else(|| {
                aggregate
                    .embedded
                    .keys()
                    .find(|k| !descriptor.embedded.iter().any(|e| &e.name == *k))
            })
            .or_else(|| {
                aggregate
                    .entities
                    .keys()
                    .find(|k| !descriptor.entities.iter().any(|e| &e.name == *k))
            })
            .or_else(|| {
                aggregate
                    .collections
                    .keys()
                    .find(|k| descriptor.collection(k).is_none())
            });

        match unknown {
            Some(field) => Err(invalid(self.name(), field, "unknown field")),
            None => Ok(()),
        }
    }

    fn write_scalars(
        &self,
        row: &mut Row,
        prefix: &str,
        fields: &[ScalarField],
        values: &Fields,
        path: &str,
    ) -> Result<()> {
        if let Some(unknown) = values.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
            return Err(invalid(self.name(), &join_path(path, unknown), "unknown field"));
        }

        for field in fields {
            let value = values.get(&field.name).and_then(Option::as_ref);
            match value {
                Some(scalar) if scalar.scalar_type() != field.scalar_type => {
                    return Err(invalid(
                        self.name(),
                        &join_path(path, &field.name),
                        format!("expected {}, got {}", field.scalar_type, scalar.scalar_type()),
                    ));
                }
                Some(scalar) => {
                    ensure_finite(self.name(), &join_path(path, &field.name), scalar)?;
                }
                None if !field.nullable => {
                    return Err(invalid(
                        self.name(),
                        &join_path(path, &field.name),
                        "required value is missing",
                    ));
                }
                None => {}
            }
            row.insert(prefixed(prefix, &field.name), self.dialect.encode_nullable(value));
        }
        Ok(())
    }

    fn write_value_object(
        &self,
        row: &mut Row,
        prefix: &str,
        descriptor: &ValueObjectDescriptor,
        value: &ValueObject,
        path: &str,
    ) -> Result<()> {
        self.write_scalars(row, prefix, &descriptor.fields, &value.fields, path)
    }

    fn write_embedded(
        &self,
        row: &mut Row,
        prefix: &str,
        field: &EmbeddedField,
        value: Option<&ValueObject>,
        path: &str,
    ) -> Result<()> {
        let group = format!("{}{}_", prefix, field.name);
        let path = join_path(path, &field.name);
        match value {
            Some(vo) => self.write_value_object(row, &group, &field.value_object, vo, &path),
            None if field.nullable => {
                for f in &field.value_object.fields {
                    row.insert(prefixed(&group, &f.name), SqlValue::Null);
                }
                Ok(())
            }
            None => Err(invalid(self.name(), &path, "required value object is missing")),
        }
    }

    /// Entity columns except the id, which lives under different names in
    /// entity and junction tables.
    fn write_entity(
        &self,
        row: &mut Row,
        prefix: &str,
        descriptor: &EntityDescriptor,
        entity: &Entity,
        path: &str,
    ) -> Result<()> {
        self.write_scalars(row, prefix, &descriptor.fields, &entity.fields, path)?;

        if let Some(unknown) = entity
            .embedded
            .keys()
            .find(|k| !descriptor.embedded.iter().any(|e| &e.name == *k))
        {
            return Err(invalid(self.name(), &join_path(path, unknown), "unknown field"));
        }
        for field in &descriptor.embedded {
            let value = entity.embedded.get(&field.name).and_then(Option::as_ref);
            self.write_embedded(row, prefix, field, value, path)?;
        }
        Ok(())
    }

    fn write_element(
        &self,
        row: &mut Row,
        kind: &ElementKind,
        element: &Element,
        path: &str,
    ) -> Result<()> {
        match (kind, element) {
            (ElementKind::Primitive(ty), Element::Primitive(scalar)) => {
                if scalar.scalar_type() != *ty {
                    return Err(invalid(
                        self.name(),
                        path,
                        format!("expected {} element, got {}", ty, scalar.scalar_type()),
                    ));
                }
                ensure_finite(self.name(), path, scalar)?;
                row.insert(VALUE_COLUMN, self.dialect.encode(scalar));
                Ok(())
            }
            (ElementKind::ValueObject(descriptor), Element::ValueObject(vo)) => {
                self.write_value_object(row, VALUE_PREFIX, descriptor, vo, path)
            }
            (ElementKind::Entity(descriptor), Element::Entity(entity)) => {
                row.insert(
                    prefixed(VALUE_PREFIX, ID_COLUMN),
                    self.dialect.encode_uuid(&entity.id),
                );
                self.write_entity(row, VALUE_PREFIX, descriptor, entity, path)
            }
            _ => Err(invalid(
                self.name(),
                path,
                format!("element does not match declared {}", element_kind_name(kind)),
            )),
        }
    }

    fn collection_rows(
        &self,
        field: &CollectionField,
        value: &CollectionValue,
        owner_id: &SqlValue,
    ) -> Result<Vec<Row>> {
        let owner = owner_column(self.name());
        let path = field.name.as_str();

        let rows = match (&field.shape, value) {
            (CollectionShape::List(kind), CollectionValue::List(items)) => {
                let mut rows = Vec::with_capacity(items.len());
                for (index, element) in items.iter().enumerate() {
                    let mut row = Row::new()
                        .with(owner.clone(), owner_id.clone())
                        .with(ORDER_INDEX_COLUMN, SqlValue::Integer(index as i64));
                    self.write_element(&mut row, kind, element, path)?;
                    rows.push(row);
                }
                rows
            }
            (CollectionShape::Set(kind), CollectionValue::Set(items)) => {
                let mut unique: Vec<&Element> = Vec::with_capacity(items.len());
                for element in items {
                    if unique.contains(&element) {
                        continue;
                    }
                    if let Element::Entity(entity) = element {
                        let clash = unique
                            .iter()
                            .any(|e| e.as_entity().is_some_and(|other| other.id == entity.id));
                        if clash {
                            return Err(invalid(
                                self.name(),
                                path,
                                format!("set holds two different entities with id {}", entity.id),
                            ));
                        }
                    }
                    unique.push(element);
                }

                let mut rows = Vec::with_capacity(unique.len());
                for element in unique {
                    let mut row = Row::new().with(owner.clone(), owner_id.clone());
                    self.write_element(&mut row, kind, element, path)?;
                    rows.push(row);
                }
                rows
            }
            (CollectionShape::Map { key, value: kind }, CollectionValue::Map(entries)) => {
                let mut rows = Vec::with_capacity(entries.len());
                for (i, (map_key, element)) in entries.iter().enumerate() {
                    if map_key.scalar_type() != *key {
                        return Err(invalid(
                            self.name(),
                            path,
                            format!("expected {} key, got {}", key, map_key.scalar_type()),
                        ));
                    }
                    ensure_finite(self.name(), path, map_key)?;
                    if entries[..i].iter().any(|(k, _)| k == map_key) {
                        return Err(invalid(self.name(), path, "map holds a duplicate key"));
                    }
                    let mut row = Row::new()
                        .with(owner.clone(), owner_id.clone())
                        .with(MAP_KEY_COLUMN, self.dialect.encode(map_key));
                    self.write_element(&mut row, kind, element, path)?;
                    rows.push(row);
                }
                rows
            }
            (shape, value) => {
                return Err(invalid(
                    self.name(),
                    path,
                    format!(
                        "declared as {} but given a {}",
                        shape.container(),
                        value.container()
                    ),
                ));
            }
        };

        Ok(rows)
    }
}

fn join_path(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

fn element_kind_name(kind: &ElementKind) -> String {
    match kind {
        ElementKind::Primitive(ty) => ty.to_string(),
        ElementKind::ValueObject(vo) => vo.name.clone(),
        ElementKind::Entity(entity) => entity.name.clone(),
    }
}

/// Rebuilds aggregates from rows read back for a compiled schema.
pub struct Unflattener<'a> {
    schema: &'a CompiledSchema,
    dialect: &'a dyn Dialect,
}

impl<'a> Unflattener<'a> {
    pub fn new(schema: &'a CompiledSchema, dialect: &'a dyn Dialect) -> Self {
        Self { schema, dialect }
    }

    fn name(&self) -> &str {
        &self.schema.descriptor.name
    }

    fn error(&self, field: &str, reason: impl std::fmt::Display) -> RepositoryError {
        RepositoryError::deserialization(self.name(), field, reason.to_string())
    }

    /// Rebuild one aggregate.
    ///
    /// `entity_rows` and `collection_rows` are keyed by field name. An
    /// entity row whose id is NULL counts as absent; a collection with no
    /// rows loads as an empty container.
    pub fn unflatten(
        &self,
        root: &Row,
        entity_rows: &BTreeMap<String, Row>,
        collection_rows: &BTreeMap<String, Vec<Row>>,
    ) -> Result<Aggregate> {
        let descriptor = &self.schema.descriptor;

        let id = self.read_uuid(root, ID_COLUMN, ID_COLUMN)?;
        let mut aggregate = Aggregate::new(id);

        aggregate.scalars = self.read_scalars(root, "", &descriptor.scalars, "")?;
        for field in &descriptor.embedded {
            let value = self.read_embedded(root, "", field, "")?;
            aggregate.embedded.insert(field.name.clone(), value);
        }

        for field in &descriptor.entities {
            let row = entity_rows
                .get(&field.name)
                .filter(|row| !row.get(ID_COLUMN).is_null());

            let entity = match row {
                Some(row) => Some(self.read_entity(row, "", &field.entity, &field.name)?),
                None if field.nullable => None,
                None => return Err(self.error(&field.name, "required entity row is missing")),
            };
            aggregate.entities.insert(field.name.clone(), entity);
        }

        for field in &descriptor.collections {
            let rows = collection_rows
                .get(&field.name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let value = self.read_collection(field, rows)?;
            aggregate.collections.insert(field.name.clone(), Some(value));
        }

        Ok(aggregate)
    }

    fn read_uuid(&self, row: &Row, column: &str, field: &str) -> Result<Uuid> {
        let value = row.get(column);
        if value.is_null() {
            return Err(self.error(field, "identifier is NULL"));
        }
        self.dialect
            .decode_uuid(value)
            .map_err(|e| self.error(field, e))
    }

    fn read_scalar(
        &self,
        row: &Row,
        column: &str,
        scalar_type: ScalarType,
        nullable: bool,
        field: &str,
    ) -> Result<Option<Scalar>> {
        let value = row.get(column);
        if value.is_null() {
            if nullable {
                return Ok(None);
            }
            return Err(self.error(field, "is NULL but required"));
        }
        self.dialect
            .decode(value, scalar_type)
            .map(Some)
            .map_err(|e| self.error(field, e))
    }

    fn read_scalars(
        &self,
        row: &Row,
        prefix: &str,
        fields: &[ScalarField],
        path: &str,
    ) -> Result<Fields> {
        let mut values = Fields::new();
        for field in fields {
            let value = self.read_scalar(
                row,
                &prefixed(prefix, &field.name),
                field.scalar_type,
                field.nullable,
                &join_path(path, &field.name),
            )?;
            values.insert(field.name.clone(), value);
        }
        Ok(values)
    }

    /// A nullable value object whose columns are all NULL reads as `None`.
    fn read_value_object(
        &self,
        row: &Row,
        prefix: &str,
        descriptor: &ValueObjectDescriptor,
        nullable: bool,
        path: &str,
    ) -> Result<Option<ValueObject>> {
        let all_null = descriptor
            .fields
            .iter()
            .all(|f| row.get(&prefixed(prefix, &f.name)).is_null());
        if nullable && all_null {
            return Ok(None);
        }

        let fields = self.read_scalars(row, prefix, &descriptor.fields, path)?;
        Ok(Some(ValueObject { fields }))
    }

    fn read_embedded(
        &self,
        row: &Row,
        prefix: &str,
        field: &EmbeddedField,
        path: &str,
    ) -> Result<Option<ValueObject>> {
        let group = format!("{}{}_", prefix, field.name);
        self.read_value_object(
            row,
            &group,
            &field.value_object,
            field.nullable,
            &join_path(path, &field.name),
        )
    }

    fn read_entity(
        &self,
        row: &Row,
        prefix: &str,
        descriptor: &EntityDescriptor,
        path: &str,
    ) -> Result<Entity> {
        let id = self.read_uuid(row, &prefixed(prefix, ID_COLUMN), &join_path(path, ID_COLUMN))?;
        let mut entity = Entity::new(id);
        entity.fields = self.read_scalars(row, prefix, &descriptor.fields, path)?;
        for field in &descriptor.embedded {
            let value = self.read_embedded(row, prefix, field, path)?;
            entity.embedded.insert(field.name.clone(), value);
        }
        Ok(entity)
    }

    fn read_element(&self, row: &Row, kind: &ElementKind, path: &str) -> Result<Element> {
        match kind {
            ElementKind::Primitive(ty) => self
                .read_scalar(row, VALUE_COLUMN, *ty, false, path)?
                .map(Element::Primitive)
                .ok_or_else(|| self.error(path, "element is NULL")),
            ElementKind::ValueObject(descriptor) => self
                .read_value_object(row, VALUE_PREFIX, descriptor, false, path)?
                .map(Element::ValueObject)
                .ok_or_else(|| self.error(path, "element is NULL")),
            ElementKind::Entity(descriptor) => self
                .read_entity(row, VALUE_PREFIX, descriptor, path)
                .map(Element::Entity),
        }
    }

    fn read_collection(&self, field: &CollectionField, rows: &[Row]) -> Result<CollectionValue> {
        let path = field.name.as_str();

        match &field.shape {
            CollectionShape::List(kind) => {
                let mut indexed = Vec::with_capacity(rows.len());
                for row in rows {
                    let index = row.get(ORDER_INDEX_COLUMN).as_i64().ok_or_else(|| {
                        self.error(&join_path(path, ORDER_INDEX_COLUMN), "is not an integer")
                    })?;
                    indexed.push((index, self.read_element(row, kind, path)?));
                }
                indexed.sort_by_key(|(index, _)| *index);
                Ok(CollectionValue::List(
                    indexed.into_iter().map(|(_, element)| element).collect(),
                ))
            }
            CollectionShape::Set(kind) => {
                let elements = rows
                    .iter()
                    .map(|row| self.read_element(row, kind, path))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CollectionValue::set(elements))
            }
            CollectionShape::Map { key, value } => {
                let mut entries = Vec::with_capacity(rows.len());
                for row in rows {
                    let map_key = self
                        .read_scalar(row, MAP_KEY_COLUMN, *key, false, &join_path(path, MAP_KEY_COLUMN))?
                        .ok_or_else(|| self.error(path, "map key is NULL"))?;
                    entries.push((map_key, self.read_element(row, value, path)?));
                }
                Ok(CollectionValue::Map(entries))
            }
        }
    }
}
