//! Declarative aggregate shapes.
//!
//! A descriptor is produced once per aggregate type by whatever
//! introspection step knows the domain types, and validated eagerly by
//! [`AggregateDescriptorBuilder::build`]. Nothing here touches a database.

use crate::error::{RepositoryError, Result};
use crate::schema::{owner_column, ID_COLUMN, VALUE_COLUMN, VALUE_PREFIX};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Semantic type of a scalar column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Uuid,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Text => "text",
            ScalarType::Integer => "integer",
            ScalarType::Real => "real",
            ScalarType::Boolean => "boolean",
            ScalarType::Timestamp => "timestamp",
            ScalarType::Uuid => "uuid",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarField {
    pub name: String,
    pub scalar_type: ScalarType,
    pub nullable: bool,
}

impl ScalarField {
    pub fn required(name: &str, scalar_type: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            scalar_type,
            nullable: false,
        }
    }

    pub fn optional(name: &str, scalar_type: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            scalar_type,
            nullable: true,
        }
    }
}

/// Identity-less type flattened into its owner's row.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueObjectDescriptor {
    pub name: String,
    pub fields: Vec<ScalarField>,
}

impl ValueObjectDescriptor {
    pub fn new(name: &str, fields: Vec<ScalarField>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }
}

/// Identity-bearing type owned by an aggregate. The `id` column is implicit.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub fields: Vec<ScalarField>,
    pub embedded: Vec<EmbeddedField>,
}

impl EntityDescriptor {
    pub fn new(name: &str, fields: Vec<ScalarField>) -> Self {
        Self {
            name: name.to_string(),
            fields,
            embedded: Vec::new(),
        }
    }

    pub fn with_embedded(mut self, field: EmbeddedField) -> Self {
        self.embedded.push(field);
        self
    }
}

/// Value object stored as a prefixed column group.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedField {
    pub name: String,
    pub value_object: ValueObjectDescriptor,
    pub nullable: bool,
}

impl EmbeddedField {
    pub fn required(name: &str, value_object: ValueObjectDescriptor) -> Self {
        Self {
            name: name.to_string(),
            value_object,
            nullable: false,
        }
    }

    pub fn optional(name: &str, value_object: ValueObjectDescriptor) -> Self {
        Self {
            name: name.to_string(),
            value_object,
            nullable: true,
        }
    }
}

/// Single owned entity stored in its own table.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityField {
    pub name: String,
    pub entity: EntityDescriptor,
    pub nullable: bool,
}

/// Declared type of a collection element or key, as reported by
/// introspection. Only some of these are storable.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Scalar(ScalarType),
    ValueObject(ValueObjectDescriptor),
    Entity(EntityDescriptor),
    /// Another aggregate root, named by type.
    AggregateRoot(String),
    /// A collection type, e.g. `List<String>`.
    Collection(String),
    /// Untyped / dynamic element.
    Dynamic,
}

impl TypeRef {
    fn type_name(&self) -> String {
        match self {
            TypeRef::Scalar(ty) => ty.name().to_string(),
            TypeRef::ValueObject(vo) => vo.name.clone(),
            TypeRef::Entity(entity) => entity.name.clone(),
            TypeRef::AggregateRoot(name) => name.clone(),
            TypeRef::Collection(name) => name.clone(),
            TypeRef::Dynamic => "dynamic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    List,
    Set,
    Map,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::List => write!(f, "List"),
            ContainerKind::Set => write!(f, "Set"),
            ContainerKind::Map => write!(f, "Map"),
        }
    }
}

/// Unvalidated collection declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionDecl {
    pub name: String,
    pub container: ContainerKind,
    pub element: TypeRef,
    pub key: Option<TypeRef>,
    pub nullable: bool,
}

impl CollectionDecl {
    pub fn list(name: &str, element: TypeRef) -> Self {
        Self {
            name: name.to_string(),
            container: ContainerKind::List,
            element,
            key: None,
            nullable: false,
        }
    }

    pub fn set(name: &str, element: TypeRef) -> Self {
        Self {
            name: name.to_string(),
            container: ContainerKind::Set,
            element,
            key: None,
            nullable: false,
        }
    }

    pub fn map(name: &str, key: TypeRef, value: TypeRef) -> Self {
        Self {
            name: name.to_string(),
            container: ContainerKind::Map,
            element: value,
            key: Some(key),
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Storable element of a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Primitive(ScalarType),
    ValueObject(ValueObjectDescriptor),
    Entity(EntityDescriptor),
}

/// Validated container × element shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionShape {
    List(ElementKind),
    Set(ElementKind),
    Map { key: ScalarType, value: ElementKind },
}

impl CollectionShape {
    pub fn container(&self) -> ContainerKind {
        match self {
            CollectionShape::List(_) => ContainerKind::List,
            CollectionShape::Set(_) => ContainerKind::Set,
            CollectionShape::Map { .. } => ContainerKind::Map,
        }
    }

    pub fn element(&self) -> &ElementKind {
        match self {
            CollectionShape::List(element) | CollectionShape::Set(element) => element,
            CollectionShape::Map { value, .. } => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionField {
    pub name: String,
    pub shape: CollectionShape,
    pub nullable: bool,
}

/// Immutable, validated shape of one aggregate type.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDescriptor {
    pub name: String,
    pub scalars: Vec<ScalarField>,
    pub embedded: Vec<EmbeddedField>,
    pub entities: Vec<EntityField>,
    pub collections: Vec<CollectionField>,
}

impl AggregateDescriptor {
    pub fn builder(name: &str) -> AggregateDescriptorBuilder {
        AggregateDescriptorBuilder {
            name: name.to_string(),
            scalars: Vec::new(),
            embedded: Vec::new(),
            entities: Vec::new(),
            collections: Vec::new(),
        }
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarField> {
        self.scalars.iter().find(|f| f.name == name)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionField> {
        self.collections.iter().find(|f| f.name == name)
    }
}

pub struct AggregateDescriptorBuilder {
    name: String,
    scalars: Vec<ScalarField>,
    embedded: Vec<EmbeddedField>,
    entities: Vec<EntityField>,
    collections: Vec<CollectionDecl>,
}

impl AggregateDescriptorBuilder {
    pub fn scalar(mut self, name: &str, scalar_type: ScalarType) -> Self {
        self.scalars.push(ScalarField::required(name, scalar_type));
        self
    }

    pub fn optional_scalar(mut self, name: &str, scalar_type: ScalarType) -> Self {
        self.scalars.push(ScalarField::optional(name, scalar_type));
        self
    }

    pub fn embedded(mut self, name: &str, value_object: ValueObjectDescriptor) -> Self {
        self.embedded.push(EmbeddedField::required(name, value_object));
        self
    }

    pub fn optional_embedded(mut self, name: &str, value_object: ValueObjectDescriptor) -> Self {
        self.embedded.push(EmbeddedField::optional(name, value_object));
        self
    }

    pub fn entity(mut self, name: &str, entity: EntityDescriptor) -> Self {
        self.entities.push(EntityField {
            name: name.to_string(),
            entity,
            nullable: false,
        });
        self
    }

    pub fn optional_entity(mut self, name: &str, entity: EntityDescriptor) -> Self {
        self.entities.push(EntityField {
            name: name.to_string(),
            entity,
            nullable: true,
        });
        self
    }

    pub fn list(self, name: &str, element: TypeRef) -> Self {
        self.collection(CollectionDecl::list(name, element))
    }

    pub fn set(self, name: &str, element: TypeRef) -> Self {
        self.collection(CollectionDecl::set(name, element))
    }

    pub fn map(self, name: &str, key: TypeRef, value: TypeRef) -> Self {
        self.collection(CollectionDecl::map(name, key, value))
    }

    pub fn collection(mut self, decl: CollectionDecl) -> Self {
        self.collections.push(decl);
        self
    }

    /// Validate every declaration and produce the immutable descriptor.
    pub fn build(self) -> Result<AggregateDescriptor> {
        validate_identifier(&self.name, &self.name, "aggregate")?;

        let mut field_names = HashSet::new();
        let all_names = self
            .scalars
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.embedded.iter().map(|f| f.name.as_str()))
            .chain(self.entities.iter().map(|f| f.name.as_str()))
            .chain(self.collections.iter().map(|f| f.name.as_str()));
        for name in all_names {
            validate_identifier(name, &self.name, "field")?;
            if !field_names.insert(name) {
                return Err(RepositoryError::descriptor(
                    name,
                    &self.name,
                    "field is declared more than once",
                    "give every field a distinct name",
                ));
            }
        }

        for field in &self.embedded {
            validate_value_object(&field.name, &field.value_object)?;
        }

        let fk_column = format!("{}_id", self.name);
        for field in &self.entities {
            validate_entity(&field.name, &field.entity, &fk_column)?;
        }

        // Root columns: id, scalars and prefixed embedded groups.
        let mut root_columns = HashSet::new();
        root_columns.insert("id".to_string());
        let root_scalars = self.scalars.iter().map(|f| (f.name.clone(), f.name.as_str()));
        let root_embedded = self.embedded.iter().flat_map(|e| {
            e.value_object
                .fields
                .iter()
                .map(move |f| (format!("{}_{}", e.name, f.name), e.name.as_str()))
        });
        for (column, field) in root_scalars.chain(root_embedded) {
            if !root_columns.insert(column.clone()) {
                return Err(RepositoryError::descriptor(
                    field,
                    &self.name,
                    format!("column '{}' is produced twice in table '{}'", column, self.name),
                    "rename the field or the value object member",
                ));
            }
        }

        let collections = self
            .collections
            .into_iter()
            .map(validate_collection)
            .collect::<Result<Vec<_>>>()?;

        check_derived_tables(&self.name, &self.entities, &collections)?;
        for field in &collections {
            check_junction_columns(&self.name, field)?;
        }

        Ok(AggregateDescriptor {
            name: self.name,
            scalars: self.scalars,
            embedded: self.embedded,
            entities: self.entities,
            collections,
        })
    }
}

/// Child table names are derived from field names, so two declarations can
/// land on the same table (entity `x_items` and collection `x`).
fn check_derived_tables(
    aggregate: &str,
    entities: &[EntityField],
    collections: &[CollectionField],
) -> Result<()> {
    let mut tables: HashMap<String, &str> = HashMap::new();
    tables.insert(aggregate.to_string(), aggregate);

    let derived = entities
        .iter()
        .map(|f| (format!("{}_{}", aggregate, f.name), f.name.as_str()))
        .chain(
            collections
                .iter()
                .map(|f| (format!("{}_{}_items", aggregate, f.name), f.name.as_str())),
        );
    for (table, field) in derived {
        if let Some(previous) = tables.insert(table.clone(), field) {
            return Err(RepositoryError::descriptor(
                field,
                aggregate,
                format!("table '{}' is also derived from '{}'", table, previous),
                "rename one of the fields so their tables differ",
            ));
        }
    }
    Ok(())
}

/// The owner key must not collide with a flattened element column.
fn check_junction_columns(aggregate: &str, field: &CollectionField) -> Result<()> {
    let owner = owner_column(aggregate);
    let element_columns: Vec<String> = match field.shape.element() {
        ElementKind::Primitive(_) => vec![VALUE_COLUMN.to_string()],
        ElementKind::ValueObject(vo) => vo
            .fields
            .iter()
            .map(|f| format!("{}{}", VALUE_PREFIX, f.name))
            .collect(),
        ElementKind::Entity(entity) => {
            let mut columns = vec![format!("{}{}", VALUE_PREFIX, ID_COLUMN)];
            columns.extend(entity.fields.iter().map(|f| format!("{}{}", VALUE_PREFIX, f.name)));
            columns.extend(entity.embedded.iter().flat_map(|e| {
                e.value_object
                    .fields
                    .iter()
                    .map(move |f| format!("{}{}_{}", VALUE_PREFIX, e.name, f.name))
            }));
            columns
        }
    };

    if element_columns.contains(&owner) {
        return Err(RepositoryError::descriptor(
            &field.name,
            aggregate,
            format!(
                "column '{}' is both the owner key and an element column of '{}_{}_items'",
                owner, aggregate, field.name
            ),
            "rename the aggregate or the element member",
        ));
    }
    Ok(())
}

fn validate_identifier(name: &str, owner: &str, what: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RepositoryError::descriptor(
            name,
            owner,
            format!("{} name is not a valid identifier", what),
            "use ASCII letters, digits and underscores only",
        ));
    }
    Ok(())
}

fn validate_value_object(field: &str, vo: &ValueObjectDescriptor) -> Result<()> {
    if vo.fields.is_empty() {
        return Err(RepositoryError::descriptor(
            field,
            &vo.name,
            "value object has no fields",
            "declare at least one scalar member",
        ));
    }
    let mut seen = HashSet::new();
    for member in &vo.fields {
        validate_identifier(&member.name, &vo.name, "value object member")?;
        if !seen.insert(member.name.as_str()) {
            return Err(RepositoryError::descriptor(
                field,
                &vo.name,
                format!("member '{}' is declared more than once", member.name),
                "give every member a distinct name",
            ));
        }
    }
    Ok(())
}

fn validate_entity(field: &str, entity: &EntityDescriptor, fk_column: &str) -> Result<()> {
    let mut columns = HashSet::new();
    columns.insert("id".to_string());
    columns.insert(fk_column.to_string());

    for embedded in &entity.embedded {
        validate_value_object(&embedded.name, &embedded.value_object)?;
    }

    let scalar_columns = entity.fields.iter().map(|f| f.name.clone());
    let embedded_columns = entity.embedded.iter().flat_map(|e| {
        e.value_object
            .fields
            .iter()
            .map(move |f| format!("{}_{}", e.name, f.name))
    });
    for column in scalar_columns.chain(embedded_columns) {
        validate_identifier(&column, &entity.name, "entity field")?;
        if !columns.insert(column.clone()) {
            return Err(RepositoryError::descriptor(
                field,
                &entity.name,
                format!("entity column '{}' is reserved or declared twice", column),
                "rename the entity field; 'id' and the owner key are managed by the store",
            ));
        }
    }
    Ok(())
}

fn validate_element(decl: &CollectionDecl, element: &TypeRef) -> Result<ElementKind> {
    match element {
        TypeRef::Scalar(ty) => Ok(ElementKind::Primitive(*ty)),
        TypeRef::ValueObject(vo) => {
            validate_value_object(&decl.name, vo)?;
            Ok(ElementKind::ValueObject(vo.clone()))
        }
        TypeRef::Entity(entity) => {
            validate_entity(&decl.name, entity, "value_id")?;
            Ok(ElementKind::Entity(entity.clone()))
        }
        TypeRef::AggregateRoot(name) => Err(RepositoryError::descriptor(
            &decl.name,
            format!("{}<{}>", decl.container, name),
            "aggregate roots cannot be stored inside another aggregate",
            "store the referenced aggregate's id instead",
        )),
        TypeRef::Collection(name) => Err(RepositoryError::descriptor(
            &decl.name,
            format!("{}<{}>", decl.container, name),
            "nested collections are not supported",
            "wrap the inner collection in an owned entity or flatten it",
        )),
        TypeRef::Dynamic => Err(RepositoryError::descriptor(
            &decl.name,
            format!("{}<dynamic>", decl.container),
            "collection elements must have a concrete type",
            "declare the element type explicitly",
        )),
    }
}

fn validate_collection(decl: CollectionDecl) -> Result<CollectionField> {
    let element = validate_element(&decl, &decl.element)?;

    let shape = match decl.container {
        ContainerKind::List => {
            reject_key(&decl)?;
            CollectionShape::List(element)
        }
        ContainerKind::Set => {
            reject_key(&decl)?;
            CollectionShape::Set(element)
        }
        ContainerKind::Map => {
            let key = match &decl.key {
                Some(TypeRef::Scalar(ty)) => *ty,
                Some(other) => {
                    return Err(RepositoryError::descriptor(
                        &decl.name,
                        format!("Map<{}, {}>", other.type_name(), decl.element.type_name()),
                        "map keys must be primitive values",
                        "key the map by a scalar such as the value object's identifying field",
                    ))
                }
                None => {
                    return Err(RepositoryError::descriptor(
                        &decl.name,
                        format!("Map<?, {}>", decl.element.type_name()),
                        "map field has no key type",
                        "declare a primitive key type",
                    ))
                }
            };
            CollectionShape::Map {
                key,
                value: element,
            }
        }
    };

    Ok(CollectionField {
        name: decl.name,
        shape,
        nullable: decl.nullable,
    })
}

fn reject_key(decl: &CollectionDecl) -> Result<()> {
    if decl.key.is_some() {
        return Err(RepositoryError::descriptor(
            &decl.name,
            format!("{}<{}>", decl.container, decl.element.type_name()),
            "only maps take a key type",
            "remove the key type or declare the field as a Map",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money() -> ValueObjectDescriptor {
        ValueObjectDescriptor::new(
            "Money",
            vec![
                ScalarField::required("amount", ScalarType::Integer),
                ScalarField::required("currency", ScalarType::Text),
            ],
        )
    }

    fn expect_descriptor_error(result: Result<AggregateDescriptor>, needle: &str) {
        match result {
            Err(RepositoryError::Descriptor {
                reason, suggestion, ..
            }) => {
                let text = format!("{} {}", reason, suggestion);
                assert!(text.contains(needle), "unexpected message: {}", text);
            }
            other => panic!("expected descriptor error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_descriptor() {
        let descriptor = AggregateDescriptor::builder("order")
            .scalar("customer_name", ScalarType::Text)
            .optional_embedded("price", money())
            .set("tags", TypeRef::Scalar(ScalarType::Text))
            .map("notes", TypeRef::Scalar(ScalarType::Text), TypeRef::ValueObject(money()))
            .build()
            .unwrap();

        assert_eq!(descriptor.name, "order");
        assert_eq!(descriptor.collections.len(), 2);
        assert_eq!(
            descriptor.collection("notes").unwrap().shape.container(),
            ContainerKind::Map
        );
    }

    #[test]
    fn test_rejects_nested_collection() {
        let result = AggregateDescriptor::builder("order")
            .list("matrix", TypeRef::Collection("List<Integer>".to_string()))
            .build();
        expect_descriptor_error(result, "nested collections");
    }

    #[test]
    fn test_rejects_dynamic_element() {
        let result = AggregateDescriptor::builder("order")
            .set("anything", TypeRef::Dynamic)
            .build();
        expect_descriptor_error(result, "concrete type");
    }

    #[test]
    fn test_rejects_value_object_map_key() {
        let result = AggregateDescriptor::builder("order")
            .map(
                "by_price",
                TypeRef::ValueObject(money()),
                TypeRef::Scalar(ScalarType::Text),
            )
            .build();
        expect_descriptor_error(result, "primitive");
    }

    #[test]
    fn test_rejects_aggregate_root_element() {
        let result = AggregateDescriptor::builder("order")
            .list("customers", TypeRef::AggregateRoot("Customer".to_string()))
            .build();
        match result {
            Err(RepositoryError::Descriptor {
                field,
                type_name,
                suggestion,
                ..
            }) => {
                assert_eq!(field, "customers");
                assert_eq!(type_name, "List<Customer>");
                assert!(suggestion.contains("id instead"));
            }
            other => panic!("expected descriptor error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicate_field() {
        let result = AggregateDescriptor::builder("order")
            .scalar("name", ScalarType::Text)
            .list("name", TypeRef::Scalar(ScalarType::Text))
            .build();
        expect_descriptor_error(result, "more than once");
    }

    #[test]
    fn test_rejects_column_collision() {
        let result = AggregateDescriptor::builder("order")
            .scalar("price_amount", ScalarType::Integer)
            .embedded("price", money())
            .build();
        expect_descriptor_error(result, "produced twice");
    }

    #[test]
    fn test_rejects_reserved_entity_column() {
        let entity = EntityDescriptor::new("Line", vec![ScalarField::required("id", ScalarType::Text)]);
        let result = AggregateDescriptor::builder("order")
            .list("lines", TypeRef::Entity(entity))
            .build();
        expect_descriptor_error(result, "reserved");
    }

    #[test]
    fn test_rejects_invalid_identifier() {
        let result = AggregateDescriptor::builder("order; DROP")
            .scalar("name", ScalarType::Text)
            .build();
        expect_descriptor_error(result, "identifier");
    }

    #[test]
    fn test_rejects_entity_and_collection_sharing_a_table() {
        let entity = EntityDescriptor::new("Extra", vec![ScalarField::required("note", ScalarType::Text)]);
        let result = AggregateDescriptor::builder("order")
            .entity("x_items", entity)
            .list("x", TypeRef::Scalar(ScalarType::Integer))
            .build();
        expect_descriptor_error(result, "order_x_items");
    }

    #[test]
    fn test_rejects_owner_key_clashing_with_element_id() {
        let line = EntityDescriptor::new("Line", vec![ScalarField::required("sku", ScalarType::Text)]);
        let result = AggregateDescriptor::builder("value")
            .list("lines", TypeRef::Entity(line))
            .build();
        expect_descriptor_error(result, "value_id");
    }

    #[test]
    fn test_owner_key_clash_with_value_object_member() {
        let tagged = ValueObjectDescriptor::new("Tagged", vec![ScalarField::required("id", ScalarType::Text)]);
        let result = AggregateDescriptor::builder("value")
            .set("tags", TypeRef::ValueObject(tagged))
            .build();
        expect_descriptor_error(result, "owner key");
    }
}
