//! aggregate-store - aggregate-to-relational mapping for SQLite and MySQL
//!
//! aggregate-store persists domain aggregates (a root entity with embedded
//! value objects, owned sub-entities and collections of any of these)
//! into relational tables, and rebuilds them exactly on read.
//!
//! # Architecture
//!
//! - **Descriptor → Tables**: an [`AggregateDescriptor`] is validated once
//!   and compiled into a root table, one table per owned entity and one
//!   junction table per collection
//! - **Dialects**: column types, quoting, upserts and scalar codecs differ
//!   per backend behind the [`Dialect`] trait
//! - **Flatten / Unflatten**: aggregates become row batches on save and
//!   are rebuilt from rows on load
//! - **Transactions**: every write runs in a reentrant transaction on a
//!   single connection
//! - **Errors**: driver failures are classified into a closed
//!   [`ErrorKind`] set
//!
//! # Example
//!
//! ```rust,no_run
//! use aggregate_store::prelude::*;
//! use uuid::Uuid;
//!
//! struct Order {
//!     id: Uuid,
//!     customer_name: String,
//!     items: Vec<String>,
//! }
//!
//! impl AggregateRoot for Order {
//!     fn descriptor() -> Result<AggregateDescriptor> {
//!         AggregateDescriptor::builder("order")
//!             .scalar("customer_name", ScalarType::Text)
//!             .list("items", TypeRef::Scalar(ScalarType::Text))
//!             .build()
//!     }
//!
//!     fn id(&self) -> Uuid {
//!         self.id
//!     }
//!
//!     fn to_aggregate(&self) -> Aggregate {
//!         Aggregate::new(self.id)
//!             .with("customer_name", self.customer_name.as_str())
//!             .with_collection(
//!                 "items",
//!                 Some(CollectionValue::list(
//!                     self.items.iter().map(|i| Scalar::from(i.as_str())),
//!                 )),
//!             )
//!     }
//!
//!     fn from_aggregate(aggregate: Aggregate) -> Result<Self> {
//!         Ok(Self {
//!             id: aggregate.id,
//!             customer_name: aggregate
//!                 .get("customer_name")
//!                 .and_then(Scalar::as_text)
//!                 .unwrap_or_default()
//!                 .to_string(),
//!             items: aggregate
//!                 .collection("items")
//!                 .map(|c| {
//!                     c.elements()
//!                         .iter()
//!                         .filter_map(|e| e.as_scalar().and_then(Scalar::as_text))
//!                         .map(str::to_string)
//!                         .collect()
//!                 })
//!                 .unwrap_or_default(),
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let backend = SqliteBackend::memory().await?;
//!     let mut orders: Repository<_, Order> = Repository::new(backend)?;
//!     orders.create_tables().await?;
//!
//!     let order = Order {
//!         id: Uuid::new_v4(),
//!         customer_name: "A".to_string(),
//!         items: vec!["x".to_string(), "y".to_string()],
//!     };
//!     orders.save(&order).await?;
//!
//!     let loaded = orders.get_by_id(order.id).await?;
//!     assert_eq!(loaded.items, vec!["x", "y"]);
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! aggregate-store = { version = "0.1", features = ["sqlite", "mysql"] }
//! ```
//!
//! The library emits `tracing` events but installs no subscriber.

pub mod backend;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod dialect;
pub mod error;
pub mod flatten;
pub mod model;
pub mod repository;
pub mod schema;
pub mod transaction;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub mod mysql;

pub use backend::{DatabaseBackend, QueryResult, Row};
pub use codec::{SqlValue, TimestampPrecision, TypeCodec};
pub use config::{BackendKind, ConnectionTarget, RepositoryConfig};
pub use descriptor::{
    AggregateDescriptor, CollectionDecl, CollectionField, CollectionShape, ContainerKind,
    ElementKind, EmbeddedField, EntityDescriptor, EntityField, ScalarField, ScalarType, TypeRef,
    ValueObjectDescriptor,
};
pub use dialect::{Dialect, MySqlDialect, SqliteDialect};
pub use error::{ErrorKind, ErrorMapper, RepositoryError, Result};
pub use flatten::{Flattener, RowBatch, TableRows, Unflattener};
pub use model::{Aggregate, AggregateRoot, CollectionValue, Element, Entity, Scalar, ValueObject};
pub use repository::Repository;
pub use schema::{CompiledSchema, SchemaCompiler, TableDefinition};
pub use transaction::{run_in_transaction, Session, TransactionManager, TransactionScope};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

#[cfg(feature = "mysql")]
pub use mysql::MySqlBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::DatabaseBackend;
    pub use crate::config::RepositoryConfig;
    pub use crate::descriptor::{
        AggregateDescriptor, EntityDescriptor, ScalarField, ScalarType, TypeRef,
        ValueObjectDescriptor,
    };
    pub use crate::error::{ErrorKind, RepositoryError, Result};
    pub use crate::model::{
        Aggregate, AggregateRoot, CollectionValue, Element, Entity, Scalar, ValueObject,
    };
    pub use crate::repository::Repository;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;

    #[cfg(feature = "mysql")]
    pub use crate::mysql::MySqlBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure all main types are exported
        let _dialect = SqliteDialect::new();
        let _mysql = MySqlDialect::new();
        let _ty = ScalarType::Uuid;
        let _kind = ErrorKind::Duplicate;
        let _config = RepositoryConfig::default();
        let _tx = TransactionManager::new();
    }
}
