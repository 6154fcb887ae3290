//! Repository facade: typed save/load/delete over one backend.

use crate::backend::{DatabaseBackend, Row};
use crate::codec::SqlValue;
use crate::dialect::JoinedSelect;
use crate::error::{RepositoryError, Result};
use crate::flatten::{Flattener, Unflattener};
use crate::model::{Aggregate, AggregateRoot};
use crate::schema::{CompiledSchema, SchemaCompiler, TableRole, ID_COLUMN, ORDER_INDEX_COLUMN};
use crate::transaction::{self, TransactionManager, TransactionScope};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const ROOT_ALIAS: &str = "r";

/// A parameterized statement produced before any I/O starts.
#[derive(Debug, Clone)]
struct Statement {
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    fn new(sql: String, params: Vec<SqlValue>) -> Self {
        Self { sql, params }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    Insert,
}

/// Persists aggregates of type `A` through backend `B`.
///
/// The table layout is compiled once from `A::descriptor()` when the
/// repository is built and shared read-only afterwards. Every write runs
/// inside a transaction; calls made from within
/// [`Repository::run_in_transaction`] join the surrounding one.
pub struct Repository<B: DatabaseBackend, A: AggregateRoot> {
    backend: B,
    schema: Arc<CompiledSchema>,
    transactions: TransactionManager,
    _aggregate: PhantomData<fn() -> A>,
}

impl<B: DatabaseBackend, A: AggregateRoot> Repository<B, A> {
    /// Validate `A`'s descriptor and compile its tables for `backend`'s
    /// dialect.
    pub fn new(backend: B) -> Result<Self> {
        let descriptor = A::descriptor()?;
        let schema = SchemaCompiler::new(backend.dialect()).compile(&descriptor);
        debug!(
            aggregate = %descriptor.name,
            dialect = backend.dialect().name(),
            tables = schema.tables.len(),
            "compiled aggregate schema"
        );

        Ok(Self {
            backend,
            schema: Arc::new(schema),
            transactions: TransactionManager::new(),
            _aggregate: PhantomData,
        })
    }

    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Direct access to the connection, for statements outside the
    /// aggregate mapping.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn aggregate_name(&self) -> &str {
        self.schema.aggregate_name()
    }

    /// Create every table if missing. Safe to call repeatedly.
    pub async fn create_tables(&mut self) -> Result<()> {
        let statements = self.schema.create_statements(self.backend.dialect());
        for sql in &statements {
            self.backend.execute(sql, &[]).await?;
        }
        info!(
            aggregate = %self.schema.aggregate_name(),
            tables = statements.len(),
            "tables ready"
        );
        Ok(())
    }

    /// Drop every table of the aggregate, children first.
    pub async fn drop_tables(&mut self) -> Result<()> {
        let statements = self.schema.drop_statements(self.backend.dialect());
        for sql in &statements {
            self.backend.execute(sql, &[]).await?;
        }
        info!(aggregate = %self.schema.aggregate_name(), "tables dropped");
        Ok(())
    }

    /// Load the aggregate with `id`, or fail with `NotFound`.
    pub async fn get_by_id(&mut self, id: Uuid) -> Result<A> {
        match self.load(id).await? {
            Some(aggregate) => A::from_aggregate(aggregate),
            None => Err(RepositoryError::not_found(self.schema.aggregate_name(), id)),
        }
    }

    pub async fn exists(&mut self, id: Uuid) -> Result<bool> {
        let root = self.schema.root();
        let dialect = self.backend.dialect();
        let sql = dialect.select_by_key(&root.name, &[ID_COLUMN.to_string()], ID_COLUMN, None);
        let key = dialect.encode_uuid(&id);

        let rows = self.backend.query(&sql, &[key]).await?;
        Ok(!rows.is_empty())
    }

    /// Upsert the root row and replace every child row in one transaction.
    pub async fn save(&mut self, aggregate: &A) -> Result<()> {
        let graph = aggregate.to_aggregate();
        debug!(aggregate = %self.schema.aggregate_name(), id = %graph.id, "saving");
        let statements = self.write_plan(&graph, WriteMode::Upsert)?;
        self.execute_in_transaction(statements).await
    }

    /// Like [`save`](Self::save), but fails with `Duplicate` if the id is
    /// already stored.
    pub async fn insert(&mut self, aggregate: &A) -> Result<()> {
        let graph = aggregate.to_aggregate();
        debug!(aggregate = %self.schema.aggregate_name(), id = %graph.id, "inserting");
        let statements = self.write_plan(&graph, WriteMode::Insert)?;
        self.execute_in_transaction(statements).await
    }

    /// Delete the aggregate and all of its child rows. Deleting an id that
    /// is not stored is a no-op.
    pub async fn delete_by_id(&mut self, id: Uuid) -> Result<()> {
        debug!(aggregate = %self.schema.aggregate_name(), %id, "deleting");
        let statements = self.delete_plan(id);
        self.execute_in_transaction(statements).await
    }

    /// Run `work` as one transaction against this repository.
    pub async fn run_in_transaction<T, F>(&mut self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Self) -> BoxFuture<'c, Result<T>> + Send,
    {
        transaction::run_in_transaction(self, work).await
    }

    /// Close the underlying connection
    pub async fn close(self) -> Result<()> {
        self.backend.close().await
    }

    async fn execute_in_transaction(&mut self, statements: Vec<Statement>) -> Result<()> {
        transaction::run_in_transaction(self, move |repo| {
            Box::pin(async move {
                for statement in &statements {
                    repo.backend.execute(&statement.sql, &statement.params).await?;
                }
                Ok(())
            })
        })
        .await
    }

    fn write_plan(&self, graph: &Aggregate, mode: WriteMode) -> Result<Vec<Statement>> {
        let dialect = self.backend.dialect();
        let batch = Flattener::new(&self.schema, dialect).flatten(graph)?;
        let owner_id = dialect.encode_uuid(&graph.id);

        let root = batch.root().ok_or_else(|| {
            RepositoryError::Schema(format!(
                "flattening {} produced no root row",
                self.schema.aggregate_name()
            ))
        })?;
        let root_table = &self.schema.root().name;
        let columns = root.columns().to_vec();
        let sql = match mode {
            WriteMode::Upsert => dialect.upsert(root_table, &columns, &[ID_COLUMN.to_string()]),
            WriteMode::Insert => dialect.insert(root_table, &columns),
        };

        let mut statements = vec![Statement::new(sql, root.values().to_vec())];

        for table in batch.children() {
            let owner = self
                .schema
                .table(&table.table)
                .and_then(|t| t.owner_column())
                .ok_or_else(|| {
                    RepositoryError::Schema(format!("table '{}' has no owner column", table.table))
                })?;

            if mode == WriteMode::Upsert {
                statements.push(Statement::new(
                    dialect.delete_by_key(&table.table, owner),
                    vec![owner_id.clone()],
                ));
            }

            for row in &table.rows {
                statements.push(Statement::new(
                    dialect.insert(&table.table, row.columns()),
                    row.values().to_vec(),
                ));
            }
        }

        Ok(statements)
    }

    /// Child rows first, then the root. The foreign keys cascade as well.
    fn delete_plan(&self, id: Uuid) -> Vec<Statement> {
        let dialect = self.backend.dialect();
        let key = dialect.encode_uuid(&id);

        let mut statements: Vec<Statement> = self
            .schema
            .children()
            .iter()
            .rev()
            .filter_map(|table| {
                table.owner_column().map(|owner| {
                    Statement::new(dialect.delete_by_key(&table.name, owner), vec![key.clone()])
                })
            })
            .collect();

        statements.push(Statement::new(
            dialect.delete_by_key(&self.schema.root().name, ID_COLUMN),
            vec![key],
        ));
        statements
    }

    /// Root and owned entities in one joined query, then one query per
    /// collection table.
    async fn load(&mut self, id: Uuid) -> Result<Option<Aggregate>> {
        let schema = Arc::clone(&self.schema);
        let root = schema.root();

        let mut select = JoinedSelect::new(&root.name, ROOT_ALIAS, ID_COLUMN);
        for column in &root.columns {
            select = select.column(ROOT_ALIAS, &column.name);
        }

        let mut entity_aliases = Vec::new();
        for (i, table) in schema.children().iter().enumerate() {
            if let TableRole::OwnedEntity { field } = &table.role {
                let alias = format!("j{}", i);
                let owner = table.owner_column().unwrap_or_default();
                select = select.join(&table.name, &alias, owner, ID_COLUMN);
                for column in &table.columns {
                    select = select.column(&alias, &column.name);
                }
                entity_aliases.push((field.clone(), alias));
            }
        }

        let (sql, key) = {
            let dialect = self.backend.dialect();
            (dialect.select_with_joins(&select), dialect.encode_uuid(&id))
        };
        let rows = self.backend.query(&sql, &[key.clone()]).await?;
        let Some(joined) = rows.first() else {
            return Ok(None);
        };

        let root_row = joined.project(ROOT_ALIAS);
        let entity_rows: BTreeMap<String, Row> = entity_aliases
            .iter()
            .map(|(field, alias)| (field.clone(), joined.project(alias)))
            .collect();

        let mut collection_rows = BTreeMap::new();
        for table in schema.children() {
            let TableRole::Collection { field } = &table.role else {
                continue;
            };
            let owner = table.owner_column().unwrap_or_default();
            let order_by = table.column(ORDER_INDEX_COLUMN).map(|_| ORDER_INDEX_COLUMN);
            let sql = self
                .backend
                .dialect()
                .select_by_key(&table.name, &table.column_names(), owner, order_by);

            let rows = self.backend.query(&sql, &[key.clone()]).await?;
            collection_rows.insert(field.clone(), rows);
        }

        let aggregate = Unflattener::new(&schema, self.backend.dialect()).unflatten(
            &root_row,
            &entity_rows,
            &collection_rows,
        )?;
        Ok(Some(aggregate))
    }
}

impl<B: DatabaseBackend, A: AggregateRoot> TransactionScope for Repository<B, A> {
    type Backend = B;

    fn transaction_parts(&mut self) -> (&mut TransactionManager, &mut B) {
        (&mut self.transactions, &mut self.backend)
    }
}
