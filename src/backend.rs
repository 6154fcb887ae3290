use crate::codec::SqlValue;
use crate::dialect::Dialect;
use crate::error::Result;
use async_trait::async_trait;

static NULL: SqlValue = SqlValue::Null;

/// Ordered mapping from column name to encoded value.
///
/// Used for rows produced by the flattener and rows read back from a
/// driver alike.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column, replacing the value if the column already exists.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        let column = column.into();
        match self.columns.iter().position(|c| *c == column) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: SqlValue) -> Self {
        self.insert(column, value);
        self
    }

    /// Value of a column; a missing column reads as NULL.
    pub fn get(&self, column: &str) -> &SqlValue {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
            .unwrap_or(&NULL)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Columns named `<prefix>__<name>`, renamed to `<name>`.
    pub fn project(&self, prefix: &str) -> Row {
        let marker = format!("{}__", prefix);
        let mut row = Row::new();
        for (column, value) in self.iter() {
            if let Some(name) = column.strip_prefix(&marker) {
                row.insert(name, value.clone());
            }
        }
        row
    }
}

/// Result of a query
pub type QueryResult = Vec<Row>;

/// Single-connection database backend.
///
/// Implementations own exactly one physical connection so that a
/// transaction begun here covers every later statement until commit or
/// rollback. Driver failures are returned already classified.
#[async_trait]
pub trait DatabaseBackend: Send {
    /// SQL dialect spoken by this backend.
    fn dialect(&self) -> &dyn Dialect;

    /// Execute a statement with positional parameters
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Query and return rows in select order
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(self) -> Result<()>;
}
