//! SQL dialects (Strategy pattern).
//!
//! A [`Dialect`] owns everything that differs between backends: column
//! types, identifier quoting, conflict resolution and the scalar codec.
//! The statement builders with a default body produce ANSI-style SQL and
//! are shared by every dialect unless it needs something else.

mod mysql;
mod sqlite;

#[cfg(feature = "mysql")]
pub(crate) use mysql::DATETIME_FORMAT;
pub use mysql::MySqlDialect;
pub use sqlite::SqliteDialect;

use crate::codec::TypeCodec;
use crate::descriptor::ScalarType;
use crate::schema::TableDefinition;

/// A column in a [`JoinedSelect`], read back under `alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub table_alias: String,
    pub column: String,
    pub alias: String,
}

/// `LEFT JOIN table AS alias ON alias.column = <base>.references`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    pub column: String,
    pub references: String,
}

/// Primary-key lookup on one table with left-joined one-to-one children.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedSelect {
    pub table: String,
    pub alias: String,
    pub key_column: String,
    pub columns: Vec<SelectColumn>,
    pub joins: Vec<Join>,
}

impl JoinedSelect {
    pub fn new(table: &str, alias: &str, key_column: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.to_string(),
            key_column: key_column.to_string(),
            columns: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Select `column` of the table aliased `table_alias` as
    /// `<table_alias>__<column>`.
    pub fn column(mut self, table_alias: &str, column: &str) -> Self {
        self.columns.push(SelectColumn {
            table_alias: table_alias.to_string(),
            column: column.to_string(),
            alias: format!("{}__{}", table_alias, column),
        });
        self
    }

    pub fn join(mut self, table: &str, alias: &str, column: &str, references: &str) -> Self {
        self.joins.push(Join {
            table: table.to_string(),
            alias: alias.to_string(),
            column: column.to_string(),
            references: references.to_string(),
        });
        self
    }
}

pub trait Dialect: TypeCodec {
    /// Dialect identifier, e.g. "sqlite".
    fn name(&self) -> &str;

    fn quote_ident(&self, name: &str) -> String;

    /// Native column type. `keyed` is set for columns that take part in a
    /// primary key, foreign key or unique constraint.
    fn column_type(&self, scalar_type: ScalarType, keyed: bool) -> String;

    /// Positional parameter placeholder for the given 1-based index.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// Trailing table options such as engine and charset.
    fn table_options(&self) -> Option<&str> {
        None
    }

    /// Insert-or-update by `key_columns` in one statement.
    fn upsert(&self, table: &str, columns: &[String], key_columns: &[String]) -> String;

    fn create_table_if_not_exists(&self, table: &TableDefinition) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", self.quote_ident(&table.name));

        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|col| {
                let mut def = format!("    {} {}", self.quote_ident(&col.name), col.sql_type);
                if !col.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        let pk = table.primary_key();
        if !pk.is_empty() {
            defs.push(format!("    PRIMARY KEY ({})", self.ident_list(&pk)));
        }

        for fk in &table.foreign_keys {
            defs.push(format!(
                "    FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                self.quote_ident(&fk.column_name),
                self.quote_ident(&fk.referenced_table),
                self.quote_ident(&fk.referenced_column),
                fk.on_delete
            ));
        }

        for unique in &table.unique_constraints {
            defs.push(format!("    UNIQUE ({})", self.ident_list(unique)));
        }

        sql.push_str(&defs.join(",\n"));
        sql.push_str("\n)");
        if let Some(options) = self.table_options() {
            sql.push(' ');
            sql.push_str(options);
        }
        sql
    }

    fn drop_table_if_exists(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_ident(table))
    }

    fn insert(&self, table: &str, columns: &[String]) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_ident(table),
            self.ident_list(columns),
            self.placeholders(columns.len())
        )
    }

    fn delete_by_key(&self, table: &str, key_column: &str) -> String {
        format!(
            "DELETE FROM {} WHERE {} = {}",
            self.quote_ident(table),
            self.quote_ident(key_column),
            self.placeholder(1)
        )
    }

    fn select_by_key(
        &self,
        table: &str,
        columns: &[String],
        key_column: &str,
        order_by: Option<&str>,
    ) -> String {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.ident_list(columns),
            self.quote_ident(table),
            self.quote_ident(key_column),
            self.placeholder(1)
        );
        if let Some(order) = order_by {
            sql.push_str(&format!(" ORDER BY {} ASC", self.quote_ident(order)));
        }
        sql
    }

    fn select_with_joins(&self, select: &JoinedSelect) -> String {
        let columns = select
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{}.{} AS {}",
                    c.table_alias,
                    self.quote_ident(&c.column),
                    self.quote_ident(&c.alias)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "SELECT {} FROM {} {}",
            columns,
            self.quote_ident(&select.table),
            select.alias
        );

        for join in &select.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} {} ON {}.{} = {}.{}",
                self.quote_ident(&join.table),
                join.alias,
                join.alias,
                self.quote_ident(&join.column),
                select.alias,
                self.quote_ident(&join.references)
            ));
        }

        sql.push_str(&format!(
            " WHERE {}.{} = {}",
            select.alias,
            self.quote_ident(&select.key_column),
            self.placeholder(1)
        ));
        sql
    }

    fn ident_list(&self, names: &[String]) -> String {
        names
            .iter()
            .map(|n| self.quote_ident(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
