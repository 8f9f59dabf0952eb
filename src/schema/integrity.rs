//! Post-load verification of the declared key semantics.
//!
//! Redshift accepts primary and foreign key declarations but never enforces
//! them, so loaded data can silently violate them. These checks count the
//! rows that do.

use std::fmt;

use sea_orm::{ConnectionTrait, Statement};

use super::{TableKeys, WAREHOUSE_KEYS};
use crate::error::PipelineError;

/// How a key declaration is violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Primary key values shared by more than one row.
    DuplicateKey,
    /// Rows whose primary key is null.
    NullKey,
    /// Fact rows whose foreign key has no matching dimension row.
    Orphan { references: &'static str },
}

/// A violated key declaration and the number of offending values or rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyViolation {
    pub table: &'static str,
    pub column: &'static str,
    pub kind: ViolationKind,
    pub count: i64,
}

impl fmt::Display for KeyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::DuplicateKey => write!(
                f,
                "{}.{}: {} duplicated key value(s)",
                self.table, self.column, self.count
            ),
            ViolationKind::NullKey => {
                write!(f, "{}.{}: {} null key(s)", self.table, self.column, self.count)
            }
            ViolationKind::Orphan { references } => write!(
                f,
                "{}.{}: {} row(s) without a matching {} row",
                self.table, self.column, self.count, references
            ),
        }
    }
}

/// Checks every warehouse table against its declared keys.
pub async fn check_keys<C>(conn: &C) -> Result<Vec<KeyViolation>, PipelineError>
where
    C: ConnectionTrait,
{
    let mut violations = Vec::new();
    for keys in &WAREHOUSE_KEYS {
        check_table(conn, keys, &mut violations).await?;
    }
    Ok(violations)
}

async fn check_table<C>(
    conn: &C,
    keys: &TableKeys,
    violations: &mut Vec<KeyViolation>,
) -> Result<(), PipelineError>
where
    C: ConnectionTrait,
{
    let table = keys.table;

    if let Some(pk) = keys.primary_key {
        let duplicates = count(
            conn,
            format!(
                "SELECT COUNT(*) AS violations FROM (SELECT {pk} FROM {table} WHERE {pk} IS NOT NULL GROUP BY {pk} HAVING COUNT(*) > 1) AS dup"
            ),
        )
        .await?;
        push(violations, table, pk, ViolationKind::DuplicateKey, duplicates);

        let nulls = count(
            conn,
            format!("SELECT COUNT(*) AS violations FROM {table} WHERE {pk} IS NULL"),
        )
        .await?;
        push(violations, table, pk, ViolationKind::NullKey, nulls);
    }

    for fk in keys.foreign_keys {
        let orphans = count(
            conn,
            format!(
                "SELECT COUNT(*) AS violations FROM {table} f LEFT JOIN {dim} d ON f.{col} = d.{dim_col} WHERE d.{dim_col} IS NULL",
                dim = fk.references,
                col = fk.column,
                dim_col = fk.referenced_column,
            ),
        )
        .await?;
        push(
            violations,
            table,
            fk.column,
            ViolationKind::Orphan {
                references: fk.references,
            },
            orphans,
        );
    }

    Ok(())
}

fn push(
    violations: &mut Vec<KeyViolation>,
    table: &'static str,
    column: &'static str,
    kind: ViolationKind,
    count: i64,
) {
    if count > 0 {
        violations.push(KeyViolation {
            table,
            column,
            kind,
            count,
        });
    }
}

async fn count<C>(conn: &C, sql: String) -> Result<i64, PipelineError>
where
    C: ConnectionTrait,
{
    let row = conn
        .query_one(Statement::from_string(conn.get_database_backend(), sql.clone()))
        .await
        .map_err(|source| PipelineError::Query {
            name: sql.clone(),
            source,
        })?;
    match row {
        Some(row) => row
            .try_get::<i64>("", "violations")
            .map_err(|source| PipelineError::Query { name: sql, source }),
        None => Ok(0),
    }
}
