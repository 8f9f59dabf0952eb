//! Pipeline driver.
//!
//! Runs the fixed statement lists of each stage, in order, on the single
//! warehouse connection. Stage 1 (staging) always completes before stage 2
//! (transform) starts.

use std::time::Instant;

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement, TransactionTrait};
use tracing::{info, instrument, warn};

use crate::{
    config::{AppConfig, CommitMode, KeyConstraints},
    db::{DatabaseError, Dialect},
    error::{PipelineError, Stage},
    schema::{self, SchemaOptions},
    staging::{self, StagingLoader},
    transform,
};

/// A statement together with the short name used in logs and errors.
#[derive(Debug, Clone)]
pub struct SqlStatement {
    pub name: String,
    pub statement: Statement,
}

impl SqlStatement {
    pub fn new(name: impl Into<String>, statement: Statement) -> Self {
        Self {
            name: name.into(),
            statement,
        }
    }
}

/// Settings shared by every stage of a run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub dialect: Dialect,
    pub commit_mode: CommitMode,
    pub key_constraints: KeyConstraints,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig, backend: DbBackend) -> Result<Self, DatabaseError> {
        Ok(Self {
            dialect: Dialect::resolve(backend, config.warehouse_flavor)?,
            commit_mode: config.commit_mode,
            key_constraints: config.key_constraints,
        })
    }

    fn schema(&self) -> SchemaOptions {
        SchemaOptions {
            dialect: self.dialect,
            key_constraints: self.key_constraints,
        }
    }
}

/// Outcome of one executed stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub statements: usize,
    pub rows_affected: u64,
}

/// Outcome of a full load-then-transform run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtlReport {
    pub staging: StageReport,
    pub transform: StageReport,
}

/// Drops every table, then creates every table.
pub async fn create_tables(
    db: &DatabaseConnection,
    options: &PipelineOptions,
) -> Result<StageReport, PipelineError> {
    let mut statements = schema::drop_table_statements(options.dialect);
    statements.extend(schema::create_table_statements(&options.schema()));
    run_stage(db, Stage::Schema, statements, options.commit_mode).await
}

/// Stage 1: replaces the contents of the staging tables with `loader`'s data.
pub async fn load_staging_tables(
    db: &DatabaseConnection,
    options: &PipelineOptions,
    loader: &dyn StagingLoader,
) -> Result<StageReport, PipelineError> {
    info!(source = loader.name(), "loading staging tables");
    let mut statements = staging::clear_staging_statements(options.dialect, options.commit_mode);
    statements.extend(loader.statements(options.dialect)?);
    run_stage(db, Stage::Staging, statements, options.commit_mode).await
}

/// Stage 2: populates the star schema from the staging tables.
pub async fn insert_tables(
    db: &DatabaseConnection,
    options: &PipelineOptions,
) -> Result<StageReport, PipelineError> {
    let statements = transform::insert_table_statements(options.dialect);
    run_stage(db, Stage::Transform, statements, options.commit_mode).await
}

/// Runs stage 1 to completion, then stage 2.
pub async fn run_etl(
    db: &DatabaseConnection,
    options: &PipelineOptions,
    loader: &dyn StagingLoader,
) -> Result<EtlReport, PipelineError> {
    let staging = load_staging_tables(db, options, loader).await?;
    let transform = insert_tables(db, options).await?;
    Ok(EtlReport { staging, transform })
}

/// Row count of every table, in creation order.
pub async fn table_counts<C>(conn: &C) -> Result<Vec<(&'static str, i64)>, PipelineError>
where
    C: ConnectionTrait,
{
    let mut counts = Vec::with_capacity(schema::CREATE_ORDER.len());
    for table in schema::CREATE_ORDER {
        let name = format!("count {table}");
        let stmt = Statement::from_string(
            conn.get_database_backend(),
            format!("SELECT COUNT(*) AS row_count FROM {table}"),
        );
        let rows = match conn.query_one(stmt).await {
            Ok(Some(row)) => row
                .try_get::<i64>("", "row_count")
                .map_err(|source| PipelineError::Query { name, source })?,
            Ok(None) => 0,
            Err(source) => return Err(PipelineError::Query { name, source }),
        };
        counts.push((table, rows));
    }
    Ok(counts)
}

#[instrument(skip(db, statements), fields(statements = statements.len()))]
async fn run_stage(
    db: &DatabaseConnection,
    stage: Stage,
    statements: Vec<SqlStatement>,
    commit_mode: CommitMode,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let rows_affected = match commit_mode {
        CommitMode::PerStatement => execute_all(db, stage, &statements).await?,
        CommitMode::PerStage => {
            let txn = db
                .begin()
                .await
                .map_err(|source| PipelineError::Transaction {
                    stage,
                    action: "begin",
                    source,
                })?;
            let rows = match execute_all(&txn, stage, &statements).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(%stage, error = %err, "rolling back stage");
                    txn.rollback()
                        .await
                        .map_err(|source| PipelineError::Transaction {
                            stage,
                            action: "roll back",
                            source,
                        })?;
                    return Err(err);
                }
            };
            txn.commit()
                .await
                .map_err(|source| PipelineError::Transaction {
                    stage,
                    action: "commit",
                    source,
                })?;
            rows
        }
    };

    info!(
        %stage,
        statements = statements.len(),
        rows_affected,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "stage complete"
    );

    Ok(StageReport {
        stage,
        statements: statements.len(),
        rows_affected,
    })
}

async fn execute_all<C>(
    conn: &C,
    stage: Stage,
    statements: &[SqlStatement],
) -> Result<u64, PipelineError>
where
    C: ConnectionTrait,
{
    let mut rows_affected = 0;
    for stmt in statements {
        let started = Instant::now();
        let result = conn
            .execute(stmt.statement.clone())
            .await
            .map_err(|source| PipelineError::Statement {
                stage,
                name: stmt.name.clone(),
                source,
            })?;
        rows_affected += result.rows_affected();
        info!(
            %stage,
            statement = %stmt.name,
            rows = result.rows_affected(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "statement executed"
        );
    }
    Ok(rows_affected)
}
