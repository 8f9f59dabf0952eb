//! Stage 1: landing the raw datasets in the staging tables.
//!
//! A [`StagingLoader`] turns a dataset source into the ordered statements that
//! fill `staging_events` and `staging_songs`. Production runs use the Redshift
//! bulk COPY from S3; the local loader inserts line-delimited JSON files from
//! disk so the pipeline also runs against plain Postgres or SQLite.

pub mod copy;
pub mod local;

use sea_orm::{
    DbBackend,
    sea_query::{Iden, Query, Table},
};

use crate::{
    config::{AppConfig, CommitMode, ConfigError, StagingSourceKind},
    db::Dialect,
    error::PipelineError,
    pipeline::SqlStatement,
    schema::{StagingEvents, StagingSongs},
};

pub use copy::{CopyCommand, JsonFormat, S3CopyLoader};
pub use local::{EventRecord, LocalJsonLoader, SongRecord};

/// Produces the statements that populate the staging tables.
pub trait StagingLoader {
    /// Short source name for logs.
    fn name(&self) -> &'static str;

    /// Statements for `dialect`, events first, then songs.
    fn statements(&self, dialect: Dialect) -> Result<Vec<SqlStatement>, PipelineError>;
}

/// Empties both staging tables so a run only transforms the data it loaded.
///
/// Redshift commits implicitly on TRUNCATE, so inside a per-stage transaction
/// the tables are cleared with DELETE instead. SQLite has no TRUNCATE.
pub fn clear_staging_statements(dialect: Dialect, commit_mode: CommitMode) -> Vec<SqlStatement> {
    let truncate = match dialect {
        Dialect::Redshift => commit_mode == CommitMode::PerStatement,
        Dialect::Postgres => true,
        Dialect::Sqlite => false,
    };
    let backend = dialect.backend();
    [
        clear_statement("staging_events", StagingEvents::Table, truncate, backend),
        clear_statement("staging_songs", StagingSongs::Table, truncate, backend),
    ]
    .into()
}

fn clear_statement<T>(name: &str, table: T, truncate: bool, backend: DbBackend) -> SqlStatement
where
    T: Iden + 'static,
{
    if truncate {
        let stmt = Table::truncate().table(table).to_owned();
        SqlStatement::new(format!("truncate {name}"), backend.build(&stmt))
    } else {
        let stmt = Query::delete().from_table(table).to_owned();
        SqlStatement::new(format!("clear {name}"), backend.build(&stmt))
    }
}

/// Builds the loader selected by `DWH_STAGING_SOURCE`.
pub fn loader_from_config(config: &AppConfig) -> Result<Box<dyn StagingLoader>, ConfigError> {
    match config.staging_source {
        StagingSourceKind::S3 => Ok(Box::new(S3CopyLoader::from_config(&config.s3)?)),
        StagingSourceKind::Local => Ok(Box::new(LocalJsonLoader::from_config(&config.local)?)),
    }
}
