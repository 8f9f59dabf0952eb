//! # Error Handling
//!
//! Every pipeline failure is fatal: the first error aborts the run and is
//! propagated to the process boundary with the driver's message attached.

use std::{fmt, path::PathBuf};

use sea_orm::{DbErr, sea_query};
use thiserror::Error;

use crate::{config::ConfigError, db::Dialect};

/// The phase of a run a statement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Dropping and creating tables.
    Schema,
    /// Stage 1: populating the staging tables.
    Staging,
    /// Stage 2: INSERT...SELECT into the star schema.
    Transform,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Schema => "schema",
            Stage::Staging => "staging",
            Stage::Transform => "transform",
        })
    }
}

/// Errors raised while building or executing pipeline statements.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} statement `{name}` failed: {source}")]
    Statement {
        stage: Stage,
        name: String,
        #[source]
        source: DbErr,
    },
    #[error("failed to {action} {stage} transaction: {source}")]
    Transaction {
        stage: Stage,
        action: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("query `{name}` failed: {source}")]
    Query {
        name: String,
        #[source]
        source: DbErr,
    },
    #[error("bulk COPY from object storage requires a Redshift warehouse, connected dialect is {dialect}")]
    CopyUnsupported { dialect: Dialect },
    #[error("invalid staging configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to read staging data at {path}: {source}")]
    StagingIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk staging directory {path}: {source}")]
    StagingWalk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("malformed JSON record in {path}: {source}")]
    StagingRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build insert for {table}: {source}")]
    QueryBuild {
        table: &'static str,
        #[source]
        source: sea_query::error::Error,
    },
}

impl PipelineError {
    /// The underlying driver error, if the failure came from the database.
    pub fn db_error(&self) -> Option<&DbErr> {
        match self {
            PipelineError::Statement { source, .. }
            | PipelineError::Transaction { source, .. }
            | PipelineError::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}
