//! Warehouse connection management.
//!
//! The pipeline owns exactly one connection for the lifetime of the process,
//! so the SeaORM pool is capped at a single connection and never retried.

use std::{fmt, time::Duration};

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};

use crate::config::{AppConfig, ConfigError, WarehouseFlavor};

/// Errors that can occur while establishing the warehouse connection.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Invalid database configuration: {source}")]
    InvalidConfiguration {
        #[source]
        source: ConfigError,
    },
    #[error("Unsupported database backend: {backend:?}")]
    UnsupportedBackend { backend: DbBackend },
}

/// SQL flavor used when rendering pipeline statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Amazon Redshift: Postgres wire protocol, COPY from S3, informational keys.
    Redshift,
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Resolve the dialect from the live connection backend and the configured flavor.
    pub fn resolve(backend: DbBackend, flavor: WarehouseFlavor) -> Result<Self, DatabaseError> {
        match backend {
            DbBackend::Postgres => Ok(match flavor {
                WarehouseFlavor::Redshift => Dialect::Redshift,
                WarehouseFlavor::Postgres => Dialect::Postgres,
            }),
            DbBackend::Sqlite => Ok(Dialect::Sqlite),
            backend => Err(DatabaseError::UnsupportedBackend { backend }),
        }
    }

    /// Backend whose query builder renders this dialect.
    pub fn backend(self) -> DbBackend {
        match self {
            Dialect::Redshift | Dialect::Postgres => DbBackend::Postgres,
            Dialect::Sqlite => DbBackend::Sqlite,
        }
    }

    /// Whether the engine ignores declared primary/foreign keys at insert time.
    pub fn keys_are_informational(self) -> bool {
        matches!(self, Dialect::Redshift)
    }

    /// Whether sort/distribution keys and IDENTITY columns are understood.
    pub fn supports_layout_hints(self) -> bool {
        matches!(self, Dialect::Redshift)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Redshift => "redshift",
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        })
    }
}

/// Opens the single warehouse connection described by `cfg`.
pub async fn connect(cfg: &AppConfig) -> Result<DatabaseConnection, DatabaseError> {
    let url = cfg
        .connection_url()
        .map_err(|source| DatabaseError::InvalidConfiguration { source })?;

    let mut opt = ConnectOptions::new(url);
    opt.max_connections(1)
        .min_connections(1)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let conn = Database::connect(opt).await?;
    log::info!(
        "Connected to {:?} warehouse backend",
        conn.get_database_backend()
    );
    Ok(conn)
}

/// Health check for the database connection.
pub async fn health_check(db: &DatabaseConnection) -> Result<(), sea_orm::DbErr> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt).await?;
    Ok(())
}
