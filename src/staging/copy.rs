//! Redshift bulk COPY from S3.
//!
//! COPY does not accept bind parameters, so the source URIs and role ARN are
//! spliced into the statement as string literals. They are validated by
//! [`S3Config::validate`] first and quote-escaped on the way in.

use sea_orm::{DbBackend, Statement};

use super::StagingLoader;
use crate::{
    config::{ConfigError, S3Config},
    db::Dialect,
    error::PipelineError,
    pipeline::SqlStatement,
};

/// How COPY maps JSON records onto the target columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonFormat {
    /// A jsonpaths document at the given URI lists one path per column.
    Paths(String),
    /// Top-level keys are matched to column names.
    Auto,
}

/// One `COPY <table> FROM 's3://...'` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCommand {
    pub table: &'static str,
    pub source: String,
    pub iam_role_arn: String,
    pub format: JsonFormat,
    pub region: String,
}

impl CopyCommand {
    pub fn to_sql(&self) -> String {
        let format = match &self.format {
            JsonFormat::Paths(uri) => format!("JSON {}", quote_literal(uri)),
            JsonFormat::Auto => "FORMAT AS JSON 'auto'".to_string(),
        };
        format!(
            "COPY {table} FROM {source}\nCREDENTIALS {credentials}\n{format}\nREGION {region}",
            table = self.table,
            source = quote_literal(&self.source),
            credentials = quote_literal(&format!("aws_iam_role={}", self.iam_role_arn)),
            region = quote_literal(&self.region),
        )
    }
}

/// Renders `value` as a single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Loads both datasets with one COPY each.
#[derive(Debug, Clone)]
pub struct S3CopyLoader {
    events: CopyCommand,
    songs: CopyCommand,
}

impl S3CopyLoader {
    pub fn from_config(s3: &S3Config) -> Result<Self, ConfigError> {
        s3.validate()?;

        let require = |key: &'static str, value: &Option<String>| {
            value.clone().ok_or(ConfigError::MissingSetting { key })
        };
        let log_data = require("LOG_DATA", &s3.log_data)?;
        let log_jsonpath = require("LOG_JSONPATH", &s3.log_jsonpath)?;
        let song_data = require("SONG_DATA", &s3.song_data)?;
        let iam_role_arn = require("IAM_ROLE_ARN", &s3.iam_role_arn)?;

        Ok(Self {
            events: CopyCommand {
                table: "staging_events",
                source: log_data,
                iam_role_arn: iam_role_arn.clone(),
                format: JsonFormat::Paths(log_jsonpath),
                region: s3.region.clone(),
            },
            songs: CopyCommand {
                table: "staging_songs",
                source: song_data,
                iam_role_arn,
                format: JsonFormat::Auto,
                region: s3.region.clone(),
            },
        })
    }

    pub fn commands(&self) -> [&CopyCommand; 2] {
        [&self.events, &self.songs]
    }
}

impl StagingLoader for S3CopyLoader {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn statements(&self, dialect: Dialect) -> Result<Vec<SqlStatement>, PipelineError> {
        if dialect != Dialect::Redshift {
            return Err(PipelineError::CopyUnsupported { dialect });
        }
        Ok(self
            .commands()
            .into_iter()
            .map(|cmd| {
                SqlStatement::new(
                    format!("copy {}", cmd.table),
                    Statement::from_string(DbBackend::Postgres, cmd.to_sql()),
                )
            })
            .collect())
    }
}
