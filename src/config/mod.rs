//! Configuration loading for the warehouse loader.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `DWH_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, fmt, path::PathBuf, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Prefix shared by every configuration key.
pub const ENV_PREFIX: &str = "DWH_";

/// Application configuration derived from `DWH_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub warehouse_flavor: WarehouseFlavor,
    #[serde(default)]
    pub key_constraints: KeyConstraints,
    #[serde(default)]
    pub commit_mode: CommitMode,
    #[serde(default)]
    pub staging_source: StagingSourceKind,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub local: LocalSourceConfig,
}

/// Connection parts of the warehouse cluster, used when no full URL is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ClusterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_db_port")]
    pub port: u16,
}

/// Object storage settings for the bulk COPY loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct S3Config {
    /// Prefix holding the event log files.
    ///
    /// Environment variable: `DWH_LOG_DATA`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_data: Option<String>,

    /// Jsonpaths document mapping log fields onto `staging_events` columns.
    ///
    /// Environment variable: `DWH_LOG_JSONPATH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_jsonpath: Option<String>,

    /// Prefix holding the song metadata files.
    ///
    /// Environment variable: `DWH_SONG_DATA`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_data: Option<String>,

    /// Role the warehouse assumes to read the bucket.
    ///
    /// Environment variable: `DWH_IAM_ROLE_ARN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_role_arn: Option<String>,

    /// Region of the source bucket (default: us-west-2)
    ///
    /// Environment variable: `DWH_S3_REGION`
    #[serde(default = "default_s3_region")]
    pub region: String,
}

/// Directories read by the local JSON staging source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LocalSourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_data: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_data: Option<PathBuf>,
}

/// Which warehouse engine sits behind a Postgres-protocol connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseFlavor {
    #[default]
    Redshift,
    Postgres,
}

/// Whether natural keys and foreign keys are declared on engines that enforce them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyConstraints {
    /// Declared only where the engine treats them as metadata (Redshift).
    #[default]
    Informational,
    /// Declared everywhere.
    Enforced,
}

/// Transaction granularity used when executing pipeline statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Every statement commits on its own.
    #[default]
    PerStatement,
    /// Every stage runs inside one transaction.
    PerStage,
}

/// Where the staging loader reads its datasets from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingSourceKind {
    #[default]
    S3,
    Local,
}

macro_rules! impl_config_enum {
    ($ty:ty, $key:literal, { $($text:literal => $variant:path),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    _ => Err(ConfigError::InvalidChoice {
                        key: $key,
                        value: value.to_string(),
                        expected: &[$($text),+],
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($variant => $text,)+
                };
                f.write_str(text)
            }
        }
    };
}

impl_config_enum!(WarehouseFlavor, "WAREHOUSE_FLAVOR", {
    "redshift" => WarehouseFlavor::Redshift,
    "postgres" => WarehouseFlavor::Postgres,
});
impl_config_enum!(KeyConstraints, "KEY_CONSTRAINTS", {
    "informational" => KeyConstraints::Informational,
    "enforced" => KeyConstraints::Enforced,
});
impl_config_enum!(CommitMode, "COMMIT_MODE", {
    "per_statement" => CommitMode::PerStatement,
    "per_stage" => CommitMode::PerStage,
});
impl_config_enum!(StagingSourceKind, "STAGING_SOURCE", {
    "s3" => StagingSourceKind::S3,
    "local" => StagingSourceKind::Local,
});

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: None,
            cluster: ClusterConfig::default(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            warehouse_flavor: WarehouseFlavor::default(),
            key_constraints: KeyConstraints::default(),
            commit_mode: CommitMode::default(),
            staging_source: StagingSourceKind::default(),
            s3: S3Config::default(),
            local: LocalSourceConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: None,
            name: None,
            user: None,
            password: None,
            port: default_db_port(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            log_data: None,
            log_jsonpath: None,
            song_data: None,
            iam_role_arn: None,
            region: default_s3_region(),
        }
    }
}

impl AppConfig {
    /// Returns the connection URL, either as configured or assembled from the cluster parts.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = self.database_url.as_deref() {
            return Ok(url.to_string());
        }

        let host = self
            .cluster
            .host
            .as_deref()
            .ok_or(ConfigError::MissingSetting { key: "DB_HOST" })?;
        let name = self
            .cluster
            .name
            .as_deref()
            .ok_or(ConfigError::MissingSetting { key: "DB_NAME" })?;
        let user = self
            .cluster
            .user
            .as_deref()
            .ok_or(ConfigError::MissingSetting { key: "DB_USER" })?;

        let mut url = Url::parse(&format!("postgres://{host}")).map_err(|source| {
            ConfigError::InvalidDatabaseHost {
                value: host.to_string(),
                source,
            }
        })?;
        // Setters only fail for cannot-be-a-base URLs, which a postgres:// URL never is.
        let _ = url.set_username(user);
        let _ = url.set_password(self.cluster.password.as_deref());
        let _ = url.set_port(Some(self.cluster.port));
        url.set_path(name);

        Ok(url.to_string())
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.database_url.is_some() {
            config.database_url = Some("[REDACTED]".to_string());
        }
        if config.cluster.password.is_some() {
            config.cluster.password = Some("[REDACTED]".to_string());
        }
        if config.s3.iam_role_arn.is_some() {
            config.s3.iam_role_arn = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection_url()?;

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidChoice {
                key: "LOG_FORMAT",
                value: self.log_format.clone(),
                expected: &["json", "pretty"],
            });
        }

        self.s3.validate()
    }
}

impl S3Config {
    /// Validate the format of every provided value; absent values are checked
    /// when a COPY loader is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("LOG_DATA", &self.log_data),
            ("LOG_JSONPATH", &self.log_jsonpath),
            ("SONG_DATA", &self.song_data),
        ] {
            if let Some(value) = value {
                validate_s3_uri(key, value)?;
            }
        }

        if let Some(arn) = &self.iam_role_arn {
            if !iam_role_pattern().is_match(arn) {
                return Err(ConfigError::InvalidIamRole { value: arn.clone() });
            }
        }

        if !region_pattern().is_match(&self.region) {
            return Err(ConfigError::InvalidRegion {
                value: self.region.clone(),
            });
        }

        Ok(())
    }
}

fn validate_s3_uri(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidS3Uri {
        key,
        value: value.to_string(),
    };
    let url = Url::parse(value).map_err(|_| invalid())?;
    if url.scheme() != "s3" || url.host_str().is_none_or(str::is_empty) || value.contains('\'') {
        return Err(invalid());
    }
    Ok(())
}

fn iam_role_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:role/[A-Za-z0-9+=,.@_/-]+$")
            .expect("IAM role pattern is valid")
    })
}

fn region_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").expect("region pattern is valid")
    })
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_db_port() -> u16 {
    5439
}

fn default_db_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_s3_region() -> String {
    "us-west-2".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("{key} is missing; set DWH_{key}")]
    MissingSetting { key: &'static str },
    #[error("invalid value '{value}' for DWH_{key}: {source}")]
    InvalidNumber {
        key: &'static str,
        value: String,
        source: std::num::ParseIntError,
    },
    #[error("invalid value '{value}' for DWH_{key}; expected one of {expected:?}")]
    InvalidChoice {
        key: &'static str,
        value: String,
        expected: &'static [&'static str],
    },
    #[error("invalid database host '{value}': {source}")]
    InvalidDatabaseHost {
        value: String,
        source: url::ParseError,
    },
    #[error("DWH_{key} must be an s3://bucket/prefix URI without quotes, got '{value}'")]
    InvalidS3Uri { key: &'static str, value: String },
    #[error("DWH_IAM_ROLE_ARN is not an IAM role ARN: '{value}'")]
    InvalidIamRole { value: String },
    #[error("DWH_S3_REGION is not a region name: '{value}'")]
    InvalidRegion { value: String },
}

/// Loads configuration using layered `.env` files and `DWH_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.<profile>`, `.env.<profile>.local`,
    /// then the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut take = |key: &str| {
            layered
                .remove(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let profile = take("PROFILE").unwrap_or(profile_hint);
        let log_level = take("LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take("LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url = take("DATABASE_URL");

        let cluster = ClusterConfig {
            host: take("DB_HOST"),
            name: take("DB_NAME"),
            user: take("DB_USER"),
            password: take("DB_PASSWORD"),
            port: parse_number("DB_PORT", take("DB_PORT"))?.unwrap_or_else(default_db_port),
        };
        let db_acquire_timeout_ms = parse_number("DB_ACQUIRE_TIMEOUT_MS", take("DB_ACQUIRE_TIMEOUT_MS"))?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let warehouse_flavor = parse_choice(take("WAREHOUSE_FLAVOR"))?;
        let key_constraints = parse_choice(take("KEY_CONSTRAINTS"))?;
        let commit_mode = parse_choice(take("COMMIT_MODE"))?;
        let staging_source = parse_choice(take("STAGING_SOURCE"))?;

        let s3 = S3Config {
            log_data: take("LOG_DATA"),
            log_jsonpath: take("LOG_JSONPATH"),
            song_data: take("SONG_DATA"),
            iam_role_arn: take("IAM_ROLE_ARN"),
            region: take("S3_REGION").unwrap_or_else(default_s3_region),
        };

        let local = LocalSourceConfig {
            log_data: take("LOCAL_LOG_DATA").map(|p| self.resolve(p)),
            song_data: take("LOCAL_SONG_DATA").map(|p| self.resolve(p)),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            cluster,
            db_acquire_timeout_ms,
            warehouse_flavor,
            key_constraints,
            commit_mode,
            staging_source,
            s3,
            local,
        };

        config.validate()?;
        Ok(config)
    }

    /// Relative local paths are taken relative to the configuration directory.
    fn resolve(&self, path: String) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    value
        .map(|v| {
            v.parse()
                .map_err(|source| ConfigError::InvalidNumber { key, value: v, source })
        })
        .transpose()
}

fn parse_choice<T>(value: Option<String>) -> Result<T, ConfigError>
where
    T: FromStr<Err = ConfigError> + Default,
{
    value.map(|v| v.parse()).transpose().map(Option::unwrap_or_default)
}
