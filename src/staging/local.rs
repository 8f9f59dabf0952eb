//! Staging from JSON files on the local filesystem.
//!
//! Mirrors what COPY does with the two datasets: log records are mapped onto
//! `staging_events` the way the jsonpaths document maps them, song records
//! are matched to `staging_songs` by key name. Rows go in through
//! parameterized multi-row INSERTs.

use std::{
    fs,
    path::{Path, PathBuf},
};

use sea_orm::sea_query::{InsertStatement, Query, SimpleExpr};
use serde::{Deserialize, Deserializer, de};
use walkdir::WalkDir;

use super::StagingLoader;
use crate::{
    config::{ConfigError, LocalSourceConfig},
    db::Dialect,
    error::PipelineError,
    pipeline::SqlStatement,
    schema::{StagingEvents, StagingSongs},
};

/// Rows per INSERT statement; keeps the bind count under every engine's limit.
const BATCH_ROWS: usize = 200;

/// One user-activity record from the event log dataset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub artist: Option<String>,
    pub auth: Option<String>,
    pub first_name: Option<String>,
    pub gender: Option<String>,
    pub item_in_session: Option<i32>,
    pub last_name: Option<String>,
    pub length: Option<f64>,
    pub level: Option<String>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub page: Option<String>,
    pub registration: Option<f64>,
    pub session_id: Option<i32>,
    pub song: Option<String>,
    pub status: Option<i16>,
    pub ts: Option<i64>,
    pub user_agent: Option<String>,
    /// Logged-out events carry an empty string.
    #[serde(default, deserialize_with = "lenient_user_id")]
    pub user_id: Option<i32>,
}

/// One catalog entry from the song dataset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SongRecord {
    pub song_id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub year: Option<i16>,
    pub num_songs: Option<i32>,
    pub artist_id: Option<String>,
    pub artist_latitude: Option<f32>,
    pub artist_longitude: Option<f32>,
    pub artist_location: Option<String>,
    pub artist_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Number(i64),
    Text(String),
}

fn lenient_user_id<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawUserId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawUserId::Number(n)) => i32::try_from(n).map(Some).map_err(de::Error::custom),
        Some(RawUserId::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawUserId::Text(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
    }
}

impl EventRecord {
    fn values(&self) -> Vec<SimpleExpr> {
        vec![
            self.artist.clone().into(),
            self.auth.clone().into(),
            self.first_name.clone().into(),
            self.gender.clone().into(),
            self.item_in_session.into(),
            self.last_name.clone().into(),
            self.length.into(),
            self.level.clone().into(),
            self.location.clone().into(),
            self.method.clone().into(),
            self.page.clone().into(),
            self.registration.into(),
            self.session_id.into(),
            self.song.clone().into(),
            self.status.into(),
            self.ts.into(),
            self.user_agent.clone().into(),
            self.user_id.into(),
        ]
    }
}

impl SongRecord {
    fn values(&self) -> Vec<SimpleExpr> {
        vec![
            self.song_id.clone().into(),
            self.title.clone().into(),
            self.duration.into(),
            self.year.into(),
            self.num_songs.into(),
            self.artist_id.clone().into(),
            self.artist_latitude.into(),
            self.artist_longitude.into(),
            self.artist_location.clone().into(),
            self.artist_name.clone().into(),
        ]
    }
}

/// Reads `*.json` files below two directories into the staging tables.
#[derive(Debug, Clone)]
pub struct LocalJsonLoader {
    log_data: PathBuf,
    song_data: PathBuf,
}

impl LocalJsonLoader {
    pub fn new(log_data: impl Into<PathBuf>, song_data: impl Into<PathBuf>) -> Self {
        Self {
            log_data: log_data.into(),
            song_data: song_data.into(),
        }
    }

    pub fn from_config(local: &LocalSourceConfig) -> Result<Self, ConfigError> {
        let log_data = local
            .log_data
            .clone()
            .ok_or(ConfigError::MissingSetting { key: "LOCAL_LOG_DATA" })?;
        let song_data = local
            .song_data
            .clone()
            .ok_or(ConfigError::MissingSetting {
                key: "LOCAL_SONG_DATA",
            })?;
        Ok(Self::new(log_data, song_data))
    }

    /// Every event record under the log directory, in file-name order.
    pub fn read_events(&self) -> Result<Vec<EventRecord>, PipelineError> {
        read_records(&self.log_data)
    }

    /// Every song record under the song directory, in file-name order.
    pub fn read_songs(&self) -> Result<Vec<SongRecord>, PipelineError> {
        read_records(&self.song_data)
    }
}

impl StagingLoader for LocalJsonLoader {
    fn name(&self) -> &'static str {
        "local"
    }

    fn statements(&self, dialect: Dialect) -> Result<Vec<SqlStatement>, PipelineError> {
        let events = self.read_events()?;
        let songs = self.read_songs()?;
        tracing::debug!(
            events = events.len(),
            songs = songs.len(),
            "read local staging records"
        );

        let mut statements = Vec::new();
        insert_batches(
            &mut statements,
            dialect,
            "staging_events",
            &events,
            || {
                Query::insert()
                    .into_table(StagingEvents::Table)
                    .columns([
                        StagingEvents::Artist,
                        StagingEvents::Auth,
                        StagingEvents::FirstName,
                        StagingEvents::Gender,
                        StagingEvents::ItemSession,
                        StagingEvents::LastName,
                        StagingEvents::Length,
                        StagingEvents::Level,
                        StagingEvents::Location,
                        StagingEvents::Method,
                        StagingEvents::Page,
                        StagingEvents::Registration,
                        StagingEvents::SessionId,
                        StagingEvents::Song,
                        StagingEvents::Status,
                        StagingEvents::Ts,
                        StagingEvents::UserAgent,
                        StagingEvents::UserId,
                    ])
                    .to_owned()
            },
            EventRecord::values,
        )?;
        insert_batches(
            &mut statements,
            dialect,
            "staging_songs",
            &songs,
            || {
                Query::insert()
                    .into_table(StagingSongs::Table)
                    .columns([
                        StagingSongs::SongId,
                        StagingSongs::Title,
                        StagingSongs::Duration,
                        StagingSongs::Year,
                        StagingSongs::NumSongs,
                        StagingSongs::ArtistId,
                        StagingSongs::ArtistLatitude,
                        StagingSongs::ArtistLongitude,
                        StagingSongs::ArtistLocation,
                        StagingSongs::ArtistName,
                    ])
                    .to_owned()
            },
            SongRecord::values,
        )?;
        Ok(statements)
    }
}

fn insert_batches<R>(
    statements: &mut Vec<SqlStatement>,
    dialect: Dialect,
    table: &'static str,
    records: &[R],
    header: impl Fn() -> InsertStatement,
    values: impl Fn(&R) -> Vec<SimpleExpr>,
) -> Result<(), PipelineError> {
    let backend = dialect.backend();
    for (batch_no, batch) in records.chunks(BATCH_ROWS).enumerate() {
        let mut insert = header();
        for record in batch {
            insert
                .values(values(record))
                .map_err(|source| PipelineError::QueryBuild { table, source })?;
        }
        statements.push(SqlStatement::new(
            format!("insert {table} batch {}", batch_no + 1),
            backend.build(&insert),
        ));
    }
    Ok(())
}

fn read_records<T>(dir: &Path) -> Result<Vec<T>, PipelineError>
where
    T: for<'de> Deserialize<'de>,
{
    if !dir.is_dir() {
        return Err(PipelineError::StagingIo {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let mut records = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|source| PipelineError::StagingWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        let text = fs::read_to_string(path).map_err(|source| PipelineError::StagingIo {
            path: path.to_path_buf(),
            source,
        })?;
        for record in serde_json::Deserializer::from_str(&text).into_iter::<T>() {
            records.push(record.map_err(|source| PipelineError::StagingRecord {
                path: path.to_path_buf(),
                source,
            })?);
        }
    }
    Ok(records)
}
