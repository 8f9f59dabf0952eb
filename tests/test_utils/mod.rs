//! Shared fixtures for the warehouse integration tests.
//!
//! Every test gets its own in-memory SQLite warehouse and writes its datasets
//! as line-delimited JSON into a temporary directory, so runs go through the
//! same local staging source the binary uses.

#![allow(dead_code)]

use std::fs;

use anyhow::Result;
use dwh_etl::{
    config::{CommitMode, KeyConstraints},
    db::Dialect,
    pipeline::{self, PipelineOptions},
    staging::LocalJsonLoader,
};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use serde_json::{Value, json};
use tempfile::TempDir;

/// 2017-07-14 02:40:00 UTC, a Friday in ISO week 28.
pub const TS: i64 = 1_500_000_000_000;

pub fn options(key_constraints: KeyConstraints, commit_mode: CommitMode) -> PipelineOptions {
    PipelineOptions {
        dialect: Dialect::Sqlite,
        commit_mode,
        key_constraints,
    }
}

pub fn default_options() -> PipelineOptions {
    options(KeyConstraints::Informational, CommitMode::PerStatement)
}

/// Opens an in-memory SQLite warehouse with every table created.
pub async fn setup_warehouse(options: &PipelineOptions) -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    pipeline::create_tables(&db, options).await?;
    Ok(db)
}

/// A `NextSong` event for user 26 in session 583.
pub fn next_song(song: &str, artist: &str, length: f64, ts: i64, item: i64) -> Value {
    json!({
        "artist": artist,
        "auth": "Logged In",
        "firstName": "Ryan",
        "gender": "M",
        "itemInSession": item,
        "lastName": "Smith",
        "length": length,
        "level": "free",
        "location": "San Jose-Sunnyvale-Santa Clara, CA",
        "method": "PUT",
        "page": "NextSong",
        "registration": 1541016707796.0,
        "sessionId": 583,
        "song": song,
        "status": 200,
        "ts": ts,
        "userAgent": "Mozilla/5.0 (X11; Linux x86_64)",
        "userId": "26"
    })
}

/// A logged-out page view with an empty `userId`.
pub fn home_page(ts: i64) -> Value {
    json!({
        "artist": null,
        "auth": "Logged Out",
        "firstName": null,
        "gender": null,
        "itemInSession": 0,
        "lastName": null,
        "length": null,
        "level": "free",
        "location": null,
        "method": "GET",
        "page": "Home",
        "registration": null,
        "sessionId": 584,
        "song": null,
        "status": 200,
        "ts": ts,
        "userAgent": null,
        "userId": ""
    })
}

pub fn song(song_id: &str, title: &str, artist_id: &str, artist_name: &str, duration: f64) -> Value {
    json!({
        "num_songs": 1,
        "artist_id": artist_id,
        "artist_latitude": null,
        "artist_longitude": null,
        "artist_location": "",
        "artist_name": artist_name,
        "song_id": song_id,
        "title": title,
        "duration": duration,
        "year": 2004
    })
}

/// Datasets on disk, removed when dropped.
pub struct Dataset {
    pub dir: TempDir,
}

impl Dataset {
    /// Writes `events` to `log_data/events.json` and `songs` to
    /// `song_data/A/songs.json`, one record per line.
    pub fn write(events: &[Value], songs: &[Value]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        write_lines(&dir, "log_data/events.json", events)?;
        write_lines(&dir, "song_data/A/songs.json", songs)?;
        Ok(Self { dir })
    }

    pub fn loader(&self) -> LocalJsonLoader {
        LocalJsonLoader::new(
            self.dir.path().join("log_data"),
            self.dir.path().join("song_data"),
        )
    }
}

pub fn write_lines(dir: &TempDir, relative: &str, records: &[Value]) -> Result<()> {
    let path = dir.path().join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body: Vec<String> = records.iter().map(Value::to_string).collect();
    fs::write(path, body.join("\n"))?;
    Ok(())
}

/// Row count of `table`.
pub async fn count(db: &DatabaseConnection, table: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            format!("SELECT COUNT(*) AS row_count FROM {table}"),
        ))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no count row for {table}"))?;
    Ok(row.try_get("", "row_count")?)
}

/// Row count of `table` matching `predicate`.
pub async fn count_where(db: &DatabaseConnection, table: &str, predicate: &str) -> Result<i64> {
    count(db, &format!("{table} WHERE {predicate}")).await
}
