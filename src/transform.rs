//! Stage 2: INSERT...SELECT from the staging tables into the star schema.
//!
//! Dimensions are filled before the fact table so every `songplays` row can
//! reference rows that already exist. Each dimension keeps one row per key:
//! `users` keeps the most recent event of each user, `songs` and `artists`
//! one catalog entry per id.

use sea_orm::Statement;

use crate::{db::Dialect, pipeline::SqlStatement};

/// Event type of a song play.
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// A play matches a catalog song when the durations differ by less than this.
pub const DURATION_TOLERANCE: u32 = 2;

type InsertSql = fn(Dialect) -> String;

/// Target tables with their insert builders, in execution order.
fn inserts() -> [(&'static str, InsertSql); 5] {
    [
        ("users", |_| user_table_insert()),
        ("songs", |_| song_table_insert()),
        ("artists", |_| artist_table_insert()),
        ("time", time_table_insert),
        ("songplays", songplay_table_insert),
    ]
}

/// The five insert statements, dimensions first.
pub fn insert_table_statements(dialect: Dialect) -> Vec<SqlStatement> {
    inserts()
        .into_iter()
        .map(|(table, build)| {
            SqlStatement::new(
                format!("insert {table}"),
                Statement::from_string(dialect.backend(), build(dialect)),
            )
        })
        .collect()
}

/// Epoch milliseconds in `column` as a timestamp, truncated to the second.
pub fn epoch_millis_to_timestamp(dialect: Dialect, column: &str) -> String {
    match dialect {
        Dialect::Redshift | Dialect::Postgres => {
            format!("TIMESTAMP 'epoch' + ({column} / 1000) * INTERVAL '1 second'")
        }
        Dialect::Sqlite => format!("datetime({column} / 1000, 'unixepoch')"),
    }
}

/// Calendar fields of `column`, in `time` column order after `start_time`.
///
/// `week` is the ISO-8601 week number and `weekday` counts from Sunday = 0,
/// matching Redshift's `EXTRACT(week)` and `EXTRACT(weekday)`.
fn calendar_fields(dialect: Dialect, column: &str) -> [String; 6] {
    match dialect {
        Dialect::Redshift | Dialect::Postgres => {
            // Postgres has no `weekday` field; `dow` is its equivalent.
            let weekday = if dialect == Dialect::Redshift {
                "weekday"
            } else {
                "dow"
            };
            ["hour", "day", "week", "month", "year", weekday]
                .map(|field| format!("EXTRACT({field} FROM {column})"))
        }
        Dialect::Sqlite => {
            let part = |fmt: &str| format!("CAST(strftime('{fmt}', {column}) AS INTEGER)");
            [
                part("%H"),
                part("%d"),
                // Day-of-year of the week's Thursday decides the ISO week.
                format!(
                    "(CAST(strftime('%j', date({column}, '-3 days', 'weekday 4')) AS INTEGER) - 1) / 7 + 1"
                ),
                part("%m"),
                part("%Y"),
                part("%w"),
            ]
        }
    }
}

fn songplay_table_insert(dialect: Dialect) -> String {
    format!(
        "INSERT INTO songplays (start_time, user_id, level, song_id, artist_id, session_id, location, user_agent)
SELECT start_time, user_id, level, song_id, artist_id, session_id, location, user_agent
FROM (
    SELECT
        {start_time} AS start_time,
        e.user_id,
        e.level,
        s.song_id,
        s.artist_id,
        e.session_id,
        e.location,
        e.user_agent,
        ROW_NUMBER() OVER (
            PARTITION BY e.user_id, e.session_id, e.item_session, e.ts, e.song, e.artist, e.length
            ORDER BY ABS(e.length - s.duration), s.song_id
        ) AS match_rank
    FROM staging_events e
    JOIN staging_songs s
    ON e.song = s.title AND e.artist = s.artist_name AND ABS(e.length - s.duration) < {DURATION_TOLERANCE}
    WHERE e.page = '{NEXT_SONG_PAGE}' AND e.user_id IS NOT NULL AND e.ts IS NOT NULL
) AS matched
WHERE match_rank = 1",
        start_time = epoch_millis_to_timestamp(dialect, "e.ts"),
    )
}

fn user_table_insert() -> String {
    format!(
        "INSERT INTO users (user_id, first_name, last_name, gender, level)
SELECT user_id, first_name, last_name, gender, level
FROM (
    SELECT
        user_id,
        first_name,
        last_name,
        gender,
        level,
        ROW_NUMBER() OVER (PARTITION BY user_id ORDER BY ts DESC NULLS LAST) AS seen_rank
    FROM staging_events
    WHERE user_id IS NOT NULL AND page = '{NEXT_SONG_PAGE}'
) AS latest
WHERE seen_rank = 1"
    )
}

fn song_table_insert() -> String {
    "INSERT INTO songs (song_id, title, artist_id, year, duration)
SELECT song_id, title, artist_id, year, duration
FROM (
    SELECT
        song_id,
        title,
        artist_id,
        year,
        duration,
        ROW_NUMBER() OVER (PARTITION BY song_id ORDER BY title, artist_id) AS entry_rank
    FROM staging_songs
    WHERE song_id IS NOT NULL
) AS catalog
WHERE entry_rank = 1"
        .to_string()
}

fn artist_table_insert() -> String {
    "INSERT INTO artists (artist_id, name, location, latitude, longitude)
SELECT artist_id, name, location, latitude, longitude
FROM (
    SELECT
        artist_id,
        artist_name AS name,
        artist_location AS location,
        artist_latitude AS latitude,
        artist_longitude AS longitude,
        ROW_NUMBER() OVER (PARTITION BY artist_id ORDER BY song_id) AS entry_rank
    FROM staging_songs
    WHERE artist_id IS NOT NULL
) AS catalog
WHERE entry_rank = 1"
        .to_string()
}

fn time_table_insert(dialect: Dialect) -> String {
    let [hour, day, week, month, year, weekday] = calendar_fields(dialect, "start_time");
    format!(
        "INSERT INTO time (start_time, hour, day, week, month, year, weekday)
SELECT
    start_time,
    {hour} AS hour,
    {day} AS day,
    {week} AS week,
    {month} AS month,
    {year} AS year,
    {weekday} AS weekday
FROM (
    SELECT DISTINCT {start_time} AS start_time
    FROM staging_events
    WHERE ts IS NOT NULL
) AS converted",
        start_time = epoch_millis_to_timestamp(dialect, "ts"),
    )
}
