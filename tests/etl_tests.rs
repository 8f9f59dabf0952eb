//! End-to-end pipeline runs against an in-memory SQLite warehouse.

mod test_utils;

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike};
use dwh_etl::{
    config::{CommitMode, KeyConstraints},
    error::{PipelineError, Stage},
    pipeline,
    schema::integrity::{ViolationKind, check_keys},
};
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use serde_json::json;
use test_utils::{
    Dataset, TS, count, count_where, default_options, home_page, next_song, options, setup_warehouse, song,
};

async fn execute(db: &DatabaseConnection, sql: &str) -> Result<()> {
    db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?;
    Ok(())
}

fn catalog() -> Vec<serde_json::Value> {
    vec![
        song("S1", "Song One", "A1", "Artist One", 200.0),
        song("S2", "Song Two", "A2", "Artist Two", 180.0),
    ]
}

#[tokio::test]
async fn close_duration_produces_one_songplay() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let data = Dataset::write(&[next_song("Song One", "Artist One", 200.5, TS, 0)], &catalog())?;

    let report = pipeline::run_etl(&db, &options, &data.loader()).await?;
    assert_eq!(report.staging.stage, Stage::Staging);
    assert_eq!(report.transform.statements, 5);

    assert_eq!(count(&db, "songplays").await?, 1);
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            "SELECT song_id, artist_id, user_id, CAST(start_time AS TEXT) AS started FROM songplays".to_string(),
        ))
        .await?
        .expect("one songplay");
    assert_eq!(row.try_get::<String>("", "song_id")?, "S1");
    assert_eq!(row.try_get::<String>("", "artist_id")?, "A1");
    assert_eq!(row.try_get::<i32>("", "user_id")?, 26);
    assert_eq!(row.try_get::<String>("", "started")?, "2017-07-14 02:40:00");
    Ok(())
}

#[tokio::test]
async fn distant_duration_produces_no_songplay() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let data = Dataset::write(&[next_song("Song One", "Artist One", 203.0, TS, 0)], &catalog())?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;

    assert_eq!(count(&db, "songplays").await?, 0);
    // The play still counts as user activity and as a point in time.
    assert_eq!(count(&db, "users").await?, 1);
    assert_eq!(count(&db, "time").await?, 1);
    Ok(())
}

#[tokio::test]
async fn non_song_pages_only_reach_the_time_dimension() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let events = [
        next_song("Song One", "Artist One", 200.5, TS, 0),
        home_page(TS + 60_000),
    ];
    let data = Dataset::write(&events, &catalog())?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;

    assert_eq!(count(&db, "staging_events").await?, 2);
    assert_eq!(count(&db, "users").await?, 1);
    assert_eq!(count(&db, "songplays").await?, 1);
    assert_eq!(count(&db, "time").await?, 2);
    assert_eq!(
        count_where(&db, "time", "CAST(start_time AS TEXT) = '2017-07-14 02:41:00'").await?,
        1
    );
    Ok(())
}

#[tokio::test]
async fn time_rows_decompose_the_timestamp() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    // 2017-07-14, then three dates whose ISO week belongs to a neighbouring year.
    let stamps = [TS, 1_609_459_200_000, 1_546_300_800_000, 1_577_750_400_000];
    let events: Vec<_> = stamps.iter().map(|ts| home_page(*ts)).collect();
    let data = Dataset::write(&events, &catalog())?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;
    assert_eq!(count(&db, "time").await?, stamps.len() as i64);

    for ts in stamps {
        let expected = DateTime::from_timestamp_millis(ts).expect("valid timestamp");
        let started = expected.format("%Y-%m-%d %H:%M:%S").to_string();
        let row = db
            .query_one(Statement::from_string(
                db.get_database_backend(),
                format!(
                    "SELECT hour, day, week, month, year, weekday FROM time \
                     WHERE CAST(start_time AS TEXT) = '{started}'"
                ),
            ))
            .await?
            .unwrap_or_else(|| panic!("no time row for {started}"));
        let field = |name: &str| row.try_get::<i32>("", name).map(|v| v as u32);
        assert_eq!(field("hour")?, expected.hour(), "{started}");
        assert_eq!(field("day")?, expected.day(), "{started}");
        assert_eq!(field("week")?, expected.iso_week().week(), "{started}");
        assert_eq!(field("month")?, expected.month(), "{started}");
        assert_eq!(field("year")? as i32, expected.year(), "{started}");
        assert_eq!(field("weekday")?, expected.weekday().num_days_from_sunday(), "{started}");
    }

    let friday = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            "SELECT week, weekday FROM time WHERE CAST(start_time AS TEXT) = '2017-07-14 02:40:00'".to_string(),
        ))
        .await?
        .expect("row for 2017-07-14");
    assert_eq!(friday.try_get::<i32>("", "week")?, 28);
    assert_eq!(friday.try_get::<i32>("", "weekday")?, 5);
    Ok(())
}

#[tokio::test]
async fn dimensions_hold_one_row_per_key() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;

    let mut upgraded = next_song("Song Two", "Artist Two", 180.2, TS + 1_000, 1);
    upgraded["level"] = json!("paid");
    let events = [
        next_song("Song One", "Artist One", 200.5, TS, 0),
        upgraded,
        // Same second as the first play.
        next_song("Unknown", "Nobody", 100.0, TS + 400, 2),
    ];
    let songs = [
        catalog(),
        // The same catalog entry delivered twice.
        vec![song("S1", "Song One", "A1", "Artist One", 200.0)],
    ]
    .concat();
    let data = Dataset::write(&events, &songs)?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;

    assert_eq!(count(&db, "users").await?, 1);
    assert_eq!(count_where(&db, "users", "level = 'paid'").await?, 1);
    assert_eq!(count(&db, "songs").await?, 2);
    assert_eq!(count(&db, "artists").await?, 2);
    assert_eq!(count(&db, "time").await?, 2);

    // A duplicated catalog entry must not duplicate the play.
    let songplays = count(&db, "songplays").await?;
    let plays = count_where(&db, "staging_events", "page = 'NextSong'").await?;
    assert_eq!(songplays, 2);
    assert!(songplays <= plays);

    assert!(check_keys(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn rerun_appends_to_the_warehouse_and_replaces_staging() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let events = [
        next_song("Song One", "Artist One", 200.5, TS, 0),
        home_page(TS + 60_000),
    ];
    let data = Dataset::write(&events, &catalog())?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;
    let first = pipeline::table_counts(&db).await?;
    pipeline::run_etl(&db, &options, &data.loader()).await?;
    let second = pipeline::table_counts(&db).await?;

    for ((table, once), (_, twice)) in first.iter().zip(&second) {
        assert!(*once > 0, "{table} is empty after the first run");
        if table.starts_with("staging_") {
            assert_eq!(twice, once, "{table} was not replaced");
        } else {
            assert_eq!(*twice, once * 2, "{table} did not double");
        }
    }

    let violations = check_keys(&db).await?;
    assert!(
        violations
            .iter()
            .any(|v| v.table == "users" && v.kind == ViolationKind::DuplicateKey)
    );
    Ok(())
}

#[tokio::test]
async fn a_run_only_transforms_the_data_it_loaded() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let next_day = TS + 86_400_000;

    let day_one = Dataset::write(&[next_song("Song One", "Artist One", 200.5, TS, 0)], &catalog())?;
    pipeline::run_etl(&db, &options, &day_one.loader()).await?;

    let day_two = Dataset::write(
        &[next_song("Song Two", "Artist Two", 180.0, next_day, 0)],
        &catalog(),
    )?;
    pipeline::run_etl(&db, &options, &day_two.loader()).await?;

    assert_eq!(count(&db, "staging_events").await?, 1);
    assert_eq!(count(&db, "staging_songs").await?, 2);
    assert_eq!(count(&db, "songplays").await?, 2);
    assert_eq!(count_where(&db, "songplays", "song_id = 'S1'").await?, 1);
    assert_eq!(count_where(&db, "songplays", "song_id = 'S2'").await?, 1);
    assert_eq!(count(&db, "time").await?, 2);
    Ok(())
}

#[tokio::test]
async fn plays_sharing_session_item_and_time_stay_separate() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let mut other_user = next_song("Song One", "Artist One", 200.5, TS, 0);
    other_user["userId"] = json!("27");
    let events = [next_song("Song One", "Artist One", 200.5, TS, 0), other_user];
    let data = Dataset::write(&events, &catalog())?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;

    assert_eq!(count(&db, "users").await?, 2);
    assert_eq!(count(&db, "songplays").await?, 2);
    assert_eq!(count_where(&db, "songplays", "user_id = 27").await?, 1);
    Ok(())
}

#[tokio::test]
async fn enforced_keys_hold_after_a_load() -> Result<()> {
    let options = options(KeyConstraints::Enforced, CommitMode::PerStatement);
    let db = setup_warehouse(&options).await?;
    let events = [
        next_song("Song One", "Artist One", 200.5, TS, 0),
        next_song("Song Two", "Artist Two", 180.0, TS + 5_000, 1),
        home_page(TS + 60_000),
    ];
    let data = Dataset::write(&events, &catalog())?;

    pipeline::run_etl(&db, &options, &data.loader()).await?;

    assert_eq!(count(&db, "songplays").await?, 2);
    assert!(check_keys(&db).await?.is_empty());

    let err = pipeline::insert_tables(&db, &options).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Statement { stage: Stage::Transform, ref name, .. } if name == "insert users"
    ));
    assert!(err.db_error().is_some());
    Ok(())
}

async fn rerun_after_clearing_dimensions(commit_mode: CommitMode) -> Result<(DatabaseConnection, PipelineError)> {
    let options = options(KeyConstraints::Enforced, commit_mode);
    let db = setup_warehouse(&options).await?;
    let data = Dataset::write(&[next_song("Song One", "Artist One", 200.5, TS, 0)], &catalog())?;
    pipeline::run_etl(&db, &options, &data.loader()).await?;

    for table in ["songplays", "users", "songs", "artists"] {
        execute(&db, &format!("DELETE FROM {table}")).await?;
    }

    // users, songs and artists succeed again; time collides with its first load.
    let err = pipeline::insert_tables(&db, &options).await.unwrap_err();
    Ok((db, err))
}

#[tokio::test]
async fn per_statement_commits_survive_a_later_failure() -> Result<()> {
    let (db, err) = rerun_after_clearing_dimensions(CommitMode::PerStatement).await?;
    assert!(matches!(err, PipelineError::Statement { ref name, .. } if name == "insert time"));
    assert_eq!(count(&db, "users").await?, 1);
    assert_eq!(count(&db, "songs").await?, 2);
    Ok(())
}

#[tokio::test]
async fn per_stage_failure_rolls_back_the_stage() -> Result<()> {
    let (db, err) = rerun_after_clearing_dimensions(CommitMode::PerStage).await?;
    assert!(matches!(err, PipelineError::Statement { ref name, .. } if name == "insert time"));
    assert_eq!(count(&db, "users").await?, 0);
    assert_eq!(count(&db, "songs").await?, 0);
    Ok(())
}

#[tokio::test]
async fn create_tables_resets_loaded_data() -> Result<()> {
    let options = default_options();
    let db = setup_warehouse(&options).await?;
    let data = Dataset::write(&[next_song("Song One", "Artist One", 200.5, TS, 0)], &catalog())?;
    pipeline::run_etl(&db, &options, &data.loader()).await?;

    let report = pipeline::create_tables(&db, &options).await?;
    assert_eq!(report.statements, 14);

    for (table, rows) in pipeline::table_counts(&db).await? {
        assert_eq!(rows, 0, "{table} was not recreated");
    }
    Ok(())
}
