//! Table definitions for the staging area and the star schema.
//!
//! Two staging tables mirror the raw JSON datasets; five warehouse tables form
//! the star schema (`songplays` fact, `users`/`songs`/`artists`/`time`
//! dimensions). The definitions are rendered per [`Dialect`]: Redshift gets
//! its sort/distribution hints and an IDENTITY column, the other engines get
//! their native auto-increment.

pub mod integrity;

use sea_orm::{
    DeriveIden,
    sea_query::{ColumnDef, ForeignKey, Iden, Table, TableCreateStatement, TableDropStatement},
};

use crate::{config::KeyConstraints, db::Dialect, pipeline::SqlStatement};

#[derive(DeriveIden)]
pub enum StagingEvents {
    Table,
    Artist,
    Auth,
    FirstName,
    Gender,
    ItemSession,
    LastName,
    Length,
    Level,
    Location,
    Method,
    Page,
    Registration,
    SessionId,
    Song,
    Status,
    Ts,
    UserAgent,
    UserId,
}

#[derive(DeriveIden)]
pub enum StagingSongs {
    Table,
    SongId,
    Title,
    Duration,
    Year,
    NumSongs,
    ArtistId,
    ArtistLatitude,
    ArtistLongitude,
    ArtistLocation,
    ArtistName,
}

#[derive(DeriveIden)]
pub enum Users {
    Table,
    UserId,
    FirstName,
    LastName,
    Gender,
    Level,
}

#[derive(DeriveIden)]
pub enum Songs {
    Table,
    SongId,
    Title,
    ArtistId,
    Year,
    Duration,
}

#[derive(DeriveIden)]
pub enum Artists {
    Table,
    ArtistId,
    Name,
    Location,
    Latitude,
    Longitude,
}

#[derive(DeriveIden)]
pub enum Time {
    Table,
    StartTime,
    Hour,
    Day,
    Week,
    Month,
    Year,
    Weekday,
}

#[derive(DeriveIden)]
pub enum Songplays {
    Table,
    SongplayId,
    StartTime,
    UserId,
    Level,
    SongId,
    ArtistId,
    SessionId,
    Location,
    UserAgent,
}

/// Every table, in drop order: staging first, then the fact table before the
/// dimensions it references.
pub const DROP_ORDER: [&str; 7] = [
    "staging_events",
    "staging_songs",
    "songplays",
    "users",
    "songs",
    "artists",
    "time",
];

/// Every table, in creation order: dimensions before the fact table.
pub const CREATE_ORDER: [&str; 7] = [
    "staging_events",
    "staging_songs",
    "users",
    "songs",
    "artists",
    "time",
    "songplays",
];

/// Key role of a warehouse table, used to verify loaded data.
#[derive(Debug, Clone, Copy)]
pub struct TableKeys {
    pub table: &'static str,
    /// Natural primary key; `None` for the fact table's synthetic identity.
    pub primary_key: Option<&'static str>,
    pub foreign_keys: &'static [ForeignKeyRef],
}

/// A `column REFERENCES table(column)` declaration.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKeyRef {
    pub column: &'static str,
    pub references: &'static str,
    pub referenced_column: &'static str,
}

pub const WAREHOUSE_KEYS: [TableKeys; 5] = [
    TableKeys {
        table: "users",
        primary_key: Some("user_id"),
        foreign_keys: &[],
    },
    TableKeys {
        table: "songs",
        primary_key: Some("song_id"),
        foreign_keys: &[],
    },
    TableKeys {
        table: "artists",
        primary_key: Some("artist_id"),
        foreign_keys: &[],
    },
    TableKeys {
        table: "time",
        primary_key: Some("start_time"),
        foreign_keys: &[],
    },
    TableKeys {
        table: "songplays",
        primary_key: None,
        foreign_keys: &[
            ForeignKeyRef {
                column: "start_time",
                references: "time",
                referenced_column: "start_time",
            },
            ForeignKeyRef {
                column: "user_id",
                references: "users",
                referenced_column: "user_id",
            },
            ForeignKeyRef {
                column: "song_id",
                references: "songs",
                referenced_column: "song_id",
            },
            ForeignKeyRef {
                column: "artist_id",
                references: "artists",
                referenced_column: "artist_id",
            },
        ],
    },
];

/// Rendering options for the table definitions.
#[derive(Debug, Clone, Copy)]
pub struct SchemaOptions {
    pub dialect: Dialect,
    pub key_constraints: KeyConstraints,
}

impl SchemaOptions {
    /// Whether natural primary keys and foreign keys are part of the DDL.
    pub fn declares_keys(&self) -> bool {
        self.dialect.keys_are_informational() || self.key_constraints == KeyConstraints::Enforced
    }

    fn natural_key(&self, mut column: ColumnDef) -> ColumnDef {
        if self.declares_keys() {
            column.primary_key();
        }
        column
    }

    fn hint(&self, mut column: ColumnDef, hint: &str) -> ColumnDef {
        if self.dialect.supports_layout_hints() {
            column.extra(hint);
        }
        column
    }

    fn references<T, C>(
        &self,
        table: &mut TableCreateStatement,
        name: &str,
        column: Songplays,
        target: T,
        target_column: C,
    ) where
        T: Iden + 'static,
        C: Iden + 'static,
    {
        if self.declares_keys() {
            table.foreign_key(
                ForeignKey::create()
                    .name(name)
                    .from(Songplays::Table, column)
                    .to(target, target_column),
            );
        }
    }
}

/// `DROP TABLE IF EXISTS` for every table, in [`DROP_ORDER`].
pub fn drop_table_statements(dialect: Dialect) -> Vec<SqlStatement> {
    DROP_ORDER
        .iter()
        .map(|table| {
            let stmt: TableDropStatement = Table::drop().table(table_iden(table)).if_exists().to_owned();
            SqlStatement::new(format!("drop {table}"), dialect.backend().build(&stmt))
        })
        .collect()
}

/// `CREATE TABLE IF NOT EXISTS` for every table, in [`CREATE_ORDER`].
pub fn create_table_statements(options: &SchemaOptions) -> Vec<SqlStatement> {
    let backend = options.dialect.backend();
    let tables = [
        staging_events_table(),
        staging_songs_table(),
        users_table(options),
        songs_table(options),
        artists_table(options),
        time_table(options),
        songplays_table(options),
    ];

    CREATE_ORDER
        .iter()
        .zip(tables)
        .map(|(name, table)| SqlStatement::new(format!("create {name}"), backend.build(&table)))
        .collect()
}

fn table_iden(name: &str) -> sea_orm::sea_query::Alias {
    sea_orm::sea_query::Alias::new(name)
}

fn staging_events_table() -> TableCreateStatement {
    Table::create()
        .table(StagingEvents::Table)
        .if_not_exists()
        .col(ColumnDef::new(StagingEvents::Artist).text())
        .col(ColumnDef::new(StagingEvents::Auth).text())
        .col(ColumnDef::new(StagingEvents::FirstName).text())
        .col(ColumnDef::new(StagingEvents::Gender).string())
        .col(ColumnDef::new(StagingEvents::ItemSession).integer())
        .col(ColumnDef::new(StagingEvents::LastName).text())
        .col(ColumnDef::new(StagingEvents::Length).decimal())
        .col(ColumnDef::new(StagingEvents::Level).string())
        .col(ColumnDef::new(StagingEvents::Location).text())
        .col(ColumnDef::new(StagingEvents::Method).string())
        .col(ColumnDef::new(StagingEvents::Page).string())
        .col(ColumnDef::new(StagingEvents::Registration).decimal())
        .col(ColumnDef::new(StagingEvents::SessionId).integer())
        .col(ColumnDef::new(StagingEvents::Song).text())
        .col(ColumnDef::new(StagingEvents::Status).small_integer())
        .col(ColumnDef::new(StagingEvents::Ts).big_integer())
        .col(ColumnDef::new(StagingEvents::UserAgent).text())
        .col(ColumnDef::new(StagingEvents::UserId).integer())
        .to_owned()
}

fn staging_songs_table() -> TableCreateStatement {
    Table::create()
        .table(StagingSongs::Table)
        .if_not_exists()
        .col(ColumnDef::new(StagingSongs::SongId).text())
        .col(ColumnDef::new(StagingSongs::Title).text())
        .col(ColumnDef::new(StagingSongs::Duration).decimal())
        .col(ColumnDef::new(StagingSongs::Year).small_integer())
        .col(ColumnDef::new(StagingSongs::NumSongs).integer())
        .col(ColumnDef::new(StagingSongs::ArtistId).text())
        .col(ColumnDef::new(StagingSongs::ArtistLatitude).float())
        .col(ColumnDef::new(StagingSongs::ArtistLongitude).float())
        .col(ColumnDef::new(StagingSongs::ArtistLocation).text())
        .col(ColumnDef::new(StagingSongs::ArtistName).text())
        .to_owned()
}

fn users_table(options: &SchemaOptions) -> TableCreateStatement {
    let user_id = options.natural_key(ColumnDef::new(Users::UserId).integer().to_owned());
    Table::create()
        .table(Users::Table)
        .if_not_exists()
        .col(options.hint(user_id, "SORTKEY"))
        .col(ColumnDef::new(Users::FirstName).text())
        .col(ColumnDef::new(Users::LastName).text())
        .col(ColumnDef::new(Users::Gender).string())
        .col(ColumnDef::new(Users::Level).string())
        .to_owned()
}

fn songs_table(options: &SchemaOptions) -> TableCreateStatement {
    let song_id = options.natural_key(ColumnDef::new(Songs::SongId).text().to_owned());
    let year = ColumnDef::new(Songs::Year).small_integer().to_owned();
    Table::create()
        .table(Songs::Table)
        .if_not_exists()
        .col(options.hint(song_id, "DISTKEY"))
        .col(ColumnDef::new(Songs::Title).string().not_null())
        .col(ColumnDef::new(Songs::ArtistId).text())
        .col(options.hint(year, "SORTKEY"))
        .col(ColumnDef::new(Songs::Duration).decimal().not_null())
        .to_owned()
}

fn artists_table(options: &SchemaOptions) -> TableCreateStatement {
    let artist_id = options.natural_key(ColumnDef::new(Artists::ArtistId).text().to_owned());
    let name = ColumnDef::new(Artists::Name).text().not_null().to_owned();
    let mut table = Table::create()
        .table(Artists::Table)
        .if_not_exists()
        .col(artist_id)
        .col(options.hint(name, "SORTKEY"))
        .col(ColumnDef::new(Artists::Location).string())
        .col(ColumnDef::new(Artists::Latitude).float())
        .col(ColumnDef::new(Artists::Longitude).float())
        .to_owned();
    if options.dialect.supports_layout_hints() {
        table.extra("DISTSTYLE ALL");
    }
    table
}

fn time_table(options: &SchemaOptions) -> TableCreateStatement {
    let start_time = options.natural_key(ColumnDef::new(Time::StartTime).timestamp().not_null().to_owned());
    Table::create()
        .table(Time::Table)
        .if_not_exists()
        .col(options.hint(start_time, "SORTKEY"))
        .col(ColumnDef::new(Time::Hour).integer().not_null())
        .col(ColumnDef::new(Time::Day).integer().not_null())
        .col(ColumnDef::new(Time::Week).integer().not_null())
        .col(ColumnDef::new(Time::Month).integer().not_null())
        .col(ColumnDef::new(Time::Year).integer().not_null())
        .col(ColumnDef::new(Time::Weekday).integer().not_null())
        .to_owned()
}

fn songplays_table(options: &SchemaOptions) -> TableCreateStatement {
    let mut songplay_id = ColumnDef::new(Songplays::SongplayId);
    songplay_id.integer();
    if options.dialect.supports_layout_hints() {
        songplay_id.extra("IDENTITY(0,1)").not_null().primary_key().extra("SORTKEY");
    } else {
        songplay_id.not_null().auto_increment().primary_key();
    }
    let song_id = ColumnDef::new(Songplays::SongId).text().not_null().to_owned();

    let mut table = Table::create()
        .table(Songplays::Table)
        .if_not_exists()
        .col(songplay_id)
        .col(ColumnDef::new(Songplays::StartTime).timestamp().not_null())
        .col(ColumnDef::new(Songplays::UserId).integer().not_null())
        .col(ColumnDef::new(Songplays::Level).string())
        .col(options.hint(song_id, "DISTKEY"))
        .col(ColumnDef::new(Songplays::ArtistId).text().not_null())
        .col(ColumnDef::new(Songplays::SessionId).integer())
        .col(ColumnDef::new(Songplays::Location).text())
        .col(ColumnDef::new(Songplays::UserAgent).text())
        .to_owned();

    options.references(&mut table, "fk_songplays_start_time", Songplays::StartTime, Time::Table, Time::StartTime);
    options.references(&mut table, "fk_songplays_user_id", Songplays::UserId, Users::Table, Users::UserId);
    options.references(&mut table, "fk_songplays_song_id", Songplays::SongId, Songs::Table, Songs::SongId);
    options.references(&mut table, "fk_songplays_artist_id", Songplays::ArtistId, Artists::Table, Artists::ArtistId);
    table
}
