//! # Song-play Warehouse Loader
//!
//! Loads raw song-catalog and listening-event JSON into two staging tables,
//! then reshapes the staged rows into a star schema with one `songplays` fact
//! table and the `users`, `songs`, `artists` and `time` dimensions.

pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod schema;
pub mod staging;
pub mod telemetry;
pub mod transform;
