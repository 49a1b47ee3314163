//! # Storage Module
//!
//! SQLite persistence for the bridge tables and the portal boundary tables.
//! The schema lives in [`schema`]; [`Database`] owns the connection.

pub mod database;
pub mod schema;

pub use database::Database;

use rusqlite::types::Type;

/// Wrap a JSON decoding failure so it can be returned from a row mapper.
pub(crate) fn json_column_error(idx: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
