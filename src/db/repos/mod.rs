pub mod core;
pub mod recovery;
pub mod resources;

use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::error::AppError;

fn conversion_err(
    row: &Row,
    col: &str,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    let idx = row.as_ref().column_index(col).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Decode a TEXT column holding `serde_json` output.
pub(crate) fn json_col<T: DeserializeOwned>(row: &Row, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(row, col, e))
}

/// Decode a nullable TEXT column holding `serde_json` output.
pub(crate) fn json_col_opt<T: DeserializeOwned>(row: &Row, col: &str) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(col)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_err(row, col, e)),
        None => Ok(None),
    }
}

/// Decode a TEXT column holding an enum's canonical name.
pub(crate) fn enum_col<T>(row: &Row, col: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = AppError>,
{
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e: AppError| conversion_err(row, col, e))
}

pub(crate) fn enum_col_opt<T>(row: &Row, col: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = AppError>,
{
    match row.get::<_, Option<String>>(col)? {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: AppError| conversion_err(row, col, e)),
        None => Ok(None),
    }
}

/// Map `QueryReturnedNoRows` to `AppError::NotFound`.
pub(crate) fn not_found(what: String) -> impl FnOnce(rusqlite::Error) -> AppError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(what),
        other => AppError::Database(other),
    }
}
