//! # Database
//!
//! Sqlite persistence for Docksmith: operations, queue, history,
//! version cache, compose backups, rollback policies, script
//! assignments and key/value config with snapshot / revert.
//!
//! Writes go through a retry-with-capped-exponential-backoff
//! wrapper to tolerate brief write contention from sibling
//! processes sharing the database file. Batched inserts are
//! transactional. Operation status transitions are guarded against
//! regression at the store boundary.

use std::{path::Path, sync::Mutex, time::Duration};

use docksmith_client::entities::operation::OperationStatus;
use rusqlite::Connection;
use thiserror::Error;

mod config;
mod history;
mod migrate;
mod ops;

pub use config::ConfigSnapshot;
pub use history::LogOperation;

#[derive(Debug, Error)]
pub enum DbError {
  #[error("database error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("json column error: {0}")]
  Json(#[from] serde_json::Error),
  #[error(
    "status transition {from} -> {to} rejected for operation {operation_id}"
  )]
  StatusRegression {
    operation_id: String,
    from: OperationStatus,
    to: OperationStatus,
  },
  #[error("{0} not found")]
  NotFound(String),
}

const MAX_WRITE_ATTEMPTS: u32 = 6;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open (creating if necessary) and migrate the database at
  /// `path`.
  pub fn open(path: &Path) -> Result<Database, DbError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(250))?;
    let db = Database {
      conn: Mutex::new(conn),
    };
    db.migrate_up()?;
    Ok(db)
  }

  /// In-memory database for tests.
  pub fn open_in_memory() -> Result<Database, DbError> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let db = Database {
      conn: Mutex::new(conn),
    };
    db.migrate_up()?;
    Ok(db)
  }

  /// Run `op` with the connection, retrying on SQLITE_BUSY /
  /// SQLITE_LOCKED with capped exponential backoff. All writes go
  /// through here.
  pub(crate) fn with_retry<T>(
    &self,
    op: impl Fn(&mut Connection) -> Result<T, DbError>,
  ) -> Result<T, DbError> {
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
      let result = {
        let mut conn = self.conn.lock().unwrap();
        op(&mut conn)
      };
      match result {
        Err(DbError::Sqlite(e))
          if is_busy(&e) && attempt + 1 < MAX_WRITE_ATTEMPTS =>
        {
          attempt += 1;
          tracing::debug!(
            attempt,
            "database busy, backing off {delay:?}"
          );
          std::thread::sleep(delay);
          delay = (delay * 2).min(MAX_BACKOFF);
        }
        other => return other,
      }
    }
  }

  pub(crate) fn read<T>(
    &self,
    op: impl FnOnce(&Connection) -> Result<T, DbError>,
  ) -> Result<T, DbError> {
    let conn = self.conn.lock().unwrap();
    op(&conn)
  }
}

fn is_busy(error: &rusqlite::Error) -> bool {
  matches!(
    error.sqlite_error_code(),
    Some(rusqlite::ErrorCode::DatabaseBusy)
      | Some(rusqlite::ErrorCode::DatabaseLocked)
  )
}

pub(crate) fn to_json<T: serde::Serialize>(
  value: &T,
) -> Result<String, DbError> {
  Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(
  text: Option<String>,
  default: T,
) -> T {
  match text {
    Some(text) => serde_json::from_str(&text).unwrap_or(default),
    None => default,
  }
}

#[cfg(test)]
mod tests;
