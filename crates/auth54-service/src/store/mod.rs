//! SQLite-backed replica storage.
//!
//! One connection behind `Arc<Mutex<_>>`; multi-statement mutations run
//! inside `BEGIN IMMEDIATE TRANSACTION` with rollback on error, so no
//! reader observes a half-applied sync. Per-table operations live in the
//! submodules; this module owns the connection discipline and the schema.
//!
//! JSON-typed columns (`secondary_keys`, `uinfo`, `params`, embedded
//! passports) are stored as JSON text and round-tripped with `serde_json`.

mod actor;
mod permaction;
mod salt;
mod session;

use std::path::Path;
use std::sync::{Arc, Mutex};

use auth54_core::passport::TIMESTAMP_FORMAT;
use chrono::Utc;
use rusqlite::Connection;
use thiserror::Error;

pub(crate) use actor::{prune_except_on as actor_prune_except_on, upsert_on as actor_upsert_on};
pub use permaction::{ActorPermactionRow, DefaultPermactionRow, GroupPermactionRow};
pub(crate) use permaction::{replace_actor_permactions_on, replace_group_permactions_on};
pub use salt::{SALT_TTL_SECONDS, SaltBinding};
pub use session::{MAX_TOKEN_ATTEMPTS, SessionRow, TemporarySessionRow};

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("database lock poisoned")]
    LockPoisoned,

    /// A JSON column failed to (de)serialize.
    #[error("stored JSON is invalid: {message}")]
    Json {
        /// Parser diagnostic.
        message: String,
    },

    /// Bounded unique-token insertion exhausted its attempts.
    #[error("could not find a free token in {attempts} attempts")]
    TokenSpaceExhausted {
        /// How many inserts were tried.
        attempts: u32,
    },
}

impl StoreError {
    pub(crate) fn json(error: &serde_json::Error) -> Self {
        Self::Json {
            message: error.to_string(),
        }
    }
}

/// Returns `true` for a uniqueness-constraint violation, the signal the
/// atomic token-insert retry loop keys on.
pub(crate) fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Current UTC stamp in the protocol wire format.
#[must_use]
pub fn now_stamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS actor (
    uuid                 TEXT PRIMARY KEY,
    actor_type           TEXT NOT NULL,
    initial_key          TEXT UNIQUE,
    secondary_keys       TEXT,
    uinfo                TEXT NOT NULL DEFAULT '{}',
    root_perms_signature TEXT,
    is_banned            INTEGER NOT NULL DEFAULT 0,
    created              TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS default_permaction (
    permaction_uuid TEXT NOT NULL,
    service_uuid    TEXT NOT NULL,
    value           INTEGER NOT NULL,
    perm_type       TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    title           TEXT NOT NULL DEFAULT '',
    unions          TEXT NOT NULL DEFAULT '[]',
    params          TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (permaction_uuid, service_uuid)
);

CREATE TABLE IF NOT EXISTS actor_permaction (
    permaction_uuid TEXT NOT NULL,
    service_uuid    TEXT NOT NULL,
    actor_uuid      TEXT NOT NULL,
    value           INTEGER NOT NULL,
    params          TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (permaction_uuid, service_uuid, actor_uuid)
);

CREATE TABLE IF NOT EXISTS group_permaction (
    permaction_uuid TEXT NOT NULL,
    service_uuid    TEXT NOT NULL,
    actor_uuid      TEXT NOT NULL,
    value           INTEGER NOT NULL,
    weight          INTEGER NOT NULL DEFAULT 0,
    params          TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (permaction_uuid, service_uuid, actor_uuid)
);

CREATE TABLE IF NOT EXISTS service_session_token (
    session_token   TEXT PRIMARY KEY,
    uuid            TEXT NOT NULL,
    apt54           TEXT NOT NULL,
    auxiliary_token TEXT NOT NULL DEFAULT '',
    service_uuid    TEXT NOT NULL,
    created         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS salt_temp (
    salt     TEXT NOT NULL,
    pub_key  TEXT,
    uuid     TEXT,
    qr_token TEXT,
    salt_for TEXT,
    created  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS temporary_session (
    temporary_session TEXT PRIMARY KEY,
    service_uuid      TEXT NOT NULL,
    created           TEXT NOT NULL
);
";

/// Handle to the service's replica database.
#[derive(Debug, Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database, for tests and ephemeral deployments.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a read or single-statement write against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs a multi-statement mutation inside `BEGIN IMMEDIATE`; the
    /// closure's result decides commit vs rollback.
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            },
            Err(error) => {
                // Rollback failures are secondary; the original error wins.
                let _ = conn.execute_batch("ROLLBACK");
                Err(error)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_cleanly_twice() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        let result: Result<(), StoreError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO temporary_session(temporary_session, service_uuid, created)
                 VALUES ('t1', 's1', '2026-01-01 00:00:00')",
                [],
            )?;
            Err(StoreError::LockPoisoned)
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM temporary_session", [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.sqlite");

        let db = Db::open(&path).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO temporary_session(temporary_session, service_uuid, created)
                 VALUES ('t1', 's1', '2026-01-01 00:00:00')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        drop(db);

        let reopened = Db::open(&path).unwrap();
        let count: i64 = reopened
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM temporary_session", [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn now_stamp_matches_wire_format() {
        let stamp = now_stamp();
        chrono::NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT).unwrap();
    }
}
