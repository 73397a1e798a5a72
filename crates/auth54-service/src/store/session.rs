//! Session token storage.
//!
//! Tokens are 32-character alphanumerics minted here. Uniqueness is
//! enforced by the primary key, not by a read-then-write check: the insert
//! is attempted and a uniqueness violation triggers a retry with a fresh
//! token, bounded by [`MAX_TOKEN_ATTEMPTS`] so a pathological generator
//! fails loudly instead of spinning.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rusqlite::{OptionalExtension, Row, params};

use super::{Db, StoreError, is_unique_violation, now_stamp};

/// Retry bound for the token insert loop.
pub const MAX_TOKEN_ATTEMPTS: u32 = 16;

const TOKEN_LEN: usize = 32;

/// One stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    /// The minted token.
    pub session_token: String,
    /// Actor the session belongs to.
    pub uuid: String,
    /// Passport captured at session creation, JSON text.
    pub apt54: String,
    /// Token of the primary session this one was fanned out from, or empty.
    pub auxiliary_token: String,
    /// Service the session is valid on.
    pub service_uuid: String,
    /// Creation stamp.
    pub created: String,
}

/// A short-lived handoff token for SSO and QR flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporarySessionRow {
    /// The handoff token.
    pub temporary_session: String,
    /// Service that minted it.
    pub service_uuid: String,
    /// Creation stamp.
    pub created: String,
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn row_to_session(row: &Row<'_>) -> Result<SessionRow, rusqlite::Error> {
    Ok(SessionRow {
        session_token: row.get("session_token")?,
        uuid: row.get("uuid")?,
        apt54: row.get("apt54")?,
        auxiliary_token: row.get("auxiliary_token")?,
        service_uuid: row.get("service_uuid")?,
        created: row.get("created")?,
    })
}

const SELECT_SESSION: &str = "SELECT session_token, uuid, apt54, auxiliary_token, service_uuid, \
                              created FROM service_session_token";

impl Db {
    /// Mints a session token for `uuid` on `service_uuid` and stores the
    /// passport snapshot alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TokenSpaceExhausted`] when the retry bound is
    /// hit, or [`StoreError`] on other storage failures.
    pub fn create_session(
        &self,
        uuid: &str,
        apt54_json: &str,
        auxiliary_token: &str,
        service_uuid: &str,
    ) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            for _ in 0..MAX_TOKEN_ATTEMPTS {
                let token = random_token();
                let inserted = conn.execute(
                    "INSERT INTO service_session_token
                     (session_token, uuid, apt54, auxiliary_token, service_uuid, created)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![token, uuid, apt54_json, auxiliary_token, service_uuid, now_stamp()],
                );
                match inserted {
                    Ok(_) => return Ok(token),
                    Err(error) if is_unique_violation(&error) => {},
                    Err(error) => return Err(error.into()),
                }
            }
            Err(StoreError::TokenSpaceExhausted {
                attempts: MAX_TOKEN_ATTEMPTS,
            })
        })
    }

    /// Looks a session up by its token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn get_session(&self, token: &str) -> Result<Option<SessionRow>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{SELECT_SESSION} WHERE session_token = ?1"),
                    params![token],
                    row_to_session,
                )
                .optional()?)
        })
    }

    /// Looks a fanned-out session up by the primary token it was derived
    /// from.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn get_session_by_auxiliary(
        &self,
        auxiliary_token: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "{SELECT_SESSION} WHERE auxiliary_token = ?1
                         ORDER BY created DESC, rowid DESC LIMIT 1"
                    ),
                    params![auxiliary_token],
                    row_to_session,
                )
                .optional()?)
        })
    }

    /// The newest session held by `uuid` on `service_uuid`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn latest_session_for(
        &self,
        uuid: &str,
        service_uuid: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "{SELECT_SESSION} WHERE uuid = ?1 AND service_uuid = ?2
                         ORDER BY created DESC, rowid DESC LIMIT 1"
                    ),
                    params![uuid, service_uuid],
                    row_to_session,
                )
                .optional()?)
        })
    }

    /// Replaces the passport snapshot stored with a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn update_session_apt54(&self, token: &str, apt54_json: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE service_session_token SET apt54 = ?1 WHERE session_token = ?2",
                params![apt54_json, token],
            )?;
            Ok(())
        })
    }

    /// Deletes a session; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn delete_session(&self, token: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM service_session_token WHERE session_token = ?1",
                params![token],
            )? > 0)
        })
    }

    /// Mints a temporary handoff token for `service_uuid`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TokenSpaceExhausted`] when the retry bound is
    /// hit, or [`StoreError`] on other storage failures.
    pub fn create_temporary_session(&self, service_uuid: &str) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            for _ in 0..MAX_TOKEN_ATTEMPTS {
                let token = random_token();
                let inserted = conn.execute(
                    "INSERT INTO temporary_session (temporary_session, service_uuid, created)
                     VALUES (?1, ?2, ?3)",
                    params![token, service_uuid, now_stamp()],
                );
                match inserted {
                    Ok(_) => return Ok(token),
                    Err(error) if is_unique_violation(&error) => {},
                    Err(error) => return Err(error.into()),
                }
            }
            Err(StoreError::TokenSpaceExhausted {
                attempts: MAX_TOKEN_ATTEMPTS,
            })
        })
    }

    /// Redeems a temporary handoff token; single use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn take_temporary_session(
        &self,
        token: &str,
    ) -> Result<Option<TemporarySessionRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT temporary_session, service_uuid, created FROM temporary_session
                     WHERE temporary_session = ?1",
                    params![token],
                    |row| {
                        Ok(TemporarySessionRow {
                            temporary_session: row.get(0)?,
                            service_uuid: row.get(1)?,
                            created: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            if row.is_some() {
                conn.execute(
                    "DELETE FROM temporary_session WHERE temporary_session = ?1",
                    params![token],
                )?;
            }
            Ok(row)
        })
    }
}
