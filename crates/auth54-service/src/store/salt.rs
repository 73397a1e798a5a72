//! Salt challenge storage.
//!
//! A salt is a short-lived random challenge bound to the identity that
//! requested it. Salts expire after [`SALT_TTL_SECONDS`] and are consumed
//! (deleted) the moment a signed response is accepted, so each challenge
//! answers at most one authentication.
//!
//! QR pairing issues a salt before the actor is known, bound only to the
//! pairing token; `bind_salt_uuid` attaches the uuid once the login device
//! resolves it. Lookups by uuid fall back to the newest unbound QR salt so
//! the pairing flow can complete.

use auth54_core::passport::TIMESTAMP_FORMAT;
use chrono::{Duration, Utc};
use rand::RngCore;
use rusqlite::{OptionalExtension, params};

use super::{Db, StoreError, now_stamp};

/// How long an issued salt stays answerable.
pub const SALT_TTL_SECONDS: i64 = 900;

const SALT_BYTES: usize = 16;

/// Identity a salt is bound to at issue time. Exactly one identity field is
/// set, plus the purpose tag.
#[derive(Debug, Clone, Default)]
pub struct SaltBinding {
    /// Requesting public key, wire form.
    pub pub_key: Option<String>,
    /// Requesting actor uuid.
    pub uuid: Option<String>,
    /// QR pairing token, for flows where the actor is not yet known.
    pub qr_token: Option<String>,
    /// Purpose tag; lookups filter on it so a salt issued for one flow
    /// cannot answer another.
    pub salt_for: Option<String>,
}

fn expiry_cutoff() -> String {
    (Utc::now() - Duration::seconds(SALT_TTL_SECONDS))
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

fn random_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Db {
    /// Issues a fresh salt bound to `binding` and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn issue_salt(&self, binding: &SaltBinding) -> Result<String, StoreError> {
        // Abandoned challenges are never consumed; issuing is the one
        // moment every flow passes through, so sweep them here.
        self.purge_expired_salts()?;
        let salt = random_salt();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO salt_temp (salt, pub_key, uuid, qr_token, salt_for, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    salt,
                    binding.pub_key,
                    binding.uuid,
                    binding.qr_token,
                    binding.salt_for,
                    now_stamp()
                ],
            )?;
            Ok(())
        })?;
        Ok(salt)
    }

    /// Newest unexpired salt issued to `pub_key` for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn salt_for_pub_key(
        &self,
        pub_key: &str,
        purpose: &str,
    ) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT salt FROM salt_temp
                     WHERE pub_key = ?1 AND salt_for = ?2 AND created >= ?3
                     ORDER BY created DESC, rowid DESC LIMIT 1",
                    params![pub_key, purpose, expiry_cutoff()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Newest unexpired salt issued to `uuid` for `purpose`, falling back
    /// to the newest unbound QR salt when the uuid has none of its own.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn salt_for_uuid(&self, uuid: &str, purpose: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let cutoff = expiry_cutoff();
            let bound: Option<String> = conn
                .query_row(
                    "SELECT salt FROM salt_temp
                     WHERE uuid = ?1 AND salt_for = ?2 AND created >= ?3
                     ORDER BY created DESC, rowid DESC LIMIT 1",
                    params![uuid, purpose, cutoff],
                    |row| row.get(0),
                )
                .optional()?;
            if bound.is_some() {
                return Ok(bound);
            }
            Ok(conn
                .query_row(
                    "SELECT salt FROM salt_temp
                     WHERE uuid IS NULL AND qr_token IS NOT NULL
                       AND salt_for = ?1 AND created >= ?2
                     ORDER BY created DESC, rowid DESC LIMIT 1",
                    params![purpose, cutoff],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Newest unexpired salt issued to a QR pairing token for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn salt_for_qr_token(
        &self,
        qr_token: &str,
        purpose: &str,
    ) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT salt FROM salt_temp
                     WHERE qr_token = ?1 AND salt_for = ?2 AND created >= ?3
                     ORDER BY created DESC, rowid DESC LIMIT 1",
                    params![qr_token, purpose, expiry_cutoff()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Attaches an actor uuid to the salts issued for a QR pairing token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn bind_salt_uuid(&self, qr_token: &str, uuid: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE salt_temp SET uuid = ?1 WHERE qr_token = ?2",
                params![uuid, qr_token],
            )?;
            Ok(())
        })
    }

    /// Deletes a salt after a successful verification; returns whether the
    /// salt still existed. A second consume of the same salt returns false.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn consume_salt(&self, salt: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM salt_temp WHERE salt = ?1", params![salt])? > 0)
        })
    }

    /// Drops every salt past the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn purge_expired_salts(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM salt_temp WHERE created < ?1",
                params![expiry_cutoff()],
            )?)
        })
    }
}
