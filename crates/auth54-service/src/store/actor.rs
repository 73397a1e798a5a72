//! Actor table operations.
//!
//! The actor table is the local replica of the federation's identity set.
//! On the trust authority it is the source of truth; on dependent services
//! it converges toward the authority through the synchronization engine,
//! so every write here is either an upsert or part of an upsert-and-prune
//! pass.

use std::collections::BTreeMap;

use auth54_core::actor::{Actor, ActorType};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use super::{Db, StoreError, now_stamp};

fn json_column<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|error| StoreError::json(&error))
}

fn row_to_actor(row: &Row<'_>) -> Result<Actor, StoreError> {
    let type_text: String = row.get("actor_type")?;
    let actor_type = ActorType::parse(&type_text).map_err(|error| StoreError::Json {
        message: error.to_string(),
    })?;
    let secondary_keys: Option<String> = row.get("secondary_keys")?;
    let secondary_keys: Option<BTreeMap<String, String>> = secondary_keys
        .as_deref()
        .map(json_column)
        .transpose()?;
    let uinfo_text: String = row.get("uinfo")?;
    let uinfo: Value = json_column(&uinfo_text)?;
    Ok(Actor {
        uuid: row.get("uuid")?,
        actor_type,
        initial_key: row.get("initial_key")?,
        secondary_keys,
        uinfo,
        root_perms_signature: row.get("root_perms_signature")?,
        is_banned: row.get::<_, i64>("is_banned")? != 0,
    })
}

const SELECT_ACTOR: &str = "SELECT uuid, actor_type, initial_key, secondary_keys, uinfo, \
                            root_perms_signature, is_banned FROM actor";

pub(crate) fn upsert_on(conn: &Connection, actor: &Actor) -> Result<(), StoreError> {
    let secondary_keys = actor
        .secondary_keys
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| StoreError::json(&error))?;
    let uinfo = serde_json::to_string(&actor.uinfo).map_err(|error| StoreError::json(&error))?;
    conn.execute(
        "INSERT INTO actor (uuid, actor_type, initial_key, secondary_keys, uinfo, \
         root_perms_signature, is_banned, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(uuid) DO UPDATE SET
             actor_type = excluded.actor_type,
             initial_key = excluded.initial_key,
             secondary_keys = excluded.secondary_keys,
             uinfo = excluded.uinfo,
             root_perms_signature = excluded.root_perms_signature,
             is_banned = excluded.is_banned",
        params![
            actor.uuid,
            actor.actor_type.as_str(),
            actor.initial_key,
            secondary_keys,
            uinfo,
            actor.root_perms_signature,
            i64::from(actor.is_banned),
            now_stamp(),
        ],
    )?;
    Ok(())
}

/// Deletes every actor whose uuid is not in `keep`.
pub(crate) fn prune_except_on(conn: &Connection, keep: &[String]) -> Result<usize, StoreError> {
    let existing: Vec<String> = {
        let mut stmt = conn.prepare("SELECT uuid FROM actor")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut pruned = 0;
    for uuid in existing {
        if !keep.contains(&uuid) {
            pruned += conn.execute("DELETE FROM actor WHERE uuid = ?1", params![uuid])?;
        }
    }
    Ok(pruned)
}

impl Db {
    /// Inserts or updates an actor row keyed by uuid.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn upsert_actor(&self, actor: &Actor) -> Result<(), StoreError> {
        self.with_conn(|conn| upsert_on(conn, actor))
    }

    /// Looks an actor up by uuid.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn get_actor(&self, uuid: &str) -> Result<Option<Actor>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_ACTOR} WHERE uuid = ?1"),
                    params![uuid],
                    |row| Ok(row_to_actor(row)),
                )
                .optional()?;
            row.transpose()
        })
    }

    /// Looks an actor up by its registered initial key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn get_actor_by_initial_key(&self, key: &str) -> Result<Option<Actor>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_ACTOR} WHERE initial_key = ?1"),
                    params![key],
                    |row| Ok(row_to_actor(row)),
                )
                .optional()?;
            row.transpose()
        })
    }

    /// Deletes an actor row; returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn delete_actor(&self, uuid: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM actor WHERE uuid = ?1", params![uuid])? > 0)
        })
    }

    /// Every actor row, ordered by uuid. This is the hash slice order for
    /// the synchronization engine.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn all_actors(&self) -> Result<Vec<Actor>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_ACTOR} ORDER BY uuid"))?;
            let rows = stmt.query_map([], |row| Ok(row_to_actor(row)))?;
            let mut actors = Vec::new();
            for row in rows {
                actors.push(row??);
            }
            Ok(actors)
        })
    }

    /// Every group actor, ordered by uuid.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn all_groups(&self) -> Result<Vec<Actor>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_ACTOR} WHERE actor_type = 'group' ORDER BY uuid"))?;
            let rows = stmt.query_map([], |row| Ok(row_to_actor(row)))?;
            let mut groups = Vec::new();
            for row in rows {
                groups.push(row??);
            }
            Ok(groups)
        })
    }
}
