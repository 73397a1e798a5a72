//! Permaction override tables.
//!
//! Three tables back the permission engine: per-service defaults, per-actor
//! overrides, and per-group overrides with weights. All three replicate
//! from the trust authority; the engine resolves in override order (actor,
//! then heaviest group, then service default) on top of these rows.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Db, StoreError};

/// A per-service default for one permaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPermactionRow {
    /// Permaction identity.
    pub permaction_uuid: String,
    /// Service the default applies on.
    pub service_uuid: String,
    /// Default decision value.
    pub value: i64,
    /// Descriptor kind, stored for replication fidelity.
    pub perm_type: String,
    /// Human description.
    pub description: String,
    /// Human title.
    pub title: String,
    /// Named permaction sets this permaction belongs to.
    pub unions: Vec<String>,
    /// Default evaluator parameters.
    pub params: Value,
}

/// A per-actor override for one permaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorPermactionRow {
    /// Permaction identity.
    pub permaction_uuid: String,
    /// Service the override applies on.
    pub service_uuid: String,
    /// Actor being overridden.
    pub actor_uuid: String,
    /// Decision value.
    pub value: i64,
    /// Evaluator parameters.
    pub params: Value,
}

/// A per-group override for one permaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPermactionRow {
    /// Permaction identity.
    pub permaction_uuid: String,
    /// Service the override applies on.
    pub service_uuid: String,
    /// Group actor being overridden.
    pub actor_uuid: String,
    /// Decision value.
    pub value: i64,
    /// Tie-break weight; the heaviest group wins.
    pub weight: i64,
    /// Evaluator parameters.
    pub params: Value,
}

fn to_json(value: &impl serde::Serialize) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|error| StoreError::json(&error))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|error| StoreError::json(&error))
}

fn row_to_actor_permaction(row: &Row<'_>) -> Result<ActorPermactionRow, StoreError> {
    let params_text: String = row.get("params")?;
    Ok(ActorPermactionRow {
        permaction_uuid: row.get("permaction_uuid")?,
        service_uuid: row.get("service_uuid")?,
        actor_uuid: row.get("actor_uuid")?,
        value: row.get("value")?,
        params: from_json(&params_text)?,
    })
}

fn row_to_group_permaction(row: &Row<'_>) -> Result<GroupPermactionRow, StoreError> {
    let params_text: String = row.get("params")?;
    Ok(GroupPermactionRow {
        permaction_uuid: row.get("permaction_uuid")?,
        service_uuid: row.get("service_uuid")?,
        actor_uuid: row.get("actor_uuid")?,
        value: row.get("value")?,
        weight: row.get("weight")?,
        params: from_json(&params_text)?,
    })
}

pub(crate) fn upsert_default_on(
    conn: &Connection,
    row: &DefaultPermactionRow,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO default_permaction
         (permaction_uuid, service_uuid, value, perm_type, description, title, unions, params)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(permaction_uuid, service_uuid) DO UPDATE SET
             value = excluded.value,
             perm_type = excluded.perm_type,
             description = excluded.description,
             title = excluded.title,
             unions = excluded.unions,
             params = excluded.params",
        params![
            row.permaction_uuid,
            row.service_uuid,
            row.value,
            row.perm_type,
            row.description,
            row.title,
            to_json(&row.unions)?,
            to_json(&row.params)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn upsert_actor_on(
    conn: &Connection,
    row: &ActorPermactionRow,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO actor_permaction (permaction_uuid, service_uuid, actor_uuid, value, params)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(permaction_uuid, service_uuid, actor_uuid) DO UPDATE SET
             value = excluded.value,
             params = excluded.params",
        params![
            row.permaction_uuid,
            row.service_uuid,
            row.actor_uuid,
            row.value,
            to_json(&row.params)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn upsert_group_on(
    conn: &Connection,
    row: &GroupPermactionRow,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO group_permaction
         (permaction_uuid, service_uuid, actor_uuid, value, weight, params)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(permaction_uuid, service_uuid, actor_uuid) DO UPDATE SET
             value = excluded.value,
             weight = excluded.weight,
             params = excluded.params",
        params![
            row.permaction_uuid,
            row.service_uuid,
            row.actor_uuid,
            row.value,
            row.weight,
            to_json(&row.params)?,
        ],
    )?;
    Ok(())
}

/// Replaces a service's actor-permaction rows wholesale, inside the
/// caller's transaction.
pub(crate) fn replace_actor_permactions_on(
    conn: &Connection,
    service_uuid: &str,
    rows: &[ActorPermactionRow],
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM actor_permaction WHERE service_uuid = ?1",
        params![service_uuid],
    )?;
    for row in rows {
        upsert_actor_on(conn, row)?;
    }
    Ok(())
}

/// Replaces a service's group-permaction rows wholesale, inside the
/// caller's transaction.
pub(crate) fn replace_group_permactions_on(
    conn: &Connection,
    service_uuid: &str,
    rows: &[GroupPermactionRow],
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM group_permaction WHERE service_uuid = ?1",
        params![service_uuid],
    )?;
    for row in rows {
        upsert_group_on(conn, row)?;
    }
    Ok(())
}

impl Db {
    /// Inserts or updates a per-service default.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn upsert_default_permaction(&self, row: &DefaultPermactionRow) -> Result<(), StoreError> {
        self.with_conn(|conn| upsert_default_on(conn, row))
    }

    /// Inserts or updates a per-actor override.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn upsert_actor_permaction(&self, row: &ActorPermactionRow) -> Result<(), StoreError> {
        self.with_conn(|conn| upsert_actor_on(conn, row))
    }

    /// Inserts or updates a per-group override.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn upsert_group_permaction(&self, row: &GroupPermactionRow) -> Result<(), StoreError> {
        self.with_conn(|conn| upsert_group_on(conn, row))
    }

    /// Deletes a per-actor override; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn delete_actor_permaction(
        &self,
        permaction_uuid: &str,
        actor_uuid: &str,
        service_uuid: &str,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM actor_permaction
                 WHERE permaction_uuid = ?1 AND actor_uuid = ?2 AND service_uuid = ?3",
                params![permaction_uuid, actor_uuid, service_uuid],
            )? > 0)
        })
    }

    /// Deletes a per-group override; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn delete_group_permaction(
        &self,
        permaction_uuid: &str,
        actor_uuid: &str,
        service_uuid: &str,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM group_permaction
                 WHERE permaction_uuid = ?1 AND actor_uuid = ?2 AND service_uuid = ?3",
                params![permaction_uuid, actor_uuid, service_uuid],
            )? > 0)
        })
    }

    /// The per-service default row for one permaction, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn default_permaction(
        &self,
        permaction_uuid: &str,
        service_uuid: &str,
    ) -> Result<Option<DefaultPermactionRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT permaction_uuid, service_uuid, value, perm_type, description, title, \
                     unions, params
                     FROM default_permaction WHERE permaction_uuid = ?1 AND service_uuid = ?2",
                    params![permaction_uuid, service_uuid],
                    |row| {
                        let unions_text: String = row.get("unions")?;
                        let params_text: String = row.get("params")?;
                        Ok((
                            DefaultPermactionRow {
                                permaction_uuid: row.get("permaction_uuid")?,
                                service_uuid: row.get("service_uuid")?,
                                value: row.get("value")?,
                                perm_type: row.get("perm_type")?,
                                description: row.get("description")?,
                                title: row.get("title")?,
                                unions: Vec::new(),
                                params: Value::Null,
                            },
                            unions_text,
                            params_text,
                        ))
                    },
                )
                .optional()?;
            match row {
                None => Ok(None),
                Some((mut default, unions_text, params_text)) => {
                    default.unions = from_json(&unions_text)?;
                    default.params = from_json(&params_text)?;
                    Ok(Some(default))
                },
            }
        })
    }

    /// The per-actor override for one permaction, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn actor_permaction_override(
        &self,
        permaction_uuid: &str,
        service_uuid: &str,
        actor_uuid: &str,
    ) -> Result<Option<ActorPermactionRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT permaction_uuid, service_uuid, actor_uuid, value, params
                     FROM actor_permaction
                     WHERE permaction_uuid = ?1 AND service_uuid = ?2 AND actor_uuid = ?3",
                    params![permaction_uuid, service_uuid, actor_uuid],
                    |row| Ok(row_to_actor_permaction(row)),
                )
                .optional()?;
            row.transpose()
        })
    }

    /// Group overrides for one permaction across the given group uuids,
    /// heaviest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn group_permaction_overrides(
        &self,
        permaction_uuid: &str,
        service_uuid: &str,
        group_uuids: &[String],
    ) -> Result<Vec<GroupPermactionRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT permaction_uuid, service_uuid, actor_uuid, value, weight, params
                 FROM group_permaction
                 WHERE permaction_uuid = ?1 AND service_uuid = ?2
                 ORDER BY weight DESC, actor_uuid",
            )?;
            let rows = stmt.query_map(params![permaction_uuid, service_uuid], |row| {
                Ok(row_to_group_permaction(row))
            })?;
            let mut overrides = Vec::new();
            for row in rows {
                let row = row??;
                if group_uuids.contains(&row.actor_uuid) {
                    overrides.push(row);
                }
            }
            Ok(overrides)
        })
    }

    /// A service's actor-permaction rows in hash slice order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn actor_permactions_for_service(
        &self,
        service_uuid: &str,
    ) -> Result<Vec<ActorPermactionRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT permaction_uuid, service_uuid, actor_uuid, value, params
                 FROM actor_permaction WHERE service_uuid = ?1
                 ORDER BY permaction_uuid, actor_uuid",
            )?;
            let rows =
                stmt.query_map(params![service_uuid], |row| Ok(row_to_actor_permaction(row)))?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row??);
            }
            Ok(result)
        })
    }

    /// A service's group-permaction rows in hash slice order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn group_permactions_for_service(
        &self,
        service_uuid: &str,
    ) -> Result<Vec<GroupPermactionRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT permaction_uuid, service_uuid, actor_uuid, value, weight, params
                 FROM group_permaction WHERE service_uuid = ?1
                 ORDER BY permaction_uuid, actor_uuid",
            )?;
            let rows =
                stmt.query_map(params![service_uuid], |row| Ok(row_to_group_permaction(row)))?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row??);
            }
            Ok(result)
        })
    }

    /// Distinct service uuids that carry permaction rows, for the
    /// authority's per-service hash map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub fn permaction_service_uuids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT service_uuid FROM actor_permaction
                 UNION SELECT service_uuid FROM group_permaction
                 ORDER BY service_uuid",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}
