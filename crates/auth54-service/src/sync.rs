//! Replica synchronization.
//!
//! Dependent services converge on the authority's actor, group, and
//! permaction tables. Divergence is detected cheaply by comparing SHA-256
//! hashes over order-stable row slices; a mismatch triggers a forced sync
//! that replaces the diverged table wholesale inside one transaction.
//!
//! Forced-sync bundles travel as gzip-compressed canonical JSON, hex-coded
//! into the request body. Decompression is capped so a hostile bundle
//! cannot balloon in memory.
//!
//! Mutations on the authority fan out as best-effort callbacks; a dead
//! dependent never blocks the mutation, it just stays stale until the next
//! hash check.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use auth54_core::AuthError;
use auth54_core::actor::{Actor, ActorType};
use auth54_core::canonical::canonicalize_value;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::channel::{Peer, ServiceChannel};
use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::store::{ActorPermactionRow, GroupPermactionRow, StoreError};

/// Hash value of an empty row slice.
pub const EMPTY_HASH_SENTINEL: &str = "0";

/// Decompressed bundle size cap.
pub const MAX_BUNDLE_BYTES: u64 = 32 * 1024 * 1024;

/// Outcome of one dependent-side hash check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Replicas agree; nothing was touched.
    InSync,
    /// Named scopes diverged and were re-pulled.
    Resynced(Vec<String>),
}

/// Synchronization operations bound to one context and channel.
#[derive(Debug, Clone, Copy)]
pub struct SyncEngine<'a> {
    ctx: &'a ServiceContext,
    channel: &'a ServiceChannel,
}

fn hash_slices<I, F>(rows: I, mut render: F) -> String
where
    I: IntoIterator,
    F: FnMut(I::Item, &mut Sha256),
{
    let mut hasher = Sha256::new();
    let mut any = false;
    for row in rows {
        any = true;
        render(row, &mut hasher);
    }
    if !any {
        return EMPTY_HASH_SENTINEL.to_string();
    }
    hex::encode(hasher.finalize())
}

fn feed_opt(hasher: &mut Sha256, value: Option<&str>) {
    hasher.update(value.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
}

fn feed_value(hasher: &mut Sha256, value: &Value) -> Result<(), ServiceError> {
    hasher.update(canonicalize_value(value)?.as_bytes());
    hasher.update([0u8]);
    Ok(())
}

impl<'a> SyncEngine<'a> {
    /// Binds the engine.
    #[must_use]
    pub const fn new(ctx: &'a ServiceContext, channel: &'a ServiceChannel) -> Self {
        Self { ctx, channel }
    }

    /// Hash over the full actor slice, uuid order.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage or canonicalization failure.
    pub fn actors_hash(&self) -> Result<String, ServiceError> {
        let actors = self.ctx.db().all_actors()?;
        let mut failure = None;
        let hash = hash_slices(&actors, |actor, hasher| {
            feed_opt(hasher, Some(&actor.uuid));
            feed_opt(hasher, actor.root_perms_signature.as_deref());
            feed_opt(hasher, actor.initial_key.as_deref());
            let secondary = actor
                .secondary_keys
                .as_ref()
                .map(|keys| serde_json::to_value(keys).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            if let Err(error) = feed_value(hasher, &secondary) {
                failure.get_or_insert(error);
            }
            if let Err(error) = feed_value(hasher, &actor.uinfo) {
                failure.get_or_insert(error);
            }
            feed_opt(hasher, Some(actor.actor_type.as_str()));
        });
        match failure {
            Some(error) => Err(error),
            None => Ok(hash),
        }
    }

    /// Hash over the group slice, uuid order.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage or canonicalization failure.
    pub fn groups_hash(&self) -> Result<String, ServiceError> {
        let groups = self.ctx.db().all_groups()?;
        let mut failure = None;
        let hash = hash_slices(&groups, |group, hasher| {
            feed_opt(hasher, Some(&group.uuid));
            if let Err(error) = feed_value(hasher, &group.uinfo) {
                failure.get_or_insert(error);
            }
        });
        match failure {
            Some(error) => Err(error),
            None => Ok(hash),
        }
    }

    /// Hash over one service's permaction slice: actor overrides then group
    /// overrides, each in permaction order.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage or canonicalization failure.
    pub fn permactions_hash(&self, service_uuid: &str) -> Result<String, ServiceError> {
        let actor_rows = self.ctx.db().actor_permactions_for_service(service_uuid)?;
        let group_rows = self.ctx.db().group_permactions_for_service(service_uuid)?;
        if actor_rows.is_empty() && group_rows.is_empty() {
            return Ok(EMPTY_HASH_SENTINEL.to_string());
        }
        let mut hasher = Sha256::new();
        for row in &actor_rows {
            feed_opt(&mut hasher, Some(&row.permaction_uuid));
            feed_value(&mut hasher, &row.params)?;
            feed_opt(&mut hasher, Some(&row.actor_uuid));
            feed_opt(&mut hasher, Some(&row.service_uuid));
            feed_opt(&mut hasher, Some(&row.value.to_string()));
        }
        for row in &group_rows {
            feed_opt(&mut hasher, Some(&row.permaction_uuid));
            feed_value(&mut hasher, &row.params)?;
            feed_opt(&mut hasher, Some(&row.actor_uuid));
            feed_opt(&mut hasher, Some(&row.service_uuid));
            feed_opt(&mut hasher, Some(&row.value.to_string()));
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// The hash report answered on `/synchronization/get_hash/`.
    ///
    /// The authority reports a per-service permaction hash map (its own
    /// uuid excluded); a dependent reports the single hash of its own
    /// slice.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage or canonicalization failure.
    pub fn hash_report(&self) -> Result<Value, ServiceError> {
        let actors = self.actors_hash()?;
        let groups = self.groups_hash()?;
        if self.ctx.is_authority() {
            let mut per_service = BTreeMap::new();
            for service_uuid in self.ctx.db().permaction_service_uuids()? {
                if service_uuid == self.ctx.service_uuid() {
                    continue;
                }
                per_service.insert(service_uuid.clone(), self.permactions_hash(&service_uuid)?);
            }
            Ok(json!({
                "actor_hash": actors,
                "group_hash": groups,
                "permactions_hash_data": per_service,
            }))
        } else {
            Ok(json!({
                "actor_hash": actors,
                "group_hash": groups,
                "permactions_hash_data": self.permactions_hash(self.ctx.service_uuid())?,
            }))
        }
    }

    /// Dependent-side convergence pass: compare hashes with the authority
    /// and re-pull any diverged scope.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the authority is unreachable or a pull
    /// cannot be applied. Called on the authority it is a no-op.
    pub fn check_sync(&self) -> Result<SyncAction, ServiceError> {
        if self.ctx.is_authority() {
            return Ok(SyncAction::InSync);
        }
        let peer = self.channel.authority_peer()?;
        let token = self.channel.session_token_for(&peer)?;
        let remote = self
            .channel
            .call(
                &peer,
                crate::handlers::Method::Post,
                "synchronization/get_hash",
                json!({}),
                Some(&token),
                &crate::channel::CallOptions::default(),
            )?
            .body;

        let mut resynced = Vec::new();
        let remote_actors = remote.get("actor_hash").and_then(Value::as_str);
        if remote_actors != Some(self.actors_hash()?.as_str()) {
            let payload = self.channel.pull_actors(&peer)?;
            self.apply_actors(&payload)?;
            resynced.push("actors".to_string());
        }
        let remote_groups = remote.get("group_hash").and_then(Value::as_str);
        if remote_groups != Some(self.groups_hash()?.as_str()) {
            // Groups are actor rows, so a full actor pull converges them.
            if !resynced.contains(&"actors".to_string()) {
                let payload = self.channel.pull_actors(&peer)?;
                self.apply_actors(&payload)?;
            }
            resynced.push("groups".to_string());
        }
        let remote_permactions = remote
            .get("permactions_hash_data")
            .and_then(|hashes| hashes.get(self.ctx.service_uuid()))
            .and_then(Value::as_str)
            .unwrap_or(EMPTY_HASH_SENTINEL);
        if remote_permactions != self.permactions_hash(self.ctx.service_uuid())? {
            let payload = self.channel.pull_permissions(&peer)?;
            self.apply_permactions(&payload)?;
            resynced.push("permactions".to_string());
        }

        if resynced.is_empty() {
            Ok(SyncAction::InSync)
        } else {
            info!(scopes = ?resynced, "replica resynchronized");
            Ok(SyncAction::Resynced(resynced))
        }
    }

    /// Builds the forced-sync bundle the authority pushes to one dependent:
    /// the actor set plus that dependent's permaction rows, gzip-compressed
    /// canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage, canonicalization, or
    /// compression failure.
    pub fn build_bundle(&self, for_service: &str) -> Result<Vec<u8>, ServiceError> {
        let actors = self.ctx.db().all_actors()?;
        let mut by_uuid = serde_json::Map::new();
        let mut uuids = Vec::new();
        for actor in &actors {
            uuids.push(Value::String(actor.uuid.clone()));
            by_uuid.insert(
                actor.uuid.clone(),
                serde_json::to_value(actor).map_err(|error| StoreError::json(&error))?,
            );
        }
        let actor_rows = self.ctx.db().actor_permactions_for_service(for_service)?;
        let group_rows = self.ctx.db().group_permactions_for_service(for_service)?;
        let parts = json!({
            "actors": { "actors": by_uuid },
            "actors_uuids": uuids,
            "actor_permactions": actor_rows,
            "group_permactions": group_rows,
        });
        let canonical = canonicalize_value(&parts)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(canonical.as_bytes())
            .and_then(|()| encoder.finish())
            .map_err(|error| {
                ServiceError::Auth(AuthError::Internal {
                    message: format!("bundle compression failed: {error}"),
                })
            })
    }

    /// Decodes a forced-sync bundle, enforcing [`MAX_BUNDLE_BYTES`].
    ///
    /// # Errors
    ///
    /// Returns a validation error for oversized or malformed bundles.
    pub fn decode_bundle(bytes: &[u8]) -> Result<Value, ServiceError> {
        let mut decoder = GzDecoder::new(bytes).take(MAX_BUNDLE_BYTES + 1);
        let mut text = String::new();
        decoder.read_to_string(&mut text).map_err(|error| {
            ServiceError::Auth(AuthError::Validation {
                message: format!("malformed sync bundle: {error}"),
            })
        })?;
        if text.len() as u64 > MAX_BUNDLE_BYTES {
            return Err(ServiceError::Auth(AuthError::Validation {
                message: "sync bundle exceeds the size cap".to_string(),
            }));
        }
        serde_json::from_str(&text).map_err(|error| {
            ServiceError::Auth(AuthError::Validation {
                message: format!("malformed sync bundle: {error}"),
            })
        })
    }

    /// Applies a forced-sync bundle: each table is replaced inside its own
    /// transaction, so readers only ever see a complete table.
    ///
    /// # Errors
    ///
    /// Returns a validation error on the authority (it is the source of
    /// truth and never accepts a forced sync), or [`ServiceError`] on a
    /// malformed bundle or storage failure.
    pub fn apply_bundle(&self, parts: &Value) -> Result<(), ServiceError> {
        if self.ctx.is_authority() {
            return Err(ServiceError::Auth(AuthError::Validation {
                message: "the trust authority does not accept forced synchronization".to_string(),
            }));
        }
        self.apply_actors(parts)?;
        self.apply_permactions(parts)?;
        Ok(())
    }

    /// Upserts the pushed actor set and prunes actors absent from
    /// `actors_uuids`, in one transaction.
    fn apply_actors(&self, parts: &Value) -> Result<(), ServiceError> {
        let Some(by_uuid) = parts
            .get("actors")
            .and_then(|outer| outer.get("actors"))
            .and_then(Value::as_object)
        else {
            return Ok(());
        };
        let mut actors = Vec::with_capacity(by_uuid.len());
        for value in by_uuid.values() {
            let actor: Actor = serde_json::from_value(value.clone())
                .map_err(|error| StoreError::json(&error))?;
            actors.push(actor);
        }
        let keep: Vec<String> = parts
            .get("actors_uuids")
            .and_then(Value::as_array)
            .map(|uuids| {
                uuids
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| actors.iter().map(|actor| actor.uuid.clone()).collect());

        self.ctx.db().transaction(|conn| {
            for actor in &actors {
                crate::store::actor_upsert_on(conn, actor)?;
            }
            crate::store::actor_prune_except_on(conn, &keep)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Replaces this service's permaction rows from the pushed parts, one
    /// transaction per table.
    fn apply_permactions(&self, parts: &Value) -> Result<(), ServiceError> {
        let service_uuid = self.ctx.service_uuid().to_string();
        if let Some(rows) = parts.get("actor_permactions") {
            let rows: Vec<ActorPermactionRow> = serde_json::from_value(rows.clone())
                .map_err(|error| StoreError::json(&error))?;
            self.ctx.db().transaction(|conn| {
                crate::store::replace_actor_permactions_on(conn, &service_uuid, &rows)
            })?;
        }
        if let Some(rows) = parts.get("group_permactions") {
            let rows: Vec<GroupPermactionRow> = serde_json::from_value(rows.clone())
                .map_err(|error| StoreError::json(&error))?;
            self.ctx.db().transaction(|conn| {
                crate::store::replace_group_permactions_on(conn, &service_uuid, &rows)
            })?;
        }
        Ok(())
    }

    /// Fans a replication callback out, best effort. On the authority the
    /// callback goes to every replicated dependent service; on a dependent
    /// it goes to the authority.
    pub fn send_callback(&self, action_type: &str, data: Value) {
        let peers = match self.callback_peers() {
            Ok(peers) => peers,
            Err(error) => {
                warn!(action_type, %error, "callback fan-out skipped");
                return;
            },
        };
        for peer in peers {
            self.channel.send_callback(&peer, action_type, data.clone());
        }
    }

    fn callback_peers(&self) -> Result<Vec<Peer>, ServiceError> {
        if !self.ctx.is_authority() {
            return Ok(vec![self.channel.authority_peer()?]);
        }
        let mut peers = Vec::new();
        for actor in self.ctx.db().all_actors()? {
            if actor.actor_type != ActorType::Service || actor.uuid == self.ctx.service_uuid() {
                continue;
            }
            if let Some(domain) = actor.service_domain() {
                peers.push(Peer {
                    name: actor.uuid.clone(),
                    url: domain.to_string(),
                    uuid: actor.uuid,
                });
            }
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use auth54_core::actor::{Actor, ActorType};
    use serde_json::json;

    use super::*;
    use crate::config::tests_support::standalone_config;
    use crate::store::Db;

    fn engine_parts() -> (ServiceContext, ServiceChannel) {
        let ctx =
            ServiceContext::with_db(standalone_config(), Db::open_in_memory().unwrap()).unwrap();
        let channel = ServiceChannel::new(ctx.clone()).unwrap();
        (ctx, channel)
    }

    fn user(uuid: &str) -> Actor {
        Actor::new(uuid, ActorType::User)
    }

    #[test]
    fn empty_tables_hash_to_sentinel() {
        let (ctx, channel) = engine_parts();
        let engine = SyncEngine::new(&ctx, &channel);
        assert_eq!(engine.actors_hash().unwrap(), EMPTY_HASH_SENTINEL);
        assert_eq!(engine.groups_hash().unwrap(), EMPTY_HASH_SENTINEL);
        assert_eq!(engine.permactions_hash("svc").unwrap(), EMPTY_HASH_SENTINEL);
    }

    #[test]
    fn actor_hash_is_deterministic_and_row_sensitive() {
        let (ctx, channel) = engine_parts();
        let engine = SyncEngine::new(&ctx, &channel);
        ctx.db().upsert_actor(&user("11111111-1111-4111-8111-111111111111")).unwrap();

        let first = engine.actors_hash().unwrap();
        assert_eq!(engine.actors_hash().unwrap(), first);

        let mut changed = user("11111111-1111-4111-8111-111111111111");
        changed.uinfo = json!({"email": "new@example.com"});
        ctx.db().upsert_actor(&changed).unwrap();
        assert_ne!(engine.actors_hash().unwrap(), first);
    }

    #[test]
    fn bundle_round_trips_through_gzip() {
        let (ctx, channel) = engine_parts();
        let engine = SyncEngine::new(&ctx, &channel);
        ctx.db().upsert_actor(&user("11111111-1111-4111-8111-111111111111")).unwrap();

        let bytes = engine.build_bundle("dependent").unwrap();
        let parts = SyncEngine::decode_bundle(&bytes).unwrap();
        assert!(parts["actors"]["actors"]["11111111-1111-4111-8111-111111111111"].is_object());
        assert_eq!(parts["actors_uuids"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn garbage_bundle_is_a_validation_error() {
        let err = SyncEngine::decode_bundle(b"not gzip at all").unwrap_err();
        assert!(matches!(
            AuthError::from(err),
            AuthError::Validation { .. }
        ));
    }

    #[test]
    fn authority_rejects_forced_sync() {
        let (ctx, channel) = engine_parts();
        let engine = SyncEngine::new(&ctx, &channel);
        let err = engine.apply_bundle(&json!({})).unwrap_err();
        assert!(matches!(
            AuthError::from(err),
            AuthError::Validation { .. }
        ));
    }

    #[test]
    fn authority_hash_report_maps_permactions_per_service() {
        let (ctx, channel) = engine_parts();
        let engine = SyncEngine::new(&ctx, &channel);
        ctx.db()
            .upsert_actor_permaction(&crate::store::ActorPermactionRow {
                permaction_uuid: "p1".to_string(),
                service_uuid: "dependent".to_string(),
                actor_uuid: "u1".to_string(),
                value: 1,
                params: json!({}),
            })
            .unwrap();

        let report = engine.hash_report().unwrap();
        assert!(report["permactions_hash_data"].is_object());
        assert!(report["permactions_hash_data"]["dependent"].is_string());
        assert_ne!(
            report["permactions_hash_data"]["dependent"],
            EMPTY_HASH_SENTINEL
        );
    }
}
