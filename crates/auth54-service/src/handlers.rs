//! Protocol endpoint handlers.
//!
//! [`dispatch`] is the single entry point for inbound federation traffic;
//! an HTTP front end translates requests into [`Request`] values, and in
//! standalone mode the channel calls it directly. Handlers return protocol
//! errors as `{ "error": ... }` bodies with the status from
//! [`AuthError::status_code`], so both deployments surface failures
//! identically.

use auth54_core::actor::{Actor, IdentityRef};
use auth54_core::passport::Apt54;
use auth54_core::{AuthError, canonicalize_value, crypto};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::channel::ServiceChannel;
use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::masquerade;
use crate::session::SessionEngine;
use crate::store::{ActorPermactionRow, GroupPermactionRow, SaltBinding, StoreError};
use crate::sync::SyncEngine;

/// Protocol verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read.
    Get,
    /// Create or act.
    Post,
    /// Update.
    Put,
    /// Remove.
    Delete,
}

/// One inbound protocol request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Verb.
    pub method: Method,
    /// Endpoint path, with or without surrounding slashes.
    pub endpoint: String,
    /// JSON body.
    pub body: Value,
    /// `Session-Token` header value.
    pub session_token: Option<String>,
}

/// One protocol response.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status.
    pub status: u16,
    /// JSON body.
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn fail(error: AuthError) -> Self {
        Self {
            status: error.status_code(),
            body: json!({ "error": error.to_string() }),
        }
    }
}

fn respond(result: Result<Value, ServiceError>) -> Response {
    match result {
        Ok(body) => Response::ok(body),
        Err(error) => {
            let error = AuthError::from(error);
            if error.status_code() >= 500 {
                warn!(%error, "handler failed");
            }
            Response::fail(error)
        },
    }
}

/// Routes one request to its handler.
#[must_use]
pub fn dispatch(ctx: &ServiceContext, request: &Request) -> Response {
    let channel = match ServiceChannel::new(ctx.clone()) {
        Ok(channel) => channel,
        Err(error) => return respond(Err(error.into())),
    };
    let path = request.endpoint.trim_matches('/');
    let token = request.session_token.as_deref();

    match (request.method, path) {
        (Method::Post, "apt54") => respond(apt54(ctx, &request.body)),
        (Method::Post, "auth") => respond(auth(ctx, &channel, &request.body)),
        (Method::Post, "save_session") => respond(save_session(ctx, &channel, &request.body)),
        (Method::Post, "get_session") => respond(get_session(ctx, &channel, &request.body, token)),
        (Method::Post, "temporary_session") => {
            respond(SessionEngine::new(ctx, &channel).create_temporary_session().map(
                |temporary_session| json!({ "temporary_session": temporary_session }),
            ))
        },
        (Method::Post | Method::Put, "actor") => {
            respond(actor_upsert(ctx, &channel, &request.body, request.method))
        },
        (Method::Delete, "actor") => respond(actor_delete(ctx, &channel, &request.body)),
        (Method::Post, "permaction/actor") => {
            respond(actor_permaction_upsert(ctx, &channel, &request.body))
        },
        (Method::Delete, "permaction/actor") => {
            respond(actor_permaction_delete(ctx, &channel, &request.body))
        },
        (Method::Post, "permaction/group") => {
            respond(group_permaction_upsert(ctx, &channel, &request.body))
        },
        (Method::Delete, "permaction/group") => {
            respond(group_permaction_delete(ctx, &channel, &request.body))
        },
        (Method::Post, "synchronization/get_hash") => {
            respond(SyncEngine::new(ctx, &channel).hash_report())
        },
        (Method::Post, "synchronization/force") => {
            respond(synchronization_force(ctx, &channel, &request.body))
        },
        (Method::Post, "masquerade/on") => respond(masquerade_on(ctx, &channel, &request.body, token)),
        (Method::Post, "masquerade/off") => respond(masquerade_off(ctx, &channel, token)),
        (Method::Post, "service/get_actors") => respond(service_get_actors(ctx, &request.body)),
        (Method::Post, "service/get_groups") => respond(service_get_groups(ctx, &request.body)),
        (Method::Post, "service/get_permissions") => {
            respond(service_get_permissions(ctx, &request.body))
        },
        (Method::Post, "service/callback") => respond(service_callback(ctx, &request.body)),
        _ => Response::fail(AuthError::NotFound {
            what: format!("endpoint '{path}'"),
        }),
    }
}

fn body_str<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

fn step(body: &Value) -> i64 {
    body.get("step").and_then(Value::as_i64).unwrap_or(1)
}

/// Resolves the actor a challenge request identifies, erroring with the
/// unknown-identity class when no replica row matches.
fn resolve_identity(
    ctx: &ServiceContext,
    identity: &IdentityRef,
) -> Result<Option<Actor>, ServiceError> {
    let actor = match identity {
        IdentityRef::PubKey(key) => ctx.db().get_actor_by_initial_key(key)?,
        IdentityRef::Uuid(uuid) => ctx.db().get_actor(uuid)?,
        IdentityRef::QrToken(_) => None,
    };
    Ok(actor)
}

fn identity_from(body: &Value) -> Result<IdentityRef, ServiceError> {
    IdentityRef::from_body(body)?.ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "request carries no pub_key, uuid, or qr_token".to_string(),
        })
    })
}

/// Issues a salt for an identity and stores the binding.
fn issue_challenge(
    ctx: &ServiceContext,
    identity: &IdentityRef,
    purpose: &str,
) -> Result<Value, ServiceError> {
    let mut binding = match identity {
        IdentityRef::PubKey(key) => SaltBinding {
            pub_key: Some(key.clone()),
            ..SaltBinding::default()
        },
        IdentityRef::Uuid(uuid) => SaltBinding {
            uuid: Some(uuid.clone()),
            ..SaltBinding::default()
        },
        IdentityRef::QrToken(qr_token) => SaltBinding {
            qr_token: Some(qr_token.clone()),
            ..SaltBinding::default()
        },
    };
    binding.salt_for = Some(purpose.to_string());
    let salt = ctx.db().issue_salt(&binding)?;
    Ok(json!({ "salt": salt }))
}

/// Fetches the pending salt for an identity and purpose.
fn pending_salt(
    ctx: &ServiceContext,
    identity: &IdentityRef,
    purpose: &str,
) -> Result<String, ServiceError> {
    let salt = match identity {
        IdentityRef::PubKey(key) => ctx.db().salt_for_pub_key(key, purpose)?,
        IdentityRef::Uuid(uuid) => ctx.db().salt_for_uuid(uuid, purpose)?,
        IdentityRef::QrToken(qr_token) => ctx.db().salt_for_qr_token(qr_token, purpose)?,
    };
    salt.ok_or_else(|| {
        ServiceError::Auth(AuthError::NotFound {
            what: "salt challenge".to_string(),
        })
    })
}

/// Checks a signed salt against every key the actor may sign with, then
/// consumes the salt so it cannot answer twice.
fn verify_challenge(
    ctx: &ServiceContext,
    actor: &Actor,
    salt: &str,
    signed_salt: &str,
) -> Result<(), ServiceError> {
    let mut verified = false;
    for key in actor.signature_keys() {
        if crypto::verify_signature(key, signed_salt, salt)? {
            verified = true;
            break;
        }
    }
    if !verified {
        warn!(actor = %actor.uuid, "salt challenge signature rejected");
        return Err(ServiceError::Auth(AuthError::Signature {
            context: "salt challenge".to_string(),
        }));
    }
    if !ctx.db().consume_salt(salt)? {
        return Err(ServiceError::Auth(AuthError::NotFound {
            what: "salt challenge".to_string(),
        }));
    }
    Ok(())
}

/// `/apt54/`: the passport-issuing challenge flow.
fn apt54(ctx: &ServiceContext, body: &Value) -> Result<Value, ServiceError> {
    let identity = identity_from(body)?;
    let actor = resolve_identity(ctx, &identity)?;

    if step(body) == 1 {
        // QR salts are issued before the actor is known.
        if actor.is_none() && !matches!(identity, IdentityRef::QrToken(_)) {
            let uuid = match &identity {
                IdentityRef::Uuid(uuid) => uuid.clone(),
                _ => String::new(),
            };
            return Err(ServiceError::Auth(AuthError::UnknownActor { uuid }));
        }
        return issue_challenge(ctx, &identity, "apt54");
    }

    if !ctx.is_authority() {
        return Err(ServiceError::Auth(AuthError::Validation {
            message: "passports are issued by the trust authority".to_string(),
        }));
    }
    let actor = actor.ok_or_else(|| {
        ServiceError::Auth(AuthError::UnknownActor {
            uuid: String::new(),
        })
    })?;
    let signed_salt = body_str(body, "signed_salt").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'signed_salt'".to_string(),
        })
    })?;
    let salt = pending_salt(ctx, &identity, "apt54")?;
    verify_challenge(ctx, &actor, &salt, signed_salt)?;

    let passport = Apt54::issue(&actor, ctx.signer())?;
    let text = serde_json::to_string(&passport).map_err(|error| StoreError::json(&error))?;
    info!(actor = %actor.uuid, "passport issued");
    Ok(json!({ "apt54": text }))
}

fn parse_apt54(body: &Value) -> Result<Apt54, ServiceError> {
    let raw = body.get("apt54").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'apt54'".to_string(),
        })
    })?;
    let passport = match raw {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    passport.map_err(|error| {
        ServiceError::Auth(AuthError::Validation {
            message: format!("unparseable apt54: {error}"),
        })
    })
}

/// `/auth/`: the session-establishing challenge flow.
fn auth(ctx: &ServiceContext, channel: &ServiceChannel, body: &Value) -> Result<Value, ServiceError> {
    if step(body) == 1 {
        let identity = identity_from(body)?;
        return issue_challenge(ctx, &identity, "auth");
    }

    let apt54 = parse_apt54(body)?;
    if !apt54.verify(ctx.trusted_public_key())? {
        warn!(actor = %apt54.user_data.uuid, "passport signature rejected");
        return Err(ServiceError::Auth(AuthError::Signature {
            context: "apt54 passport".to_string(),
        }));
    }
    if apt54.is_expired()? {
        return Err(ServiceError::Auth(AuthError::Validation {
            message: "passport is expired".to_string(),
        }));
    }

    let identity = match IdentityRef::from_body(body)? {
        Some(identity) => identity,
        None => match &apt54.user_data.initial_key {
            Some(key) => IdentityRef::PubKey(key.clone()),
            None => IdentityRef::Uuid(apt54.user_data.uuid.clone()),
        },
    };
    let signed_salt = body_str(body, "signed_salt").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'signed_salt'".to_string(),
        })
    })?;
    let salt = pending_salt(ctx, &identity, "auth")?;
    verify_challenge(ctx, &apt54.user_data, &salt, signed_salt)?;

    // QR logins chain the new session to the handoff token issued to the
    // waiting device.
    let auxiliary = body_str(body, "temporary_session").unwrap_or_default();
    if let IdentityRef::QrToken(qr_token) = &identity {
        ctx.db().bind_salt_uuid(qr_token, &apt54.user_data.uuid)?;
    }
    let outcome = SessionEngine::new(ctx, channel).create_session(&apt54, auxiliary)?;
    serde_json::to_value(&outcome).map_err(|error| StoreError::json(&error).into())
}

/// `/save_session/`: accept a session pushed by an upstream service.
fn save_session(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    verify_signed_body(ctx, body)?;
    let apt54 = parse_apt54(body)?;
    if !apt54.verify(ctx.trusted_public_key())? {
        return Err(ServiceError::Auth(AuthError::Signature {
            context: "pushed apt54 passport".to_string(),
        }));
    }
    let upstream = body_str(body, "session_token").unwrap_or_default();
    let token = SessionEngine::new(ctx, channel).save_pushed_session(&apt54, upstream)?;
    Ok(json!({ "session_token": token }))
}

/// `/get_session/`: resolve a token to the identity it asserts.
fn get_session(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
    header_token: Option<&str>,
) -> Result<Value, ServiceError> {
    let sessions = SessionEngine::new(ctx, channel);
    if let Some(temporary) = body_str(body, "temporary_session") {
        let row = sessions.redeem_temporary_session(temporary)?;
        return Ok(json!({ "session_token": row.session_token, "uuid": row.uuid }));
    }
    let token = body_str(body, "session_token")
        .or(header_token)
        .ok_or_else(|| {
            ServiceError::Auth(AuthError::Validation {
                message: "missing session token".to_string(),
            })
        })?;
    let (row, apt54) = sessions.get_session(token)?;
    Ok(json!({
        "uuid": row.uuid,
        "expiration": apt54.expiration,
        "user_data": apt54.user_data,
    }))
}

/// Verifies a signed service body: `signature` must cover the canonical
/// JSON of every other field and verify against the claimed service's
/// replicated keys (or this service's own configured key).
fn verify_signed_body(ctx: &ServiceContext, body: &Value) -> Result<String, ServiceError> {
    let service_uuid = body_str(body, "service_uuid")
        .ok_or_else(|| {
            ServiceError::Auth(AuthError::Validation {
                message: "missing 'service_uuid'".to_string(),
            })
        })?
        .to_string();
    let signature = body_str(body, "signature").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'signature'".to_string(),
        })
    })?;

    let mut unsigned = body.clone();
    if let Some(map) = unsigned.as_object_mut() {
        map.remove("signature");
    }
    let canonical = canonicalize_value(&unsigned)?;

    let keys: Vec<String> = if service_uuid == ctx.service_uuid() {
        vec![ctx.config().public_key.clone()]
    } else {
        let actor = ctx.db().get_actor(&service_uuid)?.ok_or_else(|| {
            ServiceError::Auth(AuthError::Signature {
                context: format!("unknown signing service '{service_uuid}'"),
            })
        })?;
        actor.signature_keys().iter().map(|key| (*key).to_string()).collect()
    };
    for key in &keys {
        if crypto::verify_signature(key, signature, &canonical)? {
            return Ok(service_uuid);
        }
    }
    warn!(service = %service_uuid, "signed body rejected");
    Err(ServiceError::Auth(AuthError::Signature {
        context: "service body signature".to_string(),
    }))
}

fn require_authority(ctx: &ServiceContext) -> Result<(), ServiceError> {
    if ctx.is_authority() {
        return Ok(());
    }
    Err(ServiceError::Auth(AuthError::Validation {
        message: "this operation is handled by the trust authority".to_string(),
    }))
}

fn actor_from(body: &Value) -> Result<Actor, ServiceError> {
    let raw = body.get("actor").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'actor'".to_string(),
        })
    })?;
    let actor: Actor = serde_json::from_value(raw.clone()).map_err(|error| {
        ServiceError::Auth(AuthError::Validation {
            message: format!("unparseable actor: {error}"),
        })
    })?;
    actor.validate()?;
    Ok(actor)
}

/// `/actor/` POST and PUT: create or update an actor on the authority and
/// fan the change out.
fn actor_upsert(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
    method: Method,
) -> Result<Value, ServiceError> {
    require_authority(ctx)?;
    verify_signed_body(ctx, body)?;
    let actor = actor_from(body)?;
    let existed = ctx.db().get_actor(&actor.uuid)?.is_some();
    if method == Method::Post && existed {
        return Err(ServiceError::Auth(AuthError::Validation {
            message: format!("actor '{}' already exists", actor.uuid),
        }));
    }
    ctx.db().upsert_actor(&actor)?;
    let action = if existed { "update_actor" } else { "create_actor" };
    let data = serde_json::to_value(&actor).map_err(|error| StoreError::json(&error))?;
    SyncEngine::new(ctx, channel).send_callback(action, data);
    Ok(json!({ "uuid": actor.uuid }))
}

/// `/actor/` DELETE.
fn actor_delete(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    require_authority(ctx)?;
    verify_signed_body(ctx, body)?;
    let uuid = body_str(body, "uuid").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'uuid'".to_string(),
        })
    })?;
    if !ctx.db().delete_actor(uuid)? {
        return Err(ServiceError::Auth(AuthError::NotFound {
            what: format!("actor '{uuid}'"),
        }));
    }
    SyncEngine::new(ctx, channel).send_callback("delete_actor", json!({ "uuid": uuid }));
    Ok(json!({ "uuid": uuid }))
}

fn permaction_payload(body: &Value) -> Result<&Value, ServiceError> {
    body.get("permaction").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'permaction'".to_string(),
        })
    })
}

/// `/permaction/actor/` POST.
fn actor_permaction_upsert(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    require_authority(ctx)?;
    verify_signed_body(ctx, body)?;
    let row: ActorPermactionRow = serde_json::from_value(permaction_payload(body)?.clone())
        .map_err(|error| {
            ServiceError::Auth(AuthError::Validation {
                message: format!("unparseable permaction: {error}"),
            })
        })?;
    ctx.db().upsert_actor_permaction(&row)?;
    let data = serde_json::to_value(&row).map_err(|error| StoreError::json(&error))?;
    SyncEngine::new(ctx, channel).send_callback("create_actor_permaction", data);
    Ok(json!({}))
}

/// `/permaction/actor/` DELETE.
fn actor_permaction_delete(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    require_authority(ctx)?;
    verify_signed_body(ctx, body)?;
    let payload = permaction_payload(body)?;
    let (permaction_uuid, actor_uuid, service_uuid) = permaction_key(payload)?;
    if !ctx.db().delete_actor_permaction(&permaction_uuid, &actor_uuid, &service_uuid)? {
        return Err(ServiceError::Auth(AuthError::NotFound {
            what: format!("actor permaction '{permaction_uuid}'"),
        }));
    }
    SyncEngine::new(ctx, channel).send_callback("delete_actor_permaction", payload.clone());
    Ok(json!({}))
}

/// `/permaction/group/` POST.
fn group_permaction_upsert(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    require_authority(ctx)?;
    verify_signed_body(ctx, body)?;
    let row: GroupPermactionRow = serde_json::from_value(permaction_payload(body)?.clone())
        .map_err(|error| {
            ServiceError::Auth(AuthError::Validation {
                message: format!("unparseable permaction: {error}"),
            })
        })?;
    ctx.db().upsert_group_permaction(&row)?;
    let data = serde_json::to_value(&row).map_err(|error| StoreError::json(&error))?;
    SyncEngine::new(ctx, channel).send_callback("create_group_permaction", data);
    Ok(json!({}))
}

/// `/permaction/group/` DELETE.
fn group_permaction_delete(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    require_authority(ctx)?;
    verify_signed_body(ctx, body)?;
    let payload = permaction_payload(body)?;
    let (permaction_uuid, actor_uuid, service_uuid) = permaction_key(payload)?;
    if !ctx.db().delete_group_permaction(&permaction_uuid, &actor_uuid, &service_uuid)? {
        return Err(ServiceError::Auth(AuthError::NotFound {
            what: format!("group permaction '{permaction_uuid}'"),
        }));
    }
    SyncEngine::new(ctx, channel).send_callback("delete_group_permaction", payload.clone());
    Ok(json!({}))
}

fn permaction_key(payload: &Value) -> Result<(String, String, String), ServiceError> {
    let field = |key: &str| {
        body_str(payload, key).map(str::to_string).ok_or_else(|| {
            ServiceError::Auth(AuthError::Validation {
                message: format!("missing '{key}'"),
            })
        })
    };
    Ok((field("permaction_uuid")?, field("actor_uuid")?, field("service_uuid")?))
}

/// `/synchronization/force/`: apply a pushed replica bundle.
fn synchronization_force(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
) -> Result<Value, ServiceError> {
    verify_signed_body(ctx, body)?;
    let bundle_hex = body_str(body, "bundle").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'bundle'".to_string(),
        })
    })?;
    let bytes = hex::decode(bundle_hex).map_err(|error| {
        ServiceError::Auth(AuthError::Validation {
            message: format!("bundle is not hex: {error}"),
        })
    })?;
    let parts = SyncEngine::decode_bundle(&bytes)?;
    SyncEngine::new(ctx, channel).apply_bundle(&parts)?;
    info!("forced synchronization applied");
    Ok(json!({}))
}

/// `/masquerade/on/`.
fn masquerade_on(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    body: &Value,
    token: Option<&str>,
) -> Result<Value, ServiceError> {
    let token = token.ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing session token".to_string(),
        })
    })?;
    let target = body_str(body, "actor_uuid")
        .or_else(|| body_str(body, "uuid"))
        .ok_or_else(|| {
            ServiceError::Auth(AuthError::Validation {
                message: "missing target 'actor_uuid'".to_string(),
            })
        })?;
    let outcome = masquerade::start_masquerade(ctx, channel, token, target)?;
    serde_json::to_value(&outcome).map_err(|error| StoreError::json(&error).into())
}

/// `/masquerade/off/`.
fn masquerade_off(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    token: Option<&str>,
) -> Result<Value, ServiceError> {
    let token = token.ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing session token".to_string(),
        })
    })?;
    let primary = masquerade::stop_masquerade(ctx, channel, token)?;
    Ok(json!({ "session_token": primary }))
}

/// `/service/get_actors/`: the full actor slice, in forced-sync shape.
fn service_get_actors(ctx: &ServiceContext, body: &Value) -> Result<Value, ServiceError> {
    verify_signed_body(ctx, body)?;
    let actors = ctx.db().all_actors()?;
    let mut by_uuid = serde_json::Map::new();
    let mut uuids = Vec::new();
    for actor in &actors {
        uuids.push(Value::String(actor.uuid.clone()));
        by_uuid.insert(
            actor.uuid.clone(),
            serde_json::to_value(actor).map_err(|error| StoreError::json(&error))?,
        );
    }
    Ok(json!({ "actors": { "actors": by_uuid }, "actors_uuids": uuids }))
}

/// `/service/get_groups/`: the group slice.
fn service_get_groups(ctx: &ServiceContext, body: &Value) -> Result<Value, ServiceError> {
    verify_signed_body(ctx, body)?;
    let groups = ctx.db().all_groups()?;
    let mut by_uuid = serde_json::Map::new();
    for group in &groups {
        by_uuid.insert(
            group.uuid.clone(),
            serde_json::to_value(group).map_err(|error| StoreError::json(&error))?,
        );
    }
    Ok(json!({ "groups": by_uuid }))
}

/// `/service/get_permissions/`: the calling service's permaction rows.
fn service_get_permissions(ctx: &ServiceContext, body: &Value) -> Result<Value, ServiceError> {
    let caller = verify_signed_body(ctx, body)?;
    let actor_rows = ctx.db().actor_permactions_for_service(&caller)?;
    let group_rows = ctx.db().group_permactions_for_service(&caller)?;
    Ok(json!({
        "actor_permactions": actor_rows,
        "group_permactions": group_rows,
    }))
}

/// `/service/callback/`: apply one replicated mutation.
fn service_callback(ctx: &ServiceContext, body: &Value) -> Result<Value, ServiceError> {
    verify_signed_body(ctx, body)?;
    let action_type = body_str(body, "action_type").ok_or_else(|| {
        ServiceError::Auth(AuthError::Validation {
            message: "missing 'action_type'".to_string(),
        })
    })?;
    let data = body.get("data").cloned().unwrap_or(Value::Null);

    if ctx.is_authority() {
        // The authority is the source of truth; inbound callbacks are
        // acknowledged but never applied.
        info!(action_type, "callback acknowledged");
        return Ok(json!({}));
    }
    apply_callback(ctx, action_type, &data)?;
    info!(action_type, "callback applied");
    Ok(json!({}))
}

fn apply_callback(ctx: &ServiceContext, action_type: &str, data: &Value) -> Result<(), ServiceError> {
    match action_type {
        "create_actor" | "update_actor" => {
            let actor: Actor = serde_json::from_value(data.clone()).map_err(|error| {
                ServiceError::Auth(AuthError::Validation {
                    message: format!("unparseable actor: {error}"),
                })
            })?;
            ctx.db().upsert_actor(&actor)?;
        },
        "delete_actor" => {
            if let Some(uuid) = body_str(data, "uuid") {
                ctx.db().delete_actor(uuid)?;
            }
        },
        "create_actor_permaction" => {
            let row: ActorPermactionRow =
                serde_json::from_value(data.clone()).map_err(|error| {
                    ServiceError::Auth(AuthError::Validation {
                        message: format!("unparseable permaction: {error}"),
                    })
                })?;
            ctx.db().upsert_actor_permaction(&row)?;
        },
        "delete_actor_permaction" => {
            let (permaction_uuid, actor_uuid, service_uuid) = permaction_key(data)?;
            ctx.db().delete_actor_permaction(&permaction_uuid, &actor_uuid, &service_uuid)?;
        },
        "create_group_permaction" => {
            let row: GroupPermactionRow =
                serde_json::from_value(data.clone()).map_err(|error| {
                    ServiceError::Auth(AuthError::Validation {
                        message: format!("unparseable permaction: {error}"),
                    })
                })?;
            ctx.db().upsert_group_permaction(&row)?;
        },
        "delete_group_permaction" => {
            let (permaction_uuid, actor_uuid, service_uuid) = permaction_key(data)?;
            ctx.db().delete_group_permaction(&permaction_uuid, &actor_uuid, &service_uuid)?;
        },
        other => {
            return Err(ServiceError::Auth(AuthError::Validation {
                message: format!("unknown callback action '{other}'"),
            }));
        },
    }
    Ok(())
}
