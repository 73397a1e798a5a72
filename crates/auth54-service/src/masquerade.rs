//! Masquerade: working as another actor.
//!
//! A masquerade session is a second, fully ordinary session issued for the
//! target actor and chained to the operator's own session. The capability
//! gate runs before anything is created; a denied request leaves no trace
//! beyond the log line.

use auth54_core::passport::Apt54;
use auth54_core::permaction::MASQUERADE_UNION;
use auth54_core::AuthError;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::channel::ServiceChannel;
use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::permission::PermissionEngine;
use crate::session::SessionEngine;

/// Both halves of an active masquerade.
#[derive(Debug, Clone, Serialize)]
pub struct MasqueradeOutcome {
    /// The operator's own session token.
    pub primary_session: String,
    /// The token acting as the target.
    pub masquerade_session: String,
}

/// Starts a masquerade for the holder of `session_token` onto
/// `target_uuid`.
///
/// Only the trust authority issues masquerade passports; a dependent
/// service forwards the request instead of calling this.
///
/// # Errors
///
/// Returns [`AuthError::PermissionDenied`] when the masquerade union does
/// not grant the target, [`AuthError::NotFound`] for an unknown session or
/// target, and [`ServiceError`] on storage failure.
pub fn start_masquerade(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    session_token: &str,
    target_uuid: &str,
) -> Result<MasqueradeOutcome, ServiceError> {
    if !ctx.is_authority() {
        return Err(ServiceError::Auth(AuthError::Validation {
            message: "masquerade sessions are issued by the trust authority".to_string(),
        }));
    }

    let sessions = SessionEngine::new(ctx, channel);
    let (row, apt54) = sessions.get_session(session_token)?;

    let permissions = PermissionEngine::new(ctx);
    permissions.require_union(
        MASQUERADE_UNION,
        &apt54.user_data,
        &json!({ "masquerade": [target_uuid] }),
    )?;

    let target = ctx.db().get_actor(target_uuid)?.ok_or_else(|| {
        ServiceError::Auth(AuthError::NotFound {
            what: format!("actor '{target_uuid}'"),
        })
    })?;
    if target.is_banned {
        return Err(ServiceError::Auth(AuthError::BannedActor {
            uuid: target.uuid,
        }));
    }

    let target_passport = Apt54::issue(&target, ctx.signer())?;
    let masquerade = sessions.save_pushed_session(&target_passport, &row.session_token)?;
    info!(
        operator = %apt54.user_data.uuid,
        target = target_uuid,
        "masquerade session issued"
    );

    Ok(MasqueradeOutcome {
        primary_session: row.session_token,
        masquerade_session: masquerade,
    })
}

/// Ends a masquerade: drops the masquerade session and hands back the
/// operator's own token.
///
/// # Errors
///
/// Returns [`AuthError::NotFound`] for an unknown masquerade session, or a
/// validation error for a session that is not a masquerade.
pub fn stop_masquerade(
    ctx: &ServiceContext,
    channel: &ServiceChannel,
    masquerade_token: &str,
) -> Result<String, ServiceError> {
    let sessions = SessionEngine::new(ctx, channel);
    let (row, _) = sessions.get_session(masquerade_token)?;
    if row.auxiliary_token.is_empty() {
        return Err(ServiceError::Auth(AuthError::Validation {
            message: "session is not a masquerade".to_string(),
        }));
    }
    ctx.db().delete_session(masquerade_token)?;
    Ok(row.auxiliary_token)
}

#[cfg(test)]
mod tests {
    use auth54_core::MASQUERADE_PERMACTION_UUID;
    use auth54_core::actor::{Actor, ActorType};

    use super::*;
    use crate::config::tests_support::standalone_config;
    use crate::store::{ActorPermactionRow, Db};

    const OPERATOR: &str = "11111111-1111-4111-8111-111111111111";
    const TARGET: &str = "22222222-2222-4222-8222-222222222222";

    fn setup() -> (ServiceContext, ServiceChannel, String) {
        let ctx =
            ServiceContext::with_db(standalone_config(), Db::open_in_memory().unwrap()).unwrap();
        let channel = ServiceChannel::new(ctx.clone()).unwrap();

        ctx.db().upsert_actor(&Actor::new(TARGET, ActorType::User)).unwrap();
        let operator = Actor::new(OPERATOR, ActorType::User);
        let apt54 = Apt54::issue(&operator, ctx.signer()).unwrap();
        let sessions = SessionEngine::new(&ctx, &channel);
        let token = sessions.create_session(&apt54, "").unwrap().session_token;
        (ctx, channel, token)
    }

    fn grant_masquerade(ctx: &ServiceContext, target: &str) {
        ctx.db()
            .upsert_actor_permaction(&ActorPermactionRow {
                permaction_uuid: MASQUERADE_PERMACTION_UUID.to_string(),
                service_uuid: ctx.service_uuid().to_string(),
                actor_uuid: OPERATOR.to_string(),
                value: 1,
                params: serde_json::json!({ "masquerade": [target] }),
            })
            .unwrap();
    }

    #[test]
    fn granted_masquerade_issues_chained_session() {
        let (ctx, channel, token) = setup();
        grant_masquerade(&ctx, TARGET);

        let outcome = start_masquerade(&ctx, &channel, &token, TARGET).unwrap();
        assert_eq!(outcome.primary_session, token);

        let row = ctx.db().get_session(&outcome.masquerade_session).unwrap().unwrap();
        assert_eq!(row.uuid, TARGET);
        assert_eq!(row.auxiliary_token, token);
    }

    #[test]
    fn denied_masquerade_creates_nothing() {
        let (ctx, channel, token) = setup();

        let err = start_masquerade(&ctx, &channel, &token, TARGET).unwrap_err();
        assert!(matches!(
            AuthError::from(err),
            AuthError::PermissionDenied { .. }
        ));
        assert!(
            ctx.db()
                .latest_session_for(TARGET, ctx.service_uuid())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn grant_for_other_target_does_not_transfer() {
        let (ctx, channel, token) = setup();
        grant_masquerade(&ctx, "33333333-3333-4333-8333-333333333333");

        let err = start_masquerade(&ctx, &channel, &token, TARGET).unwrap_err();
        assert!(matches!(
            AuthError::from(err),
            AuthError::PermissionDenied { .. }
        ));
    }

    #[test]
    fn stop_returns_operator_session() {
        let (ctx, channel, token) = setup();
        grant_masquerade(&ctx, TARGET);
        let outcome = start_masquerade(&ctx, &channel, &token, TARGET).unwrap();

        let primary = stop_masquerade(&ctx, &channel, &outcome.masquerade_session).unwrap();
        assert_eq!(primary, token);
        assert!(ctx.db().get_session(&outcome.masquerade_session).unwrap().is_none());

        // Stopping a plain session is rejected.
        let err = stop_masquerade(&ctx, &channel, &token).unwrap_err();
        assert!(matches!(AuthError::from(err), AuthError::Validation { .. }));
    }
}
