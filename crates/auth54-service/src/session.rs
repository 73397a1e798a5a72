//! Session lifecycle.
//!
//! A session binds a verified passport to a minted token on one service.
//! Creating a session on a service with dependents fans the session out to
//! each of them; fan-out failures are reported per dependent and never roll
//! back the primary session.

use auth54_core::AuthError;
use auth54_core::passport::Apt54;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::channel::{CallOptions, Peer, ServiceChannel};
use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::handlers::Method;
use crate::store::{SessionRow, StoreError};

/// Result of pushing a session to one dependent service.
#[derive(Debug, Clone, Serialize)]
pub struct DependentOutcome {
    /// Configured dependent name.
    pub name: String,
    /// Token minted on the dependent, when the push succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Failure diagnostic, when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A created session plus its fan-out report.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    /// Token minted on this service.
    pub session_token: String,
    /// Per-dependent push results.
    pub depended_services: Vec<DependentOutcome>,
}

/// Session operations bound to one context and channel.
#[derive(Debug, Clone, Copy)]
pub struct SessionEngine<'a> {
    ctx: &'a ServiceContext,
    channel: &'a ServiceChannel,
}

impl<'a> SessionEngine<'a> {
    /// Binds the engine.
    #[must_use]
    pub const fn new(ctx: &'a ServiceContext, channel: &'a ServiceChannel) -> Self {
        Self { ctx, channel }
    }

    /// Creates a session from a verified passport and fans it out to the
    /// configured dependents.
    ///
    /// The passport must already have passed signature verification; this
    /// re-checks the terminal gates (ban, expiry) and refreshes the local
    /// actor replica from the passport snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::BannedActor`] for a banned actor, a validation
    /// error for an expired passport, or [`ServiceError`] on storage
    /// failure.
    pub fn create_session(
        &self,
        apt54: &Apt54,
        auxiliary_token: &str,
    ) -> Result<SessionOutcome, ServiceError> {
        if apt54.user_data.is_banned {
            return Err(ServiceError::Auth(AuthError::BannedActor {
                uuid: apt54.user_data.uuid.clone(),
            }));
        }
        if apt54.is_expired()? {
            return Err(ServiceError::Auth(AuthError::Validation {
                message: format!("passport for '{}' is expired", apt54.user_data.uuid),
            }));
        }

        self.ctx.db().upsert_actor(&apt54.user_data)?;
        let apt54_text =
            serde_json::to_string(apt54).map_err(|error| StoreError::json(&error))?;
        let token = self.ctx.db().create_session(
            &apt54.user_data.uuid,
            &apt54_text,
            auxiliary_token,
            self.ctx.service_uuid(),
        )?;
        info!(actor = %apt54.user_data.uuid, "session created");

        let mut depended = Vec::new();
        for dependent in &self.ctx.config().depended_services {
            let peer = Peer {
                name: dependent.name.clone(),
                url: dependent.url.clone(),
                uuid: dependent.uuid.clone(),
            };
            depended.push(self.push_to_dependent(&peer, &token, &apt54_text));
        }

        Ok(SessionOutcome {
            session_token: token,
            depended_services: depended,
        })
    }

    fn push_to_dependent(&self, peer: &Peer, token: &str, apt54_text: &str) -> DependentOutcome {
        let body = json!({ "session_token": token, "apt54": apt54_text });
        let result = self.channel.call(
            peer,
            Method::Post,
            "save_session",
            body,
            None,
            &CallOptions::default(),
        );
        match result {
            Ok(response) if (200..300).contains(&response.status) => DependentOutcome {
                name: peer.name.clone(),
                token: response.body.get("session_token").and_then(Value::as_str).map(str::to_string),
                error: None,
            },
            Ok(response) => {
                warn!(peer = %peer.name, status = response.status, "session fan-out rejected");
                DependentOutcome {
                    name: peer.name.clone(),
                    token: None,
                    error: Some(format!("status {}", response.status)),
                }
            },
            Err(error) => {
                warn!(peer = %peer.name, %error, "session fan-out failed");
                DependentOutcome {
                    name: peer.name.clone(),
                    token: None,
                    error: Some(error.to_string()),
                }
            },
        }
    }

    /// Accepts a session pushed by an upstream service, minting a local
    /// token chained to the upstream one.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on gate or storage failure.
    pub fn save_pushed_session(
        &self,
        apt54: &Apt54,
        upstream_token: &str,
    ) -> Result<String, ServiceError> {
        if apt54.user_data.is_banned {
            return Err(ServiceError::Auth(AuthError::BannedActor {
                uuid: apt54.user_data.uuid.clone(),
            }));
        }
        self.ctx.db().upsert_actor(&apt54.user_data)?;
        let apt54_text =
            serde_json::to_string(apt54).map_err(|error| StoreError::json(&error))?;
        Ok(self.ctx.db().create_session(
            &apt54.user_data.uuid,
            &apt54_text,
            upstream_token,
            self.ctx.service_uuid(),
        )?)
    }

    /// Looks up a session and its stored passport.
    ///
    /// An expired passport is refreshed in place when this service is the
    /// authority (it reissues from the local actor replica); dependent
    /// services surface the expired passport unchanged and the client
    /// re-authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unknown token, or
    /// [`ServiceError`] on storage failure.
    pub fn get_session(&self, token: &str) -> Result<(SessionRow, Apt54), ServiceError> {
        let row = self.ctx.db().get_session(token)?.ok_or_else(|| {
            ServiceError::Auth(AuthError::NotFound {
                what: format!("session '{token}'"),
            })
        })?;
        let mut apt54: Apt54 =
            serde_json::from_str(&row.apt54).map_err(|error| StoreError::json(&error))?;

        if apt54.is_expired()? && self.ctx.is_authority() {
            if let Some(actor) = self.ctx.db().get_actor(&apt54.user_data.uuid)? {
                let fresh = Apt54::issue(&actor, self.ctx.signer())?;
                let fresh_text =
                    serde_json::to_string(&fresh).map_err(|error| StoreError::json(&error))?;
                self.ctx.db().update_session_apt54(token, &fresh_text)?;
                info!(actor = %actor.uuid, "expired passport reissued");
                apt54 = fresh;
            }
        }
        Ok((row, apt54))
    }

    /// Mints a temporary handoff token for SSO and QR flows.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage failure.
    pub fn create_temporary_session(&self) -> Result<String, ServiceError> {
        Ok(self
            .ctx
            .db()
            .create_temporary_session(self.ctx.service_uuid())?)
    }

    /// Redeems a temporary handoff token for the session it chained to.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unknown or already-redeemed
    /// token, or [`ServiceError`] on storage failure.
    pub fn redeem_temporary_session(&self, token: &str) -> Result<SessionRow, ServiceError> {
        let temp = self.ctx.db().take_temporary_session(token)?.ok_or_else(|| {
            ServiceError::Auth(AuthError::NotFound {
                what: format!("temporary session '{token}'"),
            })
        })?;
        self.ctx
            .db()
            .get_session_by_auxiliary(&temp.temporary_session)?
            .ok_or_else(|| {
                ServiceError::Auth(AuthError::NotFound {
                    what: format!("session for temporary token '{token}'"),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use auth54_core::actor::{Actor, ActorType};

    use super::*;
    use crate::config::tests_support::standalone_config;
    use crate::store::Db;

    fn engine_parts() -> (ServiceContext, ServiceChannel) {
        let ctx =
            ServiceContext::with_db(standalone_config(), Db::open_in_memory().unwrap()).unwrap();
        let channel = ServiceChannel::new(ctx.clone()).unwrap();
        (ctx, channel)
    }

    fn passport_for(ctx: &ServiceContext, uuid: &str, banned: bool) -> Apt54 {
        let mut actor = Actor::new(uuid, ActorType::User);
        actor.is_banned = banned;
        Apt54::issue(&actor, ctx.signer()).unwrap()
    }

    #[test]
    fn session_round_trips_with_passport() {
        let (ctx, channel) = engine_parts();
        let engine = SessionEngine::new(&ctx, &channel);
        let apt54 = passport_for(&ctx, "11111111-1111-4111-8111-111111111111", false);

        let outcome = engine.create_session(&apt54, "").unwrap();
        assert!(outcome.depended_services.is_empty());

        let (row, stored) = engine.get_session(&outcome.session_token).unwrap();
        assert_eq!(row.uuid, "11111111-1111-4111-8111-111111111111");
        assert_eq!(stored, apt54);

        // The replica picked the actor up from the passport.
        assert!(
            ctx.db()
                .get_actor("11111111-1111-4111-8111-111111111111")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn banned_actor_gets_no_session() {
        let (ctx, channel) = engine_parts();
        let engine = SessionEngine::new(&ctx, &channel);
        let apt54 = passport_for(&ctx, "11111111-1111-4111-8111-111111111111", true);

        let err = engine.create_session(&apt54, "").unwrap_err();
        assert!(matches!(
            AuthError::from(err),
            AuthError::BannedActor { .. }
        ));
        assert!(
            ctx.db()
                .latest_session_for("11111111-1111-4111-8111-111111111111", ctx.service_uuid())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (ctx, channel) = engine_parts();
        let engine = SessionEngine::new(&ctx, &channel);
        let err = engine.get_session("nope").unwrap_err();
        assert!(matches!(AuthError::from(err), AuthError::NotFound { .. }));
    }

    #[test]
    fn authority_reissues_expired_passport_on_lookup() {
        let (ctx, channel) = engine_parts();
        let engine = SessionEngine::new(&ctx, &channel);

        let actor = Actor::new("11111111-1111-4111-8111-111111111111", ActorType::User);
        ctx.db().upsert_actor(&actor).unwrap();

        // Store a session whose passport expired yesterday.
        let expiration = (chrono::Utc::now() - chrono::Duration::days(1))
            .format(auth54_core::TIMESTAMP_FORMAT)
            .to_string();
        let message = format!(
            "{}{expiration}",
            auth54_core::canonical_string(&actor).unwrap()
        );
        let stale = Apt54 {
            user_data: actor,
            expiration,
            signature: ctx.signer().sign(&message),
        };
        let token = ctx
            .db()
            .create_session(
                "11111111-1111-4111-8111-111111111111",
                &serde_json::to_string(&stale).unwrap(),
                "",
                ctx.service_uuid(),
            )
            .unwrap();

        let (_, refreshed) = engine.get_session(&token).unwrap();
        assert!(!refreshed.is_expired().unwrap());
        assert!(refreshed.verify(&ctx.config().public_key).unwrap());
    }

    #[test]
    fn temporary_session_redeems_chained_session() {
        let (ctx, channel) = engine_parts();
        let engine = SessionEngine::new(&ctx, &channel);

        let temp = engine.create_temporary_session().unwrap();
        let apt54 = passport_for(&ctx, "11111111-1111-4111-8111-111111111111", false);
        // The login device chains the real session to the handoff token.
        let outcome = engine.create_session(&apt54, &temp).unwrap();

        let row = engine.redeem_temporary_session(&temp).unwrap();
        assert_eq!(row.session_token, outcome.session_token);

        // Single use.
        let err = engine.redeem_temporary_session(&temp).unwrap_err();
        assert!(matches!(AuthError::from(err), AuthError::NotFound { .. }));
    }
}
