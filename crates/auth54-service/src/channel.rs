//! Signed service-to-service channel.
//!
//! Every federation call a service makes goes through [`ServiceChannel`]:
//! it signs outbound bodies with the service key, attaches the session
//! token, and enforces the configured timeouts. In standalone mode there is
//! no network; calls dispatch straight into the local handler table so the
//! same engine code runs in both deployments.
//!
//! A signed body carries the caller's `service_uuid` and a `signature` over
//! the canonical JSON of every other field, so the receiver can verify it
//! against the caller's replicated keys without any shared secret.

use std::time::Duration;

use auth54_core::canonical::{CanonicalJsonError, canonicalize_value};
use auth54_core::crypto::KeyError;
use auth54_core::passport::{Apt54, PassportError};
use auth54_core::{AuthError, actor::ActorType};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::ServiceContext;
use crate::handlers::{self, Method, Request};
use crate::store::StoreError;

/// Errors raised by the channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The HTTP client could not be built.
    #[error("http client setup failed: {message}")]
    Client {
        /// Builder diagnostic.
        message: String,
    },

    /// The request never completed (connect failure, timeout).
    #[error("request to '{peer}' failed: {message}")]
    Request {
        /// Peer name or url.
        peer: String,
        /// Transport diagnostic.
        message: String,
    },

    /// The peer answered with an unexpected status.
    #[error("'{peer}' answered {status}: {body}")]
    Status {
        /// Peer name or url.
        peer: String,
        /// HTTP status.
        status: u16,
        /// Response body, for the log.
        body: String,
    },

    /// The issuing authority does not know this service (wire status 452).
    #[error("identity '{uuid}' unknown to the authority")]
    ActorUnknown {
        /// The unknown identity.
        uuid: String,
    },

    /// The peer answered 2xx but the body is not the expected shape.
    #[error("'{peer}' answered with an invalid body: {message}")]
    InvalidResponse {
        /// Peer name or url.
        peer: String,
        /// What was wrong.
        message: String,
    },

    /// The trust authority is not registered in the local actor table.
    #[error("authority service is not registered locally")]
    AuthorityNotRegistered,

    /// Outbound body could not be canonicalized for signing.
    #[error(transparent)]
    Canonical(#[from] CanonicalJsonError),

    /// Key handling failed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A fetched passport failed verification plumbing.
    #[error(transparent)]
    Passport(#[from] PassportError),

    /// Local storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ChannelError> for AuthError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::ActorUnknown { uuid } => Self::UnknownActor { uuid },
            ChannelError::Request { peer, message } => Self::Upstream { peer, message },
            ChannelError::Status { peer, status, body } => Self::Upstream {
                peer,
                message: format!("status {status}: {body}"),
            },
            ChannelError::InvalidResponse { peer, message } => Self::Upstream { peer, message },
            ChannelError::AuthorityNotRegistered => Self::Validation {
                message: "authority service is not registered locally".to_string(),
            },
            ChannelError::Canonical(inner) => inner.into(),
            ChannelError::Key(inner) => inner.into(),
            ChannelError::Passport(inner) => inner.into(),
            ChannelError::Client { message } | ChannelError::Store(StoreError::Json { message }) => {
                Self::Internal { message }
            },
            ChannelError::Store(inner) => Self::Internal {
                message: inner.to_string(),
            },
        }
    }
}

/// A remote federation member.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Name used in logs and fan-out results.
    pub name: String,
    /// Base URL.
    pub url: String,
    /// Actor uuid of the peer service.
    pub uuid: String,
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Sign the body with the service key.
    pub signed: bool,
    /// Parse the response body as JSON.
    pub as_json: bool,
    /// Override the configured request timeout.
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            signed: true,
            as_json: true,
            timeout: None,
        }
    }
}

/// One channel response.
#[derive(Debug, Clone)]
pub struct ChannelResponse {
    /// HTTP status.
    pub status: u16,
    /// Parsed body.
    pub body: Value,
}

impl ChannelResponse {
    fn expect_ok(self, peer: &Peer) -> Result<Value, ChannelError> {
        if self.status == 452 {
            let uuid = self
                .body
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(ChannelError::ActorUnknown { uuid });
        }
        if !(200..300).contains(&self.status) {
            return Err(ChannelError::Status {
                peer: peer.name.clone(),
                status: self.status,
                body: self.body.to_string(),
            });
        }
        Ok(self.body)
    }
}

/// Outbound side of the federation protocol.
#[derive(Debug, Clone)]
pub struct ServiceChannel {
    ctx: ServiceContext,
    http: reqwest::blocking::Client,
}

impl ServiceChannel {
    /// Builds the channel with the configured connect and request timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Client`] when the HTTP client cannot be
    /// built.
    pub fn new(ctx: ServiceContext) -> Result<Self, ChannelError> {
        let timeouts = ctx.config().timeouts;
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .timeout(Duration::from_secs(timeouts.request_secs))
            .build()
            .map_err(|error| ChannelError::Client {
                message: error.to_string(),
            })?;
        Ok(Self { ctx, http })
    }

    /// The trust authority as a peer. Resolved through the local actor
    /// table: the authority must be replicated here with an `initial_key`
    /// matching the configured authority key.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AuthorityNotRegistered`] when no such actor
    /// exists.
    pub fn authority_peer(&self) -> Result<Peer, ChannelError> {
        let config = self.ctx.config();
        if config.standalone {
            return Ok(Peer {
                name: "self".to_string(),
                url: config.service_domain.clone(),
                uuid: config.service_uuid.clone(),
            });
        }
        let auth = config
            .auth
            .as_ref()
            .ok_or(ChannelError::AuthorityNotRegistered)?;
        let actor = self
            .ctx
            .db()
            .get_actor_by_initial_key(&auth.public_key)?
            .filter(|actor| actor.actor_type == ActorType::Service)
            .ok_or(ChannelError::AuthorityNotRegistered)?;
        Ok(Peer {
            name: "auth".to_string(),
            url: auth.url.clone(),
            uuid: actor.uuid,
        })
    }

    /// Adds `service_uuid` and a detached `signature` over the canonical
    /// JSON of the remaining fields.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Canonical`] when the body cannot be
    /// canonicalized.
    pub fn sign_body(&self, body: &mut Value) -> Result<(), ChannelError> {
        if !body.is_object() {
            *body = json!({});
        }
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "service_uuid".to_string(),
                Value::String(self.ctx.service_uuid().to_string()),
            );
            map.remove("signature");
        }
        let canonical = canonicalize_value(body)?;
        let signature = self.ctx.signer().sign(&canonical);
        if let Some(map) = body.as_object_mut() {
            map.insert("signature".to_string(), Value::String(signature));
        }
        Ok(())
    }

    /// Makes one call to a peer endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport failure or an unparseable
    /// response.
    pub fn call(
        &self,
        peer: &Peer,
        method: Method,
        endpoint: &str,
        mut body: Value,
        session_token: Option<&str>,
        options: &CallOptions,
    ) -> Result<ChannelResponse, ChannelError> {
        if options.signed {
            self.sign_body(&mut body)?;
        }
        if self.ctx.config().standalone {
            return self.dispatch_local(method, endpoint, body, session_token);
        }
        let url = format!(
            "{}/{}",
            peer.url.trim_end_matches('/'),
            endpoint.trim_matches('/')
        );
        let http_method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        debug!(peer = %peer.name, %url, "outbound federation call");
        let mut request = self.http.request(http_method, &format!("{url}/")).json(&body);
        if let Some(token) = session_token {
            request = request.header("Session-Token", token);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().map_err(|error| ChannelError::Request {
            peer: peer.name.clone(),
            message: error.to_string(),
        })?;
        let status = response.status().as_u16();
        let text = response.text().map_err(|error| ChannelError::Request {
            peer: peer.name.clone(),
            message: error.to_string(),
        })?;
        let body = if options.as_json {
            serde_json::from_str(&text).map_err(|error| ChannelError::InvalidResponse {
                peer: peer.name.clone(),
                message: format!("{error}: {text}"),
            })?
        } else {
            Value::String(text)
        };
        Ok(ChannelResponse { status, body })
    }

    /// Standalone deployments answer their own calls through the handler
    /// table instead of the network.
    fn dispatch_local(
        &self,
        method: Method,
        endpoint: &str,
        body: Value,
        session_token: Option<&str>,
    ) -> Result<ChannelResponse, ChannelError> {
        let request = Request {
            method,
            endpoint: endpoint.to_string(),
            body,
            session_token: session_token.map(str::to_string),
        };
        let response = handlers::dispatch(&self.ctx, &request);
        Ok(ChannelResponse {
            status: response.status,
            body: response.body,
        })
    }

    /// Fetches a fresh passport for this service from the authority: salt
    /// challenge, signed response, passport back.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ActorUnknown`] when the authority does not
    /// know this service, or any transport/parse failure.
    pub fn fetch_apt54(&self, peer: &Peer) -> Result<Apt54, ChannelError> {
        let pub_key = self.ctx.config().public_key.clone();
        let step1 = self
            .call(
                peer,
                Method::Post,
                "apt54",
                json!({ "pub_key": pub_key }),
                None,
                &CallOptions::default(),
            )?
            .expect_ok(peer)?;
        let salt = step1
            .get("salt")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::InvalidResponse {
                peer: peer.name.clone(),
                message: "missing 'salt'".to_string(),
            })?;
        let signed_salt = self.ctx.signer().sign(salt);

        let step2 = self
            .call(
                peer,
                Method::Post,
                "apt54",
                json!({ "step": 2, "pub_key": pub_key, "signed_salt": signed_salt }),
                None,
                &CallOptions::default(),
            )?
            .expect_ok(peer)?;
        let passport_text = step2
            .get("apt54")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::InvalidResponse {
                peer: peer.name.clone(),
                message: "missing 'apt54'".to_string(),
            })?;
        serde_json::from_str(passport_text).map_err(|error| ChannelError::InvalidResponse {
            peer: peer.name.clone(),
            message: format!("unparseable passport: {error}"),
        })
    }

    /// Establishes a session on a peer service with a passport: salt
    /// challenge, signed response plus passport, session token back.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on challenge, transport, or parse failure.
    pub fn establish_session(&self, peer: &Peer, apt54: &Apt54) -> Result<String, ChannelError> {
        let pub_key = self.ctx.config().public_key.clone();
        let step1 = self
            .call(
                peer,
                Method::Post,
                "auth",
                json!({ "pub_key": pub_key }),
                None,
                &CallOptions::default(),
            )?
            .expect_ok(peer)?;
        let salt = step1
            .get("salt")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::InvalidResponse {
                peer: peer.name.clone(),
                message: "missing 'salt'".to_string(),
            })?;
        let signed_salt = self.ctx.signer().sign(salt);
        let apt54_text = serde_json::to_string(apt54).map_err(|error| StoreError::json(&error))?;

        let step2 = self
            .call(
                peer,
                Method::Post,
                "auth",
                json!({
                    "step": 2,
                    "pub_key": pub_key,
                    "signed_salt": signed_salt,
                    "apt54": apt54_text,
                }),
                None,
                &CallOptions::default(),
            )?
            .expect_ok(peer)?;
        step2
            .get("session_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChannelError::InvalidResponse {
                peer: peer.name.clone(),
                message: "missing 'session_token'".to_string(),
            })
    }

    /// The cached service-to-service session token for a peer, minting one
    /// when none is stored.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when no session exists and one cannot be
    /// established.
    pub fn session_token_for(&self, peer: &Peer) -> Result<String, ChannelError> {
        let own_uuid = self.ctx.service_uuid();
        if let Some(row) = self.ctx.db().latest_session_for(own_uuid, &peer.uuid)? {
            return Ok(row.session_token);
        }
        let authority = self.authority_peer()?;
        let apt54 = self.fetch_apt54(&authority)?;
        let token = self.establish_session(peer, &apt54)?;
        let apt54_text = serde_json::to_string(&apt54).map_err(|error| StoreError::json(&error))?;
        self.ctx
            .db()
            .create_session(own_uuid, &apt54_text, &token, &peer.uuid)?;
        Ok(token)
    }

    /// Pulls the full actor set from the authority (forced sync source).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport or parse failure.
    pub fn pull_actors(&self, peer: &Peer) -> Result<Value, ChannelError> {
        self.pull(peer, "service/get_actors")
    }

    /// Pulls the group set from the authority.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport or parse failure.
    pub fn pull_groups(&self, peer: &Peer) -> Result<Value, ChannelError> {
        self.pull(peer, "service/get_groups")
    }

    /// Pulls this service's permaction rows from the authority.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] on transport or parse failure.
    pub fn pull_permissions(&self, peer: &Peer) -> Result<Value, ChannelError> {
        self.pull(peer, "service/get_permissions")
    }

    fn pull(&self, peer: &Peer, endpoint: &str) -> Result<Value, ChannelError> {
        let token = self.session_token_for(peer)?;
        self.call(
            peer,
            Method::Post,
            endpoint,
            json!({}),
            Some(&token),
            &CallOptions::default(),
        )?
        .expect_ok(peer)
    }

    /// Notifies a peer of a replicated mutation. Best effort: failures are
    /// logged, never propagated, and the triggering operation stands.
    pub fn send_callback(&self, peer: &Peer, action_type: &str, data: Value) {
        let options = CallOptions {
            timeout: Some(Duration::from_secs(self.ctx.config().timeouts.callback_secs)),
            ..CallOptions::default()
        };
        let body = json!({ "action_type": action_type, "data": data });
        match self.call(peer, Method::Post, "service/callback", body, None, &options) {
            Ok(response) if (200..300).contains(&response.status) => {},
            Ok(response) => {
                warn!(
                    peer = %peer.name,
                    action_type,
                    status = response.status,
                    "callback rejected"
                );
            },
            Err(error) => {
                warn!(peer = %peer.name, action_type, %error, "callback delivery failed");
            },
        }
    }
}
