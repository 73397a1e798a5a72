//! Permission resolution.
//!
//! Capabilities resolve against the replicated override tables in a fixed
//! precedence: a per-actor override wins outright, then the heaviest group
//! override among the actor's groups, then the per-service default row,
//! then the descriptor's declared default. The winning row supplies both
//! the grant value and the evaluator parameters.
//!
//! Unions are OR-joins: a union request is granted when any member
//! capability grants it.

use auth54_core::AuthError;
use auth54_core::actor::Actor;
use auth54_core::permaction::{PermactionDescriptor, PermactionKind};
use serde_json::Value;
use tracing::debug;

use crate::context::ServiceContext;
use crate::error::ServiceError;

/// Where a resolved grant came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantSource {
    /// A per-actor override row.
    ActorOverride,
    /// A per-group override row; carries the winning group uuid.
    GroupOverride(String),
    /// The per-service default row.
    ServiceDefault,
    /// The descriptor's declared default.
    DescriptorDefault,
}

/// The outcome of resolving one capability for one actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGrant {
    /// Grant value; `0` is denied.
    pub value: i64,
    /// Evaluator parameters from the winning row.
    pub params: Value,
    /// Which layer won.
    pub source: GrantSource,
}

/// Resolves capabilities for one service context.
#[derive(Debug, Clone, Copy)]
pub struct PermissionEngine<'a> {
    ctx: &'a ServiceContext,
}

impl<'a> PermissionEngine<'a> {
    /// Binds the engine to a context.
    #[must_use]
    pub const fn new(ctx: &'a ServiceContext) -> Self {
        Self { ctx }
    }

    fn descriptor(&self, permaction_uuid: &str) -> Result<&'a PermactionDescriptor, ServiceError> {
        self.ctx
            .registry()
            .get(permaction_uuid)
            .ok_or_else(|| {
                ServiceError::Auth(AuthError::NotFound {
                    what: format!("permaction '{permaction_uuid}'"),
                })
            })
    }

    /// Resolves the grant value and parameters for one capability.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] for an unregistered permaction uuid,
    /// or [`ServiceError`] on storage failure.
    pub fn resolve(
        &self,
        permaction_uuid: &str,
        actor: &Actor,
    ) -> Result<ResolvedGrant, ServiceError> {
        let descriptor = self.descriptor(permaction_uuid)?;
        let service_uuid = self.ctx.service_uuid();
        let db = self.ctx.db();

        if let Some(row) = db.actor_permaction_override(permaction_uuid, service_uuid, &actor.uuid)?
        {
            return Ok(ResolvedGrant {
                value: row.value,
                params: row.params,
                source: GrantSource::ActorOverride,
            });
        }

        let groups = actor.group_uuids();
        if !groups.is_empty() {
            let overrides =
                db.group_permaction_overrides(permaction_uuid, service_uuid, &groups)?;
            if let Some(winner) = overrides.into_iter().next() {
                return Ok(ResolvedGrant {
                    value: winner.value,
                    params: winner.params,
                    source: GrantSource::GroupOverride(winner.actor_uuid),
                });
            }
        }

        if let Some(row) = db.default_permaction(permaction_uuid, service_uuid)? {
            return Ok(ResolvedGrant {
                value: row.value,
                params: row.params,
                source: GrantSource::ServiceDefault,
            });
        }

        Ok(ResolvedGrant {
            value: descriptor.default_value,
            params: descriptor.params(),
            source: GrantSource::DescriptorDefault,
        })
    }

    /// Whether one capability grants a concrete request.
    ///
    /// A `Check` capability grants when its resolved value is nonzero and
    /// its evaluator accepts the request against the resolved parameters.
    /// A `Value` capability grants on a nonzero resolved value alone.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on an unregistered uuid or storage failure.
    pub fn grants(
        &self,
        permaction_uuid: &str,
        actor: &Actor,
        requested: &Value,
    ) -> Result<bool, ServiceError> {
        let descriptor = self.descriptor(permaction_uuid)?;
        let resolved = self.resolve(permaction_uuid, actor)?;
        if resolved.value == 0 {
            return Ok(false);
        }
        let granted = match descriptor.kind {
            PermactionKind::Check => (descriptor.evaluator)(&resolved.params, requested),
            PermactionKind::Value => true,
        };
        debug!(
            permaction = permaction_uuid,
            actor = %actor.uuid,
            source = ?resolved.source,
            granted,
            "capability evaluated"
        );
        Ok(granted)
    }

    /// Whether any capability in a named union grants the request.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on storage failure.
    pub fn union_grants(
        &self,
        union: &str,
        actor: &Actor,
        requested: &Value,
    ) -> Result<bool, ServiceError> {
        for descriptor in self.ctx.registry().union_members(union) {
            if self.grants(descriptor.uuid, actor, requested)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Gates an operation on a capability, failing with
    /// [`AuthError::PermissionDenied`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] when the capability does not
    /// grant, or [`ServiceError`] on resolution failure.
    pub fn require(
        &self,
        permaction_uuid: &str,
        actor: &Actor,
        requested: &Value,
    ) -> Result<(), ServiceError> {
        if self.grants(permaction_uuid, actor, requested)? {
            return Ok(());
        }
        Err(ServiceError::Auth(AuthError::PermissionDenied {
            permaction: permaction_uuid.to_string(),
        }))
    }

    /// Gates an operation on a union, failing with
    /// [`AuthError::PermissionDenied`] naming the union.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] when no member grants, or
    /// [`ServiceError`] on resolution failure.
    pub fn require_union(
        &self,
        union: &str,
        actor: &Actor,
        requested: &Value,
    ) -> Result<(), ServiceError> {
        if self.union_grants(union, actor, requested)? {
            return Ok(());
        }
        Err(ServiceError::Auth(AuthError::PermissionDenied {
            permaction: union.to_string(),
        }))
    }
}
