use axum::http::HeaderMap;

use crate::error::{ComplianceError, ComplianceResult};
use crate::external::{Actor, IdentityProvider};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ROLES_HEADER: &str = "x-actor-roles";

/// Identity asserted by the trusted gateway in front of this service.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    actor_id: Option<String>,
    tenant_id: Option<String>,
    roles: Vec<String>,
}

impl HeaderIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let roles = read(ROLES_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            actor_id: read(ACTOR_HEADER),
            tenant_id: read(TENANT_HEADER),
            roles,
        }
    }
}

impl IdentityProvider for HeaderIdentity {
    fn current_actor(&self) -> ComplianceResult<Actor> {
        match (&self.actor_id, &self.tenant_id) {
            (Some(actor_id), Some(tenant_id)) => Ok(Actor {
                actor_id: actor_id.clone(),
                tenant_id: tenant_id.clone(),
                roles: self.roles.clone(),
            }),
            _ => Err(ComplianceError::invalid_input(format!(
                "missing {} or {} header",
                ACTOR_HEADER, TENANT_HEADER
            ))),
        }
    }
}
