//! Identity provider interface
//!
//! The core trusts whatever actor the surrounding directory reports; it
//! performs no authentication of its own.

use serde::{Deserialize, Serialize};

use crate::error::{ComplianceError, ComplianceResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(actor_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            tenant_id: tenant_id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

pub trait IdentityProvider: Send + Sync {
    fn current_actor(&self) -> ComplianceResult<Actor>;
}

/// Fixed actor, for system jobs and tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    actor: Actor,
}

impl StaticIdentity {
    pub fn new(actor: Actor) -> Self {
        Self { actor }
    }

    /// The scheduler's own identity when it writes into a tenant chain.
    pub fn system(tenant_id: &str) -> Self {
        Self::new(Actor::new("system:compliance", tenant_id).with_role("system"))
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_actor(&self) -> ComplianceResult<Actor> {
        if self.actor.actor_id.is_empty() || self.actor.tenant_id.is_empty() {
            return Err(ComplianceError::invalid_input("identity is missing actor or tenant"));
        }
        Ok(self.actor.clone())
    }
}
