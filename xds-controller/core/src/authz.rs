use crate::ConfigSnapshot;
use std::{fmt, sync::Arc};

/// Resolves a stream credential to an authorizer.
pub trait ResolveAuthorizer {
    fn resolve_authorizer(&self, credential: Option<&str>)
        -> Result<Arc<dyn Authorizer>, AuthzError>;
}

pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Indicates whether the holder may register (and therefore configure) a
    /// proxy for `service`.
    fn service_write(&self, service: &str) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("ACL not found")]
    NotFound,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// Grants every permission. Used when no token table is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn service_write(&self, _: &str) -> bool {
        true
    }
}

// === impl ConfigSnapshot ===

impl ConfigSnapshot {
    /// Checks that `authz` may act on behalf of the service this snapshot
    /// configures.
    pub fn authorize(&self, authz: &dyn Authorizer) -> Result<(), AuthzError> {
        if authz.service_write(&self.service) {
            return Ok(());
        }
        Err(AuthzError::PermissionDenied(format!(
            "token lacks service:write on {:?} required by {} {}",
            self.service, self.kind, self.proxy_id,
        )))
    }
}
