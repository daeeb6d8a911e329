use thiserror::Error;

use genledger_core::{ErrorKind, OwnerId};

use crate::{Permission, Principal};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("forbidden: principal {principal} does not own this resource")]
    NotOwner { principal: OwnerId },
}

impl AuthzError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Forbidden
    }
}

/// Check that `principal` holds `required`.
///
/// - No IO
/// - No panics
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.permissions.iter().any(|p| p.grants(required)) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Like [`authorize`], and additionally require that `principal` is `owner_id`.
/// A wildcard holder acts as an operator and passes the ownership check.
pub fn authorize_owner(
    principal: &Principal,
    required: &Permission,
    owner_id: OwnerId,
) -> Result<(), AuthzError> {
    authorize(principal, required)?;
    if principal.id == owner_id || principal.permissions.iter().any(Permission::is_wildcard) {
        Ok(())
    } else {
        Err(AuthzError::NotOwner {
            principal: principal.id,
        })
    }
}
