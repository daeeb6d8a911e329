//! Acting-identity resolution.
//!
//! Audit-sensitive operations never trust a caller-supplied owner id; they
//! resolve the actor from an identifier string through a directory.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use genledger_core::{ErrorKind, OwnerId};

use crate::Permission;

/// A resolved principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: OwnerId,
    pub handle: String,
    pub email: Option<String>,
    pub permissions: Vec<Permission>,
}

impl Principal {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            id: OwnerId::new(),
            handle: handle.into(),
            email: None,
            permissions: Vec::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrincipalError {
    #[error("principal not found: {0}")]
    NotFound(String),

    #[error("principal directory unavailable: {0}")]
    Unavailable(String),
}

impl PrincipalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrincipalError::NotFound(_) => ErrorKind::NotFound,
            PrincipalError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

/// Lookup source for principals.
pub trait PrincipalDirectory: Send + Sync {
    fn find_by_handle(&self, handle: &str) -> Result<Option<Principal>, PrincipalError>;

    fn find_by_email(&self, email: &str) -> Result<Option<Principal>, PrincipalError>;
}

impl<D> PrincipalDirectory for Arc<D>
where
    D: PrincipalDirectory + ?Sized,
{
    fn find_by_handle(&self, handle: &str) -> Result<Option<Principal>, PrincipalError> {
        (**self).find_by_handle(handle)
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Principal>, PrincipalError> {
        (**self).find_by_email(email)
    }
}

/// Resolve `identifier` by exact handle first, then by email.
pub fn resolve_principal<D>(directory: &D, identifier: &str) -> Result<Principal, PrincipalError>
where
    D: PrincipalDirectory + ?Sized,
{
    if let Some(principal) = directory.find_by_handle(identifier)? {
        return Ok(principal);
    }
    if let Some(principal) = directory.find_by_email(identifier)? {
        tracing::debug!(principal_id = %principal.id, "principal resolved by email");
        return Ok(principal);
    }
    Err(PrincipalError::NotFound(identifier.to_string()))
}

/// In-memory directory for tests and the simulator.
#[derive(Debug, Default)]
pub struct InMemoryPrincipalDirectory {
    principals: RwLock<HashMap<OwnerId, Principal>>,
}

impl InMemoryPrincipalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a principal.
    pub fn register(&self, principal: Principal) -> Result<(), PrincipalError> {
        let mut map = self
            .principals
            .write()
            .map_err(|_| PrincipalError::Unavailable("directory lock poisoned".into()))?;
        map.insert(principal.id, principal);
        Ok(())
    }

    fn find<F>(&self, pred: F) -> Result<Option<Principal>, PrincipalError>
    where
        F: Fn(&Principal) -> bool,
    {
        let map = self
            .principals
            .read()
            .map_err(|_| PrincipalError::Unavailable("directory lock poisoned".into()))?;
        Ok(map.values().find(|p| pred(p)).cloned())
    }
}

impl PrincipalDirectory for InMemoryPrincipalDirectory {
    fn find_by_handle(&self, handle: &str) -> Result<Option<Principal>, PrincipalError> {
        self.find(|p| p.handle == handle)
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Principal>, PrincipalError> {
        self.find(|p| p.email.as_deref() == Some(email))
    }
}
