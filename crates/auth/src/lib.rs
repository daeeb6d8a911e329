//! `genledger-auth` — acting-identity resolution and permission checks.
//!
//! Decoupled from transport and storage: principals come from a
//! [`PrincipalDirectory`] supplied by the caller.

pub mod authorize;
pub mod permissions;
pub mod principal;

pub use authorize::{AuthzError, authorize, authorize_owner};
pub use permissions::Permission;
pub use principal::{InMemoryPrincipalDirectory, Principal, PrincipalDirectory, PrincipalError, resolve_principal};
