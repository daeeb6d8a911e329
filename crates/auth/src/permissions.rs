use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier (e.g. "generation.start").
///
/// The wildcard `"*"` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));
    pub const GENERATION_START: Permission = Permission(Cow::Borrowed("generation.start"));
    pub const GENERATION_CANCEL: Permission = Permission(Cow::Borrowed("generation.cancel"));
    /// Operator-only: re-drive a stuck settlement.
    pub const BILLING_SETTLE: Permission = Permission(Cow::Borrowed("billing.settle"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }

    /// True if holding `self` satisfies a requirement for `required`.
    pub fn grants(&self, required: &Permission) -> bool {
        self.is_wildcard() || self == required
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
