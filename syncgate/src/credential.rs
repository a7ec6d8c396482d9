//! Shared-secret credential check.

use std::fmt;
use std::sync::Arc;

/// The process-wide credential, fixed at startup.
///
/// Cheap to clone; every clone compares against the same secret.
#[derive(Clone)]
pub struct Credential {
    secret: Arc<str>,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::from(secret.into()),
        }
    }

    /// True iff a credential was presented and it equals the secret exactly.
    pub fn validate(&self, presented: Option<&str>) -> bool {
        presented.is_some_and(|p| p == &*self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}
