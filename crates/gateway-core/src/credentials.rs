//! Shared-secret credential set

use std::fmt;

use subtle::{Choice, ConstantTimeEq};

/// Immutable set of valid API keys.
///
/// Populated once at startup and only ever read afterwards, so it can be
/// shared across request tasks without locking.
#[derive(Clone, Default)]
pub struct CredentialStore {
    credentials: Vec<String>,
}

impl CredentialStore {
    /// Build a store from configured credential values.
    ///
    /// Empty values are discarded and duplicates collapse to one entry.
    pub fn new<I, S>(credentials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<String> = Vec::new();
        for credential in credentials {
            let credential = credential.into();
            if !credential.is_empty() && !set.contains(&credential) {
                set.push(credential);
            }
        }
        Self { credentials: set }
    }

    /// Check whether `candidate` is one of the configured credentials.
    ///
    /// Matching is exact and case-sensitive. Every stored credential is
    /// compared in constant time so a near miss takes as long as a far one.
    #[must_use]
    pub fn is_valid(&self, candidate: &str) -> bool {
        if candidate.is_empty() {
            return false;
        }

        let candidate = candidate.as_bytes();
        self.credentials
            .iter()
            .fold(Choice::from(0), |found, credential| {
                found | credential.as_bytes().ct_eq(candidate)
            })
            .into()
    }

    /// Number of distinct credentials
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Whether no credential is configured (every check fails)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

// Values are secrets: only the count is ever printed.
impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("count", &self.credentials.len())
            .finish()
    }
}
