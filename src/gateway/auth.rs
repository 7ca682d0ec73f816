//! API-key admission gate
//!
//! Every request whose path falls under the protected prefix must carry a
//! configured API key in the credential header. Requests outside the prefix
//! pass straight through. Admitted requests are forwarded untouched.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use zenth_core::CredentialStore;

use super::fault::ErrorResponse;
use crate::config::AuthConfig;
use crate::{Error, Result};

/// Path prefix under which every route requires a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedScope {
    prefix: String,
}

impl ProtectedScope {
    /// Create a scope; trailing slashes are ignored (`/api/` == `/api`)
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        Self {
            prefix: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
        }
    }

    /// The normalized prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `path` lies under the prefix. Matching is per path segment:
    /// `/api` covers `/api` and `/api/x`, not `/apiary`.
    #[must_use]
    pub fn covers(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Join a route path onto the prefix (`/` maps to the prefix itself)
    #[must_use]
    pub fn join(&self, path: &str) -> String {
        if self.prefix == "/" {
            path.to_string()
        } else if path == "/" {
            self.prefix.clone()
        } else {
            format!("{}{path}", self.prefix)
        }
    }
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Credential header absent or not a visible-ASCII value
    Missing,
    /// Credential not in the store
    Invalid,
}

impl Rejection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
        }
    }
}

/// The admission gate: credential header, protected scope and key set
#[derive(Debug)]
pub struct AdmissionGate {
    header: HeaderName,
    scope: ProtectedScope,
    credentials: CredentialStore,
}

impl AdmissionGate {
    /// Create a gate
    pub fn new(header: HeaderName, scope: ProtectedScope, credentials: CredentialStore) -> Self {
        Self {
            header,
            scope,
            credentials,
        }
    }

    /// Create a gate from configuration (keys expanded)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the header name is not a valid HTTP header.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let header = HeaderName::from_bytes(config.header.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| Error::Config(format!("Invalid auth header '{}': {e}", config.header)))?;

        Ok(Self::new(
            header,
            ProtectedScope::new(&config.protected_prefix),
            CredentialStore::new(config.resolve_api_keys()),
        ))
    }

    /// Credential header name
    #[must_use]
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// Protected scope
    #[must_use]
    pub fn scope(&self) -> &ProtectedScope {
        &self.scope
    }

    /// Number of configured keys
    #[must_use]
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Decide whether a request carrying `headers` may proceed
    pub fn admit(&self, headers: &HeaderMap) -> std::result::Result<(), Rejection> {
        let Some(candidate) = headers.get(&self.header).and_then(|v| v.to_str().ok()) else {
            return Err(Rejection::Missing);
        };

        if self.credentials.is_valid(candidate) {
            Ok(())
        } else {
            Err(Rejection::Invalid)
        }
    }
}

/// Admission middleware.
///
/// Short-circuits protected requests without a valid key with the 401
/// error response; everything else continues to the next stage as-is.
pub async fn admission_gate(
    State(gate): State<Arc<AdmissionGate>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();

    if !gate.scope.covers(path) {
        return next.run(request).await;
    }

    match gate.admit(request.headers()) {
        Ok(()) => {
            debug!(path = %path, "Admitted request");
            next.run(request).await
        }
        Err(rejection) => {
            warn!(path = %path, reason = rejection.as_str(), "Rejected request");
            ErrorResponse::unauthorized().into_response()
        }
    }
}
