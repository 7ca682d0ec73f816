//! Cross-origin policies for the HTTP and channel surfaces

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowMethods, AllowOrigin, Any, CorsLayer};

use crate::config::CorsConfig;
use crate::{Error, Result};

const WILDCARD: &str = "*";

/// Resolved origin/method allow-lists
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    /// `None` allows any origin
    origins: Option<Vec<HeaderValue>>,
    /// `None` allows any method
    methods: Option<Vec<Method>>,
}

impl OriginPolicy {
    /// Build a policy from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for origins that are not valid header values
    /// or methods that are not valid HTTP methods.
    pub fn from_config(config: &CorsConfig) -> Result<Self> {
        let origins = if config.allowed_origins.iter().any(|o| o == WILDCARD) {
            None
        } else {
            Some(
                config
                    .allowed_origins
                    .iter()
                    .map(|origin| {
                        HeaderValue::from_str(origin.trim_end_matches('/'))
                            .map_err(|e| Error::Config(format!("Invalid origin '{origin}': {e}")))
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
        };

        let methods = if config.allowed_methods.iter().any(|m| m == WILDCARD) {
            None
        } else {
            Some(
                config
                    .allowed_methods
                    .iter()
                    .map(|method| {
                        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                            .map_err(|e| Error::Config(format!("Invalid method '{method}': {e}")))
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
        };

        Ok(Self { origins, methods })
    }

    /// Whether any origin is accepted
    #[must_use]
    pub fn allows_any_origin(&self) -> bool {
        self.origins.is_none()
    }

    /// Check an `Origin` header value against the allow-list
    #[must_use]
    pub fn allows_origin(&self, origin: &HeaderValue) -> bool {
        match &self.origins {
            None => true,
            Some(origins) => origins.iter().any(|allowed| allowed == origin),
        }
    }

    /// Build the `tower-http` CORS layer for this policy
    #[must_use]
    pub fn layer(&self) -> CorsLayer {
        let origin = match &self.origins {
            None => AllowOrigin::any(),
            Some(origins) => AllowOrigin::list(origins.clone()),
        };
        let methods = match &self.methods {
            None => AllowMethods::any(),
            Some(methods) => AllowMethods::list(methods.clone()),
        };

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(Any)
    }
}
