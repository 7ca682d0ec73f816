//! HTTP router: route table, dispatch and the middleware stack
//!
//! Request pipeline, outermost first:
//!
//! ```text
//! trace -> compression -> cors -> fault boundary -> admission gate -> routes
//! ```
//!
//! The channel upgrade route is merged in after the stack is applied, so it
//! is outside both the fault boundary and the admission gate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::{
    Router,
    handler::Handler,
    http::{Method, Uri},
    middleware,
    routing::{MethodFilter, MethodRouter, get, on},
};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::debug;

use super::auth::{AdmissionGate, ProtectedScope, admission_gate};
use super::channel::{ChannelManager, channel_upgrade};
use super::cors::OriginPolicy;
use super::fault::{self, ErrorResponse};
use super::handlers;
use crate::config::Config;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Admission gate for the protected scope
    pub gate: Arc<AdmissionGate>,
    /// Realtime connections
    pub channels: Arc<ChannelManager>,
    /// Cross-origin policy for HTTP routes
    pub http_origins: OriginPolicy,
    /// Cross-origin policy for channel upgrades
    pub channel_origins: OriginPolicy,
    /// Upgrade path (`None` when the channel is disabled)
    pub channel_path: Option<String>,
}

impl AppState {
    /// Build state from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid credential header or CORS entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            gate: Arc::new(AdmissionGate::from_config(&config.auth)?),
            channels: Arc::new(ChannelManager::from_config(&config.channel)),
            http_origins: OriginPolicy::from_config(&config.server.cors)?,
            channel_origins: OriginPolicy::from_config(&config.channel.cors)?,
            channel_path: config.channel.enabled.then(|| config.channel.upgrade_path()),
        })
    }
}

/// Which group a route was registered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    /// Reachable without a credential
    Public,
    /// Behind the admission gate (under the protected prefix)
    Protected,
}

impl RouteScope {
    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
        }
    }
}

/// A registered route
pub struct RouteDescriptor<S> {
    /// HTTP method
    pub method: Method,
    /// Full request path
    pub path: String,
    /// Group the route belongs to
    pub scope: RouteScope,
    handler: MethodRouter<S>,
}

impl<S> fmt::Debug for RouteDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`RouteTable::dispatch`]
#[derive(Debug)]
pub enum Dispatch<'a, S> {
    /// Exact method + path match
    Route(&'a RouteDescriptor<S>),
    /// Nothing registered for this method + path
    NotFound,
}

/// Routes partitioned into a public group and a protected group.
///
/// Protected routes are registered relative to the protected prefix, and
/// protection follows the prefix rather than a per-route flag.
pub struct RouteTable<S> {
    scope: ProtectedScope,
    routes: Vec<RouteDescriptor<S>>,
    reserved: Vec<String>,
}

impl<S> RouteTable<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Empty table protecting `scope`
    pub fn new(scope: ProtectedScope) -> Self {
        Self {
            scope,
            routes: Vec::new(),
            reserved: Vec::new(),
        }
    }

    /// Claim `path` for a route served outside the table (the channel
    /// upgrade). Fails if a registered route already uses the path; later
    /// registrations on it fail too.
    pub fn reserve(&mut self, path: &str) -> Result<&mut Self> {
        if let Some(route) = self.routes.iter().find(|route| route.path == path) {
            return Err(Error::Config(format!(
                "Path {path} is already routed ({} {})",
                route.method, route.path
            )));
        }
        self.reserved.push(path.to_string());
        Ok(self)
    }

    /// Register a public route at `path`
    pub fn public<H, T>(&mut self, method: Method, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, S>,
        T: 'static,
    {
        if self.scope.covers(path) {
            return Err(Error::Config(format!(
                "Public route {path} lies under the protected prefix {}",
                self.scope.prefix()
            )));
        }
        self.register(RouteScope::Public, method, path.to_string(), handler)
    }

    /// Register a protected route at `<prefix><path>`
    pub fn protected<H, T>(&mut self, method: Method, path: &str, handler: H) -> Result<&mut Self>
    where
        H: Handler<T, S>,
        T: 'static,
    {
        validate_path(path)?;
        let full = self.scope.join(path);
        self.register(RouteScope::Protected, method, full, handler)
    }

    fn register<H, T>(
        &mut self,
        scope: RouteScope,
        method: Method,
        path: String,
        handler: H,
    ) -> Result<&mut Self>
    where
        H: Handler<T, S>,
        T: 'static,
    {
        validate_path(&path)?;
        if self.reserved.contains(&path) {
            return Err(Error::Config(format!("Path {path} is reserved")));
        }
        if matches!(self.dispatch(&method, &path), Dispatch::Route(_)) {
            return Err(Error::Config(format!("Duplicate route: {method} {path}")));
        }

        let filter = MethodFilter::try_from(method.clone())
            .map_err(|e| Error::Config(format!("Unroutable method {method}: {e}")))?;

        self.routes.push(RouteDescriptor {
            method,
            path,
            scope,
            handler: on(filter, handler),
        });
        Ok(self)
    }

    /// Look up the route for an exact method + path
    pub fn dispatch(&self, method: &Method, path: &str) -> Dispatch<'_, S> {
        self.routes
            .iter()
            .find(|route| route.method == *method && route.path == path)
            .map_or(Dispatch::NotFound, Dispatch::Route)
    }

    /// Registered routes in registration order
    pub fn routes(&self) -> &[RouteDescriptor<S>] {
        &self.routes
    }

    /// Protected scope of this table
    pub fn scope(&self) -> &ProtectedScope {
        &self.scope
    }

    /// Build the axum router. Unknown paths and unknown methods on known
    /// paths both answer 404.
    pub fn router(&self) -> Router<S> {
        let mut by_path: BTreeMap<&str, MethodRouter<S>> = BTreeMap::new();
        for route in &self.routes {
            let merged = match by_path.remove(route.path.as_str()) {
                Some(existing) => existing.merge(route.handler.clone()),
                None => route.handler.clone(),
            };
            by_path.insert(&route.path, merged);
        }

        by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(path, method_router.fallback(not_found))
            })
            .fallback(not_found)
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::Config(format!("Route path must start with '/': {path}")));
    }
    if path.contains(['{', '}', '*']) {
        return Err(Error::Config(format!("Route path must be literal: {path}")));
    }
    Ok(())
}

/// The gateway's routes: `GET /health` (public), `GET <prefix>/user-info`
/// (protected)
pub fn standard_routes<S>(scope: &ProtectedScope) -> Result<RouteTable<S>>
where
    S: Clone + Send + Sync + 'static,
{
    let mut routes = RouteTable::new(scope.clone());
    routes.public(Method::GET, "/health", handlers::health)?;
    routes.protected(Method::GET, "/user-info", handlers::user_info)?;
    Ok(routes)
}

async fn not_found(method: Method, uri: Uri) -> ErrorResponse {
    debug!(method = %method, path = %uri.path(), "No route matched");
    ErrorResponse::not_found()
}

/// Assemble the full HTTP + channel router
pub fn create_router(state: Arc<AppState>, routes: &RouteTable<Arc<AppState>>) -> Router {
    let http = routes
        .router()
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.gate),
            admission_gate,
        ))
        .layer(CatchPanicLayer::custom(fault::panic_response))
        .layer(state.http_origins.layer())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    let app = match &state.channel_path {
        Some(path) => http.merge(
            Router::new()
                .route(path, get(channel_upgrade))
                .layer(state.channel_origins.layer())
                .layer(TraceLayer::new_for_http()),
        ),
        None => http,
    };

    app.with_state(state)
}
