//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, ServiceExt, extract::Request};
use tokio::net::TcpListener;
use tokio::signal;
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tracing::{info, warn};

use super::channel::ChannelManager;
use super::router::{AppState, RouteTable, create_router, standard_routes};
use crate::config::Config;
use crate::{Error, Result};

/// Zenth gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared state (gate, channels, origin policies)
    state: Arc<AppState>,
    /// HTTP route table
    routes: RouteTable<Arc<AppState>>,
}

impl Gateway {
    /// Create a new gateway with the standard routes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the auth or CORS settings are invalid, or
    /// the channel path collides with a route.
    pub fn new(config: Config) -> Result<Self> {
        let state = Arc::new(AppState::from_config(&config)?);
        let mut routes = standard_routes(state.gate.scope())?;
        if let Some(path) = &state.channel_path {
            routes.reserve(path)?;
        }

        Ok(Self {
            config,
            state,
            routes,
        })
    }

    /// Shared state
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Realtime connection manager
    pub fn channels(&self) -> Arc<ChannelManager> {
        Arc::clone(&self.state.channels)
    }

    /// Route table
    pub fn routes(&self) -> &RouteTable<Arc<AppState>> {
        &self.routes
    }

    /// Route table, for registering additional routes before serving
    pub fn routes_mut(&mut self) -> &mut RouteTable<Arc<AppState>> {
        &mut self.routes
    }

    /// The complete service: router behind trailing-slash normalization
    pub fn app(&self) -> NormalizePath<Router> {
        NormalizePathLayer::trim_trailing_slash()
            .layer(create_router(Arc::clone(&self.state), &self.routes))
    }

    /// Bind the configured address and serve until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Live channel connections are asked to close once shutdown starts.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.app();
        self.log_banner(listener.local_addr()?);

        let channels = self.channels();
        axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!(connections = channels.connection_count(), "Closing realtime connections");
                channels.close_all();
            })
            .await?;

        info!("Gateway stopped");
        Ok(())
    }

    fn log_banner(&self, addr: SocketAddr) {
        let gate = &self.state.gate;

        info!("============================================================");
        info!("ZENTH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %addr, "Listening");

        info!("Routes:");
        for route in self.routes.routes() {
            info!("  {:<6} {} ({})", route.method, route.path, route.scope.as_str());
        }

        if gate.credential_count() == 0 {
            warn!(
                "No API keys configured - every request under {} will be rejected",
                gate.scope().prefix()
            );
        } else {
            info!(
                "API-KEY ADMISSION on {} (header={}, keys={})",
                gate.scope().prefix(),
                gate.header(),
                gate.credential_count()
            );
        }

        if let Some(path) = &self.state.channel_path {
            info!("REALTIME CHANNEL:");
            info!("  ws://{addr}{path}");
            if self.state.channel_origins.allows_any_origin() {
                warn!("Channel accepts upgrades from any origin - restrict channel.cors.allowed_origins in production");
            }
        } else {
            info!("Realtime channel disabled");
        }

        if self.state.http_origins.allows_any_origin() {
            warn!("HTTP CORS allows any origin - restrict server.cors.allowed_origins in production");
        }
        info!("============================================================");
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where available
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => "Ctrl+C",
            Err(e) => {
                warn!(error = %e, "Ctrl+C handler failed, shutting down");
                "Ctrl+C handler failure"
            }
        },
        () = terminate => "SIGTERM",
    };

    info!(signal = source, "Shutdown signal received");
}
