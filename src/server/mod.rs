//! Certificate issuing server
//!
//! # Routes
//!
//! | Route | Auth | Purpose |
//! |-------|------|---------|
//! | `GET /api/v1/roles` | Basic | roles the user may request |
//! | `POST /api/v1/signcsr` | Basic | sign a PEM certificate request |
//! | `POST /api/v1/signcsr/stepup` | Basic | same, after step-up approval |
//! | `GET /healthcheck` | none | liveness |
//! | `GET /version` | none | server version |

pub mod audit;
pub mod auth;
pub mod handler;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::info;

use crate::config::Config;
use crate::directory::{Directory, LdapConnector};
use crate::environment::Environments;
use crate::protocol::{ROLES_PATH, SIGN_CSR_PATH, STEP_UP_PATH};
use crate::step_up::{DuoAuthenticator, StepUpAuthenticator};
use crate::{Error, Result};

/// Shared, read-only server state
pub struct AppState {
    /// Role lookup and validation
    pub directory: Directory,
    /// Step-up authenticator; `None` disables step-up
    pub step_up: Option<Arc<dyn StepUpAuthenticator>>,
    /// Configured environments
    pub environments: Environments,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut protected = Router::new()
        .route(ROLES_PATH, get(handler::roles))
        .route(SIGN_CSR_PATH, post(handler::sign_csr));

    if state.step_up.is_some() {
        protected = protected.route(
            STEP_UP_PATH,
            post(handler::sign_csr_after_step_up).route_layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                handler::step_up_middleware,
            )),
        );
    }

    let protected = protected
        .route_layer(middleware::from_fn(auth::basic_auth_middleware))
        .layer(DefaultBodyLimit::max(handler::MAX_CSR_BYTES));

    Router::new()
        .route("/healthcheck", get(handler::health))
        .route("/version", get(handler::version))
        .merge(protected)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Issuing server
pub struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl Server {
    /// Build the server from configuration
    ///
    /// Loads every signing context; any unreadable CA material aborts here.
    pub fn new(config: &Config) -> Result<Self> {
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let environments = Environments::load(&config.environments)?;
        if environments.is_empty() {
            tracing::warn!("No environments configured; every signing request will fail");
        }

        let connector = LdapConnector::from_config(&config.directory);
        info!(url = %connector.url(), "Directory configured");
        let directory = Directory::new(config.directory.clone(), Arc::new(connector));

        let step_up: Option<Arc<dyn StepUpAuthenticator>> = if config.step_up.enabled {
            info!(api_url = %config.step_up.api_url, "Step-up authentication enabled");
            Some(Arc::new(DuoAuthenticator::from_config(&config.step_up)?))
        } else {
            None
        };

        Ok(Self {
            addr,
            state: Arc::new(AppState {
                directory,
                step_up,
                environments,
            }),
        })
    }

    /// Serve until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "Listening");

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
