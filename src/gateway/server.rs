//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::auth::AuthContext;
use crate::config::{Config, IdentitySource, StoreBackend};
use crate::lifecycle::LifecycleManager;
use crate::lifecycle::provisioner::LoggingProvisioner;
use crate::lifecycle::store::{CoreStore, MemoryCoreStore, SqliteCoreStore};
use crate::{Error, Result};

/// Core API gateway server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Build every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the RBAC files or the core store cannot be opened.
    pub async fn new(config: Config) -> Result<Self> {
        let auth = Arc::new(AuthContext::from_config(&config).await?);

        let store: Arc<dyn CoreStore> = match config.store.backend {
            StoreBackend::Memory => {
                warn!("Using in-memory core store; records are lost on restart");
                Arc::new(MemoryCoreStore::new())
            }
            StoreBackend::Sqlite => Arc::new(SqliteCoreStore::open(&config.store.path).await?),
        };
        let cores = Arc::new(LifecycleManager::new(store, Arc::new(LoggingProvisioner)));

        Ok(Self {
            state: Arc::new(AppState::new(auth, cores)),
            config,
        })
    }

    /// Serve until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        // Warm the key set in the background and keep it fresh.
        let refresher = if self.config.auth.identity_source == IdentitySource::Jwt {
            Some(self.state.auth.keys.spawn_refresher(shutdown_tx.subscribe()))
        } else {
            None
        };

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %addr,
            base_path = %self.state.auth.base_path(),
            identity_source = ?self.config.auth.identity_source,
            store = self.state.cores.backend(),
            rbac_rules = self.state.auth.enforcer.rule_count(),
            "Core API gateway listening"
        );

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx));
        server
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(handle) = refresher {
            if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
                warn!("JWKS refresher did not stop in time");
            }
        }
        Ok(())
    }
}

/// Resolve on Ctrl+C or SIGTERM and tell background tasks to stop.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
    let _ = shutdown_tx.send(());
}
