//! Server setup and lifecycle management

use crate::api::{create_router, AppState};
use crate::config::{CollaboratorsConfig, DaemonConfig};
use crate::error::{DaemonError, DaemonResult};
use axum::Router;
use modman_clients::{
    ClientError, ContainerEngine, HostResources, HttpContainerEngine, HttpHostResources,
    HttpSecretStore, InMemoryContainerEngine, InMemoryHostResources, InMemorySecretStore,
    ModuleRegistry, SecretStore,
};
use modman_deployment::{Collaborators, HandlerConfig, LifecycleHandler, Manager};
use modman_jobs::{JobEngine, JobEngineConfig, OrchestrationLease};
use modman_store::InMemoryStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

type Remote = (
    Arc<dyn ContainerEngine>,
    Arc<dyn SecretStore>,
    Arc<dyn HostResources>,
);

/// Modman daemon server
pub struct Server {
    config: DaemonConfig,
    manager: Arc<Manager>,
    jobs: Arc<JobEngine>,
}

impl Server {
    /// Create a new server with the given configuration
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let storage = Arc::new(InMemoryStorage::new());

        let registry = Arc::new(ModuleRegistry::new(config.modules.include_root.clone()));
        if let Some(dir) = &config.modules.dir {
            let loaded = registry.load_dir(dir).await.map_err(|e| {
                DaemonError::Config(format!("failed to load modules from {}: {}", dir.display(), e))
            })?;
            tracing::info!(modules = loaded, dir = %dir.display(), "Loaded module descriptors");
        }

        let (engine, secrets, host) = remote_services(&config)?;
        let handler = Arc::new(LifecycleHandler::new(
            Collaborators {
                storage: storage.clone(),
                modules: registry.clone(),
                engine,
                secrets,
                host,
            },
            HandlerConfig {
                timeouts: config.timeouts.timeouts(),
                volume_schemes: config.volumes.schemes.clone(),
            },
        ));

        let jobs = Arc::new(JobEngine::new(JobEngineConfig {
            workers: config.jobs.workers,
        }));
        let manager = Arc::new(Manager::new(
            handler,
            storage,
            registry,
            jobs.clone(),
            OrchestrationLease::new(),
        ));

        Ok(Self {
            config,
            manager,
            jobs,
        })
    }

    pub fn router(&self) -> Router {
        create_router(
            AppState::new(self.manager.clone()),
            self.config.server.enable_cors,
        )
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("modman daemon listening on {}", addr);

        let purge = self.jobs.clone().spawn_purge_loop(
            Duration::from_secs(self.config.jobs.purge_interval_secs),
            Duration::from_secs(self.config.jobs.max_age_secs),
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("modman daemon shutting down");
        self.jobs.shutdown();
        purge.abort();

        Ok(())
    }
}

fn remote_services(config: &DaemonConfig) -> DaemonResult<Remote> {
    match &config.collaborators {
        CollaboratorsConfig::Memory => {
            tracing::warn!("Using in-memory collaborators, no containers will be run");
            let engine: Arc<dyn ContainerEngine> = Arc::new(InMemoryContainerEngine::new());
            let secrets: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new());
            let host: Arc<dyn HostResources> = Arc::new(InMemoryHostResources::new());
            Ok((engine, secrets, host))
        }
        CollaboratorsConfig::Http {
            engine_url,
            secrets_url,
            host_resources_url,
            poll_interval_ms,
        } => {
            let timeout = Duration::from_secs(config.timeouts.http_secs);
            let client_err =
                |e: ClientError| DaemonError::Config(format!("invalid collaborator: {}", e));
            let engine: Arc<dyn ContainerEngine> = Arc::new(
                HttpContainerEngine::new(
                    engine_url,
                    timeout,
                    Duration::from_millis(*poll_interval_ms),
                )
                .map_err(client_err)?,
            );
            let secrets: Arc<dyn SecretStore> =
                Arc::new(HttpSecretStore::new(secrets_url, timeout).map_err(client_err)?);
            let host: Arc<dyn HostResources> = Arc::new(
                HttpHostResources::new(host_resources_url, timeout).map_err(client_err)?,
            );
            Ok((engine, secrets, host))
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
