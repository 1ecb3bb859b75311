use crate::agent::{build_agents, Kernel};
use crate::app_context::AppContext;
use crate::config::{AgentsConfig, EngineConfig};
use crate::error::{Context, Result};
use crate::pipeline::registry::ComponentRegistry;
use crate::pmode::{PModeStore, PModeWatcher};
use crate::security::{KeyringSecurityProvider, SecurityProvider};
use crate::store::{InMemoryRepository, MessageRepository};
use crate::telemetry::runtime_counters;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct EngineApp {
    config: EngineConfig,
    app: Arc<AppContext>,
    kernel: Kernel,
    watcher: PModeWatcher,
}

impl EngineApp {
    pub async fn initialise(config: EngineConfig) -> Result<Self> {
        let registry = ComponentRegistry::builtin();

        let pmodes = Arc::new(PModeStore::default());
        let mut watcher = PModeWatcher::new(
            config.pmode_directory.clone(),
            Arc::clone(&pmodes),
            config.pmode_watch.poll_interval,
        );
        if !watcher.reload() {
            tracing::warn!(
                directory = %config.pmode_directory.display(),
                "starting without pmodes"
            );
        }

        let security: Arc<dyn SecurityProvider> = match config.keyring_path.as_deref() {
            Some(path) => Arc::new(
                KeyringSecurityProvider::from_file(path)
                    .with_context(|| format!("failed to load keyring from {}", path.display()))?,
            ),
            None => {
                tracing::info!("no keyring configured; signing and encryption are unavailable");
                Arc::new(KeyringSecurityProvider::new())
            }
        };

        let repository = connect_repository(&config).await?;

        let app = AppContext::builder()
            .repository(repository)
            .pmodes(pmodes)
            .security(security)
            .build();

        let agents = match config.agents_path.as_deref() {
            Some(path) => AgentsConfig::from_path(path, &registry)
                .with_context(|| format!("failed to load agent settings from {}", path.display()))?,
            None => {
                tracing::info!("no agent settings given; running the datastore-driven agents");
                AgentsConfig::datastore_defaults()
            }
        };
        let agents =
            build_agents(&agents, &registry, &app).context("failed to construct agents")?;

        Ok(Self {
            config,
            app,
            kernel: Kernel::new(agents),
            watcher,
        })
    }

    pub fn app_context(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            app: _app,
            kernel,
            watcher,
        } = self;

        let shutdown = CancellationToken::new();
        let watcher_task = config.pmode_watch.enabled.then(|| {
            let token = shutdown.clone();
            tokio::spawn(watcher.run(token))
        });

        if kernel.is_empty() {
            tracing::warn!("no agents configured");
        }
        let mut handle = kernel.start(shutdown.clone());
        tracing::info!(
            agents = kernel.agents().len(),
            "as4 engine ready; press Ctrl+C to stop"
        );

        let mut failure = None;
        tokio::select! {
            exit = handle.next_exit(), if handle.running() > 0 => {
                match exit {
                    Some(Ok(agent)) => {
                        tracing::warn!(agent = %agent, "agent stopped unexpectedly");
                    }
                    Some(Err(err)) => failure = Some(err),
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }

        shutdown.cancel();
        let drained = handle.join(config.drain_timeout).await;
        kernel.stop();
        tracing::info!(counters = %runtime_counters().snapshot(), "as4 engine stopped");
        if let Some(task) = watcher_task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "pmode watcher task cancelled");
            }
        }

        if let Some(err) = failure {
            return Err(err.into());
        }
        drained.map_err(Into::into)
    }
}

#[cfg(feature = "db-postgres")]
async fn connect_repository(config: &EngineConfig) -> Result<Arc<dyn MessageRepository>> {
    use crate::store::PostgresRepository;

    let Some(database) = config.database.as_ref() else {
        return Ok(Arc::new(InMemoryRepository::new()));
    };
    let repository = PostgresRepository::connect(database)
        .await
        .context("failed to connect to postgres")?;
    repository
        .migrate()
        .await
        .context("failed to prepare postgres schema")?;
    Ok(Arc::new(repository))
}

#[cfg(not(feature = "db-postgres"))]
async fn connect_repository(config: &EngineConfig) -> Result<Arc<dyn MessageRepository>> {
    if config.database.is_some() {
        tracing::warn!(
            "database configured but the `db-postgres` feature is disabled; using the in-memory repository"
        );
    }
    Ok(Arc::new(InMemoryRepository::new()))
}
