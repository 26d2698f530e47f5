use anyhow::{Context, Result};
use dagrun_core::config::{StoreBackend, TimeConfig};
use dagrun_core::{
    InstanceStore, LocalDispatcher, MemoryStateStore, OrchestratorConfig, RedbStateStore,
    RunnerId, StateStore, StoreSignalChannel, SystemClock, WorkflowRunner,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "dagrun=info,dagrun_core=info,tower_http=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;
        config
            .orchestrator
            .validate()
            .context("Invalid configuration")?;

        Ok(config)
    }

    /// Path of the embedded state database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.orchestrator.store.database)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: WorkflowRunner,
    pub time: TimeConfig,
}

impl AppState {
    pub fn new(config: &ServerConfig, runner_id: RunnerId) -> Result<Self> {
        let orchestrator = &config.orchestrator;

        let store: Arc<dyn StateStore> = match orchestrator.store.backend {
            StoreBackend::Redb => Arc::new(
                RedbStateStore::new(config.database_path())
                    .context("Failed to open state store")?,
            ),
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory state store, nothing survives a restart");
                Arc::new(MemoryStateStore::new())
            }
        };
        let records = InstanceStore::new(store, orchestrator.retry.clone());

        let signals = Arc::new(StoreSignalChannel::new(records.clone()));
        let dispatcher = Arc::new(
            LocalDispatcher::from_config(&orchestrator.broker)
                .context("Failed to create task dispatcher")?,
        );

        let runner = WorkflowRunner::new(
            runner_id,
            orchestrator,
            records,
            signals,
            dispatcher,
            Arc::new(SystemClock),
        );

        Ok(Self {
            runner,
            time: orchestrator.time.clone(),
        })
    }
}
