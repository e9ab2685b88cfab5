//! Application wiring
//!
//! Builds the branch store, the tool registry, the LLM clients and the
//! execution engine from the environment configuration. Namespace and task
//! inspection commands only need the store; `App::build_store_only` skips
//! the LLM setup so they work without any provider credentials.

use anyhow::Context;
use llm::build_client;
use planvm_engine::{builtin_registry, EngineConfig, ExecutionEngine, LlmJudge, LlmPlanner};
use planvm_store::{BranchStore, FsBranchStore, SqliteBranchStore};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct App {
    pub config: EngineConfig,
    pub store: Arc<dyn BranchStore>,
    pub engine: Option<Arc<ExecutionEngine>>,
}

impl App {
    /// Full wiring including the engine.
    pub async fn build(store_dir: &Path) -> anyhow::Result<Self> {
        let config = EngineConfig::from_env()?;
        let store = build_store(store_dir, &config).await?;

        let standard = build_client(&config.standard).context("standard LLM endpoint")?;
        let reasoning = build_client(&config.reasoning).context("reasoning LLM endpoint")?;
        let registry = Arc::new(builtin_registry(&config, standard)?);

        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            registry,
            Arc::new(LlmPlanner::new(reasoning.clone())),
            Arc::new(LlmJudge::new(reasoning)),
            config.clone(),
        ));

        Ok(Self { config, store, engine: Some(engine) })
    }

    /// Store-only wiring for commands that never call a model.
    pub async fn build_store_only(store_dir: &Path) -> anyhow::Result<Self> {
        let config = EngineConfig::from_env()?;
        let store = build_store(store_dir, &config).await?;
        Ok(Self { config, store, engine: None })
    }

    pub fn engine(&self) -> anyhow::Result<&Arc<ExecutionEngine>> {
        self.engine
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("engine not initialized"))
    }
}

async fn build_store(
    store_dir: &Path,
    config: &EngineConfig,
) -> anyhow::Result<Arc<dyn BranchStore>> {
    match &config.database_uri {
        Some(uri) => {
            info!(uri, "using sqlite branch store");
            Ok(Arc::new(SqliteBranchStore::connect(uri).await?))
        }
        None => {
            info!(dir = %store_dir.display(), "using filesystem branch store");
            Ok(Arc::new(FsBranchStore::new(store_dir)?))
        }
    }
}
