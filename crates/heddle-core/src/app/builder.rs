//! OrchestratorBuilder - 構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_services()` で必要なサービス名を宣言する
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返す
//!
//! ストアは明示的に渡されたもの、なければ設定の `[storage] path`
//! (SQLite)、それもなければ in-memory を使う。

use std::sync::Arc;

use tracing::info;

use crate::app::orchestrator::Orchestrator;
use crate::app::services::{RegistryError, ServiceRegistry};
use crate::config::HeddleConfig;
use crate::error::HeddleError;
use crate::events::EventPublisher;
use crate::impls::{InMemoryStateStore, SqliteStateStore};
use crate::locks::LockManager;
use crate::ports::{
    Clock, EventSink, IdGenerator, ServiceAdapter, StateStore, StoreError, SystemClock,
    UlidGenerator,
};
use crate::scheduler::TaskQueue;
use crate::state::StateManager;
use crate::tenancy::{ProjectManager, WorkspaceManager};

/// # 使用例
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new(config)
///     .service("llm", Arc::new(LlmAdapter::new()))?
///     .sink(Arc::new(TracingSink))
///     .expect_services(&["llm"])
///     .build()
///     .await?;
/// ```
pub struct OrchestratorBuilder {
    config: HeddleConfig,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    sinks: Vec<Arc<dyn EventSink>>,
    services: ServiceRegistry,
    expected_services: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing services: {0:?}. These services were expected but not registered.")]
    MissingServices(Vec<String>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to open state store: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] HeddleError),
}

impl OrchestratorBuilder {
    pub fn new(config: HeddleConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            ids: None,
            sinks: Vec::new(),
            services: ServiceRegistry::new(),
            expected_services: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Registers `adapter` under `name` with the configured timeout.
    pub fn service(
        mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ServiceAdapter>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let timeout = self.config.service_timeout(&name);
        self.services.register(name, adapter, Some(timeout))?;
        Ok(self)
    }

    pub fn expect_services(mut self, names: &[&str]) -> Self {
        self.expected_services = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub async fn build(self) -> Result<Orchestrator, BuildError> {
        if let Some(expected) = &self.expected_services {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.services.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingServices(missing));
            }
        }

        let store: Arc<dyn StateStore> = match (self.store, self.config.storage_path()) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                info!(path = %path.display(), "opening sqlite state store");
                Arc::new(SqliteStateStore::open(&path)?)
            }
            (None, None) => Arc::new(InMemoryStateStore::new()),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let state = Arc::new(StateManager::new(store, clock, ids));

        let publisher = Arc::new(
            EventPublisher::new(state.clone(), self.sinks, self.config.publisher.batch_size).await?,
        );
        let queue = TaskQueue::new(state.clone(), publisher.clone())
            .with_default_priority(self.config.scheduler.default_priority)
            .with_forward_declarations(self.config.scheduler.allow_forward_declarations);
        let locks = LockManager::new(state.clone())
            .with_ttls(self.config.locks.default_ttl(), self.config.locks.max_ttl());

        info!(services = ?self.services.names(), sinks = ?publisher.sink_names(), "orchestrator built");
        Ok(Orchestrator {
            workspaces: WorkspaceManager::new(state.clone()),
            projects: ProjectManager::new(state.clone()),
            state,
            queue,
            locks,
            publisher,
            services: self.services,
            retry_policy: self.config.scheduler.retry_policy(),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new(HeddleConfig::default())
    }
}
