//! heddle-core
//!
//! Dependency-aware task orchestration core.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, lock, tenancy, events）
//! - **ports**: 抽象化レイヤー（StateStore, EventSink, ServiceAdapter, Clock, IdGenerator）
//! - **impls**: 実装（InMemory / SQLite ストア、sink、アダプタ）
//! - **state**: StateManager（トランザクション単位の書き込み）
//! - **scheduler**: DependencyGraph, TaskQueue, RetryPolicy
//! - **locks**: LockManager（TTL 付きリース）
//! - **tenancy**: RBAC, WorkspaceManager, ProjectManager
//! - **events**: EventPublisher（outbox → sink）
//! - **app**: Orchestrator と構築、バックグラウンドループ
//! - **config**: HeddleConfig（TOML）

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod impls;
pub mod locks;
pub mod observability;
pub mod ports;
pub mod scheduler;
pub mod state;
pub mod tenancy;

#[cfg(test)]
mod fixtures;

pub use app::{Context, Orchestrator, OrchestratorBuilder};
pub use config::HeddleConfig;
pub use error::{HeddleError, Result};
