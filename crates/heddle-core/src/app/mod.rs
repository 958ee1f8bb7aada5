//! App - アプリケーション層
//!
//! ports と各コンポーネントを組み合わせて、外に見せる操作を実装します。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: 構築とワイヤリング（起動時検証）
//! - **Orchestrator**: RBAC とプロジェクト状態を確認してから委譲する窓口
//! - **ServiceRegistry**: task_type → ServiceAdapter（タイムアウト付き）
//! - **WorkerGroup**: ready タスクをサービスに流すループ
//! - **PublisherLoop**: outbox イベントの配送

pub mod builder;
pub mod context;
pub mod orchestrator;
pub mod publisher_loop;
pub mod services;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::context::Context;
pub use self::orchestrator::{Dispatched, Orchestrator, Recovery};
pub use self::publisher_loop::PublisherLoop;
pub use self::services::{RegistryError, ServiceRegistry};
pub use self::worker_loop::WorkerGroup;
