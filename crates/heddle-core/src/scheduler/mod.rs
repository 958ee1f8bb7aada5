//! Scheduler - 依存グラフとタスクキュー
//!
//! - **DependencyGraph**: プロジェクト単位の依存関係と ready 集合
//! - **TaskQueue**: 登録・払い出し・完了/失敗/キャンセル/リトライ
//! - **RetryPolicy**: 呼び出し側が渡すリトライ上限

pub mod dependency;
pub mod retry;
pub mod task_queue;

pub use dependency::{DependencyGraph, GraphStats, NewNode, NodeState};
pub use retry::RetryPolicy;
pub use task_queue::{Completion, DEFAULT_PRIORITY, TaskQueue};
