//! State - タスクの状態と遷移ルール

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// TaskStatus はタスクの状態を表現
///
/// # 状態遷移
/// - waiting: 依存待ち
/// - ready: 実行可能
/// - running: 実行中（get_next で払い出し済み）
/// - done: 成功
/// - failed: 失敗（retry で ready / waiting に戻れる）
/// - cancelled: キャンセル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Ready,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Waiting,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// `Failed -> Ready` and `Failed -> Waiting` are only taken through an
    /// explicit retry; `Waiting -> Ready` only when the last dependency is done.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Waiting, Ready)
                | (Waiting, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Ready)
                | (Failed, Waiting)
        )
    }

    /// Whether dependents of a task in this state can never become ready
    /// without outside intervention.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
