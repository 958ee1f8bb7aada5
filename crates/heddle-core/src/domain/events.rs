//! Events - タスク状態遷移の通知
//!
//! 状態遷移と同じトランザクションで outbox に書き込まれ、
//! EventPublisher が seq 順に EventSink へ配送する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

use super::ids::{EventId, ProjectId, TaskId, UserId, WorkspaceId};
use super::state::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventKind {
    Created,
    Started,
    Completed,
    Failed,
    Cancelled,
    Retried,
}

impl TaskEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskEventKind::Created => "created",
            TaskEventKind::Started => "started",
            TaskEventKind::Completed => "completed",
            TaskEventKind::Failed => "failed",
            TaskEventKind::Cancelled => "cancelled",
            TaskEventKind::Retried => "retried",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task transition, as stored in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: EventId,
    /// Strictly increasing within one store. Delivery follows this order.
    pub seq: u64,
    pub kind: TaskEventKind,
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    /// Status after the transition.
    pub status: TaskStatus,
    pub actor: Option<UserId>,
    #[serde(default)]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Subscriber-facing message.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "task_event",
            "event_type": self.kind.as_str(),
            "task_id": self.task_id.to_string(),
            "workspace_id": self.workspace_id.to_string(),
            "project_id": self.project_id.to_string(),
            "status": self.status.as_str(),
            "seq": self.seq,
            "actor": self.actor.as_ref().map(UserId::as_str),
            "details": self.details,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}
