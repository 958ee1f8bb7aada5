use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::ids::{ProjectId, TaskId, UserId, WorkspaceId};
use super::state::TaskStatus;
use crate::error::HeddleError;

/// Caller-defined tag. The dispatcher routes a task to the service adapter
/// registered under this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A dependency as written in a registration batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRef {
    /// A task that already exists.
    Task(TaskId),
    /// Another member of the same batch, by position.
    Batch(usize),
}

impl From<TaskId> for DependencyRef {
    fn from(id: TaskId) -> Self {
        DependencyRef::Task(id)
    }
}

/// Registration request for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Caller-minted id, needed to forward-declare dependencies on a task
    /// before it is registered. Generated when absent.
    pub id: Option<TaskId>,
    pub name: String,
    pub task_type: TaskType,
    /// `None` falls back to the configured default priority.
    pub priority: Option<i32>,
    pub dependencies: Vec<DependencyRef>,
    pub payload: Value,
    pub metadata: Map<String, Value>,
}

impl NewTask {
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        let task_type = task_type.into();
        Self {
            id: None,
            name: task_type.as_str().to_string(),
            task_type,
            priority: None,
            dependencies: Vec::new(),
            payload: Value::Object(Map::new()),
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn after(mut self, dependency: impl Into<DependencyRef>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Depend on the batch member at `index`.
    pub fn after_batch(self, index: usize) -> Self {
        self.after(DependencyRef::Batch(index))
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Persisted state of a task.
///
/// This is the single source of truth for task state. The in-memory graph
/// only holds ids and is rebuilt from these records. All status changes go
/// through the transition methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of times this task has been dispatched.
    pub attempts: u32,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh record in `Waiting`. The queue promotes it to `Ready` once the
    /// graph says so.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        workspace_id: WorkspaceId,
        project_id: ProjectId,
        request: NewTask,
        priority: i32,
        dependencies: Vec<TaskId>,
        created_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: request.name,
            task_type: request.task_type,
            status: TaskStatus::Waiting,
            priority,
            dependencies,
            workspace_id,
            project_id,
            payload: request.payload,
            metadata: request.metadata,
            result: None,
            error: None,
            attempts: 0,
            created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), HeddleError> {
        if !self.status.can_transition_to(next) {
            return Err(HeddleError::InvalidStateTransition {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Waiting -> Ready.
    pub fn mark_ready(&mut self, now: DateTime<Utc>) -> Result<(), HeddleError> {
        self.transition(TaskStatus::Ready, now)
    }

    /// Ready -> Running (increments attempts).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> Result<(), HeddleError> {
        self.transition(TaskStatus::Running, now)?;
        self.attempts += 1;
        self.started_at = Some(now);
        Ok(())
    }

    /// Running -> Done.
    pub fn mark_done(&mut self, result: Value, now: DateTime<Utc>) -> Result<(), HeddleError> {
        self.transition(TaskStatus::Done, now)?;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Running -> Failed.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> Result<(), HeddleError> {
        self.transition(TaskStatus::Failed, now)?;
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), HeddleError> {
        self.transition(TaskStatus::Cancelled, now)?;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Failed -> Ready / Waiting, depending on whether the dependencies are
    /// still satisfied.
    pub fn reset_for_retry(&mut self, ready: bool, now: DateTime<Utc>) -> Result<(), HeddleError> {
        let next = if ready {
            TaskStatus::Ready
        } else {
            TaskStatus::Waiting
        };
        self.transition(next, now)?;
        self.result = None;
        self.finished_at = None;
        Ok(())
    }
}
