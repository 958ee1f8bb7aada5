//! StateStore port - 正本（source of truth）
//!
//! tasks / locks / workspaces / workspace_members / projects / task_events を
//! 保持する。すべての書き込みは `Mutation` のバッチとして `commit` され、
//! バッチ内のどれか一つでも失敗したら全体がロールバックされる。
//!
//! # 設計原則
//! - 状態遷移と outbox (task_events) への追記は同一バッチ
//! - insert は上書きしない、update は作成しない
//! - project は workspace を、member は workspace を、新しい task は project を参照する
//! - in-memory の投影（DependencyGraph, LockManager）はすべてここから再構築できる

use async_trait::async_trait;

use crate::domain::{
    LockId, LockRecord, Member, Project, ProjectId, TaskEvent, TaskId, TaskRecord, UserId,
    Workspace, WorkspaceId,
};

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    InsertTask(TaskRecord),
    UpdateTask(TaskRecord),

    InsertLock(LockRecord),
    UpdateLock(LockRecord),
    DeleteLock(LockId),

    InsertWorkspace(Workspace),
    UpdateWorkspace(Workspace),
    /// Cascades to the workspace's members and projects. Tasks stay behind.
    DeleteWorkspace(WorkspaceId),

    /// Adds a member or changes the role of an existing one.
    PutMember(Member),
    RemoveMember {
        workspace_id: WorkspaceId,
        user_id: UserId,
    },

    InsertProject(Project),
    UpdateProject(Project),
    DeleteProject(ProjectId),

    AppendEvent(TaskEvent),
    /// Marks the events with these sequence numbers as delivered.
    AckEvents(Vec<u64>),
}

impl Mutation {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::InsertTask(_) => "insert_task",
            Mutation::UpdateTask(_) => "update_task",
            Mutation::InsertLock(_) => "insert_lock",
            Mutation::UpdateLock(_) => "update_lock",
            Mutation::DeleteLock(_) => "delete_lock",
            Mutation::InsertWorkspace(_) => "insert_workspace",
            Mutation::UpdateWorkspace(_) => "update_workspace",
            Mutation::DeleteWorkspace(_) => "delete_workspace",
            Mutation::PutMember(_) => "put_member",
            Mutation::RemoveMember { .. } => "remove_member",
            Mutation::InsertProject(_) => "insert_project",
            Mutation::UpdateProject(_) => "update_project",
            Mutation::DeleteProject(_) => "delete_project",
            Mutation::AppendEvent(_) => "append_event",
            Mutation::AckEvents(_) => "ack_events",
        }
    }
}

/// StoreError はバックエンドの失敗
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: String },

    #[error("{kind} {id} does not exist")]
    Missing { kind: &'static str, id: String },

    #[error("{kind} {id} references missing {target} {target_id}")]
    DanglingReference {
        kind: &'static str,
        id: String,
        target: &'static str,
        target_id: String,
    },

    #[error("storage backend: {0}")]
    Backend(String),

    #[error("record encoding: {0}")]
    Codec(String),
}

impl StoreError {
    pub(crate) fn duplicate(kind: &'static str, id: impl ToString) -> Self {
        StoreError::Duplicate {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn missing(kind: &'static str, id: impl ToString) -> Self {
        StoreError::Missing {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn dangling(
        kind: &'static str,
        id: impl ToString,
        target: &'static str,
        target_id: impl ToString,
    ) -> Self {
        StoreError::DanglingReference {
            kind,
            id: id.to_string(),
            target,
            target_id: target_id.to_string(),
        }
    }
}

/// StateStore は状態・lease・テナント・outbox の正本
///
/// Reads return owned snapshots. `tasks` returns records in insertion order,
/// which the dependency graph uses as its tie-break when it is rebuilt.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Applies every mutation or none of them.
    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError>;

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// All tasks, or only those of one project, in insertion order.
    async fn tasks(&self, project: Option<ProjectId>) -> Result<Vec<TaskRecord>, StoreError>;

    async fn locks(&self) -> Result<Vec<LockRecord>, StoreError>;

    async fn workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, StoreError>;

    async fn workspaces(&self) -> Result<Vec<Workspace>, StoreError>;

    async fn members(&self, workspace: WorkspaceId) -> Result<Vec<Member>, StoreError>;

    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError>;

    async fn projects(&self, workspace: Option<WorkspaceId>) -> Result<Vec<Project>, StoreError>;

    /// Undelivered events, lowest `seq` first.
    async fn pending_events(&self, limit: usize) -> Result<Vec<TaskEvent>, StoreError>;

    /// Highest sequence number ever appended (delivered or not), 0 if none.
    async fn last_event_seq(&self) -> Result<u64, StoreError>;
}
