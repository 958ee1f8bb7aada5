//! InMemoryStateStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - テーブルは `RwLock<Tables>` 一つにまとめる
//! - commit はテーブルを複製してからバッチを適用し、全部成功したときだけ差し替える
//!   （copy-on-write。途中で失敗しても元のテーブルは一切変わらない）

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    LockId, LockRecord, Member, Project, ProjectId, TaskEvent, TaskId, TaskRecord, UserId,
    Workspace, WorkspaceId,
};
use crate::ports::{Mutation, StateStore, StoreError};

#[derive(Debug, Clone, Default)]
struct Tables {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Insertion order of `tasks`.
    task_order: Vec<TaskId>,
    locks: BTreeMap<LockId, LockRecord>,
    workspaces: BTreeMap<WorkspaceId, Workspace>,
    members: BTreeMap<(WorkspaceId, UserId), Member>,
    projects: BTreeMap<ProjectId, Project>,
    /// seq -> (event, delivered)
    events: BTreeMap<u64, (TaskEvent, bool)>,
}

impl Tables {
    fn apply(&mut self, mutation: Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::InsertTask(task) => {
                if self.tasks.contains_key(&task.id) {
                    return Err(StoreError::duplicate("task", task.id));
                }
                if !self.projects.contains_key(&task.project_id) {
                    return Err(StoreError::dangling("task", task.id, "project", task.project_id));
                }
                self.task_order.push(task.id);
                self.tasks.insert(task.id, task);
            }
            Mutation::UpdateTask(task) => {
                let slot = self
                    .tasks
                    .get_mut(&task.id)
                    .ok_or_else(|| StoreError::missing("task", task.id))?;
                *slot = task;
            }

            Mutation::InsertLock(lock) => {
                if self.locks.contains_key(&lock.lock_id) {
                    return Err(StoreError::duplicate("lock", lock.lock_id));
                }
                if let Some(ws) = lock.workspace_id
                    && !self.workspaces.contains_key(&ws)
                {
                    return Err(StoreError::dangling("lock", lock.lock_id, "workspace", ws));
                }
                if let Some(project) = lock.project_id
                    && !self.projects.contains_key(&project)
                {
                    return Err(StoreError::dangling("lock", lock.lock_id, "project", project));
                }
                self.locks.insert(lock.lock_id, lock);
            }
            Mutation::UpdateLock(lock) => {
                let slot = self
                    .locks
                    .get_mut(&lock.lock_id)
                    .ok_or_else(|| StoreError::missing("lock", lock.lock_id))?;
                *slot = lock;
            }
            Mutation::DeleteLock(id) => {
                self.locks
                    .remove(&id)
                    .ok_or_else(|| StoreError::missing("lock", id))?;
            }

            Mutation::InsertWorkspace(ws) => {
                if self.workspaces.contains_key(&ws.id) {
                    return Err(StoreError::duplicate("workspace", ws.id));
                }
                self.workspaces.insert(ws.id, ws);
            }
            Mutation::UpdateWorkspace(ws) => {
                let slot = self
                    .workspaces
                    .get_mut(&ws.id)
                    .ok_or_else(|| StoreError::missing("workspace", ws.id))?;
                *slot = ws;
            }
            Mutation::DeleteWorkspace(id) => {
                self.workspaces
                    .remove(&id)
                    .ok_or_else(|| StoreError::missing("workspace", id))?;
                self.members.retain(|(ws, _), _| *ws != id);
                self.projects.retain(|_, project| project.workspace_id != id);
            }

            Mutation::PutMember(member) => {
                if !self.workspaces.contains_key(&member.workspace_id) {
                    return Err(StoreError::dangling(
                        "member",
                        &member.user_id,
                        "workspace",
                        member.workspace_id,
                    ));
                }
                self.members
                    .insert((member.workspace_id, member.user_id.clone()), member);
            }
            Mutation::RemoveMember {
                workspace_id,
                user_id,
            } => {
                if self.members.remove(&(workspace_id, user_id.clone())).is_none() {
                    return Err(StoreError::missing("member", user_id));
                }
            }

            Mutation::InsertProject(project) => {
                if self.projects.contains_key(&project.id) {
                    return Err(StoreError::duplicate("project", project.id));
                }
                if !self.workspaces.contains_key(&project.workspace_id) {
                    return Err(StoreError::dangling(
                        "project",
                        project.id,
                        "workspace",
                        project.workspace_id,
                    ));
                }
                self.projects.insert(project.id, project);
            }
            Mutation::UpdateProject(project) => {
                let slot = self
                    .projects
                    .get_mut(&project.id)
                    .ok_or_else(|| StoreError::missing("project", project.id))?;
                *slot = project;
            }
            Mutation::DeleteProject(id) => {
                let project = self
                    .projects
                    .get(&id)
                    .ok_or_else(|| StoreError::missing("project", id))?;
                if !self.workspaces.contains_key(&project.workspace_id) {
                    return Err(StoreError::dangling(
                        "project",
                        id,
                        "workspace",
                        project.workspace_id,
                    ));
                }
                self.projects.remove(&id);
            }

            Mutation::AppendEvent(event) => {
                if self.events.contains_key(&event.seq) {
                    return Err(StoreError::duplicate("event", event.seq));
                }
                self.events.insert(event.seq, (event, false));
            }
            Mutation::AckEvents(seqs) => {
                for seq in seqs {
                    let (_, delivered) = self
                        .events
                        .get_mut(&seq)
                        .ok_or_else(|| StoreError::missing("event", seq))?;
                    *delivered = true;
                }
            }
        }
        Ok(())
    }
}

/// InMemoryStateStore は開発用の正本
///
/// プロセスが終われば消える。CLI のデフォルトとテストで使う。
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    tables: RwLock<Tables>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        for mutation in batch {
            staged.apply(mutation)?;
        }
        *tables = staged;
        Ok(())
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn tasks(&self, project: Option<ProjectId>) -> Result<Vec<TaskRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .task_order
            .iter()
            .filter_map(|id| tables.tasks.get(id))
            .filter(|task| project.is_none_or(|p| task.project_id == p))
            .cloned()
            .collect())
    }

    async fn locks(&self) -> Result<Vec<LockRecord>, StoreError> {
        Ok(self.tables.read().await.locks.values().cloned().collect())
    }

    async fn workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        Ok(self.tables.read().await.workspaces.get(&id).cloned())
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        Ok(self.tables.read().await.workspaces.values().cloned().collect())
    }

    async fn members(&self, workspace: WorkspaceId) -> Result<Vec<Member>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .members
            .values()
            .filter(|m| m.workspace_id == workspace)
            .cloned()
            .collect())
    }

    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.tables.read().await.projects.get(&id).cloned())
    }

    async fn projects(&self, workspace: Option<WorkspaceId>) -> Result<Vec<Project>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .projects
            .values()
            .filter(|p| workspace.is_none_or(|ws| p.workspace_id == ws))
            .cloned()
            .collect())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<TaskEvent>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .values()
            .filter(|(_, delivered)| !delivered)
            .take(limit)
            .map(|(event, _)| event.clone())
            .collect())
    }

    async fn last_event_seq(&self) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }
}
