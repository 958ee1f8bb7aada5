//! ProjectManager - workspace 配下のプロジェクト
//!
//! archive したプロジェクトにはタスクを登録できない。削除は archive 後のみ。

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::domain::{Lifecycle, Patch, Project, ProjectId, UserId, WorkspaceId};
use crate::error::{Entity, HeddleError, Result};
use crate::observability::QueueCounts;
use crate::ports::Mutation;
use crate::state::{StateManager, Transaction};
use crate::tenancy::rbac::{self, Permission};

/// Task statistics of one project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStats {
    pub project_id: ProjectId,
    pub counts: QueueCounts,
    pub total: usize,
    /// Share of tasks that are done, 0.0 for an empty project.
    pub completion_rate: f64,
}

pub struct ProjectManager {
    state: Arc<StateManager>,
}

impl ProjectManager {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    pub async fn create(
        &self,
        actor: &UserId,
        workspace: WorkspaceId,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<Project> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HeddleError::InvalidArgument("project name is empty".into()));
        }
        rbac::require(&self.state, workspace, actor, Permission::ProjectCreate).await?;
        workspace_active(&self.state, workspace).await?;

        let now = self.state.now();
        let project = Project {
            id: self.state.ids().next(),
            workspace_id: workspace,
            name,
            description,
            status: Lifecycle::Active,
            created_by: actor.clone(),
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        };
        let mut tx = Transaction::new("create_project");
        tx.push(Mutation::InsertProject(project.clone()));
        self.state.commit(tx).await?;

        info!(project = %project.id, workspace = %workspace, actor = %actor, "project created");
        Ok(project)
    }

    pub async fn get(&self, actor: &UserId, id: ProjectId) -> Result<Project> {
        let project = self.state.project(id).await?;
        rbac::require(&self.state, project.workspace_id, actor, Permission::ProjectRead).await?;
        Ok(project)
    }

    /// Projects of the workspace, oldest first.
    pub async fn list(
        &self,
        actor: &UserId,
        workspace: WorkspaceId,
        include_archived: bool,
    ) -> Result<Vec<Project>> {
        rbac::require(&self.state, workspace, actor, Permission::ProjectRead).await?;
        let mut projects = self.state.store().projects(Some(workspace)).await?;
        if !include_archived {
            projects.retain(|p| p.status == Lifecycle::Active);
        }
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    pub async fn update(&self, actor: &UserId, id: ProjectId, patch: Patch) -> Result<Project> {
        let mut project = self.state.project(id).await?;
        rbac::require(&self.state, project.workspace_id, actor, Permission::ProjectUpdate).await?;
        expect_status(&project, Lifecycle::Active)?;
        if patch.is_empty() {
            return Ok(project);
        }

        if let Some(name) = patch.name {
            project.name = name;
        }
        if let Some(description) = patch.description {
            project.description = Some(description);
        }
        project.metadata.extend(patch.extra);
        project.updated_at = self.state.now();
        self.save("update_project", &project).await?;
        info!(project = %id, actor = %actor, "project updated");
        Ok(project)
    }

    pub async fn archive(&self, actor: &UserId, id: ProjectId) -> Result<Project> {
        self.set_status(actor, id, Lifecycle::Active, Lifecycle::Archived).await
    }

    pub async fn restore(&self, actor: &UserId, id: ProjectId) -> Result<Project> {
        self.set_status(actor, id, Lifecycle::Archived, Lifecycle::Active).await
    }

    /// Hard delete of an archived project. Its task records stay in the store.
    pub async fn delete(&self, actor: &UserId, id: ProjectId) -> Result<()> {
        let project = self.state.project(id).await?;
        rbac::require(&self.state, project.workspace_id, actor, Permission::ProjectDelete).await?;
        expect_status(&project, Lifecycle::Archived)?;

        let mut tx = Transaction::new("delete_project");
        tx.push(Mutation::DeleteProject(id));
        self.state.commit(tx).await?;
        info!(project = %id, actor = %actor, "project deleted");
        Ok(())
    }

    pub async fn stats(&self, actor: &UserId, id: ProjectId) -> Result<ProjectStats> {
        let project = self.get(actor, id).await?;
        let tasks = self.state.tasks(project.id).await?;
        let counts = QueueCounts::from_tasks(&tasks);
        let total = counts.total();
        let completion_rate = if total == 0 {
            0.0
        } else {
            counts.done as f64 / total as f64
        };
        Ok(ProjectStats {
            project_id: id,
            counts,
            total,
            completion_rate,
        })
    }

    /// The project, if it exists, belongs to `workspace` and both are active.
    pub async fn active_in(&self, workspace: WorkspaceId, id: ProjectId) -> Result<Project> {
        let project = self.state.project(id).await?;
        if project.workspace_id != workspace {
            return Err(HeddleError::not_found(Entity::Project, id));
        }
        workspace_active(&self.state, workspace).await?;
        expect_status(&project, Lifecycle::Active)?;
        Ok(project)
    }

    async fn set_status(
        &self,
        actor: &UserId,
        id: ProjectId,
        from: Lifecycle,
        to: Lifecycle,
    ) -> Result<Project> {
        let mut project = self.state.project(id).await?;
        rbac::require(&self.state, project.workspace_id, actor, Permission::ProjectArchive).await?;
        expect_status(&project, from)?;

        project.status = to;
        project.updated_at = self.state.now();
        self.save("set_project_status", &project).await?;
        info!(project = %id, status = %to, actor = %actor, "project status changed");
        Ok(project)
    }

    async fn save(&self, label: &'static str, project: &Project) -> Result<()> {
        let mut tx = Transaction::new(label);
        tx.push(Mutation::UpdateProject(project.clone()));
        self.state.commit(tx).await
    }
}

async fn workspace_active(state: &StateManager, id: WorkspaceId) -> Result<()> {
    let workspace = state.workspace(id).await?;
    if workspace.status != Lifecycle::Active {
        return Err(HeddleError::WrongLifecycle {
            entity: Entity::Workspace,
            id: id.to_string(),
            status: workspace.status,
            required: Lifecycle::Active,
        });
    }
    Ok(())
}

fn expect_status(project: &Project, required: Lifecycle) -> Result<()> {
    if project.status != required {
        return Err(HeddleError::WrongLifecycle {
            entity: Entity::Project,
            id: project.id.to_string(),
            status: project.status,
            required,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Role, TaskStatus};
    use crate::fixtures;
    use crate::tenancy::WorkspaceManager;

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    async fn setup() -> (ProjectManager, Arc<StateManager>, WorkspaceId) {
        let (state, _) = fixtures::state_manager();
        let workspaces = WorkspaceManager::new(state.clone());
        let ws = workspaces.create(&user("alice"), "research", None).await.unwrap();
        workspaces
            .add_member(&user("alice"), ws.id, &user("bob"), Role::Member)
            .await
            .unwrap();
        workspaces
            .add_member(&user("alice"), ws.id, &user("vic"), Role::Viewer)
            .await
            .unwrap();
        (ProjectManager::new(state.clone()), state, ws.id)
    }

    #[tokio::test]
    async fn members_create_viewers_read() {
        let (projects, _, ws) = setup().await;
        let project = projects.create(&user("bob"), ws, "pipeline", None).await.unwrap();
        assert_eq!(projects.get(&user("vic"), project.id).await.unwrap(), project);

        let err = projects.create(&user("vic"), ws, "nope", None).await.unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: Some(Role::Viewer), .. }));
    }

    #[tokio::test]
    async fn archive_restore_delete_lifecycle() {
        let (projects, state, ws) = setup().await;
        let alice = user("alice");
        let project = projects.create(&alice, ws, "pipeline", None).await.unwrap();

        let err = projects.archive(&user("bob"), project.id).await.unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { .. }));
        let err = projects.delete(&alice, project.id).await.unwrap_err();
        assert!(matches!(err, HeddleError::WrongLifecycle { required: Lifecycle::Archived, .. }));

        projects.archive(&alice, project.id).await.unwrap();
        assert!(projects.list(&alice, ws, false).await.unwrap().is_empty());
        assert_eq!(projects.list(&alice, ws, true).await.unwrap().len(), 1);
        assert!(projects.active_in(ws, project.id).await.is_err());

        projects.restore(&alice, project.id).await.unwrap();
        projects.active_in(ws, project.id).await.unwrap();

        projects.archive(&alice, project.id).await.unwrap();
        projects.delete(&alice, project.id).await.unwrap();
        assert!(state.project(project.id).await.is_err());
    }

    #[tokio::test]
    async fn stats_count_tasks_by_status() {
        let (projects, state, ws) = setup().await;
        let project = projects.create(&user("alice"), ws, "pipeline", None).await.unwrap();
        let mut done = fixtures::task(1, &project, &[]);
        done.status = TaskStatus::Done;
        let mut tx = Transaction::new("seed");
        tx.push(Mutation::InsertTask(done))
            .push(Mutation::InsertTask(fixtures::task(2, &project, &[1])));
        state.commit(tx).await.unwrap();

        let stats = projects.stats(&user("vic"), project.id).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.counts.done, 1);
        assert!((stats.completion_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn archived_workspace_deactivates_its_projects() {
        let (projects, state, ws) = setup().await;
        let alice = user("alice");
        let project = projects.create(&alice, ws, "pipeline", None).await.unwrap();
        WorkspaceManager::new(state).archive(&alice, ws).await.unwrap();

        let err = projects.active_in(ws, project.id).await.unwrap_err();
        assert!(matches!(
            err,
            HeddleError::WrongLifecycle { entity: Entity::Workspace, status: Lifecycle::Archived, .. }
        ));
        let err = projects.create(&alice, ws, "late", None).await.unwrap_err();
        assert!(matches!(err, HeddleError::WrongLifecycle { entity: Entity::Workspace, .. }));
    }

    #[tokio::test]
    async fn project_must_belong_to_the_workspace() {
        let (projects, _, ws) = setup().await;
        let project = projects.create(&user("alice"), ws, "pipeline", None).await.unwrap();
        let err = projects.active_in(fixtures::ws_id(99), project.id).await.unwrap_err();
        assert!(matches!(err, HeddleError::NotFound { entity: Entity::Project, .. }));
    }
}
