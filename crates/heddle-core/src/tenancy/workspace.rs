//! WorkspaceManager - workspace とメンバーシップ
//!
//! 作成者は owner になる。owner は外せないし、owner ロールを渡せるのも
//! owner だけ。削除は owner のみ、かつ archive 済みであること。

use std::sync::Arc;

use tracing::info;

use crate::domain::{Lifecycle, Member, Patch, Role, UserId, Workspace, WorkspaceId};
use crate::error::{Entity, HeddleError, Result};
use crate::ports::Mutation;
use crate::state::{StateManager, Transaction};
use crate::tenancy::rbac::{self, Permission};

pub struct WorkspaceManager {
    state: Arc<StateManager>,
}

impl WorkspaceManager {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    pub async fn create(
        &self,
        owner: &UserId,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<Workspace> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HeddleError::InvalidArgument("workspace name is empty".into()));
        }
        let now = self.state.now();
        let workspace = Workspace {
            id: self.state.ids().next(),
            name,
            description,
            owner: owner.clone(),
            status: Lifecycle::Active,
            settings: Default::default(),
            created_at: now,
            updated_at: now,
        };

        let mut tx = Transaction::new("create_workspace");
        tx.push(Mutation::InsertWorkspace(workspace.clone()))
            .push(Mutation::PutMember(Member {
                workspace_id: workspace.id,
                user_id: owner.clone(),
                role: Role::Owner,
                joined_at: now,
            }));
        self.state.commit(tx).await?;

        info!(workspace = %workspace.id, owner = %owner, "workspace created");
        Ok(workspace)
    }

    pub async fn get(&self, actor: &UserId, id: WorkspaceId) -> Result<Workspace> {
        rbac::require(&self.state, id, actor, Permission::WorkspaceRead).await?;
        self.state.workspace(id).await
    }

    /// Workspaces `user` is a member of, oldest first.
    pub async fn list_for(&self, user: &UserId) -> Result<Vec<Workspace>> {
        let mut mine = Vec::new();
        for workspace in self.state.store().workspaces().await? {
            if self.state.role_of(workspace.id, user).await?.is_some() {
                mine.push(workspace);
            }
        }
        mine.sort_by_key(|w| w.created_at);
        Ok(mine)
    }

    pub async fn update(&self, actor: &UserId, id: WorkspaceId, patch: Patch) -> Result<Workspace> {
        rbac::require(&self.state, id, actor, Permission::WorkspaceUpdate).await?;
        let mut workspace = self.active(id).await?;
        if patch.is_empty() {
            return Ok(workspace);
        }

        if let Some(name) = patch.name {
            workspace.name = name;
        }
        if let Some(description) = patch.description {
            workspace.description = Some(description);
        }
        workspace.settings.extend(patch.extra);
        workspace.updated_at = self.state.now();

        let mut tx = Transaction::new("update_workspace");
        tx.push(Mutation::UpdateWorkspace(workspace.clone()));
        self.state.commit(tx).await?;
        info!(workspace = %id, actor = %actor, "workspace updated");
        Ok(workspace)
    }

    pub async fn archive(&self, actor: &UserId, id: WorkspaceId) -> Result<Workspace> {
        rbac::require(&self.state, id, actor, Permission::WorkspaceArchive).await?;
        let mut workspace = self.active(id).await?;
        workspace.status = Lifecycle::Archived;
        workspace.updated_at = self.state.now();

        let mut tx = Transaction::new("archive_workspace");
        tx.push(Mutation::UpdateWorkspace(workspace.clone()));
        self.state.commit(tx).await?;
        info!(workspace = %id, actor = %actor, "workspace archived");
        Ok(workspace)
    }

    /// Hard delete. Members and projects go with it.
    pub async fn delete(&self, actor: &UserId, id: WorkspaceId) -> Result<()> {
        rbac::require(&self.state, id, actor, Permission::WorkspaceDelete).await?;
        let workspace = self.state.workspace(id).await?;
        if workspace.status != Lifecycle::Archived {
            return Err(HeddleError::WrongLifecycle {
                entity: Entity::Workspace,
                id: id.to_string(),
                status: workspace.status,
                required: Lifecycle::Archived,
            });
        }

        let mut tx = Transaction::new("delete_workspace");
        tx.push(Mutation::DeleteWorkspace(id));
        self.state.commit(tx).await?;
        info!(workspace = %id, actor = %actor, "workspace deleted");
        Ok(())
    }

    /// Adds `user` or changes their role.
    pub async fn add_member(
        &self,
        actor: &UserId,
        id: WorkspaceId,
        user: &UserId,
        role: Role,
    ) -> Result<Member> {
        let actor_role = rbac::require(&self.state, id, actor, Permission::MemberManage).await?;
        let workspace = self.active(id).await?;

        if role == Role::Owner && actor_role != Role::Owner {
            return Err(outranked(actor, id, actor_role));
        }
        if user == &workspace.owner && role != Role::Owner {
            return Err(HeddleError::InvalidArgument(format!(
                "{user} owns workspace {id}; the owner's role cannot change"
            )));
        }

        let existing = self
            .state
            .members(id)
            .await?
            .into_iter()
            .find(|m| &m.user_id == user);
        if let Some(current) = &existing
            && current.role > actor_role
        {
            return Err(outranked(actor, id, actor_role));
        }
        let member = Member {
            workspace_id: id,
            user_id: user.clone(),
            role,
            joined_at: existing.map_or_else(|| self.state.now(), |m| m.joined_at),
        };

        let mut tx = Transaction::new("put_member");
        tx.push(Mutation::PutMember(member.clone()));
        self.state.commit(tx).await?;
        info!(workspace = %id, user = %user, role = %role, actor = %actor, "member added");
        Ok(member)
    }

    pub async fn remove_member(&self, actor: &UserId, id: WorkspaceId, user: &UserId) -> Result<()> {
        let actor_role = rbac::require(&self.state, id, actor, Permission::MemberManage).await?;
        let workspace = self.state.workspace(id).await?;
        if user == &workspace.owner {
            return Err(HeddleError::InvalidArgument(format!(
                "{user} owns workspace {id} and cannot be removed"
            )));
        }
        match self.state.role_of(id, user).await? {
            None => return Err(HeddleError::not_found(Entity::Member, user)),
            Some(current) if current > actor_role => return Err(outranked(actor, id, actor_role)),
            Some(_) => {}
        }

        let mut tx = Transaction::new("remove_member");
        tx.push(Mutation::RemoveMember {
            workspace_id: id,
            user_id: user.clone(),
        });
        self.state.commit(tx).await?;
        info!(workspace = %id, user = %user, actor = %actor, "member removed");
        Ok(())
    }

    pub async fn members(&self, actor: &UserId, id: WorkspaceId) -> Result<Vec<Member>> {
        rbac::require(&self.state, id, actor, Permission::MemberRead).await?;
        self.state.members(id).await
    }

    pub async fn role_of(&self, id: WorkspaceId, user: &UserId) -> Result<Option<Role>> {
        self.state.role_of(id, user).await
    }

    async fn active(&self, id: WorkspaceId) -> Result<Workspace> {
        let workspace = self.state.workspace(id).await?;
        if workspace.status != Lifecycle::Active {
            return Err(HeddleError::WrongLifecycle {
                entity: Entity::Workspace,
                id: id.to_string(),
                status: workspace.status,
                required: Lifecycle::Active,
            });
        }
        Ok(workspace)
    }
}

/// Members may only manage roles up to their own.
fn outranked(actor: &UserId, workspace: WorkspaceId, role: Role) -> HeddleError {
    HeddleError::PermissionDenied {
        user: actor.clone(),
        workspace,
        permission: Permission::MemberManage,
        role: Some(role),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use serde_json::json;

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    async fn setup() -> (WorkspaceManager, Arc<StateManager>, Workspace) {
        let (state, _) = fixtures::state_manager();
        let manager = WorkspaceManager::new(state.clone());
        let ws = manager.create(&user("alice"), "research", None).await.unwrap();
        (manager, state, ws)
    }

    #[tokio::test]
    async fn creator_becomes_owner() {
        let (manager, _, ws) = setup().await;
        assert_eq!(manager.role_of(ws.id, &user("alice")).await.unwrap(), Some(Role::Owner));
        assert_eq!(manager.list_for(&user("alice")).await.unwrap(), vec![ws.clone()]);
        assert!(manager.list_for(&user("bob")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_owner_grants_ownership() {
        let (manager, _, ws) = setup().await;
        let alice = user("alice");
        manager.add_member(&alice, ws.id, &user("bob"), Role::Admin).await.unwrap();

        let err = manager
            .add_member(&user("bob"), ws.id, &user("carol"), Role::Owner)
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: Some(Role::Admin), .. }));

        manager.add_member(&user("bob"), ws.id, &user("carol"), Role::Member).await.unwrap();
        let err = manager
            .add_member(&user("carol"), ws.id, &user("dave"), Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn owner_cannot_be_removed_or_demoted() {
        let (manager, _, ws) = setup().await;
        let alice = user("alice");
        manager.add_member(&alice, ws.id, &user("bob"), Role::Admin).await.unwrap();

        let err = manager.remove_member(&user("bob"), ws.id, &alice).await.unwrap_err();
        assert!(matches!(err, HeddleError::InvalidArgument(_)));
        let err = manager.add_member(&alice, ws.id, &alice, Role::Viewer).await.unwrap_err();
        assert!(matches!(err, HeddleError::InvalidArgument(_)));

        manager.remove_member(&alice, ws.id, &user("bob")).await.unwrap();
        assert_eq!(manager.members(&alice, ws.id).await.unwrap().len(), 1);
        let err = manager.remove_member(&alice, ws.id, &user("bob")).await.unwrap_err();
        assert!(matches!(err, HeddleError::NotFound { entity: Entity::Member, .. }));
    }

    #[tokio::test]
    async fn admins_cannot_touch_co_owners() {
        let (manager, _, ws) = setup().await;
        let alice = user("alice");
        manager.add_member(&alice, ws.id, &user("bob"), Role::Admin).await.unwrap();
        manager.add_member(&alice, ws.id, &user("carol"), Role::Owner).await.unwrap();

        let err = manager
            .add_member(&user("bob"), ws.id, &user("carol"), Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: Some(Role::Admin), .. }));
        let err = manager.remove_member(&user("bob"), ws.id, &user("carol")).await.unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: Some(Role::Admin), .. }));
        assert_eq!(manager.role_of(ws.id, &user("carol")).await.unwrap(), Some(Role::Owner));

        // 同格の admin 同士は管理できる
        manager.add_member(&alice, ws.id, &user("dave"), Role::Admin).await.unwrap();
        manager.add_member(&user("bob"), ws.id, &user("dave"), Role::Member).await.unwrap();
        manager.remove_member(&user("bob"), ws.id, &user("dave")).await.unwrap();

        manager.add_member(&user("carol"), ws.id, &user("bob"), Role::Viewer).await.unwrap();
        manager.remove_member(&user("carol"), ws.id, &user("bob")).await.unwrap();
    }

    #[tokio::test]
    async fn role_change_keeps_join_time() {
        let (manager, _, ws) = setup().await;
        let alice = user("alice");
        let first = manager.add_member(&alice, ws.id, &user("bob"), Role::Viewer).await.unwrap();
        let second = manager.add_member(&alice, ws.id, &user("bob"), Role::Member).await.unwrap();
        assert_eq!(second.role, Role::Member);
        assert_eq!(second.joined_at, first.joined_at);
    }

    #[tokio::test]
    async fn delete_requires_owner_and_archive() {
        let (manager, state, ws) = setup().await;
        let alice = user("alice");
        manager.add_member(&alice, ws.id, &user("bob"), Role::Admin).await.unwrap();

        let err = manager.delete(&alice, ws.id).await.unwrap_err();
        assert!(matches!(err, HeddleError::WrongLifecycle { status: Lifecycle::Active, .. }));

        manager.archive(&user("bob"), ws.id).await.unwrap();
        let err = manager.delete(&user("bob"), ws.id).await.unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { .. }));

        manager.delete(&alice, ws.id).await.unwrap();
        assert!(state.workspace(ws.id).await.is_err());
    }

    #[tokio::test]
    async fn update_merges_settings() {
        let (manager, _, ws) = setup().await;
        let updated = manager
            .update(&user("alice"), ws.id, Patch::default().name("lab").set("region", json!("eu")))
            .await
            .unwrap();
        assert_eq!(updated.name, "lab");
        assert_eq!(updated.settings["region"], json!("eu"));

        let err = manager
            .update(&user("mallory"), ws.id, Patch::default().name("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: None, .. }));
    }
}
