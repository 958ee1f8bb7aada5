//! RBAC - ロールごとの権限
//!
//! 判定は fail closed: メンバーでない（ロールがない）ユーザーは何もできない。

use std::fmt;

use tracing::warn;

use crate::domain::{Role, UserId, WorkspaceId};
use crate::error::{HeddleError, Result};
use crate::state::StateManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    WorkspaceRead,
    WorkspaceUpdate,
    WorkspaceArchive,
    WorkspaceDelete,
    MemberRead,
    MemberManage,
    ProjectRead,
    ProjectCreate,
    ProjectUpdate,
    ProjectArchive,
    ProjectDelete,
    TaskRead,
    TaskCreate,
    TaskUpdate,
    TaskExecute,
    LockRead,
    LockAcquire,
    LockRelease,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::WorkspaceRead => "workspace:read",
            Permission::WorkspaceUpdate => "workspace:update",
            Permission::WorkspaceArchive => "workspace:archive",
            Permission::WorkspaceDelete => "workspace:delete",
            Permission::MemberRead => "member:read",
            Permission::MemberManage => "member:manage",
            Permission::ProjectRead => "project:read",
            Permission::ProjectCreate => "project:create",
            Permission::ProjectUpdate => "project:update",
            Permission::ProjectArchive => "project:archive",
            Permission::ProjectDelete => "project:delete",
            Permission::TaskRead => "task:read",
            Permission::TaskCreate => "task:create",
            Permission::TaskUpdate => "task:update",
            Permission::TaskExecute => "task:execute",
            Permission::LockRead => "lock:read",
            Permission::LockAcquire => "lock:acquire",
            Permission::LockRelease => "lock:release",
        }
    }

    fn is_read(self) -> bool {
        matches!(
            self,
            Permission::WorkspaceRead
                | Permission::MemberRead
                | Permission::ProjectRead
                | Permission::TaskRead
                | Permission::LockRead
        )
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `role` grants `permission`.
pub fn grants(role: Role, permission: Permission) -> bool {
    use Permission::*;
    match role {
        Role::Owner => true,
        Role::Admin => permission != WorkspaceDelete,
        Role::Member => {
            permission.is_read()
                || matches!(
                    permission,
                    ProjectCreate
                        | ProjectUpdate
                        | TaskCreate
                        | TaskUpdate
                        | TaskExecute
                        | LockAcquire
                        | LockRelease
                )
        }
        Role::Viewer => permission.is_read(),
    }
}

/// Checks `user`'s role in `workspace` and returns it.
///
/// `NotFound` if the workspace does not exist, `PermissionDenied` if the
/// user is not a member or the role is too weak.
pub async fn require(
    state: &StateManager,
    workspace: WorkspaceId,
    user: &UserId,
    permission: Permission,
) -> Result<Role> {
    state.workspace(workspace).await?;
    let role = state.role_of(workspace, user).await?;
    match role {
        Some(role) if grants(role, permission) => Ok(role),
        _ => {
            warn!(user = %user, workspace = %workspace, permission = %permission, "permission denied");
            Err(HeddleError::PermissionDenied {
                user: user.clone(),
                workspace,
                permission,
                role,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::ports::Mutation;
    use crate::state::Transaction;
    use rstest::rstest;

    #[rstest]
    #[case(Role::Viewer, Permission::TaskRead, true)]
    #[case(Role::Viewer, Permission::TaskCreate, false)]
    #[case(Role::Viewer, Permission::LockAcquire, false)]
    #[case(Role::Member, Permission::TaskCreate, true)]
    #[case(Role::Member, Permission::TaskExecute, true)]
    #[case(Role::Member, Permission::LockAcquire, true)]
    #[case(Role::Member, Permission::MemberManage, false)]
    #[case(Role::Member, Permission::ProjectArchive, false)]
    #[case(Role::Admin, Permission::MemberManage, true)]
    #[case(Role::Admin, Permission::ProjectDelete, true)]
    #[case(Role::Admin, Permission::WorkspaceDelete, false)]
    #[case(Role::Owner, Permission::WorkspaceDelete, true)]
    fn permission_matrix(#[case] role: Role, #[case] permission: Permission, #[case] allowed: bool) {
        assert_eq!(grants(role, permission), allowed);
    }

    #[tokio::test]
    async fn non_members_are_denied() {
        let (state, _) = fixtures::state_manager();
        let mut tx = Transaction::new("seed");
        tx.push(Mutation::InsertWorkspace(fixtures::workspace(1, "alice")))
            .push(Mutation::PutMember(fixtures::member(1, "alice", Role::Owner)))
            .push(Mutation::PutMember(fixtures::member(1, "bob", Role::Viewer)));
        state.commit(tx).await.unwrap();
        let ws = fixtures::ws_id(1);

        assert_eq!(
            require(&state, ws, &UserId::new("alice"), Permission::WorkspaceDelete).await.unwrap(),
            Role::Owner
        );
        let err = require(&state, ws, &UserId::new("bob"), Permission::TaskCreate).await.unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: Some(Role::Viewer), .. }));
        let err = require(&state, ws, &UserId::new("eve"), Permission::TaskRead).await.unwrap_err();
        assert!(matches!(err, HeddleError::PermissionDenied { role: None, .. }));
        let err = require(&state, fixtures::ws_id(2), &UserId::new("alice"), Permission::TaskRead)
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::NotFound { .. }));
    }
}
