//! StateManager - すべての書き込みと読み込みの窓口
//!
//! TaskQueue / LockManager / WorkspaceManager / ProjectManager / EventPublisher は
//! `Arc<StateManager>` を共有し、StateStore には直接触らない。
//! 書き込みは `Transaction` に積んでから `commit` する。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::{
    Member, Project, ProjectId, Role, TaskId, TaskRecord, UserId, Workspace, WorkspaceId,
};
use crate::error::{Entity, HeddleError, Result};
use crate::ports::{Clock, IdGenerator, Mutation, StateStore};

/// Ordered batch of mutations committed all-or-nothing.
#[derive(Debug)]
pub struct Transaction {
    label: &'static str,
    ops: Vec<Mutation>,
}

impl Transaction {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.ops.push(mutation);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub struct StateManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ids(&self) -> &dyn IdGenerator {
        &*self.ids
    }

    pub fn store(&self) -> &dyn StateStore {
        &*self.store
    }

    /// Commits the batch. On failure nothing of it is visible and the store
    /// error surfaces unchanged inside `HeddleError::Transaction`.
    pub async fn commit(&self, tx: Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let label = tx.label;
        let size = tx.ops.len();
        let ops: Vec<&'static str> = tx.ops.iter().map(Mutation::label).collect();
        match self.store.commit(tx.ops).await {
            Ok(()) => {
                debug!(tx = label, mutations = size, ops = ?ops, "transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(tx = label, mutations = size, error = %err, "transaction rolled back");
                Err(HeddleError::Transaction(err))
            }
        }
    }

    pub async fn find_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.store.task(id).await?)
    }

    pub async fn task(&self, id: TaskId) -> Result<TaskRecord> {
        self.find_task(id)
            .await?
            .ok_or_else(|| HeddleError::not_found(Entity::Task, id))
    }

    pub async fn tasks(&self, project: ProjectId) -> Result<Vec<TaskRecord>> {
        Ok(self.store.tasks(Some(project)).await?)
    }

    pub async fn workspace(&self, id: WorkspaceId) -> Result<Workspace> {
        self.store
            .workspace(id)
            .await?
            .ok_or_else(|| HeddleError::not_found(Entity::Workspace, id))
    }

    pub async fn project(&self, id: ProjectId) -> Result<Project> {
        self.store
            .project(id)
            .await?
            .ok_or_else(|| HeddleError::not_found(Entity::Project, id))
    }

    pub async fn members(&self, workspace: WorkspaceId) -> Result<Vec<Member>> {
        Ok(self.store.members(workspace).await?)
    }

    /// Role of `user` in `workspace`, `None` when not a member.
    pub async fn role_of(&self, workspace: WorkspaceId, user: &UserId) -> Result<Option<Role>> {
        Ok(self
            .members(workspace)
            .await?
            .into_iter()
            .find(|m| &m.user_id == user)
            .map(|m| m.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::ports::StoreError;

    fn manager() -> Arc<StateManager> {
        fixtures::state_manager().0
    }

    #[tokio::test]
    async fn failed_commit_is_reported_as_transaction_error() {
        let state = manager();
        let mut tx = Transaction::new("test");
        tx.push(Mutation::InsertWorkspace(fixtures::workspace(1, "alice")))
            .push(Mutation::InsertProject(fixtures::project(10, 2)));

        let err = state.commit(tx).await.unwrap_err();

        assert!(matches!(
            err,
            HeddleError::Transaction(StoreError::DanglingReference { .. })
        ));
        assert!(state.workspace(fixtures::ws_id(1)).await.is_err());
    }

    #[tokio::test]
    async fn role_lookup() {
        let state = manager();
        let mut tx = Transaction::new("seed");
        tx.push(Mutation::InsertWorkspace(fixtures::workspace(1, "alice")))
            .push(Mutation::PutMember(fixtures::member(1, "alice", Role::Owner)));
        state.commit(tx).await.unwrap();

        let ws = fixtures::ws_id(1);
        assert_eq!(state.role_of(ws, &UserId::new("alice")).await.unwrap(), Some(Role::Owner));
        assert_eq!(state.role_of(ws, &UserId::new("mallory")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let state = manager();
        let err = state.task(fixtures::task_id(1)).await.unwrap_err();
        assert!(matches!(err, HeddleError::NotFound { entity: Entity::Task, .. }));
    }
}
