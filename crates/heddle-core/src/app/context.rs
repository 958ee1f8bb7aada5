use crate::domain::{HolderId, ProjectId, UserId, WorkspaceId};

/// Who is calling, and for which project. Passed to every orchestrator
/// operation instead of any ambient "current workspace".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub actor: UserId,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
}

impl Context {
    pub fn new(actor: impl Into<String>, workspace_id: WorkspaceId, project_id: ProjectId) -> Self {
        Self {
            actor: UserId::new(actor),
            workspace_id,
            project_id,
        }
    }

    /// Lock holder identity of the actor.
    pub fn holder(&self) -> HolderId {
        HolderId::from(&self.actor)
    }
}
