//! Domain model (IDs, task records, locks, tenancy, events).

pub mod events;
pub mod ids;
pub mod lock;
pub mod state;
pub mod task;
pub mod tenancy;

pub use events::{TaskEvent, TaskEventKind};
pub use ids::{
    EventId, HolderId, Id, IdMarker, LockId, ParseIdError, ProjectId, TaskId, UserId, WorkspaceId,
};
pub use lock::{LockMode, LockRecord};
pub use state::TaskStatus;
pub use task::{DependencyRef, NewTask, TaskRecord, TaskType};
pub use tenancy::{Lifecycle, Member, Patch, Project, Role, Workspace};
