use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{
    HolderId, Lifecycle, LockMode, Role, TaskId, TaskStatus, UserId, WorkspaceId,
};
use crate::ports::state_store::StoreError;
use crate::tenancy::Permission;

pub type Result<T, E = HeddleError> = std::result::Result<T, E>;

/// Kind of record an error points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Task,
    Lock,
    Workspace,
    Project,
    Member,
    Service,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Task => "task",
            Entity::Lock => "lock",
            Entity::Workspace => "workspace",
            Entity::Project => "project",
            Entity::Member => "member",
            Entity::Service => "service",
        })
    }
}

/// Operational classification, used by callers to decide whether to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Try again later (lock held by someone else).
    Transient,
    /// The request itself is wrong; repeating it changes nothing.
    Permanent,
    /// The backing store failed.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum HeddleError {
    #[error("dependency cycle: {}", join(.path, " -> "))]
    Cycle { path: Vec<TaskId> },

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: String },

    #[error("{entity} {id} is {status}, expected {required}")]
    WrongLifecycle {
        entity: Entity,
        id: String,
        status: Lifecycle,
        required: Lifecycle,
    },

    #[error("task {task}: invalid transition {from} -> {to}")]
    InvalidStateTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("resource {resource_key:?} is locked {mode} by {holder} for another {remaining:?}")]
    LockConflict {
        resource_key: String,
        holder: HolderId,
        mode: LockMode,
        remaining: Duration,
    },

    #[error("{holder} does not hold {resource_key:?} (held by: {})", join(.current, ", "))]
    NotHolder {
        resource_key: String,
        holder: HolderId,
        current: Vec<HolderId>,
    },

    #[error("{user} lacks {permission} in workspace {workspace} (role: {})", .role.map_or("none", Role::as_str))]
    PermissionDenied {
        user: UserId,
        workspace: WorkspaceId,
        permission: Permission,
        role: Option<Role>,
    },

    #[error("task {task} exhausted its retries ({attempts}/{max})")]
    RetryExhausted { task: TaskId, attempts: u32, max: u32 },

    #[error("transaction rolled back: {0}")]
    Transaction(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl HeddleError {
    pub fn not_found(entity: Entity, id: impl ToString) -> Self {
        HeddleError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Lock conflicts clear up on their own; everything else needs a different
    /// request. "No task ready" is not an error at all (`Ok(None)`).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HeddleError::LockConflict { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            HeddleError::LockConflict { .. } => ErrorClass::Transient,
            HeddleError::Transaction(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::Permanent,
        }
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_the_path() {
        let a = TaskId::from_u128(1);
        let b = TaskId::from_u128(2);
        let err = HeddleError::Cycle {
            path: vec![a, b, a],
        };
        assert_eq!(err.to_string(), format!("dependency cycle: {a} -> {b} -> {a}"));
    }

    #[test]
    fn only_lock_conflicts_are_recoverable() {
        let conflict = HeddleError::LockConflict {
            resource_key: "R".into(),
            holder: "h1".into(),
            mode: LockMode::Exclusive,
            remaining: Duration::from_secs(3),
        };
        let not_holder = HeddleError::NotHolder {
            resource_key: "R".into(),
            holder: "h2".into(),
            current: vec!["h1".into()],
        };

        assert!(conflict.is_recoverable());
        assert_eq!(conflict.class(), ErrorClass::Transient);
        assert!(!not_holder.is_recoverable());
        assert_eq!(not_holder.class(), ErrorClass::Permanent);
    }

    #[test]
    fn store_failures_are_infrastructure() {
        let err = HeddleError::from(StoreError::Backend("disk full".into()));
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        assert!(err.to_string().contains("disk full"));
    }
}
