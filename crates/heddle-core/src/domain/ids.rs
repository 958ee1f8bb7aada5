//! Domain identifiers (strongly-typed IDs).
//!
//! Generated identifiers are ULIDs wrapped in a phantom-typed `Id<T>`, so a
//! `TaskId` can never be passed where a `ProjectId` is expected. ULIDs sort by
//! creation time and can be minted on any node without coordination.
//!
//! Caller-supplied identities (users, lock holders) are plain strings and use
//! their own newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID family.
///
/// Provides the prefix used by `Display` (`"task-"`, `"proj-"`, ...).
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` only exists at compile time; `Id<T>` is exactly as large as a `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Deterministic id from a raw value. Handy in tests and fixtures.
    pub fn from_u128(value: u128) -> Self {
        Self::from_ulid(Ulid(value))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when an id string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected} id: {input:?}")]
pub struct ParseIdError {
    pub expected: &'static str,
    pub input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed form (`task-01H...`) and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                expected: T::prefix().trim_end_matches('-'),
                input: s.to_string(),
            })
    }
}

// ========================================
// マーカー型
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Workspace {}

impl IdMarker for Workspace {
    fn prefix() -> &'static str {
        "ws-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Project {}

impl IdMarker for Project {
    fn prefix() -> &'static str {
        "proj-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lock {}

impl IdMarker for Lock {
    fn prefix() -> &'static str {
        "lock-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "evt-"
    }
}

/// Identifier of a Task (unit of scheduled work).
pub type TaskId = Id<Task>;

/// Identifier of a Workspace (tenant boundary).
pub type WorkspaceId = Id<Workspace>;

/// Identifier of a Project (scope for tasks and locks inside a workspace).
pub type ProjectId = Id<Project>;

/// Identifier of a single lease grant.
pub type LockId = Id<Lock>;

/// Identifier of an emitted task event.
pub type EventId = Id<Event>;

// ========================================
// Caller-supplied identities
// ========================================

/// Identity of a human or service account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity that owns a lease: either a user or a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for HolderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HolderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&UserId> for HolderId {
    fn from(user: &UserId) -> Self {
        Self(user.0.clone())
    }
}

impl From<TaskId> for HolderId {
    fn from(task: TaskId) -> Self {
        Self(task.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_family_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let project = ProjectId::from_ulid(Ulid::new());
        let workspace = WorkspaceId::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(project.to_string().starts_with("proj-"));
        assert!(workspace.to_string().starts_with("ws-"));
        // let _: ProjectId = task; // <- does not compile
    }

    #[test]
    fn ids_parse_with_or_without_prefix() {
        let id = TaskId::from_ulid(Ulid::new());

        let prefixed: TaskId = id.to_string().parse().unwrap();
        let bare: TaskId = id.as_ulid().to_string().parse().unwrap();

        assert_eq!(prefixed, id);
        assert_eq!(bare, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "task-not-a-ulid".parse::<TaskId>().unwrap_err();
        assert_eq!(err.expected, "task");
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_plain_ulid_strings() {
        let id = ProjectId::from_ulid(Ulid::new());

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));

        let back: ProjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn task_holder_uses_display_form() {
        let task = TaskId::from_u128(42);
        let holder = HolderId::from(task);
        assert_eq!(holder.as_str(), task.to_string());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<LockId>(), 16);
    }
}
