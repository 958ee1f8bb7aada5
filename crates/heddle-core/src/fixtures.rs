//! Test fixtures shared by the unit tests of several modules.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, json};

use crate::domain::{
    EventId, Lifecycle, LockId, LockMode, LockRecord, Member, NewTask, Project, ProjectId, Role,
    TaskEvent, TaskEventKind, TaskId, TaskRecord, TaskStatus, UserId, Workspace, WorkspaceId,
};
use crate::impls::InMemoryStateStore;
use crate::ports::{FixedClock, Mutation, StateStore, StoreError, UlidGenerator};
use crate::state::StateManager;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// In-memory state manager driven by a clock that only moves when told to.
pub fn state_manager() -> (Arc<StateManager>, FixedClock) {
    let clock = FixedClock::new(t0());
    let state = StateManager::new(
        Arc::new(InMemoryStateStore::new()),
        Arc::new(clock.clone()),
        Arc::new(UlidGenerator::new(clock.clone())),
    );
    (Arc::new(state), clock)
}

pub fn ws_id(n: u128) -> WorkspaceId {
    WorkspaceId::from_u128(n)
}

pub fn proj_id(n: u128) -> ProjectId {
    ProjectId::from_u128(n)
}

pub fn task_id(n: u128) -> TaskId {
    TaskId::from_u128(n)
}

pub fn workspace(n: u128, owner: &str) -> Workspace {
    Workspace {
        id: ws_id(n),
        name: format!("ws-{n}"),
        description: None,
        owner: UserId::new(owner),
        status: Lifecycle::Active,
        settings: Map::new(),
        created_at: t0(),
        updated_at: t0(),
    }
}

pub fn member(ws: u128, user: &str, role: Role) -> Member {
    Member {
        workspace_id: ws_id(ws),
        user_id: UserId::new(user),
        role,
        joined_at: t0(),
    }
}

pub fn project(n: u128, ws: u128) -> Project {
    Project {
        id: proj_id(n),
        workspace_id: ws_id(ws),
        name: format!("proj-{n}"),
        description: None,
        status: Lifecycle::Active,
        created_by: UserId::new("alice"),
        metadata: Map::new(),
        created_at: t0(),
        updated_at: t0(),
    }
}

pub fn task(n: u128, project: &Project, deps: &[u128]) -> TaskRecord {
    TaskRecord::new(
        task_id(n),
        project.workspace_id,
        project.id,
        NewTask::new("echo").named(format!("t{n}")),
        5,
        deps.iter().copied().map(task_id).collect(),
        None,
        t0(),
    )
}

pub fn lock(n: u128, key: &str, holder: &str, mode: LockMode) -> LockRecord {
    LockRecord {
        lock_id: LockId::from_u128(n),
        resource_key: key.to_string(),
        holder: holder.into(),
        mode,
        workspace_id: None,
        project_id: None,
        acquired_at: t0(),
        expires_at: t0() + chrono::TimeDelta::seconds(60),
    }
}

pub fn event(seq: u64, task: &TaskRecord) -> TaskEvent {
    TaskEvent {
        id: EventId::from_u128(seq as u128),
        seq,
        kind: TaskEventKind::Created,
        task_id: task.id,
        workspace_id: task.workspace_id,
        project_id: task.project_id,
        status: TaskStatus::Waiting,
        actor: None,
        details: json!({}),
        timestamp: t0(),
    }
}

/// Behaviour every `StateStore` backend must share.
pub async fn exercise_store(store: &dyn StateStore) {
    let ws = workspace(1, "alice");
    let proj = project(10, 1);
    let t1 = task(100, &proj, &[]);
    let t2 = task(101, &proj, &[100]);

    store
        .commit(vec![
            Mutation::InsertWorkspace(ws.clone()),
            Mutation::PutMember(member(1, "alice", Role::Owner)),
            Mutation::InsertProject(proj.clone()),
            Mutation::InsertTask(t2.clone()),
            Mutation::InsertTask(t1.clone()),
            Mutation::AppendEvent(event(1, &t2)),
            Mutation::AppendEvent(event(2, &t1)),
        ])
        .await
        .unwrap();

    // insertion order is preserved
    let ids: Vec<_> = store.tasks(Some(proj.id)).await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![t2.id, t1.id]);
    assert_eq!(store.task(t1.id).await.unwrap(), Some(t1.clone()));
    assert_eq!(store.workspace(ws.id).await.unwrap(), Some(ws.clone()));
    assert_eq!(store.members(ws.id).await.unwrap().len(), 1);
    assert_eq!(store.projects(Some(ws.id)).await.unwrap(), vec![proj.clone()]);

    // a failing batch leaves nothing behind
    let mut running = t1.clone();
    running.status = TaskStatus::Ready;
    let err = store
        .commit(vec![
            Mutation::UpdateTask(running),
            Mutation::InsertTask(t1.clone()),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Duplicate { kind: "task", .. }), "{err:?}");
    assert_eq!(store.task(t1.id).await.unwrap().unwrap().status, TaskStatus::Waiting);

    // referential rules
    let orphan = task(200, &project(99, 1), &[]);
    let err = store.commit(vec![Mutation::InsertTask(orphan)]).await.unwrap_err();
    assert!(matches!(err, StoreError::DanglingReference { target: "project", .. }), "{err:?}");

    let err = store
        .commit(vec![Mutation::UpdateTask(task(300, &proj, &[]))])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Missing { kind: "task", .. }), "{err:?}");

    let err = store
        .commit(vec![Mutation::InsertProject(project(11, 2))])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DanglingReference { target: "workspace", .. }), "{err:?}");

    // locks
    let shared_a = lock(1, "repo", "h1", LockMode::Shared);
    let shared_b = lock(2, "repo", "h2", LockMode::Shared);
    store
        .commit(vec![
            Mutation::InsertLock(shared_a.clone()),
            Mutation::InsertLock(shared_b.clone()),
        ])
        .await
        .unwrap();
    store.commit(vec![Mutation::DeleteLock(shared_a.lock_id)]).await.unwrap();
    assert_eq!(store.locks().await.unwrap(), vec![shared_b.clone()]);

    // outbox
    assert_eq!(store.last_event_seq().await.unwrap(), 2);
    let pending = store.pending_events(10).await.unwrap();
    assert_eq!(pending.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    store.commit(vec![Mutation::AckEvents(vec![1])]).await.unwrap();
    let pending = store.pending_events(10).await.unwrap();
    assert_eq!(pending.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2]);
    assert_eq!(store.last_event_seq().await.unwrap(), 2);

    // deleting a workspace cascades to members and projects, not tasks
    store.commit(vec![Mutation::DeleteWorkspace(ws.id)]).await.unwrap();
    assert_eq!(store.workspace(ws.id).await.unwrap(), None);
    assert!(store.members(ws.id).await.unwrap().is_empty());
    assert_eq!(store.project(proj.id).await.unwrap(), None);
    assert_eq!(store.tasks(Some(proj.id)).await.unwrap().len(), 2);
}
