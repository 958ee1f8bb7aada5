//! SqliteStateStore - SQLite を使った永続化された正本
//!
//! 各テーブルは検索用のキー列と、レコード全体を JSON で持つ `body` 列からなる。
//! commit は一つの SQLite トランザクションで実行し、途中のエラーで
//! Transaction が drop されるとロールバックされる。
//!
//! ## Schema versions
//! - Version 1: workspaces, workspace_members, projects, tasks, locks, task_events

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Params, ToSql, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::domain::{
    LockRecord, Member, Project, ProjectId, TaskEvent, TaskId, TaskRecord, Workspace, WorkspaceId,
};
use crate::ports::{Mutation, StateStore, StoreError};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workspace_members (
    workspace_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (workspace_id, user_id),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    body TEXT NOT NULL,
    FOREIGN KEY (workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

-- tasks outlive their project; the reference is checked on insert only
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    status TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, status);

CREATE TABLE IF NOT EXISTS locks (
    id TEXT PRIMARY KEY,
    resource_key TEXT NOT NULL,
    holder TEXT NOT NULL,
    workspace_id TEXT,
    project_id TEXT,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_locks_resource ON locks(resource_key);

CREATE TABLE IF NOT EXISTS task_events (
    seq INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_events_pending ON task_events(delivered, seq);
"#;

/// SqliteStateStore は SQLite 上の正本
///
/// rusqlite の Connection は同期 API なので、すべての呼び出しを
/// spawn_blocking に逃がす。
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens (or creates) the database file and migrates it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", dir.display())))?;
        }

        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(backend)?;
        info!(path = %path.display(), "opened sqlite state store");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .map_err(backend)?;
        if version < CURRENT_SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![CURRENT_SCHEMA_VERSION],
            )
            .map_err(backend)?;
            info!(from = version, to = CURRENT_SCHEMA_VERSION, "migrated state store schema");
        } else {
            debug!(version, "state store schema is up to date");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection lock poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Runs a query whose first column is a JSON body.
fn load<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(backend)?;
    rows.map(|body| decode(&body.map_err(backend)?)).collect()
}

fn exists(tx: &Transaction<'_>, sql: &str, key: &dyn ToSql) -> Result<bool, StoreError> {
    tx.query_row(sql, params![key], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
        .map_err(backend)
}

fn apply(tx: &Transaction<'_>, mutation: Mutation) -> Result<(), StoreError> {
    const TASK_EXISTS: &str = "SELECT 1 FROM tasks WHERE id = ?1";
    const LOCK_EXISTS: &str = "SELECT 1 FROM locks WHERE id = ?1";
    const WORKSPACE_EXISTS: &str = "SELECT 1 FROM workspaces WHERE id = ?1";
    const PROJECT_EXISTS: &str = "SELECT 1 FROM projects WHERE id = ?1";

    match mutation {
        Mutation::InsertTask(task) => {
            let id = task.id.to_string();
            if exists(tx, TASK_EXISTS, &id)? {
                return Err(StoreError::duplicate("task", id));
            }
            if !exists(tx, PROJECT_EXISTS, &task.project_id.to_string())? {
                return Err(StoreError::dangling("task", id, "project", task.project_id));
            }
            tx.execute(
                "INSERT INTO tasks (id, workspace_id, project_id, status, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    task.workspace_id.to_string(),
                    task.project_id.to_string(),
                    task.status.as_str(),
                    encode(&task)?
                ],
            )
            .map_err(backend)?;
        }
        Mutation::UpdateTask(task) => {
            let changed = tx
                .execute(
                    "UPDATE tasks SET status = ?2, body = ?3 WHERE id = ?1",
                    params![task.id.to_string(), task.status.as_str(), encode(&task)?],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("task", task.id));
            }
        }

        Mutation::InsertLock(lock) => {
            let id = lock.lock_id.to_string();
            if exists(tx, LOCK_EXISTS, &id)? {
                return Err(StoreError::duplicate("lock", id));
            }
            if let Some(ws) = lock.workspace_id
                && !exists(tx, WORKSPACE_EXISTS, &ws.to_string())?
            {
                return Err(StoreError::dangling("lock", id, "workspace", ws));
            }
            if let Some(project) = lock.project_id
                && !exists(tx, PROJECT_EXISTS, &project.to_string())?
            {
                return Err(StoreError::dangling("lock", id, "project", project));
            }
            tx.execute(
                "INSERT INTO locks (id, resource_key, holder, workspace_id, project_id, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    lock.resource_key,
                    lock.holder.as_str(),
                    lock.workspace_id.map(|ws| ws.to_string()),
                    lock.project_id.map(|p| p.to_string()),
                    encode(&lock)?
                ],
            )
            .map_err(backend)?;
        }
        Mutation::UpdateLock(lock) => {
            let changed = tx
                .execute(
                    "UPDATE locks SET holder = ?2, body = ?3 WHERE id = ?1",
                    params![lock.lock_id.to_string(), lock.holder.as_str(), encode(&lock)?],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("lock", lock.lock_id));
            }
        }
        Mutation::DeleteLock(id) => {
            let changed = tx
                .execute("DELETE FROM locks WHERE id = ?1", params![id.to_string()])
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("lock", id));
            }
        }

        Mutation::InsertWorkspace(ws) => {
            let id = ws.id.to_string();
            if exists(tx, WORKSPACE_EXISTS, &id)? {
                return Err(StoreError::duplicate("workspace", id));
            }
            tx.execute(
                "INSERT INTO workspaces (id, body) VALUES (?1, ?2)",
                params![id, encode(&ws)?],
            )
            .map_err(backend)?;
        }
        Mutation::UpdateWorkspace(ws) => {
            let changed = tx
                .execute(
                    "UPDATE workspaces SET body = ?2 WHERE id = ?1",
                    params![ws.id.to_string(), encode(&ws)?],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("workspace", ws.id));
            }
        }
        Mutation::DeleteWorkspace(id) => {
            let key = id.to_string();
            tx.execute("DELETE FROM workspace_members WHERE workspace_id = ?1", params![key])
                .map_err(backend)?;
            tx.execute("DELETE FROM projects WHERE workspace_id = ?1", params![key])
                .map_err(backend)?;
            let changed = tx
                .execute("DELETE FROM workspaces WHERE id = ?1", params![key])
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("workspace", id));
            }
        }

        Mutation::PutMember(member) => {
            let ws = member.workspace_id.to_string();
            if !exists(tx, WORKSPACE_EXISTS, &ws)? {
                return Err(StoreError::dangling(
                    "member",
                    &member.user_id,
                    "workspace",
                    member.workspace_id,
                ));
            }
            tx.execute(
                "INSERT INTO workspace_members (workspace_id, user_id, role, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, user_id) DO UPDATE SET role = excluded.role, body = excluded.body",
                params![ws, member.user_id.as_str(), member.role.as_str(), encode(&member)?],
            )
            .map_err(backend)?;
        }
        Mutation::RemoveMember {
            workspace_id,
            user_id,
        } => {
            let changed = tx
                .execute(
                    "DELETE FROM workspace_members WHERE workspace_id = ?1 AND user_id = ?2",
                    params![workspace_id.to_string(), user_id.as_str()],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("member", user_id));
            }
        }

        Mutation::InsertProject(project) => {
            let id = project.id.to_string();
            if exists(tx, PROJECT_EXISTS, &id)? {
                return Err(StoreError::duplicate("project", id));
            }
            if !exists(tx, WORKSPACE_EXISTS, &project.workspace_id.to_string())? {
                return Err(StoreError::dangling(
                    "project",
                    id,
                    "workspace",
                    project.workspace_id,
                ));
            }
            tx.execute(
                "INSERT INTO projects (id, workspace_id, body) VALUES (?1, ?2, ?3)",
                params![id, project.workspace_id.to_string(), encode(&project)?],
            )
            .map_err(backend)?;
        }
        Mutation::UpdateProject(project) => {
            let changed = tx
                .execute(
                    "UPDATE projects SET body = ?2 WHERE id = ?1",
                    params![project.id.to_string(), encode(&project)?],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::missing("project", project.id));
            }
        }
        Mutation::DeleteProject(id) => {
            let key = id.to_string();
            let workspace: Option<String> = tx
                .query_row(
                    "SELECT workspace_id FROM projects WHERE id = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            let workspace = workspace.ok_or_else(|| StoreError::missing("project", id))?;
            if !exists(tx, WORKSPACE_EXISTS, &workspace)? {
                return Err(StoreError::dangling("project", id, "workspace", workspace));
            }
            tx.execute("DELETE FROM projects WHERE id = ?1", params![key])
                .map_err(backend)?;
        }

        Mutation::AppendEvent(event) => {
            let seq = event.seq as i64;
            if exists(tx, "SELECT 1 FROM task_events WHERE seq = ?1", &seq)? {
                return Err(StoreError::duplicate("event", event.seq));
            }
            tx.execute(
                "INSERT INTO task_events (seq, task_id, project_id, delivered, body) VALUES (?1, ?2, ?3, 0, ?4)",
                params![
                    seq,
                    event.task_id.to_string(),
                    event.project_id.to_string(),
                    encode(&event)?
                ],
            )
            .map_err(backend)?;
        }
        Mutation::AckEvents(seqs) => {
            for seq in seqs {
                let changed = tx
                    .execute(
                        "UPDATE task_events SET delivered = 1 WHERE seq = ?1",
                        params![seq as i64],
                    )
                    .map_err(backend)?;
                if changed == 0 {
                    return Err(StoreError::missing("event", seq));
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        let size = batch.len();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            for mutation in batch {
                apply(&tx, mutation)?;
            }
            tx.commit().map_err(backend)
        })
        .await?;
        debug!(mutations = size, "committed batch");
        Ok(())
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.with_conn(move |conn| {
            load(conn, "SELECT body FROM tasks WHERE id = ?1", params![id.to_string()])
                .map(|rows| rows.into_iter().next())
        })
        .await
    }

    async fn tasks(&self, project: Option<ProjectId>) -> Result<Vec<TaskRecord>, StoreError> {
        self.with_conn(move |conn| match project {
            Some(project) => load(
                conn,
                "SELECT body FROM tasks WHERE project_id = ?1 ORDER BY rowid",
                params![project.to_string()],
            ),
            None => load(conn, "SELECT body FROM tasks ORDER BY rowid", []),
        })
        .await
    }

    async fn locks(&self) -> Result<Vec<LockRecord>, StoreError> {
        self.with_conn(|conn| load(conn, "SELECT body FROM locks ORDER BY id", []))
            .await
    }

    async fn workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        self.with_conn(move |conn| {
            load(conn, "SELECT body FROM workspaces WHERE id = ?1", params![id.to_string()])
                .map(|rows| rows.into_iter().next())
        })
        .await
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        self.with_conn(|conn| load(conn, "SELECT body FROM workspaces ORDER BY id", []))
            .await
    }

    async fn members(&self, workspace: WorkspaceId) -> Result<Vec<Member>, StoreError> {
        self.with_conn(move |conn| {
            load(
                conn,
                "SELECT body FROM workspace_members WHERE workspace_id = ?1 ORDER BY user_id",
                params![workspace.to_string()],
            )
        })
        .await
    }

    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        self.with_conn(move |conn| {
            load(conn, "SELECT body FROM projects WHERE id = ?1", params![id.to_string()])
                .map(|rows| rows.into_iter().next())
        })
        .await
    }

    async fn projects(&self, workspace: Option<WorkspaceId>) -> Result<Vec<Project>, StoreError> {
        self.with_conn(move |conn| match workspace {
            Some(ws) => load(
                conn,
                "SELECT body FROM projects WHERE workspace_id = ?1 ORDER BY id",
                params![ws.to_string()],
            ),
            None => load(conn, "SELECT body FROM projects ORDER BY id", []),
        })
        .await
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<TaskEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            load(
                conn,
                "SELECT body FROM task_events WHERE delivered = 0 ORDER BY seq LIMIT ?1",
                params![limit],
            )
        })
        .await
    }

    async fn last_event_seq(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM task_events", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|seq| seq as u64)
            .map_err(backend)
        })
        .await
    }
}
