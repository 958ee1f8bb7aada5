//! TaskQueue - タスクのライフサイクル管理
//!
//! 永続レコード（StateManager）が正、DependencyGraph はプロジェクトごとの
//! 射影。書き込みは常に「ストアに commit → グラフに反映」の順で行い、
//! グラフ側でずれが見つかったら stale にして次のアクセスで作り直す。
//!
//! 1 本の Mutex の中で stage → commit するので、イベントの seq 順と
//! commit 順は一致し、同じタスクが二度払い出されることもない。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{
    DependencyRef, NewTask, ProjectId, TaskEventKind, TaskId, TaskRecord, TaskStatus, UserId,
    WorkspaceId,
};
use crate::error::{HeddleError, Result};
use crate::events::EventPublisher;
use crate::observability::QueueCounts;
use crate::ports::Mutation;
use crate::scheduler::dependency::{DependencyGraph, GraphStats, NewNode, NodeState};
use crate::scheduler::retry::RetryPolicy;
use crate::state::{StateManager, Transaction};

pub const DEFAULT_PRIORITY: i32 = 5;

/// Result of `complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub task: TaskRecord,
    /// Dependents that became ready, best first.
    pub unblocked: Vec<TaskId>,
}

#[derive(Default)]
struct QueueState {
    graphs: HashMap<ProjectId, DependencyGraph>,
    /// Projections that may disagree with the store.
    stale: HashSet<ProjectId>,
}

pub struct TaskQueue {
    state: Arc<StateManager>,
    publisher: Arc<EventPublisher>,
    inner: Mutex<QueueState>,
    default_priority: i32,
    allow_forward_declarations: bool,
}

impl TaskQueue {
    pub fn new(state: Arc<StateManager>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            state,
            publisher,
            inner: Mutex::new(QueueState::default()),
            default_priority: DEFAULT_PRIORITY,
            allow_forward_declarations: false,
        }
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_forward_declarations(mut self, allow: bool) -> Self {
        self.allow_forward_declarations = allow;
        self
    }

    /// Loads the project's graph if it is missing or stale.
    ///
    /// Records stored as `waiting` whose dependencies are all done (a crash
    /// between two writes) are promoted to `ready` on the way.
    async fn ensure_loaded(&self, inner: &mut QueueState, project: ProjectId) -> Result<()> {
        if inner.graphs.contains_key(&project) && !inner.stale.contains(&project) {
            return Ok(());
        }

        let records = self.state.tasks(project).await?;
        let graph = DependencyGraph::restore(&records, self.allow_forward_declarations);

        let now = self.state.now();
        let mut tx = Transaction::new("repair_readiness");
        for record in &records {
            match (record.status, graph.state(record.id)) {
                (TaskStatus::Waiting, Some(NodeState::Ready)) => {
                    let mut record = record.clone();
                    record.mark_ready(now)?;
                    tx.push(Mutation::UpdateTask(record));
                }
                (TaskStatus::Ready, Some(NodeState::Waiting)) => {
                    warn!(task = %record.id, "stored as ready but dependencies are not done");
                }
                _ => {}
            }
        }
        if !tx.is_empty() {
            info!(project = %project, repaired = tx.len(), "promoted tasks whose dependencies were already done");
            self.state.commit(tx).await?;
        }

        info!(project = %project, tasks = records.len(), "dependency graph loaded");
        inner.graphs.insert(project, graph);
        inner.stale.remove(&project);
        Ok(())
    }

    fn graph<'a>(&self, inner: &'a mut QueueState, project: ProjectId) -> &'a mut DependencyGraph {
        let allow = self.allow_forward_declarations;
        inner
            .graphs
            .entry(project)
            .or_insert_with(|| DependencyGraph::new().with_forward_declarations(allow))
    }

    fn mark_stale(inner: &mut QueueState, project: ProjectId, reason: &str) {
        warn!(project = %project, reason, "dependency graph marked stale");
        inner.stale.insert(project);
    }

    /// Registers a batch atomically and returns the ids in batch order.
    ///
    /// Members may reference each other with [`DependencyRef::Batch`]; every
    /// other dependency must be an existing task of the same project.
    pub async fn register(
        &self,
        workspace: WorkspaceId,
        project: ProjectId,
        actor: Option<&UserId>,
        tasks: Vec<NewTask>,
    ) -> Result<Vec<TaskId>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner, project).await?;

        let ids: Vec<TaskId> = tasks
            .iter()
            .map(|t| t.id.unwrap_or_else(|| self.state.ids().next()))
            .collect();
        let resolved = resolve_batch(&ids, &tasks)?;

        // ids that live outside this project's graph
        let batch: HashSet<TaskId> = ids.iter().copied().collect();
        let graph = self.graph(&mut inner, project);
        let external: Vec<(TaskId, TaskId)> = ids
            .iter()
            .zip(&resolved)
            .flat_map(|(task, deps)| deps.iter().map(move |dep| (*task, *dep)))
            .filter(|(_, dep)| !batch.contains(dep) && !graph.contains(*dep))
            .collect();
        for (task, dependency) in external {
            if let Some(other) = self.state.find_task(dependency).await?
                && other.project_id != project
            {
                warn!(task = %task, dependency = %dependency, "dependency belongs to another project");
                return Err(HeddleError::UnknownDependency { task, dependency });
            }
        }

        let now = self.state.now();
        let nodes: Vec<NewNode> = tasks
            .iter()
            .zip(ids.iter().zip(&resolved))
            .map(|(request, (id, deps))| NewNode {
                id: *id,
                priority: request.priority.unwrap_or(self.default_priority),
                created_at: now,
                dependencies: deps.clone(),
            })
            .collect();

        let graph = self.graph(&mut inner, project);
        if let Err(err) = graph.check_batch(&nodes) {
            warn!(project = %project, error = %err, "task batch rejected");
            return Err(err);
        }
        let ready: Vec<bool> = resolved
            .iter()
            .map(|deps| deps.iter().all(|d| graph.state(*d) == Some(NodeState::Done)))
            .collect();

        let mut tx = Transaction::new("register_tasks");
        for ((request, node), ready) in tasks.into_iter().zip(&nodes).zip(ready) {
            let mut record = TaskRecord::new(
                node.id,
                workspace,
                project,
                request,
                node.priority,
                node.dependencies.clone(),
                actor.cloned(),
                now,
            );
            if ready {
                record.mark_ready(now)?;
            }
            let details = json!({
                "name": record.name,
                "task_type": record.task_type,
                "priority": record.priority,
                "dependencies": record.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            self.publisher
                .stage(&mut tx, TaskEventKind::Created, &record, actor, details);
            tx.push(Mutation::InsertTask(record));
        }
        self.state.commit(tx).await?;

        let graph = self.graph(&mut inner, project);
        if let Err(err) = graph.add_batch(&nodes) {
            Self::mark_stale(&mut inner, project, &err.to_string());
        }
        drop(inner);

        info!(project = %project, count = ids.len(), "tasks registered");
        self.publisher.notify();
        Ok(ids)
    }

    /// Takes the best ready task of the project and marks it running.
    ///
    /// `Ok(None)` when nothing is ready.
    pub async fn get_next(
        &self,
        project: ProjectId,
        actor: Option<&UserId>,
    ) -> Result<Option<TaskRecord>> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner, project).await?;

        let Some(id) = self.graph(&mut inner, project).first_ready() else {
            return Ok(None);
        };

        let mut record = self.state.task(id).await?;
        if let Err(err) = record.start_attempt(self.state.now()) {
            Self::mark_stale(&mut inner, project, "ready node is not ready in the store");
            return Err(err);
        }

        let mut tx = Transaction::new("dispatch_task");
        tx.push(Mutation::UpdateTask(record.clone()));
        self.publisher.stage(
            &mut tx,
            TaskEventKind::Started,
            &record,
            actor,
            json!({ "attempt": record.attempts }),
        );
        self.state.commit(tx).await?;

        if let Err(err) = self.graph(&mut inner, project).mark_dispatched(id) {
            Self::mark_stale(&mut inner, project, &err.to_string());
        }
        drop(inner);

        info!(task = %id, attempt = record.attempts, "task started");
        self.publisher.notify();
        Ok(Some(record))
    }

    /// running -> done. Dependents whose last dependency this was become
    /// ready in the same transaction.
    pub async fn complete(
        &self,
        id: TaskId,
        result: Value,
        actor: Option<&UserId>,
    ) -> Result<Completion> {
        let mut inner = self.inner.lock().await;
        let mut record = self.state.task(id).await?;
        let project = record.project_id;
        self.ensure_loaded(&mut inner, project).await?;

        let now = self.state.now();
        record.mark_done(result.clone(), now)?;

        let unblocked = self.graph(&mut inner, project).would_unblock(id);
        let mut tx = Transaction::new("complete_task");
        tx.push(Mutation::UpdateTask(record.clone()));
        self.publisher.stage(
            &mut tx,
            TaskEventKind::Completed,
            &record,
            actor,
            json!({
                "result": result,
                "unblocked": unblocked.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
        );
        for dependent in &unblocked {
            let mut next = self.state.task(*dependent).await?;
            if let Err(err) = next.mark_ready(now) {
                Self::mark_stale(&mut inner, project, "waiting node is not waiting in the store");
                return Err(err);
            }
            tx.push(Mutation::UpdateTask(next));
        }
        self.state.commit(tx).await?;

        match self.graph(&mut inner, project).mark_complete(id) {
            Ok(promoted) if promoted == unblocked => {}
            Ok(_) => Self::mark_stale(&mut inner, project, "unblocked set changed during commit"),
            Err(err) => Self::mark_stale(&mut inner, project, &err.to_string()),
        }
        drop(inner);

        info!(task = %id, unblocked = unblocked.len(), "task completed");
        self.publisher.notify();
        Ok(Completion {
            task: record,
            unblocked,
        })
    }

    /// running -> failed. Dependents keep waiting.
    pub async fn fail(
        &self,
        id: TaskId,
        error: impl Into<String>,
        actor: Option<&UserId>,
    ) -> Result<TaskRecord> {
        let error = error.into();
        let mut inner = self.inner.lock().await;
        let mut record = self.state.task(id).await?;
        let project = record.project_id;
        self.ensure_loaded(&mut inner, project).await?;

        record.mark_failed(error.clone(), self.state.now())?;
        let mut tx = Transaction::new("fail_task");
        tx.push(Mutation::UpdateTask(record.clone()));
        self.publisher.stage(
            &mut tx,
            TaskEventKind::Failed,
            &record,
            actor,
            json!({ "error": error, "attempt": record.attempts }),
        );
        self.state.commit(tx).await?;

        if let Err(err) = self.graph(&mut inner, project).mark_blocked(id) {
            Self::mark_stale(&mut inner, project, &err.to_string());
        }
        drop(inner);

        info!(task = %id, attempt = record.attempts, error = %error, "task failed");
        self.publisher.notify();
        Ok(record)
    }

    /// waiting / ready / running -> cancelled. Dependents stay blocked, as
    /// after a failure.
    pub async fn cancel(&self, id: TaskId, actor: Option<&UserId>) -> Result<TaskRecord> {
        let mut inner = self.inner.lock().await;
        let mut record = self.state.task(id).await?;
        let project = record.project_id;
        self.ensure_loaded(&mut inner, project).await?;

        let previous = record.status;
        record.mark_cancelled(self.state.now())?;
        let mut tx = Transaction::new("cancel_task");
        tx.push(Mutation::UpdateTask(record.clone()));
        self.publisher.stage(
            &mut tx,
            TaskEventKind::Cancelled,
            &record,
            actor,
            json!({ "previous_status": previous }),
        );
        self.state.commit(tx).await?;

        if let Err(err) = self.graph(&mut inner, project).mark_blocked(id) {
            Self::mark_stale(&mut inner, project, &err.to_string());
        }
        drop(inner);

        info!(task = %id, previous = %previous, "task cancelled");
        self.publisher.notify();
        Ok(record)
    }

    /// failed -> ready (or waiting), if `policy` still allows another attempt.
    pub async fn retry(
        &self,
        id: TaskId,
        policy: RetryPolicy,
        actor: Option<&UserId>,
    ) -> Result<TaskRecord> {
        let mut inner = self.inner.lock().await;
        let mut record = self.state.task(id).await?;
        let project = record.project_id;
        self.ensure_loaded(&mut inner, project).await?;

        if record.status != TaskStatus::Failed {
            return Err(HeddleError::InvalidStateTransition {
                task: id,
                from: record.status,
                to: TaskStatus::Ready,
            });
        }
        if !policy.allows(record.attempts) {
            warn!(task = %id, attempts = record.attempts, max = policy.max_retries, "retry refused");
            return Err(HeddleError::RetryExhausted {
                task: id,
                attempts: record.attempts,
                max: policy.max_retries,
            });
        }

        let ready = self.graph(&mut inner, project).dependencies_satisfied(id)?;
        record.reset_for_retry(ready, self.state.now())?;
        let mut tx = Transaction::new("retry_task");
        tx.push(Mutation::UpdateTask(record.clone()));
        self.publisher.stage(
            &mut tx,
            TaskEventKind::Retried,
            &record,
            actor,
            json!({ "attempts": record.attempts, "previous_error": record.error }),
        );
        self.state.commit(tx).await?;

        match self.graph(&mut inner, project).requeue(id) {
            Ok(requeued) if requeued == ready => {}
            Ok(_) => Self::mark_stale(&mut inner, project, "readiness changed during commit"),
            Err(err) => Self::mark_stale(&mut inner, project, &err.to_string()),
        }
        drop(inner);

        info!(task = %id, status = %record.status, "task queued for retry");
        self.publisher.notify();
        Ok(record)
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskRecord> {
        self.state.task(id).await
    }

    /// Tasks of the project in registration order, optionally by status.
    pub async fn list(
        &self,
        project: ProjectId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>> {
        let mut tasks = self.state.tasks(project).await?;
        if let Some(status) = status {
            tasks.retain(|t| t.status == status);
        }
        Ok(tasks)
    }

    /// One order in which every task runs after its dependencies.
    pub async fn execution_order(&self, project: ProjectId) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner, project).await?;
        Ok(self.graph(&mut inner, project).topological_order())
    }

    /// Ready ids, best first, without dispatching them.
    pub async fn ready(&self, project: ProjectId) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner, project).await?;
        Ok(self.graph(&mut inner, project).ready_tasks().collect())
    }

    pub async fn counts(&self, project: ProjectId) -> Result<QueueCounts> {
        let tasks = self.state.tasks(project).await?;
        Ok(QueueCounts::from_tasks(&tasks))
    }

    /// Reloads the project's graph from the store now.
    pub async fn rebuild(&self, project: ProjectId) -> Result<GraphStats> {
        let mut inner = self.inner.lock().await;
        inner.stale.insert(project);
        self.ensure_loaded(&mut inner, project).await?;
        Ok(self.graph(&mut inner, project).stats())
    }

    /// Drops every cached graph; each is reloaded on next access.
    pub async fn invalidate_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.graphs.clear();
        inner.stale.clear();
    }
}

/// Turns batch references into ids, deduplicating repeated dependencies.
fn resolve_batch(ids: &[TaskId], tasks: &[NewTask]) -> Result<Vec<Vec<TaskId>>> {
    let mut resolved = Vec::with_capacity(tasks.len());
    for (index, request) in tasks.iter().enumerate() {
        let mut deps: Vec<TaskId> = Vec::with_capacity(request.dependencies.len());
        for dependency in &request.dependencies {
            let id = match *dependency {
                DependencyRef::Batch(i) if i == index => {
                    return Err(HeddleError::Cycle {
                        path: vec![ids[index], ids[index]],
                    });
                }
                DependencyRef::Batch(i) => *ids.get(i).ok_or_else(|| {
                    HeddleError::InvalidArgument(format!(
                        "task #{index} depends on batch entry #{i}, but the batch has {} tasks",
                        ids.len()
                    ))
                })?,
                DependencyRef::Task(id) => id,
            };
            if !deps.contains(&id) {
                deps.push(id);
            }
        }
        resolved.push(deps);
    }
    Ok(resolved)
}
