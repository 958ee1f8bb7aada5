//! Orchestrator - 外から呼ぶ唯一の窓口
//!
//! すべての操作は `Context` を受け取り、
//! 1. actor のロールが必要な権限を持つか
//! 2. プロジェクトが workspace に属していて、両方とも active か
//! を確認してから各コンポーネントに委譲する。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::app::context::Context;
use crate::app::services::ServiceRegistry;
use crate::domain::{LockMode, LockRecord, NewTask, Project, TaskId, TaskRecord, TaskStatus};
use crate::error::{Entity, HeddleError, Result};
use crate::events::{EventPublisher, FlushReport};
use crate::locks::{LockManager, LockScope};
use crate::observability::QueueCounts;
use crate::ports::{ServiceError, ServiceRequest};
use crate::scheduler::{Completion, RetryPolicy, TaskQueue};
use crate::state::StateManager;
use crate::tenancy::{Permission, ProjectManager, WorkspaceManager, rbac};

/// One task taken by `dispatch_next` and what its service answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Record after it was completed or failed.
    pub task: TaskRecord,
    pub outcome: std::result::Result<Value, ServiceError>,
}

/// What `recover` rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub locks: usize,
    pub pending_events: usize,
}

pub struct Orchestrator {
    pub(crate) state: Arc<StateManager>,
    pub(crate) queue: TaskQueue,
    pub(crate) locks: LockManager,
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) projects: ProjectManager,
    pub(crate) publisher: Arc<EventPublisher>,
    pub(crate) services: ServiceRegistry,
    pub(crate) retry_policy: RetryPolicy,
}

impl Orchestrator {
    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn projects(&self) -> &ProjectManager {
        &self.projects
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Role check, then the project must belong to the workspace and both
    /// must be active. Reads included.
    async fn authorize(&self, ctx: &Context, permission: Permission) -> Result<Project> {
        rbac::require(&self.state, ctx.workspace_id, &ctx.actor, permission).await?;
        self.projects.active_in(ctx.workspace_id, ctx.project_id).await
    }

    /// The task, if it belongs to the context's project.
    async fn task_in(&self, ctx: &Context, id: TaskId) -> Result<TaskRecord> {
        let task = self.queue.get(id).await?;
        if task.project_id != ctx.project_id {
            return Err(HeddleError::not_found(Entity::Task, id));
        }
        Ok(task)
    }

    #[instrument(skip(self, ctx, tasks), fields(actor = %ctx.actor, project = %ctx.project_id, count = tasks.len()))]
    pub async fn register_tasks(&self, ctx: &Context, tasks: Vec<NewTask>) -> Result<Vec<TaskId>> {
        self.authorize(ctx, Permission::TaskCreate).await?;
        self.queue
            .register(ctx.workspace_id, ctx.project_id, Some(&ctx.actor), tasks)
            .await
    }

    /// Best ready task of the project, now running. `Ok(None)` when nothing
    /// is ready.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, project = %ctx.project_id))]
    pub async fn next_task(&self, ctx: &Context) -> Result<Option<TaskRecord>> {
        self.authorize(ctx, Permission::TaskExecute).await?;
        self.queue.get_next(ctx.project_id, Some(&ctx.actor)).await
    }

    #[instrument(skip(self, ctx, result), fields(actor = %ctx.actor, task = %id))]
    pub async fn complete_task(&self, ctx: &Context, id: TaskId, result: Value) -> Result<Completion> {
        self.authorize(ctx, Permission::TaskExecute).await?;
        self.task_in(ctx, id).await?;
        self.queue.complete(id, result, Some(&ctx.actor)).await
    }

    #[instrument(skip(self, ctx, error), fields(actor = %ctx.actor, task = %id))]
    pub async fn fail_task(&self, ctx: &Context, id: TaskId, error: impl Into<String>) -> Result<TaskRecord> {
        self.authorize(ctx, Permission::TaskExecute).await?;
        self.task_in(ctx, id).await?;
        self.queue.fail(id, error, Some(&ctx.actor)).await
    }

    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, task = %id))]
    pub async fn cancel_task(&self, ctx: &Context, id: TaskId) -> Result<TaskRecord> {
        self.authorize(ctx, Permission::TaskUpdate).await?;
        self.task_in(ctx, id).await?;
        self.queue.cancel(id, Some(&ctx.actor)).await
    }

    /// Retries a failed task under `policy`, or the configured one.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, task = %id))]
    pub async fn retry_task(
        &self,
        ctx: &Context,
        id: TaskId,
        policy: Option<RetryPolicy>,
    ) -> Result<TaskRecord> {
        self.authorize(ctx, Permission::TaskUpdate).await?;
        self.task_in(ctx, id).await?;
        self.queue
            .retry(id, policy.unwrap_or(self.retry_policy), Some(&ctx.actor))
            .await
    }

    pub async fn task(&self, ctx: &Context, id: TaskId) -> Result<TaskRecord> {
        self.authorize(ctx, Permission::TaskRead).await?;
        self.task_in(ctx, id).await
    }

    pub async fn tasks(&self, ctx: &Context, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        self.authorize(ctx, Permission::TaskRead).await?;
        self.queue.list(ctx.project_id, status).await
    }

    pub async fn execution_order(&self, ctx: &Context) -> Result<Vec<TaskId>> {
        self.authorize(ctx, Permission::TaskRead).await?;
        self.queue.execution_order(ctx.project_id).await
    }

    pub async fn counts(&self, ctx: &Context) -> Result<QueueCounts> {
        self.authorize(ctx, Permission::TaskRead).await?;
        self.queue.counts(ctx.project_id).await
    }

    /// Lease on `resource_key` held by the actor. Never waits.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, project = %ctx.project_id))]
    pub async fn acquire_lock(
        &self,
        ctx: &Context,
        resource_key: &str,
        mode: LockMode,
        ttl: Option<Duration>,
    ) -> Result<LockRecord> {
        self.authorize(ctx, Permission::LockAcquire).await?;
        let scope = LockScope::project(ctx.workspace_id, ctx.project_id);
        self.locks
            .acquire(resource_key, &ctx.holder(), mode, ttl, scope)
            .await
    }

    /// Runs `work` under the actor's lease on `resource_key`, released once
    /// `work` is done.
    pub async fn with_lock<F, Fut, T>(
        &self,
        ctx: &Context,
        resource_key: &str,
        mode: LockMode,
        ttl: Option<Duration>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(LockRecord) -> Fut,
        Fut: Future<Output = T>,
    {
        self.authorize(ctx, Permission::LockAcquire).await?;
        let scope = LockScope::project(ctx.workspace_id, ctx.project_id);
        self.locks
            .with_lease(resource_key, &ctx.holder(), mode, ttl, scope, work)
            .await
    }

    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn release_lock(&self, ctx: &Context, resource_key: &str) -> Result<LockRecord> {
        self.authorize(ctx, Permission::LockRelease).await?;
        self.locks.release(resource_key, &ctx.holder()).await
    }

    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn extend_lock(
        &self,
        ctx: &Context,
        resource_key: &str,
        ttl: Option<Duration>,
    ) -> Result<LockRecord> {
        self.authorize(ctx, Permission::LockAcquire).await?;
        self.locks.extend(resource_key, &ctx.holder(), ttl).await
    }

    /// Live leases taken for the context's project.
    pub async fn active_locks(&self, ctx: &Context) -> Result<Vec<LockRecord>> {
        self.authorize(ctx, Permission::LockRead).await?;
        self.locks.list_active(Some(ctx.project_id)).await
    }

    /// Takes the next ready task, calls the service named by its type and
    /// reports the answer. `Ok(None)` when nothing is ready.
    ///
    /// Service errors fail the task; they are not returned as `Err`.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, project = %ctx.project_id))]
    pub async fn dispatch_next(&self, ctx: &Context) -> Result<Option<Dispatched>> {
        let Some(task) = self.next_task(ctx).await? else {
            return Ok(None);
        };

        let service = task.task_type.as_str();
        let outcome = match ServiceRequest::from_payload(&task.payload) {
            Ok(request) => self.services.call(service, request).await,
            Err(err) => Err(err),
        };

        let task = match &outcome {
            Ok(result) => self.queue.complete(task.id, result.clone(), Some(&ctx.actor)).await?.task,
            Err(err) => {
                warn!(task = %task.id, service, error = %err, "service call failed");
                self.queue.fail(task.id, err.to_string(), Some(&ctx.actor)).await?
            }
        };
        Ok(Some(Dispatched { task, outcome }))
    }

    /// Drops every in-memory projection and reloads it from the store.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Recovery> {
        self.queue.invalidate_all().await;
        let locks = self.locks.rebuild().await?;
        self.publisher.resync().await?;
        let pending_events = self.state.store().pending_events(usize::MAX).await?.len();
        info!(locks, pending_events, "projections rebuilt");
        Ok(Recovery { locks, pending_events })
    }

    pub async fn flush_events(&self) -> Result<FlushReport> {
        self.publisher.flush().await
    }
}
