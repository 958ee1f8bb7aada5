//! Subcommand handlers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use heddle_core::app::PublisherLoop;
use heddle_core::domain::{LockMode, NewTask, TaskEvent, TaskId, UserId};
use heddle_core::impls::{EchoAdapter, MemorySink};
use heddle_core::ports::{Clock, FixedClock, SystemClock};
use heddle_core::{Context, HeddleConfig, Orchestrator, OrchestratorBuilder};
use serde_json::json;
use tracing::info;

use crate::plan::PlanFile;

const CLI_USER: &str = "cli";

/// Workspace and project owned by the CLI user, for one command run.
async fn scratch_project(orchestrator: &Orchestrator, project: &str) -> Result<Context> {
    let actor = UserId::new(CLI_USER);
    let workspace = orchestrator
        .workspaces()
        .create(&actor, "heddle-cli", Some("created by the heddle binary".into()))
        .await?;
    let project = orchestrator
        .projects()
        .create(&actor, workspace.id, project, None)
        .await?;
    Ok(Context::new(CLI_USER, workspace.id, project.id))
}

fn print_events(events: &[TaskEvent], names: &HashMap<TaskId, String>) {
    println!("events:");
    for event in events {
        let name = names.get(&event.task_id).map_or("?", String::as_str);
        println!(
            "  #{:<3} {:<10} {:<6} -> {:<9} {}",
            event.seq,
            event.kind.as_str(),
            name,
            event.status.as_str(),
            event.details
        );
    }
}

/// T1 (priority 5) and T2 (priority 10, after T1) through an echo service.
pub async fn demo(config: HeddleConfig) -> Result<()> {
    let sink = MemorySink::new();
    let flush_interval = config.publisher.flush_interval();
    let orchestrator = OrchestratorBuilder::new(config)
        .sink(Arc::new(sink.clone()))
        .service("echo", Arc::new(EchoAdapter::new("echo")))?
        .expect_services(&["echo"])
        .build()
        .await?;
    let publisher = PublisherLoop::spawn(Arc::clone(orchestrator.publisher()), flush_interval);
    let ctx = scratch_project(&orchestrator, "demo").await?;

    let ids = orchestrator
        .register_tasks(
            &ctx,
            vec![
                NewTask::new("echo")
                    .named("T1")
                    .priority(5)
                    .payload(json!({"action": "fetch"})),
                NewTask::new("echo")
                    .named("T2")
                    .priority(10)
                    .after_batch(0)
                    .payload(json!({"action": "summarize"})),
            ],
        )
        .await?;
    let names: HashMap<TaskId, String> = ids
        .iter()
        .zip(["T1", "T2"])
        .map(|(id, name)| (*id, name.to_string()))
        .collect();
    println!("registered T1={} T2={}", ids[0], ids[1]);

    while let Some(done) = orchestrator.dispatch_next(&ctx).await? {
        let name = &names[&done.task.id];
        match &done.outcome {
            Ok(result) => println!("{name} done: {result}"),
            Err(err) => println!("{name} failed: {err}"),
        }
    }
    println!("no task available");

    let cycle = orchestrator
        .register_tasks(
            &ctx,
            vec![
                NewTask::new("echo").named("A").after_batch(1),
                NewTask::new("echo").named("B").after_batch(0),
            ],
        )
        .await;
    if let Err(err) = cycle {
        println!("cyclic batch rejected: {err}");
    }

    publisher.shutdown_and_join().await;
    print_events(&sink.events(), &names);
    println!("counts: {:?}", orchestrator.counts(&ctx).await?);
    Ok(())
}

/// Registers the plan's tasks; with `run`, dispatches them to echo services.
pub async fn plan(config: HeddleConfig, file: &Path, run: bool) -> Result<()> {
    let plan = PlanFile::load(file)?;
    let batch = plan.to_batch()?;
    let project = plan.project.clone().unwrap_or_else(|| {
        file.file_stem()
            .map_or_else(|| "plan".to_string(), |s| s.to_string_lossy().into_owned())
    });

    let mut builder = OrchestratorBuilder::new(config);
    if run {
        for task_type in plan.task_types() {
            builder = builder.service(task_type, Arc::new(EchoAdapter::new(task_type)))?;
        }
    }
    let orchestrator = builder.build().await?;
    let ctx = scratch_project(&orchestrator, &project).await?;

    let ids = orchestrator
        .register_tasks(&ctx, batch)
        .await
        .with_context(|| format!("failed to register {}", file.display()))?;
    let keys: HashMap<TaskId, &str> = ids
        .iter()
        .zip(&plan.tasks)
        .map(|(id, task)| (*id, task.key.as_str()))
        .collect();
    info!(project = %ctx.project_id, tasks = ids.len(), "plan registered");

    println!("execution order for {project}:");
    for (step, id) in orchestrator.execution_order(&ctx).await?.iter().enumerate() {
        let task = orchestrator.task(&ctx, *id).await?;
        println!(
            "  {:>2}. {:<16} type={:<10} priority={:<3} {}",
            step + 1,
            keys.get(id).copied().unwrap_or("?"),
            task.task_type.as_str(),
            task.priority,
            task.status
        );
    }

    if run {
        while let Some(done) = orchestrator.dispatch_next(&ctx).await? {
            let key = keys.get(&done.task.id).copied().unwrap_or("?");
            match done.outcome {
                Ok(_) => println!("  ran {key}"),
                Err(err) => println!("  {key} failed: {err}"),
            }
        }
        println!("counts: {:?}", orchestrator.counts(&ctx).await?);
    }
    Ok(())
}

/// Two holders contending for leases on a clock that only moves when told.
pub async fn locks(config: HeddleConfig) -> Result<()> {
    let clock = FixedClock::new(SystemClock.now());
    let orchestrator = OrchestratorBuilder::new(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .await?;
    let owner = scratch_project(&orchestrator, "locks").await?;
    orchestrator
        .workspaces()
        .add_member(
            &owner.actor,
            owner.workspace_id,
            &UserId::new("worker-2"),
            heddle_core::domain::Role::Member,
        )
        .await?;
    let other = Context::new("worker-2", owner.workspace_id, owner.project_id);

    let ttl = Duration::from_secs(30);
    let lease = orchestrator
        .acquire_lock(&owner, "dataset/train", LockMode::Exclusive, Some(ttl))
        .await?;
    println!("{} holds {} ({}) until {}", lease.holder, lease.resource_key, lease.mode, lease.expires_at);

    match orchestrator
        .acquire_lock(&other, "dataset/train", LockMode::Shared, None)
        .await
    {
        Ok(_) => println!("unexpected: worker-2 got the lease"),
        Err(err) => println!("worker-2 refused: {err}"),
    }

    for ctx in [&owner, &other] {
        orchestrator
            .acquire_lock(ctx, "cache/embeddings", LockMode::Shared, None)
            .await?;
    }
    println!("both hold cache/embeddings (shared)");

    clock.advance(ttl + Duration::from_secs(1));
    println!("clock advanced {}s", (ttl + Duration::from_secs(1)).as_secs());

    let taken = orchestrator
        .acquire_lock(&other, "dataset/train", LockMode::Exclusive, None)
        .await?;
    println!("{} now holds {} until {}", taken.holder, taken.resource_key, taken.expires_at);

    orchestrator.release_lock(&owner, "cache/embeddings").await?;
    println!("active leases:");
    for lock in orchestrator.active_locks(&owner).await? {
        println!(
            "  {:<18} {:<9} {:<9} {}",
            lock.resource_key,
            lock.mode.as_str(),
            lock.holder.as_str(),
            lock.expires_at
        );
    }

    // keys are global; leave nothing behind in a persistent store
    for key in ["dataset/train", "cache/embeddings"] {
        orchestrator.release_lock(&other, key).await?;
    }
    Ok(())
}
