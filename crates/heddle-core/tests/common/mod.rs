//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Once};

use chrono::{DateTime, TimeZone, Utc};
use heddle_core::domain::{Role, UserId};
use heddle_core::impls::{EchoAdapter, FnAdapter, MemorySink};
use heddle_core::ports::{ErrorKind, FixedClock, ServiceError, ServiceRequest, StateStore};
use heddle_core::{Context, HeddleConfig, Orchestrator, OrchestratorBuilder};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// `RUST_LOG` が設定されていればテスト出力にログを流す
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        if let Ok(filter) = std::env::var("RUST_LOG") {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(filter))
                .with_test_writer()
                .try_init();
        }
    });
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// One workspace owned by `alice`, one project, and the services
/// `echo` (answers with the request) and `flaky` (fails with `remote`).
pub struct World {
    pub orchestrator: Arc<Orchestrator>,
    pub sink: MemorySink,
    pub clock: FixedClock,
    pub owner: Context,
}

impl World {
    /// Same workspace and project, another actor.
    pub fn as_user(&self, user: &str) -> Context {
        Context::new(user, self.owner.workspace_id, self.owner.project_id)
    }

    pub async fn add_member(&self, user: &str, role: Role) {
        self.orchestrator
            .workspaces()
            .add_member(&self.owner.actor, self.owner.workspace_id, &UserId::new(user), role)
            .await
            .unwrap();
    }
}

pub async fn world() -> World {
    world_with(HeddleConfig::default(), None).await
}

pub async fn world_with(config: HeddleConfig, store: Option<Arc<dyn StateStore>>) -> World {
    init_tracing();
    let clock = FixedClock::new(t0());
    let sink = MemorySink::new();

    let mut builder = OrchestratorBuilder::new(config)
        .clock(Arc::new(clock.clone()))
        .sink(Arc::new(sink.clone()))
        .service("echo", Arc::new(EchoAdapter::new("echo")))
        .unwrap()
        .service(
            "flaky",
            Arc::new(FnAdapter::new(|req: ServiceRequest| async move {
                Err::<Value, _>(ServiceError::new(ErrorKind::Remote, format!("{} broke", req.action)))
            })),
        )
        .unwrap();
    if let Some(store) = store {
        builder = builder.store(store);
    }
    let orchestrator = Arc::new(builder.build().await.unwrap());

    let alice = "alice".into();
    let workspace = orchestrator
        .workspaces()
        .create(&alice, "research", None)
        .await
        .unwrap();
    let project = orchestrator
        .projects()
        .create(&alice, workspace.id, "pipeline", None)
        .await
        .unwrap();

    World {
        orchestrator,
        sink,
        clock,
        owner: Context::new("alice", workspace.id, project.id),
    }
}

pub fn action(name: &str) -> Value {
    json!({"action": name, "parameters": {}})
}
