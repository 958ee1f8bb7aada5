//! WorkerGroup - ready タスクをサービスに流し続ける
//!
//! # フロー
//! 1. Orchestrator::dispatch_next() で ready タスクを取り、running にする
//! 2. task_type 名のサービスを呼ぶ
//! 3. 結果で complete / fail を記録する
//! 4. ready がなければ idle 分だけ待つ（shutdown とは select で競合させる）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::context::Context;
use crate::app::orchestrator::Orchestrator;

/// Worker group handle.
/// - `shutdown_and_join()` でワーカー全体を止めて終了を待つ
/// - 実行中のサービス呼び出しは中断しない。新しいタスクを取らなくなるだけ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<usize>>,
}

impl WorkerGroup {
    /// Spawn `n` workers, all dispatching for `ctx`'s project.
    pub fn spawn(n: usize, orchestrator: Arc<Orchestrator>, ctx: Context, idle: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let orchestrator = Arc::clone(&orchestrator);
            let ctx = ctx.clone();
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, orchestrator, ctx, idle, &mut rx).await
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait. Returns how many tasks the workers dispatched.
    pub async fn shutdown_and_join(self) -> usize {
        self.request_shutdown();
        let mut dispatched = 0;
        for join in self.joins {
            dispatched += join.await.unwrap_or(0);
        }
        dispatched
    }
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    ctx: Context,
    idle: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> usize {
    let mut dispatched = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match orchestrator.dispatch_next(&ctx).await {
            Ok(Some(done)) => {
                dispatched += 1;
                debug!(worker_id, task = %done.task.id, status = %done.task.status, "task dispatched");
                continue;
            }
            Ok(None) => {}
            Err(err) => warn!(worker_id, error = %err, "dispatch failed"),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle) => {}
        }
    }
    dispatched
}
