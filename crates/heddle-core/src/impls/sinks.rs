//! EventSink の実装
//!
//! - **BroadcastSink**: tokio broadcast でプロセス内の購読者に流す
//! - **MemorySink**: 受け取ったイベントを記録する（テスト、CLI 用）
//! - **TracingSink**: tracing にワイヤ形式で出力する

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::domain::TaskEvent;
use crate::ports::{EventSink, SinkError};

/// BroadcastSink は購読者ごとに独立した受信口を持つ
///
/// 購読者がいなくても配送は成功扱い。遅い購読者は `Lagged` を受け取る。
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Value>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receives every event delivered after this call, in wire format.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn deliver(&self, event: &TaskEvent) -> Result<(), SinkError> {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(event.to_wire());
        Ok(())
    }
}

/// MemorySink は受け取ったイベントを順番に保持する
///
/// `fail_next` で次の配送を一度だけ失敗させられる。
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    events: Vec<TaskEvent>,
    fail_next: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.lock().events.clone()
    }

    pub fn fail_next(&self, reason: impl Into<String>) {
        self.lock().fail_next = Some(reason.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, event: &TaskEvent) -> Result<(), SinkError> {
        let mut inner = self.lock();
        if let Some(reason) = inner.fail_next.take() {
            return Err(SinkError {
                sink: "memory".into(),
                seq: event.seq,
                reason,
            });
        }
        inner.events.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, event: &TaskEvent) -> Result<(), SinkError> {
        info!(
            target: "heddle::events",
            seq = event.seq,
            event_type = event.kind.as_str(),
            task_id = %event.task_id,
            project_id = %event.project_id,
            payload = %event.to_wire(),
            "task event"
        );
        Ok(())
    }
}
