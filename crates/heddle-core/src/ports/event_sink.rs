//! EventSink port - タスクイベントの配送先
//!
//! EventPublisher は outbox から取り出したイベントを seq 順に渡す。
//! `deliver` が Err を返したイベントは ack されず、次の flush で再送される
//! (at-least-once)。

use async_trait::async_trait;

use crate::domain::TaskEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sink {sink} rejected event {seq}: {reason}")]
pub struct SinkError {
    pub sink: String,
    pub seq: u64,
    pub reason: String,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn deliver(&self, event: &TaskEvent) -> Result<(), SinkError>;
}
