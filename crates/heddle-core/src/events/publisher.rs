//! EventPublisher - outbox の書き込みと配送
//!
//! 状態遷移を書き込む側は `stage` で同じ Transaction にイベントを積む。
//! `flush` は未配送イベントを seq 順に全 sink へ渡し、全 sink が受け取った
//! ものだけ ack する。途中で失敗したらそこで止めて、残りは次回に回す。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::domain::{TaskEvent, TaskEventKind, TaskRecord, UserId};
use crate::error::Result;
use crate::ports::{EventSink, Mutation, SinkError};
use crate::state::{StateManager, Transaction};

/// Outcome of one `flush`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events accepted by every sink and acked.
    pub delivered: usize,
    /// First sink failure; everything from that event on stays pending.
    pub stalled: Option<SinkError>,
}

pub struct EventPublisher {
    state: Arc<StateManager>,
    sinks: Vec<Arc<dyn EventSink>>,
    /// Last seq handed out.
    seq: AtomicU64,
    batch_size: usize,
    wake: Notify,
    flushing: Mutex<()>,
}

impl EventPublisher {
    /// Seeds the sequence from the store so a reopened database keeps counting.
    pub async fn new(
        state: Arc<StateManager>,
        sinks: Vec<Arc<dyn EventSink>>,
        batch_size: usize,
    ) -> Result<Self> {
        let last = state.store().last_event_seq().await?;
        Ok(Self {
            state,
            sinks,
            seq: AtomicU64::new(last),
            batch_size: batch_size.max(1),
            wake: Notify::new(),
            flushing: Mutex::new(()),
        })
    }

    /// Appends the event for `task`'s current status to `tx` and returns its seq.
    ///
    /// Callers must commit transactions in the order they staged them; the
    /// task queue does this by staging and committing under its own lock.
    pub fn stage(
        &self,
        tx: &mut Transaction,
        kind: TaskEventKind,
        task: &TaskRecord,
        actor: Option<&UserId>,
        details: Value,
    ) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        tx.push(Mutation::AppendEvent(TaskEvent {
            id: self.state.ids().next(),
            seq,
            kind,
            task_id: task.id,
            workspace_id: task.workspace_id,
            project_id: task.project_id,
            status: task.status,
            actor: actor.cloned(),
            details,
            timestamp: self.state.now(),
        }));
        seq
    }

    /// Wakes the publisher loop.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }

    /// Re-reads the last seq from the store, e.g. after a rebuild.
    pub async fn resync(&self) -> Result<()> {
        let last = self.state.store().last_event_seq().await?;
        self.seq.fetch_max(last, Ordering::SeqCst);
        Ok(())
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Delivers pending events in seq order.
    ///
    /// A sink error does not fail the call; it is reported in
    /// [`FlushReport::stalled`]. Store errors do fail it.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            let pending = self.state.store().pending_events(self.batch_size).await?;
            if pending.is_empty() {
                break;
            }

            let mut acked = Vec::with_capacity(pending.len());
            for event in &pending {
                if let Err(err) = self.deliver(event).await {
                    warn!(seq = err.seq, sink = %err.sink, reason = %err.reason, "event delivery stalled");
                    report.stalled = Some(err);
                    break;
                }
                acked.push(event.seq);
            }

            let stalled = report.stalled.is_some();
            if !acked.is_empty() {
                report.delivered += acked.len();
                let mut tx = Transaction::new("ack_events");
                tx.push(Mutation::AckEvents(acked));
                self.state.commit(tx).await?;
            }
            if stalled || pending.len() < self.batch_size {
                break;
            }
        }

        if report.delivered > 0 {
            debug!(delivered = report.delivered, "outbox flushed");
        }
        Ok(report)
    }

    async fn deliver(&self, event: &TaskEvent) -> std::result::Result<(), SinkError> {
        for sink in &self.sinks {
            sink.deliver(event).await?;
        }
        Ok(())
    }
}
