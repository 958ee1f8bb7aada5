//! PublisherLoop - outbox を定期的に配送する
//!
//! # フロー
//! 1. 状態遷移の commit 後に EventPublisher::notify() で起こされる
//!    (あるいは flush_interval ごとに起きる)
//! 2. EventPublisher::flush() で seq 順に配送して ack
//! 3. sink が失敗したイベントは未配送のまま残り、次の周回で再送

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::EventPublisher;

/// Handle of the background publisher.
/// - `shutdown_and_join()` で最後に一度 flush してから止まる
pub struct PublisherLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PublisherLoop {
    pub fn spawn(publisher: Arc<EventPublisher>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            run(publisher, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn run(
    publisher: Arc<EventPublisher>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = publisher.notified() => {}
            _ = ticker.tick() => {}
        }

        flush_once(&publisher).await;
    }

    // drain what was committed before shutdown
    flush_once(&publisher).await;
    debug!("publisher loop stopped");
}

async fn flush_once(publisher: &EventPublisher) {
    match publisher.flush().await {
        Ok(report) => {
            if let Some(stalled) = report.stalled {
                debug!(delivered = report.delivered, seq = stalled.seq, "flush stalled, will retry");
            }
        }
        Err(err) => warn!(error = %err, "outbox flush failed"),
    }
}
