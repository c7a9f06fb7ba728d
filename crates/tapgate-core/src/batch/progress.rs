use super::registry::{BatchId, ProgressSnapshot};
use serde::Serialize;
use tokio::sync::mpsc;

/// Notification-only progress reporting. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn batch_started(&self, batch: &BatchId, total: usize);
    fn item_completed(&self, batch: &BatchId, test_id: &str, success: bool, progress: ProgressSnapshot);
    fn batch_completed(&self, batch: &BatchId, progress: ProgressSnapshot);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        batch_id: BatchId,
        total: usize,
    },
    ItemCompleted {
        batch_id: BatchId,
        test_id: String,
        success: bool,
        completed: usize,
        total: usize,
    },
    BatchCompleted {
        batch_id: BatchId,
        completed: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn batch_started(&self, batch: &BatchId, total: usize) {
        tracing::info!(event = "batch.started", batch_id = %batch, total, "generating {} test case(s)", total);
    }

    fn item_completed(&self, batch: &BatchId, test_id: &str, success: bool, progress: ProgressSnapshot) {
        tracing::info!(
            event = "batch.progress",
            batch_id = %batch,
            test_id,
            success,
            completed = progress.completed,
            total = progress.total,
            "[{}/{}] {}",
            progress.completed,
            progress.total,
            test_id
        );
    }

    fn batch_completed(&self, batch: &BatchId, progress: ProgressSnapshot) {
        tracing::info!(
            event = "batch.completed",
            batch_id = %batch,
            completed = progress.completed,
            total = progress.total
        );
    }
}

/// Forwards events over an unbounded channel; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl ProgressSink for ChannelProgress {
    fn batch_started(&self, batch: &BatchId, total: usize) {
        self.emit(ProgressEvent::BatchStarted {
            batch_id: batch.clone(),
            total,
        });
    }

    fn item_completed(&self, batch: &BatchId, test_id: &str, success: bool, progress: ProgressSnapshot) {
        self.emit(ProgressEvent::ItemCompleted {
            batch_id: batch.clone(),
            test_id: test_id.to_string(),
            success,
            completed: progress.completed,
            total: progress.total,
        });
    }

    fn batch_completed(&self, batch: &BatchId, progress: ProgressSnapshot) {
        self.emit(ProgressEvent::BatchCompleted {
            batch_id: batch.clone(),
            completed: progress.completed,
            total: progress.total,
        });
    }
}
