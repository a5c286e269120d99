//! Persistence of batch jobs and their progress.
//!
//! Every write is a compare-and-update against the current status, so a
//! cancel issued by an admin and progress written by the dispatcher can race
//! without a terminal batch ever being reopened.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BatchCounters, BatchJob, BatchProgress, BatchRecord, BatchStatus, Notification,
};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The batch already reached this terminal status
    Terminal(BatchStatus),
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a new job with `pending` progress.
    async fn create(&self, job: &BatchJob) -> Result<BatchProgress, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<BatchRecord>, AppError>;

    /// Most recent batches first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BatchRecord>, AppError>;

    async fn status(&self, id: Uuid) -> Result<Option<BatchStatus>, AppError>;

    /// Move the batch to `to` if its current status allows it.
    ///
    /// Counters, when given, are merged so they never decrease. Returns
    /// `false` when the transition was refused.
    async fn transition(
        &self,
        id: Uuid,
        to: BatchStatus,
        counters: Option<BatchCounters>,
        error: Option<String>,
    ) -> Result<bool, AppError>;

    async fn set_total(&self, id: Uuid, total: i64) -> Result<(), AppError>;

    /// Write counters while the batch is `sending` (or just got `cancelled`).
    async fn update_counters(&self, id: Uuid, counters: BatchCounters) -> Result<bool, AppError>;

    async fn cancel(&self, id: Uuid, cancelled_by: Uuid) -> Result<CancelOutcome, AppError>;

    /// The first `limit` notifications delivered for a batch.
    async fn preview(&self, id: Uuid, limit: i64) -> Result<Vec<Notification>, AppError>;

    /// Move every `pending` or `sending` batch to `failed` with `reason`.
    ///
    /// Returns the ids that were changed.
    async fn fail_unfinished(&self, reason: &str) -> Result<Vec<Uuid>, AppError>;
}

/// Statuses during which counters may still be written.
pub(crate) const COUNTER_WRITABLE: [BatchStatus; 2] = [BatchStatus::Sending, BatchStatus::Cancelled];

/// In-process batch store.
///
/// Holds no delivery records, so `preview` is always empty. Every accepted
/// write is appended to a per-batch history for inspection.
#[derive(Default)]
pub struct MemoryBatchStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, BatchRecord>,
    history: HashMap<Uuid, Vec<BatchProgress>>,
}

impl MemoryState {
    fn commit(&mut self, id: Uuid) {
        if let Some(record) = self.records.get(&id) {
            self.history
                .entry(id)
                .or_default()
                .push(record.progress.clone());
        }
    }
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots of the progress after every accepted write, oldest first.
    pub async fn history(&self, id: Uuid) -> Vec<BatchProgress> {
        self.inner
            .read()
            .await
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

fn merge_counters(progress: &mut BatchProgress, counters: BatchCounters) {
    progress.emails_sent = progress.emails_sent.max(counters.emails_sent);
    progress.pushes_sent = progress.pushes_sent.max(counters.pushes_sent);
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn create(&self, job: &BatchJob) -> Result<BatchProgress, AppError> {
        let mut state = self.inner.write().await;
        if state.records.contains_key(&job.id) {
            return Err(AppError::Conflict(format!("Batch {} already exists", job.id)));
        }
        let progress = BatchProgress::pending(job.id);
        state.records.insert(
            job.id,
            BatchRecord {
                job: job.clone(),
                progress: progress.clone(),
            },
        );
        state.commit(job.id);
        Ok(progress)
    }

    async fn get(&self, id: Uuid) -> Result<Option<BatchRecord>, AppError> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BatchRecord>, AppError> {
        let state = self.inner.read().await;
        let mut records: Vec<BatchRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| b.job.created_at.cmp(&a.job.created_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn status(&self, id: Uuid) -> Result<Option<BatchStatus>, AppError> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(&id)
            .map(|r| r.progress.status))
    }

    async fn transition(
        &self,
        id: Uuid,
        to: BatchStatus,
        counters: Option<BatchCounters>,
        error: Option<String>,
    ) -> Result<bool, AppError> {
        let mut state = self.inner.write().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        let progress = &mut record.progress;
        if !progress.status.can_transition_to(to) {
            return Ok(false);
        }

        let now = Utc::now();
        progress.status = to;
        match to {
            BatchStatus::Sending => progress.started_at = Some(now),
            BatchStatus::Cancelled => progress.cancelled_at = Some(now),
            BatchStatus::Completed | BatchStatus::Failed => progress.completed_at = Some(now),
            BatchStatus::Pending => {}
        }
        if let Some(counters) = counters {
            merge_counters(progress, counters);
        }
        if error.is_some() {
            progress.last_error = error;
        }
        state.commit(id);
        Ok(true)
    }

    async fn set_total(&self, id: Uuid, total: i64) -> Result<(), AppError> {
        let mut state = self.inner.write().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Batch {} not found", id)))?;
        record.progress.total_recipients = total;
        state.commit(id);
        Ok(())
    }

    async fn update_counters(&self, id: Uuid, counters: BatchCounters) -> Result<bool, AppError> {
        let mut state = self.inner.write().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        if !COUNTER_WRITABLE.contains(&record.progress.status) {
            return Ok(false);
        }
        merge_counters(&mut record.progress, counters);
        state.commit(id);
        Ok(true)
    }

    async fn cancel(&self, id: Uuid, cancelled_by: Uuid) -> Result<CancelOutcome, AppError> {
        let mut state = self.inner.write().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        let progress = &mut record.progress;
        if !progress.status.can_transition_to(BatchStatus::Cancelled) {
            return Ok(CancelOutcome::Terminal(progress.status));
        }
        progress.status = BatchStatus::Cancelled;
        progress.cancelled_at = Some(Utc::now());
        progress.cancelled_by = Some(cancelled_by);
        state.commit(id);
        Ok(CancelOutcome::Cancelled)
    }

    async fn preview(&self, _id: Uuid, _limit: i64) -> Result<Vec<Notification>, AppError> {
        Ok(Vec::new())
    }

    async fn fail_unfinished(&self, reason: &str) -> Result<Vec<Uuid>, AppError> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for (id, record) in state.records.iter_mut() {
            let progress = &mut record.progress;
            if progress.status.can_transition_to(BatchStatus::Failed) {
                progress.status = BatchStatus::Failed;
                progress.completed_at = Some(now);
                progress.last_error = Some(reason.to_string());
                failed.push(*id);
            }
        }
        for id in &failed {
            state.commit(*id);
        }
        Ok(failed)
    }
}
