//! Batch dispatcher — delivers a global notification to every resolved
//! recipient in paced chunks, polling for cancellation between chunks.
//!
//! A submitted batch runs on its own Tokio task. The store's status row is the
//! only state shared with the outside world: admins cancel by flipping it, and
//! the dispatcher reads it back before starting each chunk. A chunk already in
//! flight always runs to the end.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::{
    BatchCounters, BatchJob, BatchProgress, BatchRecord, BatchStatus, Notification, Recipient,
};

use crate::delivery::Deliverer;
use crate::resolver::RecipientResolver;
use crate::store::{BatchStore, CancelOutcome};

/// Delivery records included in a batch detail view.
pub const PREVIEW_LIMIT: i64 = 10;

/// `last_error` of batches found unfinished at start-up.
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Pacing and bounds for batch processing.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Processed recipients between progress writes
    pub progress_interval: u64,
    pub delivery_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_delay: Duration::from_millis(100),
            progress_interval: 10,
            delivery_timeout: Duration::from_secs(90),
        }
    }
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.batch_chunk_size,
            chunk_delay: Duration::from_millis(config.batch_chunk_delay_ms),
            progress_interval: config.batch_progress_interval,
            delivery_timeout: Duration::from_secs(config.delivery_timeout_secs),
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRunReport {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub chunks_processed: usize,
    pub delays_applied: usize,
}

/// A batch with its progress and the first few delivery records.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDetails {
    pub job: BatchJob,
    pub progress: BatchProgress,
    pub notifications: Vec<Notification>,
}

/// In-memory state of a run, kept outside `run` so a failure can still
/// persist what was delivered.
#[derive(Debug, Default)]
struct RunState {
    counters: BatchCounters,
    processed: u64,
    chunks_processed: usize,
    delays_applied: usize,
}

pub struct BatchDispatcher {
    store: Arc<dyn BatchStore>,
    resolver: Arc<dyn RecipientResolver>,
    deliverer: Arc<dyn Deliverer>,
    settings: DispatchSettings,
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<dyn BatchStore>,
        resolver: Arc<dyn RecipientResolver>,
        deliverer: Arc<dyn Deliverer>,
        mut settings: DispatchSettings,
    ) -> Self {
        // The timeout never undercuts the deliverer's own retry budget
        if let Some(budget) = deliverer.max_duration()
            && budget > settings.delivery_timeout
        {
            tracing::warn!(
                configured_secs = settings.delivery_timeout.as_secs(),
                budget_secs = budget.as_secs(),
                "Delivery timeout below retry budget, raising it"
            );
            settings.delivery_timeout = budget;
        }

        Self {
            store,
            resolver,
            deliverer,
            settings,
        }
    }

    /// Persist the job and start processing it in the background.
    ///
    /// Returns as soon as the `pending` progress is stored.
    pub async fn submit(self: &Arc<Self>, job: BatchJob) -> Result<BatchProgress, AppError> {
        let progress = self.store.create(&job).await?;

        tracing::info!(
            batch_id = %job.id,
            created_by = %job.created_by,
            "Global notification batch submitted"
        );

        let span = tracing::info_span!("batch", batch_id = %job.id);
        let dispatcher = Arc::clone(self);
        tokio::spawn(
            async move {
                dispatcher.process(job).await;
            }
            .instrument(span),
        );

        Ok(progress)
    }

    /// Fail batches a previous process left `pending` or `sending`.
    ///
    /// Their tasks died with that process, so nothing would ever finish them.
    /// Call once at start-up, before new batches are submitted.
    pub async fn recover_interrupted(&self) -> Result<usize, AppError> {
        let failed = self.store.fail_unfinished(INTERRUPTED_REASON).await?;
        for id in &failed {
            tracing::warn!(batch_id = %id, "Batch interrupted by restart, marked failed");
        }
        Ok(failed.len())
    }

    /// Run a stored job to a terminal status.
    pub async fn process(&self, job: BatchJob) -> BatchRunReport {
        let mut state = RunState::default();

        let status = match self.run(&job, &mut state).await {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(batch_id = %job.id, error = %err, "Batch processing failed");
                self.fail(job.id, state.counters, err.to_string()).await
            }
        };

        let report = BatchRunReport {
            batch_id: job.id,
            status,
            counters: state.counters,
            chunks_processed: state.chunks_processed,
            delays_applied: state.delays_applied,
        };

        tracing::info!(
            batch_id = %job.id,
            status = %report.status,
            emails_sent = report.counters.emails_sent,
            pushes_sent = report.counters.pushes_sent,
            chunks = report.chunks_processed,
            "Batch finished"
        );

        report
    }

    async fn run(&self, job: &BatchJob, state: &mut RunState) -> Result<BatchStatus, AppError> {
        let id = job.id;

        if !self
            .store
            .transition(id, BatchStatus::Sending, None, None)
            .await?
        {
            let status = self.store.status(id).await?.unwrap_or(BatchStatus::Cancelled);
            tracing::info!(batch_id = %id, status = %status, "Batch not started");
            return Ok(status);
        }

        let recipients = match self.resolver.resolve(&job.selector).await {
            Ok(recipients) => recipients,
            Err(err) => {
                tracing::error!(batch_id = %id, error = %err, "Failed to resolve recipients");
                return Ok(self
                    .fail(id, state.counters, format!("recipient resolution failed: {}", err))
                    .await);
            }
        };

        if recipients.is_empty() {
            tracing::warn!(batch_id = %id, "Batch has no recipients");
            return Ok(self.fail(id, state.counters, "no recipients".to_string()).await);
        }

        self.store.set_total(id, recipients.len() as i64).await?;
        tracing::info!(batch_id = %id, total = recipients.len(), "Sending batch");

        let interval = self.settings.progress_interval.max(1);
        for (index, chunk) in recipients.chunks(self.settings.chunk_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.chunk_delay).await;
                state.delays_applied += 1;
            }

            match self.store.status(id).await? {
                Some(BatchStatus::Sending) => {}
                Some(BatchStatus::Cancelled) => {
                    tracing::info!(batch_id = %id, chunk = index, "Batch cancelled");
                    self.store.update_counters(id, state.counters).await?;
                    return Ok(BatchStatus::Cancelled);
                }
                other => {
                    let status = other.unwrap_or(BatchStatus::Failed);
                    tracing::warn!(batch_id = %id, status = %status, "Batch left sending unexpectedly");
                    return Ok(status);
                }
            }

            for recipient in chunk {
                self.deliver_one(recipient, job, state).await;
                state.processed += 1;
                if state.processed % interval == 0 {
                    self.store.update_counters(id, state.counters).await?;
                }
            }
            state.chunks_processed += 1;

            tracing::debug!(
                batch_id = %id,
                chunk = index,
                processed = state.processed,
                "Chunk processed"
            );
        }

        if self
            .store
            .transition(id, BatchStatus::Completed, Some(state.counters), None)
            .await?
        {
            return Ok(BatchStatus::Completed);
        }

        // A cancel landed during the last chunk
        let status = self.store.status(id).await?.unwrap_or(BatchStatus::Cancelled);
        if status == BatchStatus::Cancelled {
            self.store.update_counters(id, state.counters).await?;
        }
        Ok(status)
    }

    async fn deliver_one(&self, recipient: &Recipient, job: &BatchJob, state: &mut RunState) {
        let attempt = tokio::time::timeout(
            self.settings.delivery_timeout,
            self.deliverer.deliver(recipient, job),
        )
        .await;

        match attempt {
            Ok(Ok(report)) => {
                if report.email_sent {
                    state.counters.emails_sent += 1;
                }
                if report.push_sent {
                    state.counters.pushes_sent += 1;
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    batch_id = %job.id,
                    user_id = %recipient.user_id,
                    error = %err,
                    "Delivery failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    batch_id = %job.id,
                    user_id = %recipient.user_id,
                    timeout_secs = self.settings.delivery_timeout.as_secs(),
                    "Delivery timed out"
                );
            }
        }
    }

    /// Best-effort move to `failed`, returning the status the batch ended in.
    async fn fail(&self, id: Uuid, counters: BatchCounters, reason: String) -> BatchStatus {
        match self
            .store
            .transition(id, BatchStatus::Failed, Some(counters), Some(reason))
            .await
        {
            Ok(true) => BatchStatus::Failed,
            Ok(false) => match self.store.status(id).await {
                Ok(Some(status)) => status,
                _ => BatchStatus::Failed,
            },
            Err(err) => {
                tracing::error!(batch_id = %id, error = %err, "Failed to record batch failure");
                BatchStatus::Failed
            }
        }
    }

    /// Request cooperative cancellation of a pending or sending batch.
    pub async fn cancel(&self, id: Uuid, cancelled_by: Uuid) -> Result<(), AppError> {
        match self.store.cancel(id, cancelled_by).await? {
            CancelOutcome::Cancelled => {
                tracing::info!(batch_id = %id, cancelled_by = %cancelled_by, "Batch cancellation requested");
                Ok(())
            }
            CancelOutcome::NotFound => Err(AppError::NotFound(format!("Batch {} not found", id))),
            CancelOutcome::Terminal(status) => Err(AppError::Conflict(format!(
                "Batch {} is already {}",
                id, status
            ))),
        }
    }

    pub async fn details(&self, id: Uuid) -> Result<BatchDetails, AppError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Batch {} not found", id)))?;
        let notifications = self.store.preview(id, PREVIEW_LIMIT).await?;

        Ok(BatchDetails {
            job: record.job,
            progress: record.progress,
            notifications,
        })
    }

    /// Most recent batches first. `page` starts at 1.
    pub async fn list(&self, page: u32, page_size: u32) -> Result<Vec<BatchRecord>, AppError> {
        if page < 1 {
            return Err(AppError::Validation("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(AppError::Validation(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = (page as i64 - 1) * page_size as i64;
        self.store.list(page_size as i64, offset).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_common::types::{
        BatchPayload, ChannelFlags, DeliveryReport, NotificationType, RecipientSelector,
    };

    use super::*;
    use crate::resolver::StaticResolver;
    use crate::store::MemoryBatchStore;

    /// Deliverer that records calls and misbehaves for selected users.
    #[derive(Default)]
    struct ScriptedDeliverer {
        delivered: Mutex<Vec<Uuid>>,
        failing: HashSet<Uuid>,
        hanging: HashSet<Uuid>,
        /// Succeed after a minute
        slow: HashSet<Uuid>,
        max_duration: Option<Duration>,
        /// Cancel the batch once this many calls have been made
        cancel_after: Option<(usize, Arc<MemoryBatchStore>)>,
    }

    impl ScriptedDeliverer {
        fn calls(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Deliverer for ScriptedDeliverer {
        async fn deliver(
            &self,
            recipient: &Recipient,
            job: &BatchJob,
        ) -> Result<DeliveryReport, AppError> {
            let calls = {
                let mut delivered = self.delivered.lock().unwrap();
                delivered.push(recipient.user_id);
                delivered.len()
            };
            if let Some((after, store)) = &self.cancel_after {
                if calls == *after {
                    store.cancel(job.id, job.created_by).await?;
                }
            }
            if self.hanging.contains(&recipient.user_id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.slow.contains(&recipient.user_id) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.failing.contains(&recipient.user_id) {
                return Err(AppError::Delivery("gateway unavailable".to_string()));
            }
            Ok(DeliveryReport {
                notification_id: Uuid::new_v4(),
                email_sent: job.channels.send_email,
                push_sent: job.channels.send_push,
            })
        }

        fn max_duration(&self) -> Option<Duration> {
            self.max_duration
        }
    }

    /// Store whose counter writes fail after a number of successes.
    struct FlakyStore {
        inner: Arc<MemoryBatchStore>,
        counter_writes_left: AtomicUsize,
        /// Reject the move to `sending` with an error
        fail_start: bool,
    }

    #[async_trait]
    impl BatchStore for FlakyStore {
        async fn create(&self, job: &BatchJob) -> Result<BatchProgress, AppError> {
            self.inner.create(job).await
        }
        async fn get(&self, id: Uuid) -> Result<Option<BatchRecord>, AppError> {
            self.inner.get(id).await
        }
        async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BatchRecord>, AppError> {
            self.inner.list(limit, offset).await
        }
        async fn status(&self, id: Uuid) -> Result<Option<BatchStatus>, AppError> {
            self.inner.status(id).await
        }
        async fn transition(
            &self,
            id: Uuid,
            to: BatchStatus,
            counters: Option<BatchCounters>,
            error: Option<String>,
        ) -> Result<bool, AppError> {
            if self.fail_start && to == BatchStatus::Sending {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.inner.transition(id, to, counters, error).await
        }
        async fn set_total(&self, id: Uuid, total: i64) -> Result<(), AppError> {
            self.inner.set_total(id, total).await
        }
        async fn update_counters(
            &self,
            id: Uuid,
            counters: BatchCounters,
        ) -> Result<bool, AppError> {
            let left = self.counter_writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.counter_writes_left.store(left - 1, Ordering::SeqCst);
            self.inner.update_counters(id, counters).await
        }
        async fn cancel(&self, id: Uuid, by: Uuid) -> Result<CancelOutcome, AppError> {
            self.inner.cancel(id, by).await
        }
        async fn preview(&self, id: Uuid, limit: i64) -> Result<Vec<Notification>, AppError> {
            self.inner.preview(id, limit).await
        }
        async fn fail_unfinished(&self, reason: &str) -> Result<Vec<Uuid>, AppError> {
            self.inner.fail_unfinished(reason).await
        }
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|_| Recipient {
                user_id: Uuid::new_v4(),
                account_id: Uuid::new_v4(),
                email: Some("user@example.com".to_string()),
            })
            .collect()
    }

    fn job() -> BatchJob {
        BatchJob::new(
            Uuid::new_v4(),
            BatchPayload {
                title: "Scheduled maintenance".to_string(),
                message: "Service will be down at 02:00 UTC".to_string(),
                notification_type: NotificationType::Warning,
                metadata: serde_json::json!({}),
            },
            RecipientSelector::All,
            ChannelFlags::default(),
        )
    }

    fn dispatcher(
        store: Arc<dyn BatchStore>,
        recipients: Vec<Recipient>,
        deliverer: Arc<ScriptedDeliverer>,
    ) -> BatchDispatcher {
        BatchDispatcher::new(
            store,
            Arc::new(StaticResolver::new(recipients)),
            deliverer,
            DispatchSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_recipients_delivered_in_chunks() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let dispatcher = dispatcher(store.clone(), recipients(250), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.chunks_processed, 3);
        assert_eq!(report.delays_applied, 2);
        assert_eq!(report.counters.emails_sent, 250);
        assert_eq!(report.counters.pushes_sent, 250);
        assert_eq!(deliverer.calls(), 250);

        let record = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.progress.status, BatchStatus::Completed);
        assert_eq!(record.progress.total_recipients, 250);
        assert_eq!(record.progress.emails_sent, 250);
        assert!(record.progress.started_at.is_some());
        assert!(record.progress.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_recipient_does_not_stop_batch() {
        let store = Arc::new(MemoryBatchStore::new());
        let targets = recipients(10);
        let deliverer = Arc::new(ScriptedDeliverer {
            failing: HashSet::from([targets[4].user_id]),
            ..Default::default()
        });
        let dispatcher = dispatcher(store.clone(), targets, deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.counters.emails_sent, 9);
        assert_eq!(report.counters.pushes_sent, 9);
        assert_eq!(deliverer.calls(), 10);
        assert_eq!(report.delays_applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_first_chunk_stops_batch() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer {
            cancel_after: Some((100, store.clone())),
            ..Default::default()
        });
        let dispatcher = dispatcher(store.clone(), recipients(300), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.chunks_processed, 1);
        assert_eq!(deliverer.calls(), 100);

        let record = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.progress.status, BatchStatus::Cancelled);
        assert_eq!(record.progress.emails_sent, 100);
        assert_eq!(record.progress.pushes_sent, 100);
        assert_eq!(record.progress.cancelled_by, Some(job.created_by));
        assert!(record.progress.completed_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_last_chunk_reports_cancelled() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer {
            cancel_after: Some((5, store.clone())),
            ..Default::default()
        });
        let dispatcher = dispatcher(store.clone(), recipients(10), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        // The chunk in flight finishes
        assert_eq!(deliverer.calls(), 10);
        assert_eq!(report.status, BatchStatus::Cancelled);
        let record = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.progress.status, BatchStatus::Cancelled);
        assert_eq!(record.progress.emails_sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_recipients_fails() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let dispatcher = dispatcher(store.clone(), Vec::new(), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(deliverer.calls(), 0);
        let record = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.progress.last_error.as_deref(), Some("no recipients"));
        assert_eq!(record.progress.counters(), BatchCounters::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_error_fails() {
        struct BrokenResolver;

        #[async_trait]
        impl RecipientResolver for BrokenResolver {
            async fn resolve(
                &self,
                _selector: &RecipientSelector,
            ) -> Result<Vec<Recipient>, AppError> {
                Err(AppError::Internal("accounts table unavailable".to_string()))
            }
        }

        let store = Arc::new(MemoryBatchStore::new());
        let dispatcher = BatchDispatcher::new(
            store.clone(),
            Arc::new(BrokenResolver),
            Arc::new(ScriptedDeliverer::default()),
            DispatchSettings::default(),
        );
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        assert_eq!(report.status, BatchStatus::Failed);
        let record = store.get(job.id).await.unwrap().unwrap();
        assert!(
            record
                .progress
                .last_error
                .unwrap()
                .contains("accounts table unavailable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_pending_never_sends() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let dispatcher = dispatcher(store.clone(), recipients(5), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();
        dispatcher.cancel(job.id, job.created_by).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(deliverer.calls(), 0);
        let record = store.get(job.id).await.unwrap().unwrap();
        assert!(record.progress.started_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_delivery_counts_as_failure() {
        let store = Arc::new(MemoryBatchStore::new());
        let targets = recipients(3);
        let deliverer = Arc::new(ScriptedDeliverer {
            hanging: HashSet::from([targets[1].user_id]),
            ..Default::default()
        });
        let dispatcher = dispatcher(store.clone(), targets, deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job).await;

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.counters.emails_sent, 2);
        assert_eq!(deliverer.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_marks_failed_and_keeps_counters() {
        let memory = Arc::new(MemoryBatchStore::new());
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            counter_writes_left: AtomicUsize::new(1),
            fail_start: false,
        });
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let dispatcher = dispatcher(store.clone(), recipients(50), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        // First write at 10 succeeds, second at 20 fails
        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(deliverer.calls(), 20);
        let record = memory.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.progress.status, BatchStatus::Failed);
        assert_eq!(record.progress.emails_sent, 20);
        assert!(record.progress.last_error.unwrap().contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_error_fails_pending_batch() {
        let memory = Arc::new(MemoryBatchStore::new());
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            counter_writes_left: AtomicUsize::new(usize::MAX),
            fail_start: true,
        });
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let dispatcher = dispatcher(store.clone(), recipients(5), deliverer.clone());
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job.clone()).await;

        // Pending goes straight to failed, nothing was sent
        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(deliverer.calls(), 0);
        let record = memory.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.progress.status, BatchStatus::Failed);
        assert!(record.progress.started_at.is_none());
        assert!(record.progress.completed_at.is_some());
        assert!(record.progress.last_error.unwrap().contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_raised_to_delivery_budget() {
        let store = Arc::new(MemoryBatchStore::new());
        let targets = recipients(3);
        let deliverer = Arc::new(ScriptedDeliverer {
            slow: HashSet::from([targets[0].user_id]),
            max_duration: Some(Duration::from_secs(90)),
            ..Default::default()
        });
        let dispatcher = BatchDispatcher::new(
            store.clone(),
            Arc::new(StaticResolver::new(targets)),
            deliverer.clone(),
            DispatchSettings {
                delivery_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        assert_eq!(dispatcher.settings.delivery_timeout, Duration::from_secs(90));
        let job = job();
        store.create(&job).await.unwrap();

        let report = dispatcher.process(job).await;

        // The minute-long delivery still counts
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.counters.emails_sent, 3);
        assert_eq!(report.counters.pushes_sent, 3);
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_unfinished_batches() {
        let store = Arc::new(MemoryBatchStore::new());
        let dispatcher = dispatcher(
            store.clone(),
            Vec::new(),
            Arc::new(ScriptedDeliverer::default()),
        );
        let pending = job();
        let sending = job();
        let cancelled = job();
        for job in [&pending, &sending, &cancelled] {
            store.create(job).await.unwrap();
        }
        store
            .transition(sending.id, BatchStatus::Sending, None, None)
            .await
            .unwrap();
        dispatcher
            .cancel(cancelled.id, cancelled.created_by)
            .await
            .unwrap();

        assert_eq!(dispatcher.recover_interrupted().await.unwrap(), 2);

        for id in [pending.id, sending.id] {
            let details = dispatcher.details(id).await.unwrap();
            assert_eq!(details.progress.status, BatchStatus::Failed);
            assert_eq!(
                details.progress.last_error.as_deref(),
                Some(INTERRUPTED_REASON)
            );
        }
        assert_eq!(
            store.status(cancelled.id).await.unwrap(),
            Some(BatchStatus::Cancelled)
        );
        assert_eq!(dispatcher.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_history_is_monotonic() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer {
            cancel_after: Some((150, store.clone())),
            ..Default::default()
        });
        let dispatcher = dispatcher(store.clone(), recipients(250), deliverer);
        let job = job();
        store.create(&job).await.unwrap();

        dispatcher.process(job.clone()).await;

        let history = store.history(job.id).await;
        assert!(history.len() > 2);
        for pair in history.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            assert!(after.emails_sent >= before.emails_sent);
            assert!(after.pushes_sent >= before.pushes_sent);
            assert!(
                before.status == after.status || before.status.can_transition_to(after.status),
                "{} -> {}",
                before.status,
                after.status
            );
        }
        let last = history.last().unwrap();
        assert_eq!(last.status, BatchStatus::Cancelled);
        assert_eq!(last.emails_sent, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_returns_pending_then_completes() {
        let store = Arc::new(MemoryBatchStore::new());
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let dispatcher = Arc::new(dispatcher(store.clone(), recipients(120), deliverer));
        let job = job();

        let progress = dispatcher.submit(job.clone()).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Pending);

        let mut status = BatchStatus::Pending;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = store.status(job.id).await.unwrap().unwrap();
            if status.is_terminal() {
                break;
            }
        }
        assert_eq!(status, BatchStatus::Completed);

        let details = dispatcher.details(job.id).await.unwrap();
        assert_eq!(details.progress.total_recipients, 120);
        assert_eq!(details.progress.emails_sent, 120);
        assert!(details.notifications.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_errors() {
        let store = Arc::new(MemoryBatchStore::new());
        let dispatcher = dispatcher(
            store.clone(),
            Vec::new(),
            Arc::new(ScriptedDeliverer::default()),
        );
        let job = job();
        store.create(&job).await.unwrap();
        store
            .transition(job.id, BatchStatus::Sending, None, None)
            .await
            .unwrap();
        store
            .transition(job.id, BatchStatus::Completed, None, None)
            .await
            .unwrap();

        let err = dispatcher.cancel(job.id, job.created_by).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(
            store.status(job.id).await.unwrap(),
            Some(BatchStatus::Completed)
        );

        let err = dispatcher
            .cancel(Uuid::new_v4(), job.created_by)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(matches!(
            dispatcher.details(Uuid::new_v4()).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_validates_paging() {
        let store = Arc::new(MemoryBatchStore::new());
        let dispatcher = dispatcher(
            store.clone(),
            Vec::new(),
            Arc::new(ScriptedDeliverer::default()),
        );
        for _ in 0..3 {
            store.create(&job()).await.unwrap();
        }

        assert_eq!(dispatcher.list(1, 2).await.unwrap().len(), 2);
        assert_eq!(dispatcher.list(2, 2).await.unwrap().len(), 1);
        assert!(matches!(
            dispatcher.list(0, 20).await.unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            dispatcher.list(1, 0).await.unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            dispatcher.list(1, 101).await.unwrap_err(),
            AppError::Validation(_)
        ));
    }
}
