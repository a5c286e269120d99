//! Postgres-backed batch store over `notification_batches`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BatchCounters, BatchJob, BatchPayload, BatchProgress, BatchRecord, BatchStatus, ChannelFlags,
    Notification, NotificationType, RecipientSelector,
};

use crate::store::{BatchStore, COUNTER_WRITABLE, CancelOutcome};

pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    created_by: Uuid,
    title: String,
    message: String,
    notification_type: NotificationType,
    metadata: serde_json::Value,
    selector: Json<RecipientSelector>,
    send_email: bool,
    send_push: bool,
    status: BatchStatus,
    total_recipients: i64,
    emails_sent: i64,
    pushes_sent: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancelled_by: Option<Uuid>,
}

impl From<BatchRow> for BatchRecord {
    fn from(row: BatchRow) -> Self {
        BatchRecord {
            job: BatchJob {
                id: row.id,
                created_by: row.created_by,
                payload: BatchPayload {
                    title: row.title,
                    message: row.message,
                    notification_type: row.notification_type,
                    metadata: row.metadata,
                },
                selector: row.selector.0,
                channels: ChannelFlags {
                    send_email: row.send_email,
                    send_push: row.send_push,
                },
                created_at: row.created_at,
            },
            progress: BatchProgress {
                batch_id: row.id,
                status: row.status,
                total_recipients: row.total_recipients,
                emails_sent: row.emails_sent,
                pushes_sent: row.pushes_sent,
                started_at: row.started_at,
                completed_at: row.completed_at,
                cancelled_at: row.cancelled_at,
                cancelled_by: row.cancelled_by,
                last_error: row.last_error,
            },
        }
    }
}

fn status_names(statuses: &[BatchStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn create(&self, job: &BatchJob) -> Result<BatchProgress, AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_batches
                (id, created_by, title, message, notification_type, metadata, selector,
                 send_email, send_push, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10)
            "#,
        )
        .bind(job.id)
        .bind(job.created_by)
        .bind(&job.payload.title)
        .bind(&job.payload.message)
        .bind(job.payload.notification_type)
        .bind(&job.payload.metadata)
        .bind(Json(&job.selector))
        .bind(job.channels.send_email)
        .bind(job.channels.send_push)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(BatchProgress::pending(job.id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<BatchRecord>, AppError> {
        let row: Option<BatchRow> =
            sqlx::query_as("SELECT * FROM notification_batches WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(BatchRecord::from))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BatchRecord>, AppError> {
        let rows: Vec<BatchRow> = sqlx::query_as(
            r#"
            SELECT * FROM notification_batches
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BatchRecord::from).collect())
    }

    async fn status(&self, id: Uuid) -> Result<Option<BatchStatus>, AppError> {
        let row: Option<(BatchStatus,)> =
            sqlx::query_as("SELECT status FROM notification_batches WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(status,)| status))
    }

    async fn transition(
        &self,
        id: Uuid,
        to: BatchStatus,
        counters: Option<BatchCounters>,
        error: Option<String>,
    ) -> Result<bool, AppError> {
        let from = status_names(BatchStatus::predecessors(to));
        let counters = counters.unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE notification_batches
            SET status = $2,
                started_at = CASE WHEN $2 = 'sending' THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                cancelled_at = CASE WHEN $2 = 'cancelled' THEN NOW() ELSE cancelled_at END,
                emails_sent = GREATEST(emails_sent, $3),
                pushes_sent = GREATEST(pushes_sent, $4),
                last_error = COALESCE($5, last_error)
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(to)
        .bind(counters.emails_sent)
        .bind(counters.pushes_sent)
        .bind(error)
        .bind(&from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_total(&self, id: Uuid, total: i64) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE notification_batches SET total_recipients = $2 WHERE id = $1")
            .bind(id)
            .bind(total)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Batch {} not found", id)));
        }
        Ok(())
    }

    async fn update_counters(&self, id: Uuid, counters: BatchCounters) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_batches
            SET emails_sent = GREATEST(emails_sent, $2),
                pushes_sent = GREATEST(pushes_sent, $3)
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(counters.emails_sent)
        .bind(counters.pushes_sent)
        .bind(status_names(&COUNTER_WRITABLE))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel(&self, id: Uuid, cancelled_by: Uuid) -> Result<CancelOutcome, AppError> {
        let from = status_names(BatchStatus::predecessors(BatchStatus::Cancelled));
        let result = sqlx::query(
            r#"
            UPDATE notification_batches
            SET status = 'cancelled', cancelled_at = NOW(), cancelled_by = $2
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(cancelled_by)
        .bind(&from)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        Ok(match self.status(id).await? {
            None => CancelOutcome::NotFound,
            Some(status) => CancelOutcome::Terminal(status),
        })
    }

    async fn preview(&self, id: Uuid, limit: i64) -> Result<Vec<Notification>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE batch_id = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn fail_unfinished(&self, reason: &str) -> Result<Vec<Uuid>, AppError> {
        let from = status_names(BatchStatus::predecessors(BatchStatus::Failed));
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE notification_batches
            SET status = 'failed', completed_at = NOW(), last_error = $1
            WHERE status = ANY($2)
            RETURNING id
            "#,
        )
        .bind(reason)
        .bind(&from)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
