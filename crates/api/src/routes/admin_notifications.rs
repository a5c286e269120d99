//! Admin routes for global notification batches.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BatchJob, BatchPayload, BatchRecord, ChannelFlags, NotificationType, RecipientSelector,
};
use courier_engine::dispatcher::{BatchDetails, DEFAULT_PAGE_SIZE};

use crate::middleware::auth::AdminUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/admin/notifications/send-global", post(send_global))
        .route("/api/admin/notifications/list", get(list_batches))
        .route("/api/admin/notifications/batch/{id}", get(get_batch))
        .route("/api/admin/notifications/batch/{id}/cancel", post(cancel_batch))
}

/// Body of a global notification submission.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalNotificationRequest {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub notification_type: NotificationType,
    #[serde(default = "default_true")]
    pub send_email: bool,
    #[serde(default = "default_true")]
    pub send_push: bool,
    /// Takes precedence over `target_account_ids`; neither means everyone
    pub target_user_ids: Option<Vec<Uuid>>,
    pub target_account_ids: Option<Vec<Uuid>>,
    pub metadata: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl GlobalNotificationRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("title must not be empty".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(AppError::Validation("message must not be empty".to_string()));
        }
        if !self.channels().any() {
            return Err(AppError::Validation(
                "at least one of send_email or send_push must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    fn channels(&self) -> ChannelFlags {
        ChannelFlags {
            send_email: self.send_email,
            send_push: self.send_push,
        }
    }

    fn into_job(self, created_by: Uuid) -> BatchJob {
        let channels = self.channels();
        BatchJob::new(
            created_by,
            BatchPayload {
                title: self.title,
                message: self.message,
                notification_type: self.notification_type,
                metadata: self.metadata.unwrap_or_else(|| json!({})),
            },
            RecipientSelector::from_targets(self.target_user_ids, self.target_account_ids),
            channels,
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// POST /api/admin/notifications/send-global — Queue a global notification batch.
async fn send_global(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(request): Json<GlobalNotificationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    request.validate()?;
    let job = request.into_job(admin.user_id());
    let title = job.payload.title.clone();

    let progress = state.dispatcher.submit(job).await?;

    Ok(Json(json!({
        "batch_id": progress.batch_id,
        "status": progress.status,
        "message": "Global notification queued for sending",
        "title": title,
    })))
}

/// GET /api/admin/notifications/list — Most recent batches first.
async fn list_batches(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BatchRecord>>, AppError> {
    let batches = state
        .dispatcher
        .list(
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(batches))
}

/// GET /api/admin/notifications/batch/:id — Progress and a delivery preview.
async fn get_batch(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchDetails>, AppError> {
    Ok(Json(state.dispatcher.details(id).await?))
}

/// POST /api/admin/notifications/batch/:id/cancel — Stop a batch at its next chunk.
async fn cancel_batch(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.dispatcher.cancel(id, admin.user_id()).await?;
    Ok(Json(json!({
        "batch_id": id,
        "status": "cancelled",
        "message": "Batch cancellation requested. Processing will stop at next checkpoint.",
    })))
}
