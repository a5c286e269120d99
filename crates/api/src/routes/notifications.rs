//! User notification inbox, preferences and internal single-send routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeliveryReport, Notification, NotificationPreferences};
use courier_engine::inbox::{InboxService, ListFilter, NotificationPage};
use courier_notifier::SendNotification;
use courier_notifier::preferences::{PreferenceService, UpdatePreferencesParams};

use crate::middleware::auth::{AdminUser, AuthUser};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/read-all", patch(mark_all_read))
        .route(
            "/api/notifications/preferences",
            get(get_preferences).put(update_preferences),
        )
        .route("/api/notifications/register-push-token", post(register_push_token))
        .route("/api/notifications/send", post(send_notification))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/read", patch(mark_read))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadBody {
    #[serde(default = "default_true")]
    pub is_read: bool,
}

#[derive(Debug, Deserialize)]
pub struct MarkAllBody {
    pub notification_ids: Option<Vec<Uuid>>,
    #[serde(default = "default_true")]
    pub is_read: bool,
}

#[derive(Debug, Deserialize)]
pub struct PushTokenBody {
    pub push_token: String,
}

fn default_true() -> bool {
    true
}

/// GET /api/notifications — Paged inbox of the authenticated user.
async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filter): Query<ListFilter>,
) -> Result<Json<NotificationPage>, AppError> {
    let page = InboxService::list(&state.pool, auth.user_id, &filter).await?;
    Ok(Json(page))
}

async fn get_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(InboxService::get(&state.pool, auth.user_id, id).await?))
}

/// PATCH /api/notifications/:id/read
async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<MarkReadBody>>,
) -> Result<Json<Notification>, AppError> {
    let is_read = body.map(|Json(b)| b.is_read).unwrap_or(true);
    let notification = InboxService::mark_read(&state.pool, auth.user_id, id, is_read).await?;
    Ok(Json(notification))
}

/// PATCH /api/notifications/read-all — Given ids, or every unread notification.
async fn mark_all_read(
    State(state): State<AppState>,
    auth: AuthUser,
    body: Option<Json<MarkAllBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (ids, is_read) = match body {
        Some(Json(body)) => (body.notification_ids, body.is_read),
        None => (None, true),
    };
    let updated =
        InboxService::mark_many_read(&state.pool, auth.user_id, ids.as_deref(), is_read).await?;
    Ok(Json(json!({"success": true, "updated_count": updated})))
}

async fn get_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<NotificationPreferences>, AppError> {
    let prefs = PreferenceService::get_or_default(&state.pool, auth.user_id).await?;
    Ok(Json(prefs))
}

/// PUT /api/notifications/preferences — Partial update; category maps are merged.
async fn update_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<UpdatePreferencesParams>,
) -> Result<Json<NotificationPreferences>, AppError> {
    let prefs = PreferenceService::update(&state.pool, auth.user_id, &params).await?;
    Ok(Json(prefs))
}

async fn register_push_token(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<PushTokenBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    PreferenceService::register_push_token(&state.pool, auth.user_id, &body.push_token).await?;
    Ok(Json(json!({"success": true})))
}

/// POST /api/notifications/send — Deliver one notification now. Admin only.
async fn send_notification(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<SendNotification>,
) -> Result<Json<DeliveryReport>, AppError> {
    if request.title.trim().is_empty() || request.message.trim().is_empty() {
        return Err(AppError::Validation(
            "title and message must not be empty".to_string(),
        ));
    }
    let report = state.notifier.send_notification(&request).await?;
    Ok(Json(report))
}
