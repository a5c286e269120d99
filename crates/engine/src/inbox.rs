//! Per-user notification inbox: listing and read state.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Notification, NotificationCategory, NotificationType};

use crate::dispatcher::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

/// Service layer for a user's notification inbox.
pub struct InboxService;

/// Query filters for listing notifications.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Exact read state; wins over `unread_only`
    pub is_read: Option<bool>,
    pub unread_only: Option<bool>,
    pub category: Option<NotificationCategory>,
    pub notification_type: Option<NotificationType>,
}

impl ListFilter {
    fn read_state(&self) -> Option<bool> {
        match (self.is_read, self.unread_only) {
            (Some(is_read), _) => Some(is_read),
            (None, Some(true)) => Some(false),
            _ => None,
        }
    }

    fn paging(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1) as i64;
        let page_size = self
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE) as i64;
        (page_size, (page - 1) * page_size)
    }
}

/// One page of a user's notifications.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    /// Matching notifications across all pages
    pub total: i64,
    /// Unread notifications of the user, ignoring filters
    pub unread_count: i64,
}

impl InboxService {
    /// Newest notifications first.
    pub async fn list(
        pool: &PgPool,
        user_id: Uuid,
        filter: &ListFilter,
    ) -> Result<NotificationPage, AppError> {
        let read_state = filter.read_state();
        let (limit, offset) = filter.paging();

        let notifications: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1
              AND ($2::boolean IS NULL OR is_read = $2)
              AND ($3::text IS NULL OR category = $3)
              AND ($4::text IS NULL OR notification_type = $4)
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(user_id)
        .bind(read_state)
        .bind(filter.category)
        .bind(filter.notification_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE user_id = $1
              AND ($2::boolean IS NULL OR is_read = $2)
              AND ($3::text IS NULL OR category = $3)
              AND ($4::text IS NULL OR notification_type = $4)
            "#,
        )
        .bind(user_id)
        .bind(read_state)
        .bind(filter.category)
        .bind(filter.notification_type)
        .fetch_one(pool)
        .await?;

        let (unread_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        Ok(NotificationPage {
            notifications,
            total,
            unread_count,
        })
    }

    /// A single notification, only if it belongs to the user.
    pub async fn get(pool: &PgPool, user_id: Uuid, id: Uuid) -> Result<Notification, AppError> {
        let notification: Option<Notification> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .fetch_optional(pool)
                .await?;

        notification.ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    pub async fn mark_read(
        pool: &PgPool,
        user_id: Uuid,
        id: Uuid,
        is_read: bool,
    ) -> Result<Notification, AppError> {
        let notification: Option<Notification> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET is_read = $3,
                read_at = CASE WHEN $3 THEN COALESCE(read_at, NOW()) ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(is_read)
        .fetch_optional(pool)
        .await?;

        notification.ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    /// Mark the given notifications, or every unread one when `ids` is `None`.
    ///
    /// Returns the number of rows changed.
    pub async fn mark_many_read(
        pool: &PgPool,
        user_id: Uuid,
        ids: Option<&[Uuid]>,
        is_read: bool,
    ) -> Result<u64, AppError> {
        let result = match ids {
            Some(ids) => {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET is_read = $3,
                        read_at = CASE WHEN $3 THEN COALESCE(read_at, NOW()) ELSE NULL END,
                        updated_at = NOW()
                    WHERE user_id = $1 AND id = ANY($2)
                    "#,
                )
                .bind(user_id)
                .bind(ids)
                .bind(is_read)
                .execute(pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET is_read = TRUE, read_at = NOW(), updated_at = NOW()
                    WHERE user_id = $1 AND is_read = FALSE
                    "#,
                )
                .bind(user_id)
                .execute(pool)
                .await?
            }
        };

        tracing::debug!(user_id = %user_id, updated = result.rows_affected(), "Notifications marked");
        Ok(result.rows_affected())
    }
}
