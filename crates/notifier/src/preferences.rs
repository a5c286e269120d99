//! Per-user delivery preferences and push token registration.

use std::collections::HashMap;

use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{NotificationCategory, NotificationPreferences, default_categories};

/// Service layer for notification preferences.
pub struct PreferenceService;

/// Partial update of a user's preferences. Category maps are merged into the stored ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePreferencesParams {
    pub email_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub email_categories: Option<HashMap<String, bool>>,
    pub push_categories: Option<HashMap<String, bool>>,
}

impl PreferenceService {
    /// The account a user acts through: their personal account, else the oldest owned one.
    pub async fn account_for_user(pool: &PgPool, user_id: Uuid) -> Result<Option<Uuid>, AppError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM accounts
            WHERE primary_owner_user_id = $1
            ORDER BY personal_account DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    pub async fn find(
        pool: &PgPool,
        user_id: Uuid,
    ) -> Result<Option<NotificationPreferences>, AppError> {
        let prefs = sqlx::query_as("SELECT * FROM notification_preferences WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        Ok(prefs)
    }

    /// Stored preferences, or the defaults if the user never saved any. Never writes.
    pub async fn get_or_default(
        pool: &PgPool,
        user_id: Uuid,
    ) -> Result<NotificationPreferences, AppError> {
        if let Some(prefs) = Self::find(pool, user_id).await? {
            return Ok(prefs);
        }
        let account_id = Self::account_for_user(pool, user_id).await?;
        Ok(NotificationPreferences::defaults(user_id, account_id))
    }

    /// Stored preferences, inserting the defaults first if absent.
    pub async fn get_or_create(
        pool: &PgPool,
        user_id: Uuid,
        account_id: Uuid,
    ) -> Result<NotificationPreferences, AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_preferences (user_id, account_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .execute(pool)
        .await?;

        Self::find(pool, user_id).await?.ok_or_else(|| {
            AppError::Internal(format!("Preferences for user {} vanished after insert", user_id))
        })
    }

    /// Apply a partial update, creating the row if needed.
    pub async fn update(
        pool: &PgPool,
        user_id: Uuid,
        params: &UpdatePreferencesParams,
    ) -> Result<NotificationPreferences, AppError> {
        let account_id = Self::account_for_user(pool, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Account not found".to_string()))?;

        let email_categories = params
            .email_categories
            .as_ref()
            .map(validate_categories)
            .transpose()?;
        let push_categories = params
            .push_categories
            .as_ref()
            .map(validate_categories)
            .transpose()?;

        let prefs: NotificationPreferences = sqlx::query_as(
            r#"
            INSERT INTO notification_preferences
                (user_id, account_id, email_enabled, push_enabled, email_categories, push_categories)
            VALUES (
                $1, $2,
                COALESCE($3, TRUE),
                COALESCE($4, TRUE),
                $7 || COALESCE($5, '{}'::jsonb),
                $7 || COALESCE($6, '{}'::jsonb)
            )
            ON CONFLICT (user_id) DO UPDATE SET
                email_enabled = COALESCE($3, notification_preferences.email_enabled),
                push_enabled = COALESCE($4, notification_preferences.push_enabled),
                email_categories = notification_preferences.email_categories || COALESCE($5, '{}'::jsonb),
                push_categories = notification_preferences.push_categories || COALESCE($6, '{}'::jsonb),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .bind(params.email_enabled)
        .bind(params.push_enabled)
        .bind(email_categories)
        .bind(push_categories)
        .bind(default_categories())
        .fetch_one(pool)
        .await?;

        tracing::info!(user_id = %user_id, "Notification preferences updated");
        Ok(prefs)
    }

    /// Register (or replace) the device push token of a user.
    pub async fn register_push_token(
        pool: &PgPool,
        user_id: Uuid,
        push_token: &str,
    ) -> Result<(), AppError> {
        let push_token = push_token.trim();
        if push_token.is_empty() {
            return Err(AppError::Validation("push_token must not be empty".to_string()));
        }

        let account_id = Self::account_for_user(pool, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Account not found".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO notification_preferences (user_id, account_id, push_token, push_token_updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                push_token = EXCLUDED.push_token,
                push_token_updated_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .bind(push_token)
        .execute(pool)
        .await?;

        tracing::info!(user_id = %user_id, "Push token registered");
        Ok(())
    }

    /// Forget a push token the gateway reported as dead. No-op if it was replaced meanwhile.
    pub async fn clear_push_token(
        pool: &PgPool,
        user_id: Uuid,
        push_token: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_preferences
            SET push_token = NULL, push_token_updated_at = NULL, updated_at = NOW()
            WHERE user_id = $1 AND push_token = $2
            "#,
        )
        .bind(user_id)
        .bind(push_token)
        .execute(pool)
        .await?;

        let cleared = result.rows_affected() > 0;
        if cleared {
            tracing::info!(user_id = %user_id, "Cleared invalid push token");
        }
        Ok(cleared)
    }
}

/// Reject unknown category names so typos don't silently create dead keys.
fn validate_categories(categories: &HashMap<String, bool>) -> Result<serde_json::Value, AppError> {
    let mut map = serde_json::Map::new();
    for (name, enabled) in categories {
        if !NotificationCategory::ALL.iter().any(|c| c.as_str() == name) {
            return Err(AppError::Validation(format!(
                "Unknown notification category '{}'",
                name
            )));
        }
        map.insert(name.clone(), serde_json::Value::Bool(*enabled));
    }
    Ok(serde_json::Value::Object(map))
}
