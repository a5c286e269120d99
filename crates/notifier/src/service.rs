//! Single-notification delivery: persist the notification, then try each enabled channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    DeliveryReport, NotificationCategory, NotificationPreferences, NotificationType,
};

use crate::email::{self, EmailSender};
use crate::preferences::PreferenceService;
use crate::push::{self, PushMessage, PushSender};
use crate::retry::RetryPolicy;

/// A request to notify one user.
#[derive(Debug, Clone, Deserialize)]
pub struct SendNotification {
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub notification_type: NotificationType,
    pub category: Option<NotificationCategory>,
    pub thread_id: Option<Uuid>,
    pub agent_run_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub send_email: bool,
    #[serde(default = "default_true")]
    pub send_push: bool,
    pub metadata: Option<serde_json::Value>,
    /// Global batch this notification belongs to
    #[serde(skip)]
    pub batch_id: Option<Uuid>,
    /// Address already known to the caller; looked up from `users` otherwise
    #[serde(skip)]
    pub email_hint: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Outcome of one channel for one notification.
#[derive(Debug, Default)]
struct ChannelOutcome {
    sent: bool,
    sent_at: Option<DateTime<Utc>>,
    error: Option<String>,
    attempts: u32,
}

impl ChannelOutcome {
    fn skipped() -> Self {
        Self::default()
    }

    fn failed(error: String, attempts: u32) -> Self {
        Self {
            error: Some(error),
            attempts,
            ..Self::default()
        }
    }

    fn retries(&self) -> u32 {
        if self.sent {
            0
        } else {
            self.attempts.saturating_sub(1)
        }
    }
}

/// Allowance for the row writes around the channel sends.
const PERSIST_ALLOWANCE: Duration = Duration::from_secs(5);

/// Worst case of both channels exhausting `retry`, each push attempt
/// including its receipt lookup.
pub fn delivery_budget(retry: &RetryPolicy) -> Duration {
    retry.budget(email::SEND_TIMEOUT)
        + retry.budget(push::SEND_TIMEOUT + push::RECEIPT_TIMEOUT)
        + PERSIST_ALLOWANCE
}

/// Sends notifications over email and push according to user preferences.
pub struct NotificationService {
    pool: PgPool,
    email: Arc<dyn EmailSender>,
    push: Arc<dyn PushSender>,
    retry: RetryPolicy,
    app_url: String,
}

impl NotificationService {
    pub fn new(
        pool: PgPool,
        email: Arc<dyn EmailSender>,
        push: Arc<dyn PushSender>,
        retry: RetryPolicy,
        app_url: String,
    ) -> Self {
        Self {
            pool,
            email,
            push,
            retry,
            app_url,
        }
    }

    /// Longest a single `send_notification` is expected to run.
    pub fn max_delivery_time(&self) -> Duration {
        delivery_budget(&self.retry)
    }

    /// Create the notification record and deliver it over the enabled channels.
    ///
    /// Channel failures are recorded on the row and reflected in the report;
    /// only database failures are returned as errors.
    pub async fn send_notification(&self, req: &SendNotification) -> Result<DeliveryReport, AppError> {
        let prefs = PreferenceService::get_or_create(&self.pool, req.user_id, req.account_id).await?;

        let should_email = req.send_email && prefs.allows_email(req.category);
        let should_push = req.send_push && prefs.allows_push(req.category);

        let notification_id = self.insert_notification(req).await?;

        let email = if should_email {
            self.deliver_email(req).await?
        } else {
            ChannelOutcome::skipped()
        };

        let push = if should_push {
            self.deliver_push(req, &prefs, notification_id).await?
        } else {
            ChannelOutcome::skipped()
        };

        self.record_outcome(notification_id, &email, &push).await?;

        tracing::debug!(
            notification_id = %notification_id,
            user_id = %req.user_id,
            email_sent = email.sent,
            push_sent = push.sent,
            "Notification delivered"
        );

        Ok(DeliveryReport {
            notification_id,
            email_sent: email.sent,
            push_sent: push.sent,
        })
    }

    async fn insert_notification(&self, req: &SendNotification) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        let metadata = req.metadata.clone().unwrap_or_else(|| json!({}));

        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, account_id, user_id, title, message, notification_type, category,
                 thread_id, agent_run_id, metadata, batch_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(req.account_id)
        .bind(req.user_id)
        .bind(&req.title)
        .bind(&req.message)
        .bind(req.notification_type)
        .bind(req.category)
        .bind(req.thread_id)
        .bind(req.agent_run_id)
        .bind(&metadata)
        .bind(req.batch_id)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn deliver_email(&self, req: &SendNotification) -> Result<ChannelOutcome, AppError> {
        let address = match &req.email_hint {
            Some(address) => Some(address.clone()),
            None => self.user_email(req.user_id).await?,
        };

        let Some(address) = address else {
            tracing::warn!(user_id = %req.user_id, "No email address for user");
            return Ok(ChannelOutcome::failed(
                "no email address for user".to_string(),
                0,
            ));
        };

        let message = email::render_notification(
            &address,
            &req.title,
            &req.message,
            req.notification_type,
            &self.app_url,
        );

        let sender = self.email.as_ref();
        let message = &message;
        let outcome = self.retry.run(move || sender.send(message)).await;
        Ok(match outcome.result {
            Ok(()) => ChannelOutcome {
                sent: true,
                sent_at: Some(Utc::now()),
                error: None,
                attempts: outcome.attempts,
            },
            Err(err) => {
                tracing::error!(
                    user_id = %req.user_id,
                    attempts = outcome.attempts,
                    error = %err,
                    "Failed to send notification email"
                );
                ChannelOutcome::failed(err.to_string(), outcome.attempts)
            }
        })
    }

    async fn deliver_push(
        &self,
        req: &SendNotification,
        prefs: &NotificationPreferences,
        notification_id: Uuid,
    ) -> Result<ChannelOutcome, AppError> {
        let Some(token) = prefs.push_token.as_deref() else {
            return Ok(ChannelOutcome::skipped());
        };

        let message = PushMessage {
            to: token.to_string(),
            title: req.title.clone(),
            body: req.message.clone(),
            data: json!({
                "notification_id": notification_id,
                "thread_id": req.thread_id,
                "agent_run_id": req.agent_run_id,
            }),
        };

        let sender = self.push.as_ref();
        let message = &message;
        let outcome = self.retry.run(move || sender.send(message)).await;
        match outcome.result {
            Ok(()) => Ok(ChannelOutcome {
                sent: true,
                sent_at: Some(Utc::now()),
                error: None,
                attempts: outcome.attempts,
            }),
            Err(err) => {
                if err.invalidates_token() {
                    tracing::warn!(user_id = %req.user_id, error = %err, "Push token rejected by gateway");
                    PreferenceService::clear_push_token(&self.pool, req.user_id, token).await?;
                } else {
                    tracing::error!(
                        user_id = %req.user_id,
                        attempts = outcome.attempts,
                        error = %err,
                        "Failed to send push notification"
                    );
                }
                Ok(ChannelOutcome::failed(err.to_string(), outcome.attempts))
            }
        }
    }

    async fn user_email(&self, user_id: Uuid) -> Result<Option<String>, AppError> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|(email,)| email)
            .filter(|email| !email.trim().is_empty()))
    }

    async fn record_outcome(
        &self,
        notification_id: Uuid,
        email: &ChannelOutcome,
        push: &ChannelOutcome,
    ) -> Result<(), AppError> {
        let retry_count = email.retries().max(push.retries()) as i32;

        sqlx::query(
            r#"
            UPDATE notifications
            SET email_sent = $2, email_sent_at = $3, email_error = $4,
                push_sent = $5, push_sent_at = $6, push_error = $7,
                retry_count = $8, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(notification_id)
        .bind(email.sent)
        .bind(email.sent_at)
        .bind(&email.error)
        .bind(push.sent)
        .bind(push.sent_at)
        .bind(&push.error)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_budget_with_default_retry() {
        // email 3 x 10 s + 2 x 2 s, push 3 x 15 s + 2 x 2 s, plus row writes
        assert_eq!(
            delivery_budget(&RetryPolicy::default()),
            Duration::from_secs(34 + 49 + 5)
        );

        let single = RetryPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(1),
        };
        assert_eq!(delivery_budget(&single), Duration::from_secs(10 + 15 + 5));
    }

    #[test]
    fn test_send_request_defaults() {
        let req: SendNotification = serde_json::from_value(json!({
            "user_id": Uuid::new_v4(),
            "account_id": Uuid::new_v4(),
            "title": "Hello",
            "message": "World"
        }))
        .unwrap();
        assert!(req.send_email);
        assert!(req.send_push);
        assert_eq!(req.notification_type, NotificationType::Info);
        assert!(req.category.is_none());
        assert!(req.batch_id.is_none());
    }

    #[test]
    fn test_retries_only_count_failures() {
        let sent = ChannelOutcome {
            sent: true,
            sent_at: Some(Utc::now()),
            error: None,
            attempts: 3,
        };
        assert_eq!(sent.retries(), 0);
        assert_eq!(ChannelOutcome::failed("x".into(), 3).retries(), 2);
        assert_eq!(ChannelOutcome::skipped().retries(), 0);
    }
}
