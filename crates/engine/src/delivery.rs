//! Delivery seam between the dispatcher and the notification service.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::{BatchJob, DeliveryReport, NotificationCategory, Recipient};
use courier_notifier::{NotificationService, SendNotification};

/// Delivers one batch payload to one recipient.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, job: &BatchJob) -> Result<DeliveryReport, AppError>;

    /// Upper bound of one `deliver` call including its own retries, if known.
    fn max_duration(&self) -> Option<Duration> {
        None
    }
}

/// The single-notification request sent to each recipient of a batch.
pub fn batch_notification(recipient: &Recipient, job: &BatchJob) -> SendNotification {
    let mut metadata = match &job.payload.metadata {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    metadata.insert("global_batch_id".to_string(), json!(job.id));
    metadata.insert("created_by".to_string(), json!(job.created_by));

    SendNotification {
        user_id: recipient.user_id,
        account_id: recipient.account_id,
        title: job.payload.title.clone(),
        message: job.payload.message.clone(),
        notification_type: job.payload.notification_type,
        category: Some(NotificationCategory::Admin),
        thread_id: None,
        agent_run_id: None,
        send_email: job.channels.send_email,
        send_push: job.channels.send_push,
        metadata: Some(serde_json::Value::Object(metadata)),
        batch_id: Some(job.id),
        email_hint: recipient.email.clone(),
    }
}

#[async_trait]
impl Deliverer for NotificationService {
    async fn deliver(&self, recipient: &Recipient, job: &BatchJob) -> Result<DeliveryReport, AppError> {
        self.send_notification(&batch_notification(recipient, job)).await
    }

    fn max_duration(&self) -> Option<Duration> {
        Some(self.max_delivery_time())
    }
}
