use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Visual flavour of a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    AgentComplete,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Info => write!(f, "info"),
            NotificationType::Success => write!(f, "success"),
            NotificationType::Warning => write!(f, "warning"),
            NotificationType::Error => write!(f, "error"),
            NotificationType::AgentComplete => write!(f, "agent_complete"),
        }
    }
}

/// Category used for per-category delivery preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Agent,
    System,
    Billing,
    Admin,
}

impl NotificationCategory {
    pub const ALL: [NotificationCategory; 4] = [
        NotificationCategory::Agent,
        NotificationCategory::System,
        NotificationCategory::Billing,
        NotificationCategory::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Agent => "agent",
            NotificationCategory::System => "system",
            NotificationCategory::Billing => "billing",
            NotificationCategory::Admin => "admin",
        }
    }
}

impl std::fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a global notification batch.
///
/// `Pending → Sending → {Completed | Cancelled | Failed}`. A pending batch may
/// also be cancelled, or failed when it could not be started or its process
/// died before it ran. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Sending,
    Completed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Cancelled | BatchStatus::Failed
        )
    }

    /// Whether a batch in `self` may move to `next`.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        match self {
            BatchStatus::Pending => matches!(
                next,
                BatchStatus::Sending | BatchStatus::Cancelled | BatchStatus::Failed
            ),
            BatchStatus::Sending => next.is_terminal(),
            BatchStatus::Completed | BatchStatus::Cancelled | BatchStatus::Failed => false,
        }
    }

    /// Statuses from which a batch may move to `next`.
    pub fn predecessors(next: BatchStatus) -> &'static [BatchStatus] {
        match next {
            BatchStatus::Pending => &[],
            BatchStatus::Sending => &[BatchStatus::Pending],
            BatchStatus::Completed => &[BatchStatus::Sending],
            BatchStatus::Cancelled | BatchStatus::Failed => {
                &[BatchStatus::Pending, BatchStatus::Sending]
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Sending => "sending",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which users a batch is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum RecipientSelector {
    All,
    Users(Vec<Uuid>),
    Accounts(Vec<Uuid>),
}

impl RecipientSelector {
    /// Build a selector from the optional target lists of a submission.
    ///
    /// User ids win over account ids; no (or empty) targets means everyone.
    pub fn from_targets(user_ids: Option<Vec<Uuid>>, account_ids: Option<Vec<Uuid>>) -> Self {
        match (user_ids, account_ids) {
            (Some(users), _) if !users.is_empty() => RecipientSelector::Users(users),
            (_, Some(accounts)) if !accounts.is_empty() => RecipientSelector::Accounts(accounts),
            _ => RecipientSelector::All,
        }
    }
}

/// Delivery channels requested for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlags {
    pub send_email: bool,
    pub send_push: bool,
}

impl ChannelFlags {
    /// Whether at least one channel is enabled.
    pub fn any(&self) -> bool {
        self.send_email || self.send_push
    }
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self {
            send_email: true,
            send_push: true,
        }
    }
}

/// Content delivered to every recipient of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPayload {
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    /// Arbitrary metadata copied onto every delivered notification
    pub metadata: serde_json::Value,
}

/// An admin request to notify a set of users. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub created_by: Uuid,
    pub payload: BatchPayload,
    pub selector: RecipientSelector,
    pub channels: ChannelFlags,
    pub created_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(
        created_by: Uuid,
        payload: BatchPayload,
        selector: RecipientSelector,
        channels: ChannelFlags,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_by,
            payload,
            selector,
            channels,
            created_at: Utc::now(),
        }
    }
}

/// Per-channel success counters of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub emails_sent: i64,
    pub pushes_sent: i64,
}

/// Mutable progress of a batch, owned by the dispatcher until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_recipients: i64,
    pub emails_sent: i64,
    pub pushes_sent: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub last_error: Option<String>,
}

impl BatchProgress {
    pub fn pending(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Pending,
            total_recipients: 0,
            emails_sent: 0,
            pushes_sent: 0,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            last_error: None,
        }
    }

    pub fn counters(&self) -> BatchCounters {
        BatchCounters {
            emails_sent: self.emails_sent,
            pushes_sent: self.pushes_sent,
        }
    }
}

/// A batch together with its current progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub job: BatchJob,
    pub progress: BatchProgress,
}

/// A resolved batch target. Lives only for the duration of a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub email: Option<String>,
}

/// A notification delivered to (and shown in the inbox of) a single user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub account_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub category: Option<NotificationCategory>,
    pub thread_id: Option<Uuid>,
    pub agent_run_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub batch_id: Option<Uuid>,
    pub email_sent: bool,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub email_error: Option<String>,
    pub push_sent: bool,
    pub push_sent_at: Option<DateTime<Utc>>,
    pub push_error: Option<String>,
    pub retry_count: i32,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's delivery preferences.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub account_id: Option<Uuid>,
    pub email_enabled: bool,
    pub push_enabled: bool,
    /// Map of category → enabled; missing categories are enabled
    pub email_categories: serde_json::Value,
    /// Map of category → enabled; missing categories are enabled
    pub push_categories: serde_json::Value,
    pub push_token: Option<String>,
    pub push_token_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreferences {
    /// Preferences used for a user who never saved any.
    pub fn defaults(user_id: Uuid, account_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            account_id,
            email_enabled: true,
            push_enabled: true,
            email_categories: default_categories(),
            push_categories: default_categories(),
            push_token: None,
            push_token_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allows_email(&self, category: Option<NotificationCategory>) -> bool {
        self.email_enabled && category_enabled(&self.email_categories, category)
    }

    pub fn allows_push(&self, category: Option<NotificationCategory>) -> bool {
        self.push_enabled && category_enabled(&self.push_categories, category)
    }
}

/// All categories enabled.
pub fn default_categories() -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = NotificationCategory::ALL
        .iter()
        .map(|c| (c.as_str().to_string(), serde_json::Value::Bool(true)))
        .collect();
    serde_json::Value::Object(map)
}

fn category_enabled(categories: &serde_json::Value, category: Option<NotificationCategory>) -> bool {
    let Some(category) = category else {
        return true;
    };
    categories
        .get(category.as_str())
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

/// Outcome of sending one notification over its enabled channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub notification_id: Uuid,
    pub email_sent: bool,
    pub push_sent: bool,
}
