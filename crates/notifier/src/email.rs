//! Email channel — Resend HTTP API client plus the notification template.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use courier_common::types::NotificationType;

use crate::retry::Retryable;

pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email delivery not configured")]
    NotConfigured,

    #[error("email request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("email API returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl Retryable for EmailError {
    fn is_permanent(&self) -> bool {
        match self {
            EmailError::NotConfigured => true,
            EmailError::Request(_) => false,
            // 429 and 5xx are worth another attempt, other 4xx are not
            EmailError::Rejected { status, .. } => (400..500).contains(status) && *status != 429,
        }
    }
}

/// A rendered email ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Client for the Resend `POST /emails` endpoint.
pub struct ResendClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

impl ResendClient {
    pub fn new(api_url: String, api_key: Option<String>, from: Option<String>) -> Self {
        if api_key.is_none() {
            tracing::warn!("RESEND_API_KEY not set, email notifications are disabled");
        }
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            from: from.unwrap_or_else(|| "Courier <notifications@courier.local>".to_string()),
        }
    }
}

#[async_trait]
impl EmailSender for ResendClient {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(EmailError::NotConfigured);
        };

        let response = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(api_key)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "from": self.from,
                "to": [format!("{} <{}>", message.to_name, message.to)],
                "subject": message.subject,
                "html": message.html,
                "text": message.text,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        tracing::debug!(to = %message.to, "Notification email sent");
        Ok(())
    }
}

/// Render the notification email for `to`.
pub fn render_notification(
    to: &str,
    title: &str,
    message: &str,
    notification_type: NotificationType,
    app_url: &str,
) -> EmailMessage {
    let to_name = display_name(to);
    let accent = accent_color(notification_type);
    let title_html = escape_html(title);
    let message_html = escape_html(message);

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>{title_html}</title></head>
<body style="font-family: Arial, sans-serif; background-color: #f5f5f5; margin: 0; padding: 0;">
  <div style="max-width: 600px; margin: 40px auto; padding: 30px; background-color: #ffffff; border-radius: 8px;">
    <div style="border-left: 4px solid {accent}; padding-left: 20px; margin-bottom: 20px;">
      <h1 style="font-size: 24px; margin: 0 0 10px 0;">{title_html}</h1>
    </div>
    <p>Hi {name},</p>
    <div style="background-color: #f9fafb; padding: 20px; border-radius: 6px; white-space: pre-wrap;">{message_html}</div>
    <a href="{app_url}" style="display: inline-block; margin-top: 30px; background-color: {accent}; color: #ffffff; padding: 14px 24px; text-decoration: none; font-weight: bold; border-radius: 6px;">View in App</a>
    <p style="margin-top: 30px; font-size: 12px; color: #6b7280; text-align: center;">You received this notification because you have an account with us.</p>
  </div>
</body>
</html>"#,
        name = escape_html(&to_name),
    );

    let text = format!("{title}\n\n{message}\n\nView in App: {app_url}\n");

    EmailMessage {
        to: to.to_string(),
        to_name,
        subject: format!("🔔 {}", title),
        html,
        text,
    }
}

fn accent_color(notification_type: NotificationType) -> &'static str {
    match notification_type {
        NotificationType::Info => "#3B82F6",
        NotificationType::Success => "#10B981",
        NotificationType::Warning => "#F59E0B",
        NotificationType::Error => "#EF4444",
        NotificationType::AgentComplete => "#8B5CF6",
    }
}

/// "jane.doe@example.com" → "Jane.doe"
fn display_name(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    let mut chars = local.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => email.to_string(),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
