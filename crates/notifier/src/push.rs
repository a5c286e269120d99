//! Push channel — client for an Expo-compatible push gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::retry::Retryable;

pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const RECEIPT_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_TOKEN_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push token: {0}")]
    InvalidToken(String),

    #[error("DeviceNotRegistered: {0}")]
    DeviceNotRegistered(String),

    #[error("InvalidCredentials: {0}")]
    InvalidCredentials(String),

    #[error("push gateway rejected message: {0}")]
    Rejected(String),

    #[error("push gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected push gateway response: {0}")]
    Malformed(String),
}

impl PushError {
    /// The stored token is dead and must be cleared so the app re-registers.
    pub fn invalidates_token(&self) -> bool {
        matches!(
            self,
            PushError::DeviceNotRegistered(_) | PushError::InvalidCredentials(_)
        )
    }
}

impl Retryable for PushError {
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            PushError::InvalidToken(_)
                | PushError::DeviceNotRegistered(_)
                | PushError::InvalidCredentials(_)
        )
    }
}

/// A push message addressed to a single device token.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: Value,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), PushError>;
}

pub struct ExpoPushClient {
    client: reqwest::Client,
    send_url: String,
    receipts_url: String,
}

impl ExpoPushClient {
    pub fn new(send_url: String) -> Self {
        let receipts_url = receipts_url_for(&send_url);
        Self {
            client: reqwest::Client::new(),
            send_url,
            receipts_url,
        }
    }

    /// Look up the delivery receipt for a ticket. Lookup failures are logged and ignored.
    async fn check_receipt(&self, receipt_id: &str) -> Option<Value> {
        let response = self
            .client
            .post(&self.receipts_url)
            .timeout(RECEIPT_TIMEOUT)
            .json(&json!({ "ids": [receipt_id] }))
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(status = %r.status(), "Push receipt lookup failed");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Push receipt lookup failed");
                return None;
            }
        };

        match response.json::<Value>().await {
            Ok(body) => body.get("data")?.get(receipt_id).cloned(),
            Err(e) => {
                tracing::warn!(error = %e, "Push receipt response was not JSON");
                None
            }
        }
    }
}

#[async_trait]
impl PushSender for ExpoPushClient {
    async fn send(&self, message: &PushMessage) -> Result<(), PushError> {
        validate_token(&message.to)?;

        let response = self
            .client
            .post(&self.send_url)
            .timeout(SEND_TIMEOUT)
            .header("Accept", "application/json")
            .json(&json!([{
                "to": message.to,
                "title": message.title,
                "body": message.body,
                "data": message.data,
                "sound": "default",
                "priority": "default",
                "channelId": "default",
                "badge": 1,
            }]))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PushError::Malformed(e.to_string()))?;

        if let Some(receipt_id) = interpret_ticket(&body)?
            && let Some(receipt) = self.check_receipt(&receipt_id).await
        {
            interpret_receipt(&receipt)?;
        }

        tracing::debug!("Push notification accepted by gateway");
        Ok(())
    }
}

fn validate_token(token: &str) -> Result<(), PushError> {
    if token.len() < MIN_TOKEN_LEN {
        return Err(PushError::InvalidToken("token too short".to_string()));
    }
    Ok(())
}

fn receipts_url_for(send_url: &str) -> String {
    let base = send_url.trim_end_matches('/');
    match base.strip_suffix("/send") {
        Some(prefix) => format!("{}/getReceipts", prefix),
        None => format!("{}/getReceipts", base),
    }
}

/// Interpret the send response. Returns the receipt id when the ticket is ok.
fn interpret_ticket(body: &Value) -> Result<Option<String>, PushError> {
    let ticket = body
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .ok_or_else(|| PushError::Malformed("no data in push response".to_string()))?;

    match ticket.get("status").and_then(|s| s.as_str()) {
        Some("ok") => Ok(ticket
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)),
        other => Err(error_from_details(ticket, other.unwrap_or("unknown"))),
    }
}

/// Interpret a delivery receipt; `ok` receipts and unknown shapes pass.
fn interpret_receipt(receipt: &Value) -> Result<(), PushError> {
    match receipt.get("status").and_then(|s| s.as_str()) {
        Some("error") => Err(error_from_details(receipt, "error")),
        _ => Ok(()),
    }
}

fn error_from_details(entry: &Value, status: &str) -> PushError {
    let message = entry
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("push failed with status: {}", status));

    match entry
        .get("details")
        .and_then(|d| d.get("error"))
        .and_then(|e| e.as_str())
    {
        Some("DeviceNotRegistered") => PushError::DeviceNotRegistered(message),
        Some("InvalidCredentials") => PushError::InvalidCredentials(message),
        _ => PushError::Rejected(message),
    }
}
