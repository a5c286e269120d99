//! Notification delivery helper.
//!
//! Sends a single notification to a user over email (Resend HTTP API) and
//! push (Expo-compatible gateway), honouring the user's preferences and
//! recording the outcome on the notification row.

pub mod email;
pub mod preferences;
pub mod push;
pub mod retry;
pub mod service;

pub use email::{EmailSender, ResendClient};
pub use push::{ExpoPushClient, PushSender};
pub use retry::RetryPolicy;
pub use service::{NotificationService, SendNotification};
