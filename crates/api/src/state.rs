//! Shared application state for the Axum API server.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use courier_common::config::AppConfig;
use courier_engine::dispatcher::{BatchDispatcher, DispatchSettings};
use courier_engine::pg_store::PgBatchStore;
use courier_engine::resolver::PgRecipientResolver;
use courier_notifier::{ExpoPushClient, NotificationService, ResendClient, RetryPolicy};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: AppConfig,
    pub notifier: Arc<NotificationService>,
    pub dispatcher: Arc<BatchDispatcher>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        notifier: Arc<NotificationService>,
        dispatcher: Arc<BatchDispatcher>,
    ) -> Self {
        Self {
            pool,
            config,
            notifier,
            dispatcher,
        }
    }

    /// Wire the production services from configuration.
    pub fn from_config(pool: PgPool, config: AppConfig) -> Self {
        let email = Arc::new(ResendClient::new(
            config.resend_api_url.clone(),
            config.resend_api_key.clone(),
            config.email_from.clone(),
        ));
        let push = Arc::new(ExpoPushClient::new(config.expo_api_url.clone()));
        let retry = RetryPolicy {
            max_attempts: config.delivery_max_attempts,
            delay: Duration::from_millis(config.delivery_retry_delay_ms),
        };

        let notifier = Arc::new(NotificationService::new(
            pool.clone(),
            email,
            push,
            retry,
            config.app_url.clone(),
        ));
        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::new(PgBatchStore::new(pool.clone())),
            Arc::new(PgRecipientResolver::new(pool.clone())),
            notifier.clone(),
            DispatchSettings::from_config(&config),
        ));

        Self::new(pool, config, notifier, dispatcher)
    }
}
