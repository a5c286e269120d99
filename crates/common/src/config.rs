use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the API server binds to (default: 3000)
    pub api_port: u16,

    /// JWT secret for API authentication
    pub jwt_secret: String,

    /// Resend API key for email delivery. Email is disabled when unset.
    pub resend_api_key: Option<String>,

    /// Resend API base URL
    pub resend_api_url: String,

    /// Email sender address
    pub email_from: Option<String>,

    /// Public URL of the web app, linked from notification emails
    pub app_url: String,

    /// Expo-compatible push gateway send endpoint
    pub expo_api_url: String,

    /// Recipients per chunk in a global notification batch (default: 100)
    pub batch_chunk_size: usize,

    /// Pause between chunks in milliseconds (default: 100)
    pub batch_chunk_delay_ms: u64,

    /// Processed recipients between progress writes (default: 10)
    pub batch_progress_interval: u64,

    /// Upper bound for a single recipient's delivery in seconds (default: 90).
    /// Raised to the retry budget when lower.
    pub delivery_timeout_secs: u64,

    /// Attempts per channel before a delivery is given up (default: 3)
    pub delivery_max_attempts: u32,

    /// Fixed delay between delivery attempts in milliseconds (default: 2000)
    pub delivery_retry_delay_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_var("API_PORT", 3000)?,
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            email_from: std::env::var("EMAIL_FROM").ok(),
            app_url: std::env::var("APP_URL")
                .unwrap_or_else(|_| "https://app.example.com".to_string()),
            expo_api_url: std::env::var("EXPO_API_URL")
                .unwrap_or_else(|_| "https://exp.host/--/api/v2/push/send".to_string()),
            batch_chunk_size: parse_var("BATCH_CHUNK_SIZE", 100)?,
            batch_chunk_delay_ms: parse_var("BATCH_CHUNK_DELAY_MS", 100)?,
            batch_progress_interval: parse_var("BATCH_PROGRESS_INTERVAL", 10)?,
            delivery_timeout_secs: parse_var("DELIVERY_TIMEOUT_SECS", 90)?,
            delivery_max_attempts: parse_var("DELIVERY_MAX_ATTEMPTS", 3)?,
            delivery_retry_delay_ms: parse_var("DELIVERY_RETRY_DELAY_MS", 2000)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make batches unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_chunk_size == 0 {
            anyhow::bail!("BATCH_CHUNK_SIZE must be greater than zero");
        }
        if self.delivery_timeout_secs == 0 {
            anyhow::bail!("DELIVERY_TIMEOUT_SECS must be greater than zero");
        }
        if self.delivery_max_attempts == 0 {
            anyhow::bail!("DELIVERY_MAX_ATTEMPTS must be greater than zero");
        }
        Ok(())
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/courier".to_string(),
            db_max_connections: 20,
            api_port: 3000,
            jwt_secret: "secret".to_string(),
            resend_api_key: None,
            resend_api_url: "https://api.resend.com".to_string(),
            email_from: None,
            app_url: "https://app.example.com".to_string(),
            expo_api_url: "https://exp.host/--/api/v2/push/send".to_string(),
            batch_chunk_size: 100,
            batch_chunk_delay_ms: 100,
            batch_progress_interval: 10,
            delivery_timeout_secs: 90,
            delivery_max_attempts: 3,
            delivery_retry_delay_ms: 2000,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let err = AppConfig {
            delivery_timeout_secs: 0,
            ..config()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("DELIVERY_TIMEOUT_SECS"));

        let err = AppConfig {
            batch_chunk_size: 0,
            ..config()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("BATCH_CHUNK_SIZE"));

        let err = AppConfig {
            delivery_max_attempts: 0,
            ..config()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("DELIVERY_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u64 = parse_var("COURIER_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("COURIER_TEST_BAD_NUMBER", "ten") };
        let result: anyhow::Result<u32> = parse_var("COURIER_TEST_BAD_NUMBER", 1);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("COURIER_TEST_BAD_NUMBER"));
        assert!(err.contains("u32"));
    }

    #[test]
    fn test_parse_var_reads_value() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("COURIER_TEST_CHUNK", " 250 ") };
        let value: usize = parse_var("COURIER_TEST_CHUNK", 100).unwrap();
        assert_eq!(value, 250);
    }
}
