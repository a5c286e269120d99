//! Turns a batch's recipient selector into concrete users.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Recipient, RecipientSelector};

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Ordered recipients, at most one per user.
    async fn resolve(&self, selector: &RecipientSelector) -> Result<Vec<Recipient>, AppError>;
}

/// Drop repeated users, keeping the first occurrence.
pub fn dedupe(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.user_id))
        .collect()
}

/// Resolves selectors against the `users` and `accounts` tables.
pub struct PgRecipientResolver {
    pool: PgPool,
}

impl PgRecipientResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn by_users(&self, user_ids: &[Uuid]) -> Result<Vec<Recipient>, AppError> {
        // Users without a personal account are skipped
        let rows = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (a.primary_owner_user_id)
                   a.primary_owner_user_id AS user_id, a.id AS account_id, u.email
            FROM accounts a
            JOIN users u ON u.id = a.primary_owner_user_id
            WHERE a.personal_account = TRUE AND a.primary_owner_user_id = ANY($1)
            ORDER BY a.primary_owner_user_id, a.created_at
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(order_by(rows, user_ids, |r| r.user_id))
    }

    async fn by_accounts(&self, account_ids: &[Uuid]) -> Result<Vec<Recipient>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT a.primary_owner_user_id AS user_id, a.id AS account_id, u.email
            FROM accounts a
            JOIN users u ON u.id = a.primary_owner_user_id
            WHERE a.id = ANY($1)
            "#,
        )
        .bind(account_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(order_by(rows, account_ids, |r| r.account_id))
    }

    async fn everyone(&self) -> Result<Vec<Recipient>, AppError> {
        let rows = sqlx::query_as(
            r#"
            SELECT a.primary_owner_user_id AS user_id, a.id AS account_id, u.email
            FROM accounts a
            JOIN users u ON u.id = a.primary_owner_user_id
            WHERE a.personal_account = TRUE
            ORDER BY a.created_at, a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Put rows in the order their keys were requested.
fn order_by(
    mut rows: Vec<Recipient>,
    requested: &[Uuid],
    key: impl Fn(&Recipient) -> Uuid,
) -> Vec<Recipient> {
    rows.sort_by_key(|r| {
        let k = key(r);
        requested.iter().position(|id| *id == k).unwrap_or(usize::MAX)
    });
    rows
}

#[async_trait]
impl RecipientResolver for PgRecipientResolver {
    async fn resolve(&self, selector: &RecipientSelector) -> Result<Vec<Recipient>, AppError> {
        let recipients = match selector {
            RecipientSelector::Users(ids) => self.by_users(ids).await?,
            RecipientSelector::Accounts(ids) => self.by_accounts(ids).await?,
            RecipientSelector::All => self.everyone().await?,
        };
        Ok(dedupe(recipients))
    }
}

/// Resolves every selector to the same fixed list.
pub struct StaticResolver {
    recipients: Vec<Recipient>,
}

impl StaticResolver {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self { recipients }
    }
}

#[async_trait]
impl RecipientResolver for StaticResolver {
    async fn resolve(&self, _selector: &RecipientSelector) -> Result<Vec<Recipient>, AppError> {
        Ok(dedupe(self.recipients.clone()))
    }
}
