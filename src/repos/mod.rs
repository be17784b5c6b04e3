use async_trait::async_trait;

use crate::models::token::Token;

pub mod locks;
pub mod sqlite;

/// Durable record of one token per correlation id.
#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn get(&self, correlation_id: &str) -> anyhow::Result<Option<Token>>;
    async fn get_by_state(&self, state_nonce: &str) -> anyhow::Result<Option<Token>>;
    /// Clears `state_nonce` on the matching row in the same transaction as the lookup.
    /// Returns the row's correlation id, or `None` when no unconsumed row carries the nonce.
    async fn consume_state(&self, state_nonce: &str) -> anyhow::Result<Option<String>>;
    async fn upsert(&self, token: &Token) -> anyhow::Result<()>;
    /// Returns whether a row was removed.
    async fn delete(&self, correlation_id: &str) -> anyhow::Result<bool>;
    async fn list_active(&self) -> anyhow::Result<Vec<Token>>;
    /// Pending logins and deactivated tokens.
    async fn list_inactive(&self) -> anyhow::Result<Vec<Token>>;
}
