use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::OptionalExtension;
use time::OffsetDateTime;

use crate::db::sqlite::SqlitePool;
use crate::models::token::{format_timestamp, Token, TokenRow};
use crate::repos::TokenRepo;
use crate::schema::tokens;

pub struct SqliteTokenRepo {
    pool: SqlitePool,
}

impl SqliteTokenRepo {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl TokenRepo for SqliteTokenRepo {
    async fn get(&self, correlation_id: &str) -> anyhow::Result<Option<Token>> {
        let correlation_id = correlation_id.to_string();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Token>> {
            let mut conn = pool.get()?;
            let row = tokens::table
                .find(&correlation_id)
                .select(TokenRow::as_select())
                .first(&mut conn)
                .optional()?;
            row.map(Token::try_from).transpose()
        })
        .await?
    }

    async fn get_by_state(&self, state_nonce: &str) -> anyhow::Result<Option<Token>> {
        let state_nonce = state_nonce.to_string();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Token>> {
            let mut conn = pool.get()?;
            let row = tokens::table
                .filter(tokens::state_nonce.eq(&state_nonce))
                .select(TokenRow::as_select())
                .first(&mut conn)
                .optional()?;
            row.map(Token::try_from).transpose()
        })
        .await?
    }

    async fn consume_state(&self, state_nonce: &str) -> anyhow::Result<Option<String>> {
        let state_nonce = state_nonce.to_string();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
            let mut conn = pool.get()?;
            let now = format_timestamp(OffsetDateTime::now_utc())?;
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let correlation_id = tokens::table
                    .filter(tokens::state_nonce.eq(&state_nonce))
                    .select(tokens::correlation_id)
                    .first::<String>(conn)
                    .optional()?;
                if let Some(id) = &correlation_id {
                    diesel::update(tokens::table.find(id))
                        .set((
                            tokens::state_nonce.eq(None::<String>),
                            tokens::updated_at.eq(&now),
                        ))
                        .execute(conn)?;
                }
                Ok(correlation_id)
            })
        })
        .await?
    }

    async fn upsert(&self, token: &Token) -> anyhow::Result<()> {
        let row = TokenRow::try_from(token)?;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut conn = pool.get()?;
            diesel::replace_into(tokens::table)
                .values(&row)
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, correlation_id: &str) -> anyhow::Result<bool> {
        let correlation_id = correlation_id.to_string();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let mut conn = pool.get()?;
            let removed = diesel::delete(tokens::table.find(&correlation_id)).execute(&mut conn)?;
            Ok(removed > 0)
        })
        .await?
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Token>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Token>> {
            let mut conn = pool.get()?;
            let rows = tokens::table
                .filter(tokens::is_active.eq(1))
                .order(tokens::created_at.asc())
                .select(TokenRow::as_select())
                .load(&mut conn)?;
            rows.into_iter().map(Token::try_from).collect()
        })
        .await?
    }

    async fn list_inactive(&self) -> anyhow::Result<Vec<Token>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Token>> {
            let mut conn = pool.get()?;
            let rows = tokens::table
                .filter(tokens::is_active.eq(0))
                .order(tokens::updated_at.asc())
                .select(TokenRow::as_select())
                .load(&mut conn)?;
            rows.into_iter().map(Token::try_from).collect()
        })
        .await?
    }
}
