use std::sync::Arc;

use base64::Engine as _;
use rand::RngCore;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::models::token::Token;
use crate::repos::TokenRepo;

const NONCE_BYTES: usize = 32;

/// A login in progress: the `state` sent to the provider and the row it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub nonce: String,
    pub correlation_id: String,
}

/// Issues single-use `state` nonces and redeems each at most once.
#[derive(Clone)]
pub struct StateValidator {
    tokens: Arc<dyn TokenRepo>,
}

impl StateValidator {
    pub fn new(tokens: Arc<dyn TokenRepo>) -> Self {
        Self { tokens }
    }

    /// Creates a pending token row keyed by a fresh correlation id.
    pub async fn issue(&self) -> Result<PendingAuthorization, AuthError> {
        let pending = PendingAuthorization {
            nonce: random_nonce(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        };
        let token = Token::pending(&pending.correlation_id, &pending.nonce, OffsetDateTime::now_utc());
        self.tokens.upsert(&token).await?;
        info!(correlation_id = %pending.correlation_id, "authorization state issued");
        Ok(pending)
    }

    /// Redeems `nonce` and returns the correlation id it was issued for.
    pub async fn consume(&self, nonce: &str) -> Result<String, AuthError> {
        if nonce.is_empty() {
            warn!("callback without state");
            return Err(AuthError::StateMismatch);
        }
        match self.tokens.consume_state(nonce).await? {
            Some(correlation_id) => {
                info!(correlation_id = %correlation_id, "authorization state consumed");
                Ok(correlation_id)
            }
            None => {
                warn!("unknown or already used state");
                Err(AuthError::StateMismatch)
            }
        }
    }
}

fn random_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::random_nonce;

    #[test]
    fn nonces_are_url_safe_and_distinct() {
        let a = random_nonce();
        let b = random_nonce();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
