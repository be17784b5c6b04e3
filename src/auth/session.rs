use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tower_cookies::{Cookie, Cookies, Key};
use tracing::{debug, info};

use crate::models::token::Token;
use crate::repos::TokenRepo;

pub const SESSION_COOKIE: &str = "sid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub correlation_id: String,
    pub exp: Option<i64>, // unix seconds
}

/// What a request handler needs to know about the caller.
pub trait Authenticatable {
    fn id(&self) -> &str;
    fn is_authenticated(&self) -> bool;
    fn is_active(&self) -> bool;
}

/// The token bound to the caller's session.
#[derive(Debug, Clone)]
pub struct CurrentSession {
    pub token: Token,
}

impl Authenticatable for CurrentSession {
    fn id(&self) -> &str {
        &self.token.correlation_id
    }

    fn is_authenticated(&self) -> bool {
        self.token.access_token.is_some()
    }

    fn is_active(&self) -> bool {
        self.token.is_active
    }
}

#[derive(Debug)]
pub enum SessionState {
    /// No session cookie.
    Anonymous,
    /// A session was bound to this correlation id but its token is gone,
    /// inactive or about to expire. The cookie has been cleared.
    Expired(String),
    Active(CurrentSession),
}

/// Binds browser sessions to token rows through a private cookie.
#[derive(Clone)]
pub struct SessionBinder {
    key: Key,
    ttl: Duration,
    secure: bool,
    buffer: Duration,
    tokens: Arc<dyn TokenRepo>,
}

impl SessionBinder {
    pub fn new(key: Key, ttl: Duration, secure: bool, buffer: Duration, tokens: Arc<dyn TokenRepo>) -> Self {
        Self { key, ttl, secure, buffer, tokens }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn bind(&self, cookies: &Cookies, correlation_id: &str) -> anyhow::Result<()> {
        let exp = OffsetDateTime::now_utc() + self.ttl;
        let s = Session {
            correlation_id: correlation_id.to_string(),
            exp: Some(exp.unix_timestamp()),
        };
        let mut cookie = Cookie::new(SESSION_COOKIE, serde_json::to_string(&s)?);
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
        cookie.set_secure(self.secure);
        cookie.set_max_age(self.ttl);
        cookies.private(&self.key).add(cookie);
        debug!(correlation_id = %correlation_id, "session bound");
        Ok(())
    }

    pub fn resolve(&self, cookies: &Cookies) -> Option<String> {
        let c = cookies.private(&self.key).get(SESSION_COOKIE)?;
        let session: Session = serde_json::from_str(c.value()).ok()?;
        if let Some(exp) = session.exp {
            if OffsetDateTime::now_utc().unix_timestamp() > exp {
                return None;
            }
        }
        Some(session.correlation_id)
    }

    pub fn clear(&self, cookies: &Cookies) {
        let mut base = Cookie::new(SESSION_COOKIE, "");
        base.set_path("/");
        cookies.private(&self.key).remove(base);
    }

    pub fn is_within_buffer(&self, token: &Token, now: OffsetDateTime) -> bool {
        token.is_within_buffer(self.buffer, now)
    }

    /// Authenticated, active and outside the refresh buffer.
    pub fn is_usable(&self, current: &CurrentSession, now: OffsetDateTime) -> bool {
        current.is_authenticated() && current.is_active() && self.is_within_buffer(&current.token, now)
    }

    /// Resolves the session and decides whether it is still usable. Unusable
    /// sessions are cleared.
    pub async fn current(&self, cookies: &Cookies) -> anyhow::Result<SessionState> {
        let Some(correlation_id) = self.resolve(cookies) else {
            return Ok(SessionState::Anonymous);
        };
        let token = self.tokens.get(&correlation_id).await?;
        let now = OffsetDateTime::now_utc();
        match token.map(|token| CurrentSession { token }) {
            Some(current) if self.is_usable(&current, now) => Ok(SessionState::Active(current)),
            _ => {
                info!(correlation_id = %correlation_id, "session no longer valid; clearing");
                self.clear(cookies);
                Ok(SessionState::Expired(correlation_id))
            }
        }
    }
}
