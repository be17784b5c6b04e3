use diesel::prelude::*;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Row shape of the `tokens` table. Timestamps are RFC 3339 text.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::tokens)]
pub struct TokenRow {
    pub correlation_id: String,
    pub state_nonce: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<String>,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
    pub session_expires_at: Option<String>,
}

/// One authorization attempt and, once the callback succeeds, its credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub correlation_id: String,
    pub state_nonce: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// When the session cookie bound to this token runs out.
    pub session_expires_at: Option<OffsetDateTime>,
}

/// Credentials returned by the provider's token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Duration,
}

impl Credentials {
    pub fn expires_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.expires_in
    }
}

impl Token {
    /// A placeholder row created when a login starts.
    pub fn pending(correlation_id: &str, state_nonce: &str, now: OffsetDateTime) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            state_nonce: Some(state_nonce.to_string()),
            access_token: None,
            refresh_token: None,
            token_type: None,
            expires_in: None,
            expires_at: None,
            is_active: false,
            created_at: now,
            updated_at: now,
            session_expires_at: None,
        }
    }

    /// Applies freshly issued credentials and activates the token.
    /// A response without a refresh token keeps the one already stored.
    pub fn with_credentials(mut self, creds: &Credentials, now: OffsetDateTime) -> Self {
        self.access_token = Some(creds.access_token.clone());
        if let Some(refresh_token) = &creds.refresh_token {
            self.refresh_token = Some(refresh_token.clone());
        }
        self.token_type = Some(creds.token_type.clone());
        self.expires_in = Some(creds.expires_in.whole_seconds());
        self.expires_at = Some(creds.expires_at(now));
        self.is_active = true;
        self.updated_at = now;
        self
    }

    pub fn deactivated(mut self, now: OffsetDateTime) -> Self {
        self.is_active = false;
        self.updated_at = now;
        self
    }

    pub fn bound_until(mut self, session_expires_at: OffsetDateTime) -> Self {
        self.session_expires_at = Some(session_expires_at);
        self
    }

    /// An active token whose session cookie has run out.
    pub fn session_lapsed(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.session_expires_at.is_some_and(|at| at < now)
    }

    /// An inactive row untouched for longer than `max_age`.
    pub fn is_stale(&self, max_age: Duration, now: OffsetDateTime) -> bool {
        !self.is_active && self.updated_at + max_age < now
    }

    /// True while at least `buffer` remains before the access token expires.
    pub fn is_within_buffer(&self, buffer: Duration, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - buffer >= now,
            None => false,
        }
    }
}

impl TryFrom<TokenRow> for Token {
    type Error = anyhow::Error;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            correlation_id: row.correlation_id,
            state_nonce: row.state_nonce,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            token_type: row.token_type,
            expires_in: row.expires_in,
            expires_at: row.expires_at.as_deref().map(parse_timestamp).transpose()?,
            is_active: row.is_active != 0,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            session_expires_at: row.session_expires_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

impl TryFrom<&Token> for TokenRow {
    type Error = anyhow::Error;

    fn try_from(token: &Token) -> Result<Self, Self::Error> {
        Ok(Self {
            correlation_id: token.correlation_id.clone(),
            state_nonce: token.state_nonce.clone(),
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            token_type: token.token_type.clone(),
            expires_in: token.expires_in,
            expires_at: token.expires_at.map(format_timestamp).transpose()?,
            is_active: i32::from(token.is_active),
            created_at: format_timestamp(token.created_at)?,
            updated_at: format_timestamp(token.updated_at)?,
            session_expires_at: token.session_expires_at.map(format_timestamp).transpose()?,
        })
    }
}

pub fn format_timestamp(at: OffsetDateTime) -> anyhow::Result<String> {
    at.format(&Rfc3339)
        .map_err(|e| anyhow::anyhow!("invalid timestamp {at}: {e}"))
}

fn parse_timestamp(raw: &str) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{raw}': {e}"))
}
