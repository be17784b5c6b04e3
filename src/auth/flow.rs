//! Login, callback, view and logout.
//!
//! A session moves from anonymous to pending (nonce issued, row created) to
//! authenticated (credentials stored, refresh armed). It falls back to
//! anonymous when its token leaves the refresh buffer or on logout. Rows a
//! session lets go of are deleted, their refresh job first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_cookies::Cookies;
use tracing::{error, info, warn};

use crate::auth::provider::ProviderClient;
use crate::auth::session::{Authenticatable, CurrentSession, SessionBinder, SessionState};
use crate::auth::state::StateValidator;
use crate::error::AuthError;
use crate::models::token::{Credentials, Token};
use crate::repos::{locks::RowLocks, TokenRepo};
use crate::scheduler::RefreshScheduler;

/// Query parameters the provider appends to the redirect URI.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IndexView {
    pub correlation_id: String,
    pub seconds_until_refresh: Option<i64>,
}

/// Where `/login` sends the browser.
#[derive(Debug, PartialEq, Eq)]
pub enum LoginRedirect {
    /// The session is still valid.
    Resume,
    /// A new authorization was started.
    Provider(String),
}

#[derive(Clone)]
pub struct AuthFlow {
    state: StateValidator,
    sessions: SessionBinder,
    tokens: Arc<dyn TokenRepo>,
    provider: Arc<ProviderClient>,
    refresh: RefreshScheduler,
    locks: RowLocks,
}

impl AuthFlow {
    pub fn new(
        state: StateValidator,
        sessions: SessionBinder,
        tokens: Arc<dyn TokenRepo>,
        provider: Arc<ProviderClient>,
        refresh: RefreshScheduler,
        locks: RowLocks,
    ) -> Self {
        Self { state, sessions, tokens, provider, refresh, locks }
    }

    /// Resolves the caller's session. A session found unusable is cleared
    /// and its row torn down.
    async fn session(&self, cookies: &Cookies) -> Result<SessionState, AuthError> {
        let state = self.sessions.current(cookies).await?;
        if let SessionState::Expired(correlation_id) = &state {
            let now = OffsetDateTime::now_utc();
            self.discard(correlation_id, |token| {
                !self.sessions.is_usable(&CurrentSession { token: token.clone() }, now)
            })
            .await;
        }
        Ok(state)
    }

    /// `None` when the caller has to log in.
    pub async fn index_view(&self, cookies: &Cookies) -> Result<Option<IndexView>, AuthError> {
        match self.session(cookies).await? {
            SessionState::Active(current) => {
                let id = current.id().to_string();
                let seconds_until_refresh = self
                    .refresh
                    .seconds_until_refresh(&id)
                    .map(|d| d.whole_seconds());
                Ok(Some(IndexView { correlation_id: id, seconds_until_refresh }))
            }
            SessionState::Anonymous | SessionState::Expired(_) => Ok(None),
        }
    }

    /// A stale session is replaced by a new authorization in the same response.
    pub async fn begin_login(&self, cookies: &Cookies) -> Result<LoginRedirect, AuthError> {
        if let SessionState::Active(_) = self.session(cookies).await? {
            return Ok(LoginRedirect::Resume);
        }
        let pending = self.state.issue().await?;
        self.sessions.bind(cookies, &pending.correlation_id)?;
        Ok(LoginRedirect::Provider(self.provider.authorization_url(&pending.nonce)))
    }

    /// The state must belong to the session that started the login. A
    /// rejected callback deletes the pending row; a scheduling failure puts
    /// the row back as it was.
    pub async fn complete_callback(&self, cookies: &Cookies, params: CallbackParams) -> Result<(), AuthError> {
        let session = self.sessions.resolve(cookies);
        let correlation_id = self.state.consume(params.state.as_deref().unwrap_or_default()).await?;

        if session.as_deref() != Some(correlation_id.as_str()) {
            warn!(correlation_id = %correlation_id, "state was issued to another session");
            self.discard(&correlation_id, |token| !token.is_active).await;
            return Err(AuthError::StateMismatch);
        }

        let creds = match self.exchange(&correlation_id, params).await {
            Ok(creds) => creds,
            Err(e) => {
                self.discard(&correlation_id, |token| !token.is_active).await;
                return Err(e);
            }
        };

        {
            let _row = self.locks.lock(&correlation_id).await;
            let previous = self
                .tokens
                .get(&correlation_id)
                .await?
                .ok_or(AuthError::TokenNotFound)?;
            let now = OffsetDateTime::now_utc();
            let token = previous
                .clone()
                .with_credentials(&creds, now)
                .bound_until(now + self.sessions.ttl());
            self.tokens.upsert(&token).await?;
            if let Err(e) = self.refresh.schedule(&correlation_id, creds.expires_at(now)) {
                if let Err(restore) = self.tokens.upsert(&previous).await {
                    error!(correlation_id = %correlation_id, error = ?restore, "failed to roll back token after scheduling error");
                }
                return Err(AuthError::Scheduling(e));
            }
        }

        self.sessions.bind(cookies, &correlation_id)?;
        info!(correlation_id = %correlation_id, "login completed");
        Ok(())
    }

    async fn exchange(&self, correlation_id: &str, params: CallbackParams) -> Result<Credentials, AuthError> {
        if let Some(err) = params.error {
            let detail = match params.error_description {
                Some(description) => format!("{err}: {description}"),
                None => err,
            };
            warn!(correlation_id = %correlation_id, error = %detail, "provider denied authorization");
            return Err(AuthError::AuthorizationDenied(detail));
        }
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::AuthorizationDenied("missing authorization code".to_string()))?;

        Ok(self.provider.exchange_code(&code).await?)
    }

    /// Cancels the refresh job, deletes the token, then clears the session.
    /// A failed step leaves the later ones undone.
    pub async fn logout(&self, cookies: &Cookies) -> Result<(), AuthError> {
        let Some(correlation_id) = self.sessions.resolve(cookies) else {
            return Ok(());
        };
        {
            let _row = self.locks.lock(&correlation_id).await;
            self.revoke(&correlation_id).await?;
        }
        self.sessions.clear(cookies);
        info!(correlation_id = %correlation_id, "logged out");
        Ok(())
    }

    /// Best-effort `revoke` for a row no session points at any more. The row
    /// is re-read under its lock and kept unless `reapable` still holds.
    async fn discard(&self, correlation_id: &str, reapable: impl Fn(&Token) -> bool) {
        let _row = self.locks.lock(correlation_id).await;
        match self.tokens.get(correlation_id).await {
            Ok(Some(token)) if reapable(&token) => {}
            Ok(_) => return,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = ?e, "could not read token to discard");
                return;
            }
        }
        if let Err(e) = self.revoke(correlation_id).await {
            warn!(correlation_id = %correlation_id, error = %e, "could not remove token; leaving it to the sweep");
        }
    }

    /// Cancels the refresh job, then deletes the row. When the delete fails an
    /// active token gets its job back. Callers hold the row lock.
    async fn revoke(&self, correlation_id: &str) -> Result<(), AuthError> {
        let token = self.tokens.get(correlation_id).await?;

        self.refresh
            .cancel(correlation_id)
            .await
            .map_err(AuthError::JobCancellationFailed)?;

        match self.tokens.delete(correlation_id).await {
            Ok(true) => info!(correlation_id = %correlation_id, "token deleted"),
            Ok(false) => warn!(correlation_id = %correlation_id, "no token to delete"),
            Err(e) => {
                if let Some(expires_at) = token.filter(|t| t.is_active).and_then(|t| t.expires_at) {
                    if let Err(rearm) = self.refresh.schedule(correlation_id, expires_at) {
                        error!(correlation_id = %correlation_id, error = %rearm, "failed to re-arm refresh after delete failure");
                    }
                }
                return Err(AuthError::TokenDeletionFailed(e));
            }
        }
        Ok(())
    }
}
