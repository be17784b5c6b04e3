//! OAuth2 client for the token provider.
//!
//! Every round trip is bounded by the configured timeout. Failures are split
//! into three kinds: the provider could not be reached, it answered with an
//! OAuth error, or it answered with something we could not use.

use std::time::Duration;

use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse, BasicTokenType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl,
    RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use thiserror::Error;

use crate::config::AppConfig;
use crate::models::token::Credentials;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unavailable(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Explicit OAuth error replies are final; everything else may succeed later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected(_))
    }
}

pub struct ProviderClient {
    client: BasicClient,
    scopes: Vec<String>,
    timeout: Duration,
}

impl ProviderClient {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let provider = &cfg.provider;
        let client = BasicClient::new(
            ClientId::new(provider.client_id.clone()),
            Some(ClientSecret::new(provider.client_secret.clone())),
            AuthUrl::new(provider.auth_url.clone())?,
            Some(TokenUrl::new(provider.token_url.clone())?),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(RedirectUrl::new(cfg.redirect_uri())?);

        Ok(Self {
            client,
            scopes: provider.scopes.clone(),
            timeout: cfg.provider_timeout(),
        })
    }

    /// Authorization URL carrying `state` verbatim.
    pub fn authorization_url(&self, state: &str) -> String {
        let state = state.to_string();
        let (url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .url();
        url.to_string()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Credentials, ProviderError> {
        let request = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client);
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(self.timed_out()),
            Ok(Err(e)) => Err(classify(e)),
            Ok(Ok(resp)) => credentials(&resp),
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Credentials, ProviderError> {
        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let request = self
            .client
            .exchange_refresh_token(&refresh_token)
            .request_async(async_http_client);
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(self.timed_out()),
            Ok(Err(e)) => Err(classify(e)),
            Ok(Ok(resp)) => credentials(&resp),
        }
    }

    fn timed_out(&self) -> ProviderError {
        ProviderError::Unavailable(format!("no response within {:?}", self.timeout))
    }
}

fn credentials(resp: &BasicTokenResponse) -> Result<Credentials, ProviderError> {
    let expires_in = resp
        .expires_in()
        .ok_or_else(|| ProviderError::Malformed("token response without expires_in".to_string()))?;
    let expires_in = time::Duration::try_from(expires_in)
        .map_err(|e| ProviderError::Malformed(format!("expires_in out of range: {e}")))?;
    Ok(Credentials {
        access_token: resp.access_token().secret().clone(),
        refresh_token: resp.refresh_token().map(|t| t.secret().clone()),
        token_type: match resp.token_type() {
            BasicTokenType::Bearer => "bearer".to_string(),
            BasicTokenType::Mac => "mac".to_string(),
            BasicTokenType::Extension(other) => other.clone(),
        },
        expires_in,
    })
}

fn classify<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> ProviderError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::Request(e) => ProviderError::Unavailable(e.to_string()),
        RequestTokenError::ServerResponse(resp) => ProviderError::Rejected(resp.to_string()),
        RequestTokenError::Parse(e, _) => ProviderError::Malformed(e.to_string()),
        RequestTokenError::Other(msg) => ProviderError::Malformed(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ProviderClient {
        let mut cfg = AppConfig::default();
        cfg.provider.auth_url = "https://provider.test/oauth/authorize".into();
        cfg.provider.client_id = "client-1".into();
        cfg.provider.scopes = vec!["contacts".into(), "deals".into()];
        ProviderClient::from_config(&cfg).unwrap()
    }

    #[test]
    fn authorization_url_carries_state_and_client() {
        let url = url_params(&client().authorization_url("nonce-abc"));
        assert_eq!(url.get("state").map(String::as_str), Some("nonce-abc"));
        assert_eq!(url.get("client_id").map(String::as_str), Some("client-1"));
        assert_eq!(url.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(url.get("scope").map(String::as_str), Some("contacts deals"));
        assert_eq!(
            url.get("redirect_uri").map(String::as_str),
            Some("http://127.0.0.1:8080/oauth-callback/")
        );
    }

    #[test]
    fn only_rejections_are_final() {
        assert!(ProviderError::Unavailable("x".into()).is_retryable());
        assert!(ProviderError::Malformed("x".into()).is_retryable());
        assert!(!ProviderError::Rejected("invalid_grant".into()).is_retryable());
    }

    fn url_params(raw: &str) -> std::collections::HashMap<String, String> {
        oauth2::url::Url::parse(raw)
            .unwrap()
            .query_pairs()
            .into_owned()
            .collect()
    }
}
