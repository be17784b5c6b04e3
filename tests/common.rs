#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use base64::Engine as _;
use rand::RngCore;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt; // for oneshot
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use token_keeper::app::{build_router, AppState};
use token_keeper::config::AppConfig;
use token_keeper::db::sqlite::{make_pool, SqlitePool};
use token_keeper::models::token::Token;
use token_keeper::repos::{sqlite::SqliteTokenRepo, TokenRepo};
use token_keeper::scheduler::SchedulerService;

pub struct TestDb {
    pub _dir: TempDir,
    pub path: String,
    pub pool: SqlitePool,
}

pub fn init_test_db() -> anyhow::Result<TestDb> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("test.sqlite");
    let path_str = db_path.display().to_string();

    let pool = make_pool(&path_str)?;
    {
        let mut conn = pool.get()?;
        token_keeper::db::migrations::run_sqlite_migrations(&mut conn)?;
    }

    Ok(TestDb { _dir: dir, path: path_str, pool })
}

pub fn random_cookie_key() -> String {
    let mut key = [0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Config pointing the provider at `provider_uri`, with fast retries.
pub fn test_config(provider_uri: &str, db_path: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.server.bind_addr = "127.0.0.1:0".into();
    cfg.server.cookie_key_base64 = random_cookie_key();
    cfg.db.url = db_path.to_string();
    cfg.provider.auth_url = format!("{provider_uri}/oauth/authorize");
    cfg.provider.token_url = format!("{provider_uri}/oauth/v1/token");
    cfg.provider.client_id = "client-id".into();
    cfg.provider.client_secret = "client-secret".into();
    cfg.provider.timeout_secs = 2;
    cfg.refresh.initial_backoff_ms = 10;
    cfg.refresh.max_backoff_ms = 40;
    cfg.refresh.max_retries = 2;
    cfg.refresh.min_interval_secs = 1;
    cfg.scheduler.join_timeout_ms = 500;
    cfg.scheduler.stop_timeout_ms = 1_000;
    cfg.scheduler.sweep_interval_secs = 1;
    cfg
}

/// Delegates to SQLite, with faults that tests switch on.
pub struct FaultyRepo {
    inner: Arc<SqliteTokenRepo>,
    /// Every delete fails.
    pub fail_delete: AtomicBool,
    /// `get` blocks its thread this long before answering.
    pub stall_get_ms: AtomicU64,
}

impl FaultyRepo {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteTokenRepo::new(pool),
            fail_delete: AtomicBool::new(false),
            stall_get_ms: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl TokenRepo for FaultyRepo {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Token>> {
        let stall = self.stall_get_ms.load(Ordering::SeqCst);
        if stall > 0 {
            std::thread::sleep(Duration::from_millis(stall));
        }
        self.inner.get(id).await
    }
    async fn get_by_state(&self, nonce: &str) -> anyhow::Result<Option<Token>> {
        self.inner.get_by_state(nonce).await
    }
    async fn consume_state(&self, nonce: &str) -> anyhow::Result<Option<String>> {
        self.inner.consume_state(nonce).await
    }
    async fn upsert(&self, token: &Token) -> anyhow::Result<()> {
        self.inner.upsert(token).await
    }
    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("disk I/O error"));
        }
        self.inner.delete(id).await
    }
    async fn list_active(&self) -> anyhow::Result<Vec<Token>> {
        self.inner.list_active().await
    }
    async fn list_inactive(&self) -> anyhow::Result<Vec<Token>> {
        self.inner.list_inactive().await
    }
}

pub struct TestApp {
    pub db: TestDb,
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub fn new(config: AppConfig) -> TestApp {
        let db = init_test_db().expect("init db");
        let tokens: Arc<dyn TokenRepo> = SqliteTokenRepo::new(db.pool.clone());
        Self::with_repo(db, config, tokens)
    }

    /// Same wiring as `app::run`, minus the listener.
    pub fn with_repo(db: TestDb, mut config: AppConfig, tokens: Arc<dyn TokenRepo>) -> TestApp {
        config.db.url = db.path.clone();
        let scheduler = Arc::new(SchedulerService::new(config.scheduler_config()));
        scheduler.start().expect("start scheduler");
        let state = AppState::build(config, tokens, scheduler).expect("app state");
        let router = build_router(state.clone());
        TestApp { db, state, router }
    }

    pub async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<Body> {
        let mut req = Request::get(uri);
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        self.router
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    /// Starts a login; returns the session cookie and the issued `state`.
    pub async fn login(&self) -> (String, String) {
        let res = self.get("/login", None).await;
        assert!(res.status().is_redirection(), "login status {}", res.status());
        let cookie = session_cookie(&res).expect("session cookie on login");
        let state = query_param(&location(&res), "state").expect("state in provider URL");
        (cookie, state)
    }

    /// Runs login and callback; returns the cookie bound to the authenticated token.
    pub async fn authenticate(&self) -> (String, String) {
        let (cookie, state) = self.login().await;
        let res = self
            .get(&format!("/oauth-callback/?state={state}&code=auth-code"), Some(&cookie))
            .await;
        assert!(res.status().is_redirection(), "callback status {}", res.status());
        let cookie = session_cookie(&res).expect("session cookie on callback");
        let token = self
            .state
            .tokens
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .max_by_key(|t| t.updated_at)
            .expect("active token after callback");
        (cookie, token.correlation_id)
    }
}

/// `sid=<value>` from the response, if it sets a non-empty session cookie.
pub fn session_cookie<B>(res: &Response<B>) -> Option<String> {
    res.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .find(|pair| pair.starts_with("sid=") && pair.len() > "sid=".len())
        .map(str::to_string)
}

pub fn session_cleared<B>(res: &Response<B>) -> bool {
    res.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with("sid=;") || v == "sid=")
}

pub fn location<B>(res: &Response<B>) -> String {
    res.headers()
        .get(header::LOCATION)
        .expect("Location header")
        .to_str()
        .unwrap()
        .to_string()
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub async fn json_body(res: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn token_response(access_token: &str, refresh_token: &str, expires_in: i64) -> ResponseTemplate {
    ResponseTemplate::new(StatusCode::OK.as_u16()).set_body_json(json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "token_type": "bearer",
        "expires_in": expires_in,
    }))
}

pub fn oauth_error(error: &str) -> ResponseTemplate {
    ResponseTemplate::new(StatusCode::BAD_REQUEST.as_u16())
        .set_body_json(json!({ "error": error, "error_description": "test" }))
}

/// Answers the authorization-code grant.
pub async fn mock_code_exchange(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/oauth/v1/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(response)
        .mount(server)
        .await;
}

/// Answers the refresh-token grant.
pub async fn mock_refresh(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/oauth/v1/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(response)
        .mount(server)
        .await;
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
