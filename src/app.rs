use axum::{routing::get, Router};
use tower_cookies::{CookieManagerLayer, Key};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use crate::auth::{flow::AuthFlow, provider::ProviderClient, session::SessionBinder, state::StateValidator};
use crate::config::{AppConfig, decode_cookie_key};
use crate::repos::{locks::RowLocks, TokenRepo};
use crate::scheduler::{RefreshPolicy, RefreshScheduler, SchedulerService, SessionReaper};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub tokens: Arc<dyn TokenRepo>,
    pub scheduler: Arc<SchedulerService>,
    pub refresh: RefreshScheduler,
    pub reaper: SessionReaper,
    pub flow: AuthFlow,
}

impl AppState {
    /// Wires the components around a token store and a scheduler owned by the caller.
    pub fn build(
        config: AppConfig,
        tokens: Arc<dyn TokenRepo>,
        scheduler: Arc<SchedulerService>,
    ) -> anyhow::Result<Self> {
        let key_bytes = decode_cookie_key(&config.server.cookie_key_base64)?;
        let cookie_key = Key::from(&key_bytes);
        let provider = Arc::new(ProviderClient::from_config(&config)?);
        let locks = RowLocks::default();

        let refresh = RefreshScheduler::new(
            tokens.clone(),
            provider.clone(),
            locks.clone(),
            scheduler.clone(),
            RefreshPolicy::from_config(&config.refresh),
        );
        let reaper = SessionReaper::new(
            tokens.clone(),
            refresh.clone(),
            locks.clone(),
            config.session_ttl(),
            config.sweep_interval(),
        );
        let sessions = SessionBinder::new(
            cookie_key,
            config.session_ttl(),
            config.server.secure_cookies(),
            config.refresh_buffer(),
            tokens.clone(),
        );
        let flow = AuthFlow::new(
            StateValidator::new(tokens.clone()),
            sessions,
            tokens.clone(),
            provider,
            refresh.clone(),
            locks,
        );

        Ok(Self { config, tokens, scheduler, refresh, reaper, flow })
    }
}

pub async fn run() -> anyhow::Result<()> {
    // logging
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let config = AppConfig::load()?;

    let pool = crate::db::sqlite::make_pool(&config.db.url)?;
    {
        let mut conn = pool.get()?;
        crate::db::migrations::run_sqlite_migrations(&mut conn)?;
    }
    let tokens: Arc<dyn TokenRepo> = crate::repos::sqlite::SqliteTokenRepo::new(pool);

    let scheduler = Arc::new(SchedulerService::new(config.scheduler_config()));
    scheduler.start()?;

    let state = AppState::build(config.clone(), tokens, scheduler.clone())?;
    state.refresh.restore().await?;
    let _sweep = state.reaper.spawn(&scheduler)?;

    let app = build_router(state);

    let addr = config.server.bind_addr.clone();
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = scheduler.stop().await {
        tracing::warn!(error = %e, "scheduler did not stop cleanly");
    }
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/", get(crate::web::handlers::account::index))
        .route("/login", get(crate::web::handlers::auth::login))
        .route("/oauth-callback/", get(crate::web::handlers::auth::callback))
        .route("/logout", get(crate::web::handlers::account::logout))
        .with_state(state)
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
