//! Periodic reaping of rows no session can reach.
//!
//! Two kinds of rows are removed: active tokens whose session cookie has run
//! out, and inactive rows (abandoned logins, failed callbacks, abandoned
//! refreshes) left untouched for longer than the session TTL. Active tokens
//! lose their refresh job before the row goes.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::token::Token;
use crate::repos::{locks::RowLocks, TokenRepo};
use crate::scheduler::refresh::RefreshScheduler;
use crate::scheduler::service::{JobHandle, SchedulerError, SchedulerService};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Active tokens whose session lapsed.
    pub abandoned: usize,
    /// Inactive rows past the session TTL.
    pub stale: usize,
}

#[derive(Clone)]
pub struct SessionReaper {
    tokens: Arc<dyn TokenRepo>,
    refresh: RefreshScheduler,
    locks: RowLocks,
    session_ttl: Duration,
    interval: std::time::Duration,
}

impl SessionReaper {
    pub fn new(
        tokens: Arc<dyn TokenRepo>,
        refresh: RefreshScheduler,
        locks: RowLocks,
        session_ttl: Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self { tokens, refresh, locks, session_ttl, interval }
    }

    /// Runs `sweep` on the service every interval, starting immediately.
    pub fn spawn(&self, service: &SchedulerService) -> Result<JobHandle, SchedulerError> {
        let this = self.clone();
        let job = service.spawn(move |cancel| this.run(cancel))?;
        info!(interval = ?self.interval, "session sweep scheduled");
        Ok(job)
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(report) if report == SweepReport::default() => debug!("sweep found nothing to reap"),
                Ok(report) => info!(abandoned = report.abandoned, stale = report.stale, "sweep reaped rows"),
                Err(e) => warn!(error = ?e, "sweep failed"),
            }
        }
    }

    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let now = OffsetDateTime::now_utc();
        let mut report = SweepReport::default();

        for token in self.tokens.list_active().await? {
            if token.session_lapsed(now) && self.reap(&token.correlation_id, |t| t.session_lapsed(now)).await? {
                report.abandoned += 1;
            }
        }

        let ttl = self.session_ttl;
        for token in self.tokens.list_inactive().await? {
            if token.is_stale(ttl, now) && self.reap(&token.correlation_id, |t| t.is_stale(ttl, now)).await? {
                report.stale += 1;
            }
        }
        Ok(report)
    }

    /// Re-checks the row under its lock, then cancels its job and deletes it.
    async fn reap(&self, correlation_id: &str, still_reapable: impl Fn(&Token) -> bool) -> anyhow::Result<bool> {
        let _row = self.locks.lock(correlation_id).await;
        match self.tokens.get(correlation_id).await? {
            Some(token) if still_reapable(&token) => {}
            _ => return Ok(false),
        }
        if let Err(e) = self.refresh.cancel(correlation_id).await {
            warn!(correlation_id = %correlation_id, error = %e, "could not cancel refresh job; keeping token");
            return Ok(false);
        }
        let removed = self.tokens.delete(correlation_id).await?;
        if removed {
            debug!(correlation_id = %correlation_id, "token reaped");
        }
        Ok(removed)
    }
}
