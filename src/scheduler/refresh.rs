//! One refresh job per active token.
//!
//! A job sleeps until `expires_at - buffer`, renews the access token with the
//! provider's refresh grant and re-arms itself from the new expiry. The job
//! registry is the source of truth for `seconds_until_refresh`. An entry exists
//! exactly while the token it refreshes is active: jobs remove their own entry
//! when they find the token gone or give up on it, and every path that deletes
//! an active row cancels its job first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::provider::ProviderClient;
use crate::config::RefreshCfg;
use crate::models::token::Credentials;
use crate::repos::{locks::RowLocks, TokenRepo};
use crate::scheduler::service::{JobHandle, SchedulerError, SchedulerService};

/// Exponential backoff between refresh attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_retries: u32,
    pub initial_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Lead time before expiry at which a refresh fires.
    pub buffer: Duration,
    /// Floor between consecutive firings when a provider issues very short lifetimes.
    pub min_interval: Duration,
    pub backoff: Backoff,
}

impl RefreshPolicy {
    pub fn from_config(cfg: &RefreshCfg) -> Self {
        Self {
            buffer: Duration::seconds(cfg.buffer_secs as i64),
            min_interval: Duration::seconds(cfg.min_interval_secs as i64),
            backoff: Backoff {
                max_retries: cfg.max_retries,
                initial_delay: std::time::Duration::from_millis(cfg.initial_backoff_ms),
                max_delay: std::time::Duration::from_millis(cfg.max_backoff_ms),
            },
        }
    }
}

struct JobEntry {
    generation: Uuid,
    next_fire_at: OffsetDateTime,
    job: JobHandle,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    tokens: Arc<dyn TokenRepo>,
    provider: Arc<ProviderClient>,
    locks: RowLocks,
    service: Arc<SchedulerService>,
    policy: RefreshPolicy,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

impl RefreshScheduler {
    pub fn new(
        tokens: Arc<dyn TokenRepo>,
        provider: Arc<ProviderClient>,
        locks: RowLocks,
        service: Arc<SchedulerService>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            tokens,
            provider,
            locks,
            service,
            policy,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arms a job firing at `expires_at - buffer`, replacing any job already
    /// registered for the id. Callers hold the row lock.
    pub fn schedule(&self, correlation_id: &str, expires_at: OffsetDateTime) -> Result<(), SchedulerError> {
        let next_fire_at = expires_at - self.policy.buffer;
        let generation = Uuid::new_v4();

        // The registry stays locked across spawn and insert so a job that
        // finishes immediately cannot try to retire itself before it is registered.
        let mut jobs = self.jobs();
        let this = self.clone();
        let id = correlation_id.to_string();
        let job = self
            .service
            .spawn(move |cancel| this.run(id, generation, next_fire_at, cancel))?;
        if let Some(previous) = jobs.insert(
            correlation_id.to_string(),
            JobEntry { generation, next_fire_at, job },
        ) {
            previous.job.signal();
        }
        info!(correlation_id = %correlation_id, next_fire_at = %next_fire_at, "refresh job scheduled");
        Ok(())
    }

    /// Disarms and removes the job. Missing jobs are a no-op. On failure the
    /// job stays registered.
    pub async fn cancel(&self, correlation_id: &str) -> Result<(), SchedulerError> {
        if !self.has_job(correlation_id) {
            debug!(correlation_id = %correlation_id, "no refresh job to cancel");
            return Ok(());
        }
        self.service.ensure_running()?;
        let removed = self.jobs().remove(correlation_id);
        let Some(mut entry) = removed else {
            return Ok(());
        };
        match self.service.cancel(&mut entry.job).await {
            Ok(()) => {
                info!(correlation_id = %correlation_id, "refresh job cancelled");
                Ok(())
            }
            // A job that panicked is not running any more.
            Err(SchedulerError::Join(e)) => {
                error!(correlation_id = %correlation_id, error = %e, "refresh job had failed before cancel");
                Ok(())
            }
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "refresh job did not stop; keeping it registered");
                self.jobs().entry(correlation_id.to_string()).or_insert(entry);
                Err(e)
            }
        }
    }

    /// Time left before the next refresh; zero once the job is due or in flight.
    pub fn seconds_until_refresh(&self, correlation_id: &str) -> Option<Duration> {
        let now = OffsetDateTime::now_utc();
        self.jobs()
            .get(correlation_id)
            .map(|entry| (entry.next_fire_at - now).max(Duration::ZERO))
    }

    pub fn has_job(&self, correlation_id: &str) -> bool {
        self.jobs().contains_key(correlation_id)
    }

    /// Re-arms jobs for every active token in the store. Run once at startup.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let active = self.tokens.list_active().await?;
        let mut restored = 0;
        for token in active {
            let Some(expires_at) = token.expires_at else {
                warn!(correlation_id = %token.correlation_id, "active token without expiry; skipping");
                continue;
            };
            let _row = self.locks.lock(&token.correlation_id).await;
            self.schedule(&token.correlation_id, expires_at)?;
            restored += 1;
        }
        info!(restored, "refresh jobs restored");
        Ok(restored)
    }

    async fn run(
        self,
        correlation_id: String,
        generation: Uuid,
        mut fire_at: OffsetDateTime,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay_until(fire_at)) => {}
            }
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = self.fire(&correlation_id, generation) => next,
            };
            match next {
                Some(at) => fire_at = at,
                None => return,
            }
        }
    }

    /// One firing. Returns the next fire time, or `None` once the job has retired.
    async fn fire(&self, correlation_id: &str, generation: Uuid) -> Option<OffsetDateTime> {
        info!(correlation_id = %correlation_id, "starting token refresh");

        let refresh_token = {
            let _row = self.locks.lock(correlation_id).await;
            match self.tokens.get(correlation_id).await {
                Ok(Some(token)) if token.is_active => match token.refresh_token {
                    Some(refresh_token) => refresh_token,
                    None => {
                        warn!(correlation_id = %correlation_id, "active token has no refresh token");
                        let now = OffsetDateTime::now_utc();
                        return match self.tokens.upsert(&token.deactivated(now)).await {
                            Ok(()) => {
                                self.retire(correlation_id, generation);
                                None
                            }
                            Err(e) => self.after_store_error(correlation_id, generation, e),
                        };
                    }
                },
                Ok(_) => {
                    info!(correlation_id = %correlation_id, "token gone or inactive; retiring refresh job");
                    self.retire(correlation_id, generation);
                    return None;
                }
                Err(e) => return self.after_store_error(correlation_id, generation, e),
            }
        };

        // The provider round trip runs without the row lock.
        let refreshed = self.request_refresh(correlation_id, &refresh_token).await;

        let _row = self.locks.lock(correlation_id).await;
        let current = match self.tokens.get(correlation_id).await {
            Ok(Some(token)) if token.is_active => token,
            Ok(_) => {
                info!(correlation_id = %correlation_id, "token removed during refresh; retiring refresh job");
                self.retire(correlation_id, generation);
                return None;
            }
            Err(e) => return self.after_store_error(correlation_id, generation, e),
        };

        let now = OffsetDateTime::now_utc();
        match refreshed {
            Some(creds) => {
                let expires_at = creds.expires_at(now);
                if let Err(e) = self.tokens.upsert(&current.with_credentials(&creds, now)).await {
                    return self.after_store_error(correlation_id, generation, e);
                }
                let next = (expires_at - self.policy.buffer).max(now + self.policy.min_interval);
                info!(correlation_id = %correlation_id, expires_at = %expires_at, "token refreshed");
                self.rearm(correlation_id, generation, next)
            }
            None => match self.tokens.upsert(&current.deactivated(now)).await {
                Ok(()) => {
                    warn!(correlation_id = %correlation_id, "refresh abandoned; token deactivated");
                    self.retire(correlation_id, generation);
                    None
                }
                Err(e) => self.after_store_error(correlation_id, generation, e),
            },
        }
    }

    async fn request_refresh(&self, correlation_id: &str, refresh_token: &str) -> Option<Credentials> {
        let backoff = &self.policy.backoff;
        let mut attempt = 0;
        loop {
            match self.provider.refresh(refresh_token).await {
                Ok(creds) => return Some(creds),
                Err(e) if e.is_retryable() && attempt < backoff.max_retries => {
                    let delay = backoff.delay(attempt);
                    warn!(correlation_id = %correlation_id, error = %e, attempt, ?delay, "token refresh failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(correlation_id = %correlation_id, error = %e, attempt, "token refresh failed");
                    return None;
                }
            }
        }
    }

    fn after_store_error(&self, correlation_id: &str, generation: Uuid, err: anyhow::Error) -> Option<OffsetDateTime> {
        let next = OffsetDateTime::now_utc() + self.policy.min_interval;
        error!(correlation_id = %correlation_id, error = ?err, retry_at = %next, "token store error during refresh");
        self.rearm(correlation_id, generation, next)
    }

    fn rearm(&self, correlation_id: &str, generation: Uuid, next_fire_at: OffsetDateTime) -> Option<OffsetDateTime> {
        match self.jobs().get_mut(correlation_id) {
            Some(entry) if entry.generation == generation => {
                entry.next_fire_at = next_fire_at;
                Some(next_fire_at)
            }
            _ => None,
        }
    }

    fn retire(&self, correlation_id: &str, generation: Uuid) {
        let mut jobs = self.jobs();
        if jobs.get(correlation_id).is_some_and(|entry| entry.generation == generation) {
            jobs.remove(correlation_id);
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn delay_until(at: OffsetDateTime) -> std::time::Duration {
    std::time::Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            max_retries: 5,
            initial_delay: std::time::Duration::from_millis(100),
            max_delay: std::time::Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 350);
        assert_eq!(backoff.delay(31).as_millis(), 350);
    }

    #[test]
    fn overdue_fire_time_sleeps_zero() {
        let past = OffsetDateTime::now_utc() - Duration::minutes(3);
        assert_eq!(delay_until(past), std::time::Duration::ZERO);
    }
}
