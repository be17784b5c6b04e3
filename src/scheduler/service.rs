//! Lifecycle-managed task runner for timed jobs.
//!
//! The service is created by the composition root, started once at boot and
//! stopped on shutdown. Jobs are plain tokio tasks tracked by a `TaskTracker`
//! and driven by a child of the service's root `CancellationToken`, so
//! stopping the service stops every job.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,

    #[error("scheduler not running")]
    NotRunning,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("job task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long `cancel` waits for a signalled job to return.
    pub join_timeout: Duration,
    /// How long `stop` waits for all jobs to drain.
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// A spawned job: its cancellation signal and join handle.
#[derive(Debug)]
pub struct JobHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl JobHandle {
    /// Signals the job without waiting for it.
    pub fn signal(&self) {
        self.cancel.cancel();
    }
}

pub struct SchedulerService {
    config: SchedulerConfig,
    running: AtomicBool,
    root: Mutex<CancellationToken>,
    tracker: TaskTracker,
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            root: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        *self.root.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.tracker.reopen();
        info!(scheduler = "refresh", event = "start", "scheduler started");
        Ok(())
    }

    /// Cancels every job and waits for them to finish.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        self.root.lock().unwrap_or_else(PoisonError::into_inner).cancel();
        self.tracker.close();

        let stop_timeout = self.config.stop_timeout;
        if tokio::time::timeout(stop_timeout, self.tracker.wait()).await.is_err() {
            warn!(pending = self.tracker.len(), "jobs still running after stop timeout");
            return Err(SchedulerError::Timeout(stop_timeout));
        }
        info!(scheduler = "refresh", event = "stop", "scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SchedulerError::NotRunning)
        }
    }

    /// Spawns `job` with its own cancellation token, a child of the service root.
    pub fn spawn<F, Fut>(&self, job: F) -> Result<JobHandle, SchedulerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ensure_running()?;
        let cancel = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token();
        let handle = self.tracker.spawn(job(cancel.clone()));
        Ok(JobHandle { cancel, handle })
    }

    /// Signals the job and waits, bounded by the join timeout, for it to return.
    /// After a timeout the handle can be awaited again.
    pub async fn cancel(&self, job: &mut JobHandle) -> Result<(), SchedulerError> {
        job.cancel.cancel();
        let join_timeout = self.config.join_timeout;
        match tokio::time::timeout(join_timeout, &mut job.handle).await {
            Err(_) => Err(SchedulerError::Timeout(join_timeout)),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(SchedulerError::Join(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SchedulerService {
        SchedulerService::new(SchedulerConfig {
            join_timeout: Duration::from_millis(200),
            stop_timeout: Duration::from_millis(500),
        })
    }

    #[tokio::test]
    async fn lifecycle_rejects_double_start_and_stop() {
        let svc = service();
        svc.start().unwrap();
        assert!(matches!(svc.start(), Err(SchedulerError::AlreadyRunning)));
        svc.stop().await.unwrap();
        assert!(matches!(svc.stop().await, Err(SchedulerError::NotRunning)));
        svc.start().unwrap();
        assert!(svc.is_running());
    }

    #[tokio::test]
    async fn spawn_requires_a_running_service() {
        let svc = service();
        let res = svc.spawn(|_| async {});
        assert!(matches!(res, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn cancel_waits_for_the_job_to_return() {
        let svc = service();
        svc.start().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut job = svc
            .spawn(|cancel| async move {
                cancel.cancelled().await;
                let _ = tx.send(());
            })
            .unwrap();
        svc.cancel(&mut job).await.unwrap();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn cancel_times_out_on_a_job_that_ignores_its_signal() {
        let svc = service();
        svc.start().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut job = svc
            .spawn(|_| async move {
                let _ = rx.await;
            })
            .unwrap();
        assert!(matches!(svc.cancel(&mut job).await, Err(SchedulerError::Timeout(_))));

        tx.send(()).unwrap();
        svc.cancel(&mut job).await.unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_running_jobs() {
        let svc = service();
        svc.start().unwrap();
        let _job = svc
            .spawn(|cancel| async move { cancel.cancelled().await })
            .unwrap();
        svc.stop().await.unwrap();
    }
}
