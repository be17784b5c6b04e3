//! Timer primitive and the jobs built on it: token refresh and the session sweep.

pub mod refresh;
pub mod service;
pub mod sweep;

pub use refresh::{Backoff, RefreshPolicy, RefreshScheduler};
pub use service::{JobHandle, SchedulerConfig, SchedulerError, SchedulerService};
pub use sweep::{SessionReaper, SweepReport};
