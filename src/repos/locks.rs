use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// Per-row async locks keyed by correlation id.
///
/// Request handlers and refresh jobs take the lock for a row before reading
/// or writing it; unrelated rows never contend. Entries nobody holds or waits
/// on are dropped on the next acquisition.
#[derive(Clone, Default)]
pub struct RowLocks {
    rows: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

pub type RowGuard = OwnedMutexGuard<()>;

impl RowLocks {
    pub async fn lock(&self, correlation_id: &str) -> RowGuard {
        let row = {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            rows.retain(|_, m| Arc::strong_count(m) > 1);
            rows.entry(correlation_id.to_string()).or_default().clone()
        };
        row.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::RowLocks;
    use std::time::Duration;

    #[tokio::test]
    async fn same_row_is_serialized() {
        let locks = RowLocks::default();
        let guard = locks.lock("a").await;
        let pending = tokio::time::timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(pending.is_err(), "second lock on the same row must wait");
        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn distinct_rows_do_not_contend() {
        let locks = RowLocks::default();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_rows_are_pruned() {
        let locks = RowLocks::default();
        drop(locks.lock("a").await);
        drop(locks.lock("b").await);
        let _c = locks.lock("c").await;
        assert_eq!(locks.tracked(), 1);
    }
}
