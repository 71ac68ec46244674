//! Exit notifications and per-process exit records.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Exit notification produced by the process reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    /// Process id (container id for the init process, exec id otherwise)
    pub id: String,
    /// OS pid of the exited process
    pub pid: u32,
    /// Exit status (128 + signal for signalled processes)
    pub status: i32,
}

/// When and how a process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub status: i32,
    pub exited_at: DateTime<Utc>,
}

/// Write-once exit record.
///
/// The first [`ExitCell::set`] wins; later calls are ignored. Waiters that
/// subscribe before or after the record is set both observe it.
#[derive(Debug)]
pub struct ExitCell {
    tx: watch::Sender<Option<ExitRecord>>,
}

impl ExitCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Record the exit. Returns `false` if an exit was already recorded.
    pub fn set(&self, status: i32) -> bool {
        let record = ExitRecord {
            status,
            exited_at: Utc::now(),
        };
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(record);
            true
        })
    }

    /// Current record, if the process has exited.
    pub fn get(&self) -> Option<ExitRecord> {
        *self.tx.borrow()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the exit is recorded.
    pub async fn wait(&self) -> ExitRecord {
        let mut rx = self.tx.subscribe();
        if let Ok(record) = rx.wait_for(Option::is_some).await {
            if let Some(record) = *record {
                return record;
            }
        }
        // The sender lives in `self`, so the channel cannot close under us.
        std::future::pending().await
    }
}

impl Default for ExitCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_set_wins() {
        let cell = ExitCell::new();
        assert!(cell.get().is_none());
        assert!(cell.set(137));
        let first = cell.get().unwrap();
        assert!(!cell.set(0));
        assert_eq!(cell.get().unwrap(), first);
        assert_eq!(first.status, 137);
    }

    #[tokio::test]
    async fn test_wait_after_exit_returns_immediately() {
        let cell = ExitCell::new();
        cell.set(3);
        let record = tokio::time::timeout(Duration::from_secs(1), cell.wait())
            .await
            .expect("wait should not block after exit");
        assert_eq!(record.status, 3);
    }

    #[tokio::test]
    async fn test_waiters_before_and_after_exit_agree() {
        let cell = Arc::new(ExitCell::new());

        let early: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        cell.set(9);

        let late = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };

        let expected = cell.get().unwrap();
        for handle in early {
            assert_eq!(handle.await.unwrap(), expected);
        }
        assert_eq!(late.await.unwrap(), expected);
    }
}
