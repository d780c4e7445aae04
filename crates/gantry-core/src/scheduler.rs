//! Named recurring background tasks.
//!
//! Both limiters push expiry work into periodic sweeps; this module owns
//! those loops. Each task is a tokio interval loop guarded by a child
//! cancellation token, registered under a unique name so it can be cancelled
//! individually or all at once at shutdown.

use std::{future::Future, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Scheduling errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// A task with this name is already registered.
    #[error("recurring task '{0}' is already scheduled")]
    AlreadyScheduled(String),
}

#[derive(Debug)]
struct RecurringTask {
    token: CancellationToken,
    #[allow(dead_code, reason = "kept to tie the task's lifetime to this entry")]
    handle: JoinHandle<()>,
}

/// Registry of named recurring tasks.
#[derive(Debug, Default)]
pub struct RecurringScheduler {
    tasks: DashMap<String, RecurringTask>,
    root: CancellationToken,
}

impl RecurringScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` every `interval` until cancelled.
    ///
    /// The first run happens one full interval after scheduling. Requires a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::AlreadyScheduled`] if `name` is taken.
    pub fn schedule_recurring<W, F>(
        &self,
        name: &str,
        interval: Duration,
        work: W,
    ) -> Result<(), ScheduleError>
    where
        W: Fn() -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send,
    {
        if self.tasks.contains_key(name) {
            return Err(ScheduleError::AlreadyScheduled(name.to_string()));
        }

        let token = self.root.child_token();
        let task_token = token.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick completes instantly; consume it so
            // work runs on the interval, not at spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => work().await,
                }
            }
            tracing::trace!(name = %task_name, "recurring task stopped");
        });

        match self.tasks.entry(name.to_string()) {
            dashmap::Entry::Vacant(slot) => {
                slot.insert(RecurringTask { token, handle });
                Ok(())
            },
            dashmap::Entry::Occupied(_) => {
                // Lost a race with a concurrent scheduler of the same name.
                token.cancel();
                handle.abort();
                Err(ScheduleError::AlreadyScheduled(name.to_string()))
            },
        }
    }

    /// Cancel one task by name. Returns `true` if it existed.
    pub fn cancel_recurring(&self, name: &str) -> bool {
        if let Some((_, task)) = self.tasks.remove(name) {
            task.token.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every task.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.tasks.clear();
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// `true` if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scheduled_work_runs_on_interval() {
        let scheduler = RecurringScheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        scheduler
            .schedule_recurring("counter", Duration::from_millis(100), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_names_are_rejected() {
        let scheduler = RecurringScheduler::new();
        scheduler
            .schedule_recurring("sweep", Duration::from_secs(1), || async {})
            .unwrap();

        let err = scheduler
            .schedule_recurring("sweep", Duration::from_secs(1), || async {})
            .unwrap_err();
        assert_eq!(err, ScheduleError::AlreadyScheduled("sweep".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_work() {
        let scheduler = RecurringScheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        scheduler
            .schedule_recurring("sweep", Duration::from_millis(100), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(scheduler.cancel_recurring("sweep"));
        let after_cancel = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);

        assert!(!scheduler.cancel_recurring("sweep"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let scheduler = RecurringScheduler::new();
        scheduler.schedule_recurring("a", Duration::from_secs(1), || async {}).unwrap();
        scheduler.schedule_recurring("b", Duration::from_secs(1), || async {}).unwrap();
        assert_eq!(scheduler.len(), 2);

        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }
}
