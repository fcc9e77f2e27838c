//! Task tracking for periodic maintenance jobs
//!
//! Each job is registered under a name; registering the same name again
//! aborts the previous task. All jobs observe one cancellation token.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TaskTracker {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a task, aborting any previous task with the same name
    pub fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old_handle) = tasks.insert(name.into(), handle) {
                old_handle.abort();
            }
        }
    }

    /// Run `job` every `period` until cancelled. The first run happens after one period.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task = %task_name, "Periodic task cancelled");
                        break;
                    }
                    _ = interval.tick() => job().await,
                }
            }
        });
        info!(task = %name, period_secs = period.as_secs(), "Periodic task scheduled");
        self.register(name, handle);
    }

    pub fn unregister(&self, name: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(name) {
                handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().map(|(_, h)| h).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
