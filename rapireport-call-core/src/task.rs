//! Scoped background tasks
//!
//! Poll loops and call timers are spawned as tokio tasks owned by the
//! component that started them. Dropping the handle aborts the task.

use std::future::Future;
use tokio::task::JoinHandle;

/// Owned handle to a spawned task, aborted on drop
#[derive(Debug)]
pub struct ScopedTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScopedTask {
    /// Spawn `future` on the current runtime
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "Spawning scoped task");
        Self {
            name,
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Abort the task
    ///
    /// Returns `true` the first time, `false` when already cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                tracing::trace!(task = self.name, "Scoped task cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether the task is still scheduled
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Task name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
