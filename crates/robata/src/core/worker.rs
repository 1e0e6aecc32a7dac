//! Background task management for the control loop and the batch workers.

use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use tokio::{task::JoinHandle, sync::Notify};
use tracing::warn;

/// A handle over one long-running background task.
///
/// The task receives a `running` flag and a notifier. It is expected to loop
/// while the flag is set and to wait on the notifier (or a timer) between
/// iterations, so that [`WorkerHandle::shutdown`] can wake it up to exit.
///
/// # Example
///
/// ```ignore
/// let worker = WorkerHandle::new(|running, notifier| {
///     tokio::spawn(async move {
///         while running.load(Ordering::SeqCst) {
///             tokio::select! {
///                 _ = notifier.notified() => {},
///                 _ = tokio::time::sleep(Duration::from_millis(25)) => {},
///             }
///         }
///     })
/// });
///
/// worker.stop().await;
/// ```
pub struct WorkerHandle {
    /// Cleared to ask the task to exit
    running: Arc<AtomicBool>,

    /// `None` once shutdown has taken it
    handle: Option<JoinHandle<()>>,

    /// Wakes the task
    notifier: Arc<Notify>,
}

impl WorkerHandle {
    /// Spawn a task with its own running flag and notifier.
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()> + Send + 'static,
    {
        Self::with_signals(Arc::new(AtomicBool::new(true)), Arc::new(Notify::new()), task)
    }

    /// Spawn a task that shares an existing running flag and notifier.
    ///
    /// The control loop uses this so that submitters and batch workers can
    /// wake it through the scheduler's notifier.
    pub fn with_signals<F>(running: Arc<AtomicBool>, notifier: Arc<Notify>, task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()> + Send + 'static,
    {
        running.store(true, Ordering::SeqCst);
        let handle = task(running.clone(), notifier.clone());
        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Ask the task to exit without waiting for it.
    ///
    /// The join handle is moved into a detached task so the background task
    /// is still awaited to completion. Outside a runtime there is nothing
    /// left to await on and the handle is simply dropped.
    pub fn shutdown(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    let _ = handle.await;
                });
            }
        }
    }

    /// Ask the task to exit and wait until it has.
    pub async fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_waiters wakes a task parked in `notified()`; notify_one stores a
        // permit for a task that is between iterations
        self.notifier.notify_waiters();
        self.notifier.notify_one();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
