//! Debounce with one trailing run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{run_isolated, FlagGuard};

/// Collapses bursts of refresh requests.
///
/// The first [`invalidate`](Self::invalidate) runs the callback right away.
/// Calls arriving while it runs, or during the `delay` that follows, are
/// folded into a single trailing run. A burst of any size therefore costs at
/// most two executions.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use relay_hub::bundle::BundledUpdate;
///
/// # async fn demo() {
/// let bundler = BundledUpdate::new(Duration::from_millis(250));
/// for _ in 0..100 {
///     bundler.invalidate(false, || async { /* refresh the feed */ });
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct BundledUpdate {
    delay: Duration,
    running: Arc<AtomicBool>,
    owed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BundledUpdate {
    /// Creates a bundler that waits `delay` after each run.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: Arc::new(AtomicBool::new(false)),
            owed: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Whether a run (or its trailing delay) is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a run of `on_update`.
    ///
    /// While a run is in progress the request is dropped when
    /// `ignore_if_doing` is set, and otherwise turns into the trailing run.
    /// Must be called from within a tokio runtime; outside one the request
    /// is logged and dropped.
    pub fn invalidate<F, Fut>(&self, ignore_if_doing: bool, on_update: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            if !ignore_if_doing {
                self.owed.store(true, Ordering::SeqCst);
            }
            return;
        }

        let guard = FlagGuard(Arc::clone(&self.running));
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("Bundled update requested outside a tokio runtime");
            return;
        };

        let owed = Arc::clone(&self.owed);
        let delay = self.delay;
        let handle = runtime.spawn(async move {
            let _guard = guard;
            run_isolated("update", on_update()).await;
            tokio::time::sleep(delay).await;
            if owed.swap(false, Ordering::SeqCst) {
                run_isolated("update", on_update()).await;
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Cancels the current run. The bundler accepts new requests right away.
    pub fn cancel(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.owed.store(false, Ordering::SeqCst);
    }
}

impl Drop for BundledUpdate {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
