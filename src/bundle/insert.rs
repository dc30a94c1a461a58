//! Batched delivery of accumulated payloads.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{run_isolated, FlagGuard};

/// Collects items and hands them over in sets.
///
/// Items queued while a batch is processed, or during the `delay` after it,
/// go into the next batch. The worker keeps draining until the queue stays
/// empty.
#[derive(Debug)]
pub struct BundledInsert<T> {
    delay: Duration,
    running: Arc<AtomicBool>,
    queue: Arc<Mutex<HashSet<T>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> BundledInsert<T>
where
    T: Eq + Hash + Send + 'static,
{
    /// Creates a bundler that waits `delay` after each batch.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(Mutex::new(HashSet::new())),
            task: Mutex::new(None),
        }
    }

    /// Number of items waiting for the next batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a batch (or its trailing delay) is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues `item` and starts delivering batches to `on_update` if no
    /// delivery is in progress.
    pub fn invalidate_list<F, Fut>(&self, item: T, on_update: F)
    where
        F: Fn(HashSet<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item);

        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let guard = FlagGuard(Arc::clone(&self.running));
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("Bundled insert requested outside a tokio runtime");
            return;
        };

        let running = Arc::clone(&self.running);
        let queue = Arc::clone(&self.queue);
        let delay = self.delay;
        let handle = runtime.spawn(async move {
            let mut guard = Some(guard);
            loop {
                loop {
                    let batch =
                        std::mem::take(&mut *queue.lock().unwrap_or_else(PoisonError::into_inner));
                    if batch.is_empty() {
                        break;
                    }
                    run_isolated("insert", on_update(batch)).await;
                    tokio::time::sleep(delay).await;
                }

                drop(guard.take());

                // An item queued after the last drain but before the flag was
                // released would otherwise wait for the next caller.
                let stranded = !queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_empty();
                if !stranded || running.swap(true, Ordering::SeqCst) {
                    break;
                }
                guard = Some(FlagGuard(Arc::clone(&running)));
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Cancels delivery. Queued items stay queued.
    pub fn cancel(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl<T> Drop for BundledInsert<T> {
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
