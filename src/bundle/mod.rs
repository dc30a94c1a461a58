//! Debounce and coalescing primitives.
//!
//! Many call sites ask for the same expensive refresh in quick succession.
//! [`BundledUpdate`] collapses a burst of triggers into at most two runs;
//! [`BundledInsert`] collects payloads into sets and delivers them in
//! batches.
//!
//! The "in progress" flag of both is cleared by a drop guard owned by the
//! spawned task, so it is reset whether the run finishes, panics, or is
//! cancelled.

mod insert;
mod update;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;

pub use insert::BundledInsert;
pub use update::BundledUpdate;

/// Clears a shared flag when dropped.
struct FlagGuard(Arc<AtomicBool>);

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Awaits `work`, logging instead of propagating a panic.
async fn run_isolated(name: &str, work: impl Future<Output = ()>) {
    if AssertUnwindSafe(work).catch_unwind().await.is_err() {
        log::error!("Bundled {name} callback panicked");
    }
}
