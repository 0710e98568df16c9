//! Per-operation execution context: thread budget, task granularity, and
//! cooperative cancellation.
//!
//! The worker count follows the cost model
//! `nthreads = min(nthreads_max, ceil(work / chunk))` with a default chunk
//! of 4096 entries, and tasks fan out to `min(work, 64 * nthreads)` so the
//! scheduler has slack to balance uneven slices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Default work granule: one task per this many entries when deciding how
/// many threads an operation deserves.
pub const DEFAULT_CHUNK: usize = 4096;

#[derive(Clone, Debug)]
pub struct Context {
    pub nthreads_max: usize,
    pub chunk: usize,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for Context {
    fn default() -> Self {
        let nthreads_max = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self { nthreads_max, chunk: DEFAULT_CHUNK, cancel: None }
    }
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cancellation token. Kernels poll it at task boundaries;
    /// a cancelled operation returns [`Error::Cancelled`] without touching
    /// its output.
    #[must_use]
    pub fn with_cancel(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// A copy of this context with a tighter thread cap (descriptor
    /// override for one call).
    #[must_use]
    pub fn with_nthreads_max(&self, n: usize) -> Self {
        let mut ctx = self.clone();
        ctx.nthreads_max = n.max(1);
        ctx
    }

    #[inline]
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Acquire))
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Threads worth spinning up for `work` units.
    #[inline]
    #[must_use]
    pub fn nthreads(&self, work: usize) -> usize {
        let by_work = work.div_ceil(self.chunk.max(1));
        self.nthreads_max.min(by_work).max(1)
    }

    /// Task count for `work` units on `nthreads` threads: one task when
    /// serial, otherwise enough slack for dynamic balancing.
    #[inline]
    #[must_use]
    pub fn ntasks(&self, work: usize, nthreads: usize) -> usize {
        if nthreads <= 1 {
            1
        } else {
            (64 * nthreads).min(work).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_work_is_serial() {
        let ctx = Context { nthreads_max: 8, chunk: 4096, cancel: None };
        assert_eq!(ctx.nthreads(100), 1);
        assert_eq!(ctx.ntasks(100, 1), 1);
    }

    #[test]
    fn large_work_scales_to_cap() {
        let ctx = Context { nthreads_max: 8, chunk: 4096, cancel: None };
        assert_eq!(ctx.nthreads(1 << 20), 8);
        assert_eq!(ctx.ntasks(1 << 20, 8), 512);
        // ntasks never exceeds the work itself
        assert_eq!(ctx.ntasks(10, 8), 10);
    }

    #[test]
    fn cancellation_is_observable() {
        let token = Arc::new(AtomicBool::new(false));
        let ctx = Context::new().with_cancel(Arc::clone(&token));
        assert!(ctx.check().is_ok());
        token.store(true, Ordering::Release);
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
    }
}
