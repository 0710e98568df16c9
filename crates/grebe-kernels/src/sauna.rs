//! Per-task dense scratch with the hi-watermark trick.
//!
//! A `Sauna` holds a dense accumulator (`work`) and a companion `mark`
//! array. Slot `i` counts as occupied for the current output vector iff
//! `mark[i] == hiwater`; bumping `hiwater` retires every slot at once, so
//! no per-vector clearing ever happens. Marks are only reset when the
//! counter saturates, once per `u64::MAX` vectors.
//!
//! Saunas are drawn from a process-wide pool. Acquisition blocks until one
//! is free; the guard returns it on drop, including on panic or early
//! return.

use parking_lot::{Condvar, Mutex};
use std::sync::OnceLock;

pub(crate) struct Sauna {
    work: Vec<u64>,
    mark: Vec<u64>,
    hiwater: u64,
    zsize: usize,
}

impl Sauna {
    fn new() -> Self {
        Self { work: Vec::new(), mark: Vec::new(), hiwater: 0, zsize: 1 }
    }

    /// Size the scratch for `inner` slots of `zsize`-byte values. Growing
    /// keeps existing marks valid; the accumulator is backed by `u64` words
    /// so slots are 8-byte aligned for every built-in type.
    pub(crate) fn ensure(&mut self, inner: usize, zsize: usize) {
        self.zsize = zsize;
        let words = (inner * zsize).div_ceil(8);
        if self.work.len() < words {
            self.work.resize(words, 0);
        }
        if self.mark.len() < inner {
            self.mark.resize(inner, 0);
        }
    }

    /// Start a new output vector; returns the watermark that claims slots.
    pub(crate) fn next_vector(&mut self) -> u64 {
        if self.hiwater == u64::MAX {
            self.mark.fill(0);
            self.hiwater = 0;
        }
        self.hiwater += 1;
        self.hiwater
    }

    #[inline]
    pub(crate) fn mark_slot(&mut self, i: usize, water: u64) {
        self.mark[i] = water;
    }

    #[inline]
    pub(crate) fn is_marked(&self, i: usize, water: u64) -> bool {
        self.mark[i] == water
    }

    /// The accumulator and mark arrays, borrowed together so scatter loops
    /// can update both.
    #[inline]
    pub(crate) fn parts_bytes_mut(&mut self) -> (&mut [u8], &mut [u64]) {
        let work = unsafe {
            std::slice::from_raw_parts_mut(self.work.as_mut_ptr().cast(), self.work.len() * 8)
        };
        (work, &mut self.mark)
    }

    /// Typed variant of [`Sauna::parts_bytes_mut`]. Valid for the built-in
    /// types because the backing store is 8-byte aligned.
    ///
    /// # Safety
    /// `T` must be the type the caller has been writing into the slots and
    /// `size_of::<T>()` must equal the `zsize` passed to [`Sauna::ensure`].
    #[inline]
    pub(crate) unsafe fn parts_typed_mut<T>(&mut self) -> (&mut [T], &mut [u64]) {
        debug_assert_eq!(std::mem::size_of::<T>(), self.zsize);
        let work = unsafe {
            std::slice::from_raw_parts_mut(
                self.work.as_mut_ptr().cast(),
                self.work.len() * 8 / std::mem::size_of::<T>(),
            )
        };
        (work, &mut self.mark)
    }
}

struct Pool {
    free: Mutex<Vec<Sauna>>,
    ready: Condvar,
}

static POOL: OnceLock<Pool> = OnceLock::new();

fn pool() -> &'static Pool {
    POOL.get_or_init(|| {
        let n = rayon::current_num_threads().max(1);
        Pool {
            free: Mutex::new((0..n).map(|_| Sauna::new()).collect()),
            ready: Condvar::new(),
        }
    })
}

/// Exclusive use of one pooled sauna; blocks while the pool is empty.
pub(crate) struct SaunaGuard {
    sauna: Option<Sauna>,
}

impl SaunaGuard {
    pub(crate) fn acquire(inner: usize, zsize: usize) -> Self {
        let p = pool();
        let mut free = p.free.lock();
        while free.is_empty() {
            p.ready.wait(&mut free);
        }
        let mut sauna = free.pop().expect("non-empty after wait");
        drop(free);
        sauna.ensure(inner, zsize);
        Self { sauna: Some(sauna) }
    }
}

impl std::ops::Deref for SaunaGuard {
    type Target = Sauna;
    fn deref(&self) -> &Sauna {
        self.sauna.as_ref().expect("sauna present until drop")
    }
}

impl std::ops::DerefMut for SaunaGuard {
    fn deref_mut(&mut self) -> &mut Sauna {
        self.sauna.as_mut().expect("sauna present until drop")
    }
}

impl Drop for SaunaGuard {
    fn drop(&mut self) {
        if let Some(sauna) = self.sauna.take() {
            let p = pool();
            p.free.lock().push(sauna);
            p.ready.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_retires_slots_without_clearing() {
        let mut s = Sauna::new();
        s.ensure(8, 8);
        let w1 = s.next_vector();
        s.mark_slot(3, w1);
        assert!(s.is_marked(3, w1));
        let w2 = s.next_vector();
        assert!(!s.is_marked(3, w2));
        assert!(w2 > w1);
    }

    #[test]
    fn typed_view_round_trips() {
        let mut s = Sauna::new();
        s.ensure(4, 8);
        let (w, mark) = unsafe { s.parts_typed_mut::<f64>() };
        w[2] = 6.5;
        mark[2] = 1;
        let (w, _) = unsafe { s.parts_typed_mut::<f64>() };
        assert_eq!(w[2], 6.5);
    }

    #[test]
    fn guard_returns_to_pool() {
        {
            let _g1 = SaunaGuard::acquire(16, 8);
            let _g2 = SaunaGuard::acquire(16, 8);
        }
        // both back in the pool; acquiring again must not block
        let _g3 = SaunaGuard::acquire(32, 4);
    }
}
