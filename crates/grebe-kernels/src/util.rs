//! Shared helpers for the kernels: index casts, work slicing, fallible
//! allocation.

use grebe_core::{Error, Matrix, Result};

#[inline]
pub(crate) fn i64_to_usize(x: i64) -> usize {
    debug_assert!(x >= 0);
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    {
        x as usize
    }
}

#[inline]
pub(crate) fn usize_to_i64(x: usize) -> i64 {
    debug_assert!(i64::try_from(x).is_ok());
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    {
        x as i64
    }
}

/// Allocate a zero-filled `i64` buffer, reporting failure instead of
/// aborting.
pub(crate) fn alloc_i64(n: usize, what: &str) -> Result<Vec<i64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|_| Error::OutOfMemory(format!("{what}: {n} indices")))?;
    v.resize(n, 0);
    Ok(v)
}

/// Allocate a zero-filled byte buffer, reporting failure instead of
/// aborting.
pub(crate) fn alloc_u8(n: usize, what: &str) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|_| Error::OutOfMemory(format!("{what}: {n} bytes")))?;
    v.resize(n, 0);
    Ok(v)
}

/// Exclusive prefix sum of per-vector counts into a pointer array.
pub(crate) fn prefix_sum(counts: &[usize]) -> Vec<i64> {
    let mut p = vec![0i64; counts.len() + 1];
    for (k, &c) in counts.iter().enumerate() {
        p[k + 1] = p[k] + usize_to_i64(c);
    }
    p
}

/// Split `0..n` into at most `ntasks` contiguous equal ranges.
pub(crate) fn slice_flat(n: usize, ntasks: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }
    let ntasks = ntasks.clamp(1, n);
    let per = n.div_ceil(ntasks);
    let mut ranges = Vec::with_capacity(ntasks);
    let mut start = 0;
    while start < n {
        let end = (start + per).min(n);
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Split the stored vectors of `m` into contiguous ranges balanced by entry
/// count, targeting `ntasks` ranges.
pub(crate) fn slice_vectors(m: &Matrix, ntasks: usize) -> Vec<(usize, usize)> {
    let nvec = m.nvec();
    if nvec == 0 {
        return Vec::new();
    }
    let total = m.nstored();
    let target = (total / ntasks.max(1)).max(1);
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut acc = 0usize;
    let mut k0 = 0usize;
    for k in 0..nvec {
        let (s, e) = m.vector_range(k);
        if acc == 0 {
            k0 = k;
        }
        acc += e - s;
        if acc >= target {
            ranges.push((k0, k + 1));
            acc = 0;
        }
    }
    if acc > 0 || ranges.is_empty() {
        ranges.push((k0.min(nvec), nvec));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_sum_builds_pointers() {
        assert_eq!(prefix_sum(&[2, 0, 3]), vec![0, 2, 2, 5]);
        assert_eq!(prefix_sum(&[]), vec![0]);
    }

    #[test]
    fn slice_flat_covers_everything() {
        let r = slice_flat(10, 3);
        assert_eq!(r.first().unwrap().0, 0);
        assert_eq!(r.last().unwrap().1, 10);
        let total: usize = r.iter().map(|(s, e)| e - s).sum();
        assert_eq!(total, 10);
        assert!(slice_flat(0, 4).is_empty());
        assert_eq!(slice_flat(2, 100).len(), 2);
    }
}
