//! The sparse matrix data model.
//!
//! A matrix stores its entries compressed by outer vector (columns when
//! `ByCol`, rows when `ByRow`):
//!
//! - `p`: vector pointers (length `nvec + 1`); vector `k` occupies
//!   `p[k] .. p[k+1]` in `i` and `x`.
//! - `i`: inner indices, strictly increasing within each vector once
//!   zombies are unflipped.
//! - `x`: values, `typ.size` bytes each, parallel to `i`.
//! - `h`: present only in hypersparse form — the sorted outer indices of
//!   the `nvec` stored vectors.
//!
//! Two mutation queues ride along: `pending`, an unordered bag of tuples
//! not yet merged, and zombies, entries flagged for deletion by flipping
//! their inner index to a negative sentinel. Both are drained by `wait` in
//! the kernels crate; the invariants below hold at every operation
//! boundary.

use crate::elem::Elem;
use crate::error::{Error, Result};
use crate::ops::BinaryOp;
use crate::types::Type;

/// Storage orientation: which dimension is the outer (compressed) one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    /// CSC: outer vectors are columns.
    ByCol,
    /// CSR: outer vectors are rows.
    ByRow,
}

impl Orientation {
    #[inline]
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Orientation::ByCol => Orientation::ByRow,
            Orientation::ByRow => Orientation::ByCol,
        }
    }
}

/// Zombie sentinel encoding: a deleted entry keeps its slot with the inner
/// index bitwise-complemented, which is always negative and preserves the
/// sort order of the live values around it.
#[inline]
#[must_use]
pub const fn flip_index(i: i64) -> i64 {
    !i
}

#[inline]
#[must_use]
pub const fn is_zombie(i: i64) -> bool {
    i < 0
}

/// Recover the logical inner index whether or not the slot is a zombie.
#[inline]
#[must_use]
pub const fn unflip_index(i: i64) -> i64 {
    if i < 0 {
        !i
    } else {
        i
    }
}

/// Unordered tuples awaiting assembly into the compressed form.
///
/// `op`, when set, combines duplicate tuples during the merge; when absent
/// the last write wins.
#[derive(Clone, Debug, Default)]
pub struct Pending {
    pub outer: Vec<i64>,
    pub inner: Vec<i64>,
    pub x: Vec<u8>,
    pub op: Option<BinaryOp>,
}

impl Pending {
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.outer.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outer.is_empty()
    }

    pub fn clear(&mut self) {
        self.outer.clear();
        self.inner.clear();
        self.x.clear();
        self.op = None;
    }

    pub fn push(&mut self, outer: i64, inner: i64, value: &[u8]) {
        self.outer.push(outer);
        self.inner.push(inner);
        self.x.extend_from_slice(value);
    }
}

/// A runtime-typed sparse matrix.
#[derive(Clone, Debug)]
pub struct Matrix {
    pub typ: Type,
    pub nrows: usize,
    pub ncols: usize,
    pub orientation: Orientation,
    /// Sorted outer indices of stored vectors; `None` when non-hypersparse.
    pub h: Option<Vec<i64>>,
    pub p: Vec<i64>,
    pub i: Vec<i64>,
    pub x: Vec<u8>,
    /// Count of flipped (logically deleted) slots in `i`.
    pub nzombies: usize,
    pub pending: Pending,
}

impl Matrix {
    /// An empty matrix in the default by-column orientation.
    pub fn new(typ: Type, nrows: usize, ncols: usize) -> Result<Self> {
        Self::new_with(typ, nrows, ncols, Orientation::ByCol)
    }

    pub fn new_with(
        typ: Type,
        nrows: usize,
        ncols: usize,
        orientation: Orientation,
    ) -> Result<Self> {
        if typ.size == 0 {
            return Err(Error::InvalidValue("element type has zero size".into()));
        }
        let outer = match orientation {
            Orientation::ByCol => ncols,
            Orientation::ByRow => nrows,
        };
        Ok(Self {
            typ,
            nrows,
            ncols,
            orientation,
            h: None,
            p: vec![0; outer + 1],
            i: Vec::new(),
            x: Vec::new(),
            nzombies: 0,
            pending: Pending::default(),
        })
    }

    /// Assemble a matrix from raw compressed parts, optionally validating
    /// every structural invariant.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        typ: Type,
        nrows: usize,
        ncols: usize,
        orientation: Orientation,
        h: Option<Vec<i64>>,
        p: Vec<i64>,
        i: Vec<i64>,
        x: Vec<u8>,
        check: bool,
    ) -> Result<Self> {
        let m = Self {
            typ,
            nrows,
            ncols,
            orientation,
            h,
            p,
            i,
            x,
            nzombies: 0,
            pending: Pending::default(),
        };
        if check {
            m.check()?;
        }
        Ok(m)
    }

    /// The size of the outer (compressed) dimension.
    #[inline]
    #[must_use]
    pub fn outer_dim(&self) -> usize {
        match self.orientation {
            Orientation::ByCol => self.ncols,
            Orientation::ByRow => self.nrows,
        }
    }

    /// The size of the inner dimension.
    #[inline]
    #[must_use]
    pub fn inner_dim(&self) -> usize {
        match self.orientation {
            Orientation::ByCol => self.nrows,
            Orientation::ByRow => self.ncols,
        }
    }

    /// Number of stored vectors (`outer_dim` unless hypersparse).
    #[inline]
    #[must_use]
    pub fn nvec(&self) -> usize {
        self.h.as_ref().map_or_else(|| self.outer_dim(), Vec::len)
    }

    #[inline]
    #[must_use]
    pub fn is_hyper(&self) -> bool {
        self.h.is_some()
    }

    /// Number of live entries (stored slots minus zombies; pending tuples
    /// are not counted until merged).
    #[inline]
    #[must_use]
    pub fn nvals(&self) -> usize {
        self.i.len() - self.nzombies
    }

    /// Number of stored slots, zombies included.
    #[inline]
    #[must_use]
    pub fn nstored(&self) -> usize {
        self.i.len()
    }

    /// True when there is no deferred work (no pending tuples, no zombies).
    #[inline]
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.pending.is_empty() && self.nzombies == 0
    }

    /// The outer index of stored vector `k`.
    #[inline]
    #[must_use]
    pub fn vector_outer(&self, k: usize) -> i64 {
        match &self.h {
            Some(h) => h[k],
            None => k as i64,
        }
    }

    /// Locate outer index `j` among the stored vectors.
    #[must_use]
    pub fn find_vector(&self, j: i64) -> Option<usize> {
        match &self.h {
            Some(h) => h.binary_search(&j).ok(),
            None => {
                if j >= 0 && (j as usize) < self.outer_dim() {
                    Some(j as usize)
                } else {
                    None
                }
            }
        }
    }

    /// The slot range of stored vector `k`.
    #[inline]
    #[must_use]
    pub fn vector_range(&self, k: usize) -> (usize, usize) {
        (self.p[k] as usize, self.p[k + 1] as usize)
    }

    /// The value bytes of slot `pos`.
    #[inline]
    #[must_use]
    pub fn value_bytes(&self, pos: usize) -> &[u8] {
        &self.x[pos * self.typ.size..(pos + 1) * self.typ.size]
    }

    /// Map a logical `(row, col)` position to `(outer, inner)` for this
    /// orientation.
    #[inline]
    #[must_use]
    pub fn to_outer_inner(&self, row: usize, col: usize) -> (i64, i64) {
        match self.orientation {
            Orientation::ByCol => (col as i64, row as i64),
            Orientation::ByRow => (row as i64, col as i64),
        }
    }

    /// Drop all entries and deferred work, keeping type, shape, and
    /// orientation.
    pub fn clear(&mut self) {
        self.h = None;
        self.p = vec![0; self.outer_dim() + 1];
        self.i.clear();
        self.x.clear();
        self.nzombies = 0;
        self.pending.clear();
    }

    /// Zombie-aware binary search for inner index `inner` in slot range
    /// `lo..hi`. The unflipped indices are strictly sorted, so the search
    /// compares through [`unflip_index`].
    #[must_use]
    pub fn search_vector(&self, lo: usize, hi: usize, inner: i64) -> Option<usize> {
        let mut lo = lo;
        let mut hi = hi;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let v = unflip_index(self.i[mid]);
            match v.cmp(&inner) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Set one element. A live hit is overwritten in place (reviving a
    /// zombie if the slot was deleted); otherwise the tuple is queued on
    /// the pending bag for the next `wait`.
    pub fn set_element_bytes(&mut self, row: usize, col: usize, value: &[u8]) -> Result<()> {
        if row >= self.nrows || col >= self.ncols {
            return Err(Error::InvalidValue(format!(
                "index ({row},{col}) outside {}-by-{}",
                self.nrows, self.ncols
            )));
        }
        if value.len() != self.typ.size {
            return Err(Error::DomainMismatch(format!(
                "value has {} bytes, matrix type has {}",
                value.len(),
                self.typ.size
            )));
        }
        let (outer, inner) = self.to_outer_inner(row, col);
        if let Some(k) = self.find_vector(outer) {
            let (s, e) = self.vector_range(k);
            if let Some(pos) = self.search_vector(s, e, inner) {
                if is_zombie(self.i[pos]) {
                    self.i[pos] = flip_index(self.i[pos]);
                    self.nzombies -= 1;
                }
                let size = self.typ.size;
                self.x[pos * size..(pos + 1) * size].copy_from_slice(value);
                return Ok(());
            }
        }
        self.pending.push(outer, inner, value);
        Ok(())
    }

    /// Typed wrapper over [`Matrix::set_element_bytes`].
    pub fn set_element<T: Elem>(&mut self, row: usize, col: usize, v: T) -> Result<()> {
        if self.typ.code != T::CODE {
            return Err(Error::DomainMismatch(format!(
                "matrix type {:?} does not match element type {:?}",
                self.typ.code,
                T::CODE
            )));
        }
        let mut buf = vec![0u8; self.typ.size];
        v.store(&mut buf);
        self.set_element_bytes(row, col, &buf)
    }

    /// Look up one element among the *stored* entries. Pending tuples are
    /// not visible; callers that may have pending work go through the
    /// kernels' `extract_element`, which finalizes first.
    #[must_use]
    pub fn get_entry_bytes(&self, row: usize, col: usize) -> Option<&[u8]> {
        let (outer, inner) = self.to_outer_inner(row, col);
        let k = self.find_vector(outer)?;
        let (s, e) = self.vector_range(k);
        let pos = self.search_vector(s, e, inner)?;
        if is_zombie(self.i[pos]) {
            None
        } else {
            Some(self.value_bytes(pos))
        }
    }

    /// Typed wrapper over [`Matrix::get_entry_bytes`].
    ///
    /// # Panics
    /// If `T` does not match the matrix type.
    #[must_use]
    pub fn get_entry<T: Elem>(&self, row: usize, col: usize) -> Option<T> {
        assert_eq!(self.typ.code, T::CODE, "element type mismatch");
        self.get_entry_bytes(row, col).map(T::load)
    }

    /// Validate every structural invariant. Deserialization and the debug
    /// assertions in the kernels go through this.
    pub fn check(&self) -> Result<()> {
        let outer = self.outer_dim();
        let inner = self.inner_dim() as i64;
        let nvec = self.nvec();
        if let Some(h) = &self.h {
            if h.len() > outer {
                return Err(Error::InvalidObject(format!(
                    "hypersparse list has {} vectors, outer dimension is {outer}",
                    h.len()
                )));
            }
            for w in h.windows(2) {
                if w[0] >= w[1] {
                    return Err(Error::InvalidObject(
                        "hypersparse list must be strictly sorted".into(),
                    ));
                }
            }
            if let (Some(&first), Some(&last)) = (h.first(), h.last()) {
                if first < 0 || last >= outer as i64 {
                    return Err(Error::InvalidObject(
                        "hypersparse outer index out of range".into(),
                    ));
                }
            }
        }
        if self.p.len() != nvec + 1 {
            return Err(Error::InvalidObject(format!(
                "pointer array has {} entries, expected {}",
                self.p.len(),
                nvec + 1
            )));
        }
        if self.p[0] != 0 {
            return Err(Error::InvalidObject("pointer array must start at 0".into()));
        }
        if self.p[nvec] != self.i.len() as i64 {
            return Err(Error::InvalidObject(format!(
                "pointer array ends at {}, index array has {} slots",
                self.p[nvec],
                self.i.len()
            )));
        }
        if self.x.len() != self.i.len() * self.typ.size {
            return Err(Error::InvalidObject(format!(
                "value array has {} bytes, expected {}",
                self.x.len(),
                self.i.len() * self.typ.size
            )));
        }
        let mut zombies = 0usize;
        for k in 0..nvec {
            let (s, e) = (self.p[k], self.p[k + 1]);
            if s > e {
                return Err(Error::InvalidObject(
                    "pointer array must be non-decreasing".into(),
                ));
            }
            let mut prev = -1i64;
            for pos in s as usize..e as usize {
                let raw = self.i[pos];
                if is_zombie(raw) {
                    zombies += 1;
                }
                let v = unflip_index(raw);
                if v >= inner {
                    return Err(Error::InvalidObject(format!(
                        "inner index {v} outside dimension {inner}"
                    )));
                }
                if v <= prev {
                    return Err(Error::InvalidObject(
                        "inner indices must be strictly increasing within each vector".into(),
                    ));
                }
                prev = v;
            }
        }
        if zombies != self.nzombies {
            return Err(Error::InvalidObject(format!(
                "zombie count {zombies} does not match recorded {}",
                self.nzombies
            )));
        }
        if self.pending.x.len() != self.pending.len() * self.typ.size {
            return Err(Error::InvalidObject(
                "pending value bytes do not match pending tuple count".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCode;

    #[test]
    fn new_matrix_is_empty_and_by_column() {
        let a = Matrix::new(Type::FP64, 3, 4).unwrap();
        assert_eq!(a.orientation, Orientation::ByCol);
        assert_eq!(a.outer_dim(), 4);
        assert_eq!(a.inner_dim(), 3);
        assert_eq!(a.nvals(), 0);
        assert!(a.is_finalized());
        a.check().unwrap();
    }

    #[test]
    fn set_element_queues_pending() {
        let mut a = Matrix::new(Type::FP64, 2, 2).unwrap();
        a.set_element(0, 1, 3.5f64).unwrap();
        assert_eq!(a.pending.len(), 1);
        assert_eq!(a.nvals(), 0);
        // pending is not visible through get_entry
        assert_eq!(a.get_entry::<f64>(0, 1), None);
    }

    #[test]
    fn set_element_overwrites_live_hit() {
        let mut a = Matrix::from_parts(
            Type::FP64,
            2,
            2,
            Orientation::ByCol,
            None,
            vec![0, 1, 2],
            vec![0, 1],
            [1.0f64, 2.0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            true,
        )
        .unwrap();
        a.set_element(0, 0, 9.0f64).unwrap();
        assert!(a.pending.is_empty());
        assert_eq!(a.get_entry::<f64>(0, 0), Some(9.0));
    }

    #[test]
    fn zombie_slot_is_hidden_and_revivable() {
        let mut a = Matrix::from_parts(
            Type::INT32,
            3,
            1,
            Orientation::ByCol,
            None,
            vec![0, 2],
            vec![0, 2],
            [7i32, 8].iter().flat_map(|v| v.to_le_bytes()).collect(),
            true,
        )
        .unwrap();
        a.i[1] = flip_index(a.i[1]);
        a.nzombies = 1;
        a.check().unwrap();
        assert_eq!(a.nvals(), 1);
        assert_eq!(a.get_entry::<i32>(2, 0), None);

        a.set_element(2, 0, 5i32).unwrap();
        assert_eq!(a.nzombies, 0);
        assert_eq!(a.get_entry::<i32>(2, 0), Some(5));
    }

    #[test]
    fn type_mismatch_is_domain_error() {
        let mut a = Matrix::new(Type::FP64, 2, 2).unwrap();
        assert!(matches!(
            a.set_element(0, 0, 1i32),
            Err(Error::DomainMismatch(_))
        ));
    }

    #[test]
    fn out_of_bounds_is_invalid_value() {
        let mut a = Matrix::new(Type::FP64, 2, 2).unwrap();
        assert!(matches!(
            a.set_element(5, 0, 1.0f64),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn check_rejects_unsorted_indices() {
        let r = Matrix::from_parts(
            Type::BOOL,
            3,
            1,
            Orientation::ByCol,
            None,
            vec![0, 2],
            vec![2, 0],
            vec![1, 1],
            true,
        );
        assert!(matches!(r, Err(Error::InvalidObject(_))));
    }

    #[test]
    fn hypersparse_invariants() {
        let a = Matrix::from_parts(
            Type::BOOL,
            4,
            1000,
            Orientation::ByCol,
            Some(vec![3, 700]),
            vec![0, 1, 2],
            vec![0, 2],
            vec![1, 1],
            true,
        )
        .unwrap();
        assert!(a.is_hyper());
        assert_eq!(a.nvec(), 2);
        assert_eq!(a.find_vector(700), Some(1));
        assert_eq!(a.find_vector(5), None);
        assert_eq!(a.get_entry::<bool>(2, 700), Some(true));
        assert_eq!(a.typ.code, TypeCode::Bool);
    }
}
