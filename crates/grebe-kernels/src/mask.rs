//! Mask evaluation.
//!
//! A mask restricts which output positions an operation may write. The
//! view is built once per operation; each output vector then locates its
//! mask vector (hypersparse lookup) and probes positions by binary search,
//! or by direct indexing when the vector is dense.

use grebe_core::{cast_factory, CastFn, Error, Matrix, Result, TypeCode};

use crate::util::i64_to_usize;

/// How the descriptor says to read the mask.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MaskCfg {
    pub structural: bool,
    pub complement: bool,
}

/// A mask matrix prepared for probing. The matrix must be finalized and
/// stored in the same orientation as the output being masked.
pub(crate) struct MaskView<'a> {
    m: &'a Matrix,
    cfg: MaskCfg,
    cast_bool: Option<CastFn>,
}

impl<'a> MaskView<'a> {
    pub(crate) fn new(m: &'a Matrix, cfg: MaskCfg) -> Result<Self> {
        debug_assert!(m.is_finalized());
        let cast_bool = if cfg.structural || m.typ.code == TypeCode::Bool {
            None
        } else {
            Some(cast_factory(TypeCode::Bool, m.typ.code).ok_or_else(|| {
                Error::DomainMismatch(format!(
                    "mask of type {:?} cannot be read as boolean",
                    m.typ.code
                ))
            })?)
        };
        Ok(Self { m, cfg, cast_bool })
    }

    #[inline]
    pub(crate) fn cfg(&self) -> MaskCfg {
        self.cfg
    }

    /// Entry count of the whole mask (for quick-return and planner checks).
    #[inline]
    pub(crate) fn nvals(&self) -> usize {
        self.m.nvals()
    }

    /// The mask restricted to output vector `j`. A missing vector yields an
    /// empty probe (which admits everything when complemented).
    pub(crate) fn vector(&self, j: i64) -> MaskVec<'_> {
        let (ix, x) = match self.m.find_vector(j) {
            Some(k) => {
                let (s, e) = self.m.vector_range(k);
                (
                    &self.m.i[s..e],
                    &self.m.x[s * self.m.typ.size..e * self.m.typ.size],
                )
            }
            None => (&[][..], &[][..]),
        };
        MaskVec {
            ix,
            x,
            msize: self.m.typ.size,
            dense: ix.len() == self.m.inner_dim(),
            structural: self.cfg.structural,
            complement: self.cfg.complement,
            cast_bool: self.cast_bool,
        }
    }
}

/// One mask vector ready for per-position probes.
pub(crate) struct MaskVec<'a> {
    ix: &'a [i64],
    x: &'a [u8],
    msize: usize,
    dense: bool,
    structural: bool,
    complement: bool,
    cast_bool: Option<CastFn>,
}

impl MaskVec<'_> {
    /// True when no position in this vector can be admitted, so the whole
    /// output vector may be skipped.
    #[inline]
    pub(crate) fn rejects_all(&self) -> bool {
        self.ix.is_empty() && !self.complement
    }

    fn value_true(&self, pos: usize) -> bool {
        if self.structural {
            return true;
        }
        match self.cast_bool {
            None => self.x[pos * self.msize] != 0,
            Some(f) => {
                let mut b = false;
                unsafe {
                    f(
                        std::ptr::from_mut(&mut b).cast(),
                        self.x.as_ptr().add(pos * self.msize),
                    );
                }
                b
            }
        }
    }

    /// Stored indices of this mask vector (for mask-driven iteration).
    #[inline]
    pub(crate) fn indices(&self) -> &[i64] {
        self.ix
    }

    /// Whether the stored entry at `pos` reads as true.
    #[inline]
    pub(crate) fn value_true_at(&self, pos: usize) -> bool {
        self.value_true(pos)
    }

    #[inline]
    pub(crate) fn complemented(&self) -> bool {
        self.complement
    }

    /// May position `inner` be written?
    pub(crate) fn admit(&self, inner: i64) -> bool {
        let present_true = if self.dense {
            self.value_true(i64_to_usize(inner))
        } else {
            match self.ix.binary_search(&inner) {
                Ok(pos) => self.value_true(pos),
                Err(_) => false,
            }
        };
        present_true ^ self.complement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grebe_core::{Orientation, Type};

    fn bool_mask() -> Matrix {
        // column 0: rows {1 (true), 3 (false)}
        Matrix::from_parts(
            Type::BOOL,
            4,
            2,
            Orientation::ByCol,
            None,
            vec![0, 2, 2],
            vec![1, 3],
            vec![1, 0],
            true,
        )
        .unwrap()
    }

    #[test]
    fn value_mask_admits_true_entries_only() {
        let m = bool_mask();
        let view = MaskView::new(&m, MaskCfg::default()).unwrap();
        let v = view.vector(0);
        assert!(v.admit(1));
        assert!(!v.admit(3)); // present but false
        assert!(!v.admit(0)); // absent
        assert!(view.vector(1).rejects_all());
    }

    #[test]
    fn structural_mask_ignores_values() {
        let m = bool_mask();
        let view = MaskView::new(&m, MaskCfg { structural: true, complement: false }).unwrap();
        let v = view.vector(0);
        assert!(v.admit(1));
        assert!(v.admit(3));
        assert!(!v.admit(0));
    }

    #[test]
    fn complement_inverts_admission() {
        let m = bool_mask();
        let view = MaskView::new(&m, MaskCfg { structural: false, complement: true }).unwrap();
        let v = view.vector(0);
        assert!(!v.admit(1));
        assert!(v.admit(3));
        assert!(v.admit(0));
        // a missing vector admits everything under complement
        let v1 = view.vector(1);
        assert!(!v1.rejects_all());
        assert!(v1.admit(2));
    }
}
