//! Entry selection: `C<M> = accum(C, select(A))`.
//!
//! A two-phase filter over the entries of `A`. Phase 1 counts survivors
//! per vector, phase 2 writes them. Positional selectors test the entry's
//! coordinates against a diagonal offset; value selectors compare the
//! entry against a thunk scalar through a monomorphized predicate.

use grebe_core::ops::fns;
use grebe_core::types::scalar_from_bytes;
use grebe_core::{
    BinaryOp, Context, Descriptor, Error, Matrix, Orientation, Result, TypeCode,
};
use rayon::prelude::*;
use tracing::debug;

use crate::accum_mask::accum_mask;
use crate::convert::{conform_hyper, materialize};
use crate::ewise::check_output_domains;
use crate::mask::MaskCfg;
use crate::util::{alloc_i64, alloc_u8, i64_to_usize, prefix_sum, usize_to_i64};
use crate::wait::{finalized, wait};

/// Built-in selection operators. The thunk scalar is the diagonal offset
/// for the positional group and the comparison operand for the value
/// group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector {
    Triu,
    Tril,
    Diag,
    Offdiag,
    Nonzero,
    EqZero,
    GtThunk,
    GeThunk,
    LtThunk,
    LeThunk,
    EqThunk,
    NeThunk,
}

impl Selector {
    const fn positional(self) -> bool {
        matches!(
            self,
            Selector::Triu | Selector::Tril | Selector::Diag | Selector::Offdiag
        )
    }
}

#[allow(clippy::too_many_arguments)]
pub fn select(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&BinaryOp>,
    selector: Selector,
    a: &Matrix,
    thunk: Option<&[u8]>,
    desc: &Descriptor,
    ctx: &Context,
) -> Result<()> {
    let ctx = desc
        .nthreads
        .map_or_else(|| ctx.clone(), |n| ctx.with_nthreads_max(n));

    let (anr, anc) = if desc.transpose_inp0 {
        (a.ncols, a.nrows)
    } else {
        (a.nrows, a.ncols)
    };
    if c.nrows != anr || c.ncols != anc {
        return Err(Error::DimensionMismatch(format!(
            "output is {}-by-{}, input is {anr}-by-{anc}",
            c.nrows, c.ncols
        )));
    }
    if let Some(m) = mask {
        if m.nrows != c.nrows || m.ncols != c.ncols {
            return Err(Error::DimensionMismatch("mask shape differs from output".into()));
        }
    }
    check_output_domains(c.typ, accum, a.typ)?;
    let test = SelTest::new(selector, a, thunk)?;

    wait(c, &ctx)?;
    let cfg = MaskCfg { structural: desc.mask_structure, complement: desc.mask_complement };
    if let Some(m) = mask {
        if m.nvals() == 0 && m.pending.is_empty() && !cfg.complement {
            if desc.replace {
                c.clear();
            }
            return Ok(());
        }
    }

    let af = finalized(a, &ctx)?;
    let am = materialize(&af, desc.transpose_inp0, c.orientation, &ctx)?;
    let t = select_kernel(&am, &test, &ctx)?;
    ctx.check()?;

    let mf = match mask {
        Some(m) => Some(finalized(m, &ctx)?),
        None => None,
    };
    let mm = match &mf {
        Some(m) => Some(materialize(m, false, c.orientation, &ctx)?),
        None => None,
    };
    accum_mask(c, mm.as_deref(), cfg, accum, t, desc.replace, &ctx)
}

/// The resolved per-entry test.
enum SelTest {
    /// `pred(col - row, k)` on the diagonal offset.
    Position(fn(i64, i64) -> bool, i64),
    /// `pred(value, thunk)` through a typed shim.
    Value(ValuePred, Vec<u8>),
}

impl SelTest {
    fn new(selector: Selector, a: &Matrix, thunk: Option<&[u8]>) -> Result<Self> {
        if selector.positional() {
            let k = match thunk {
                None => 0,
                Some(bytes) => {
                    if bytes.len() != 8 {
                        return Err(Error::InvalidValue(
                            "positional selector thunk must be an 8-byte offset".into(),
                        ));
                    }
                    scalar_from_bytes::<i64>(bytes)
                }
            };
            let pred: fn(i64, i64) -> bool = match selector {
                Selector::Triu => |d, k| d >= k,
                Selector::Tril => |d, k| d <= k,
                Selector::Diag => |d, k| d == k,
                Selector::Offdiag => |d, k| d != k,
                _ => unreachable!("positional() said so"),
            };
            return Ok(SelTest::Position(pred, k));
        }

        if !a.typ.code.is_builtin() {
            return Err(Error::DomainMismatch(
                "value selectors require a built-in matrix type".into(),
            ));
        }
        let operand = match selector {
            Selector::Nonzero | Selector::EqZero => vec![0u8; a.typ.size],
            _ => {
                let bytes = thunk.ok_or_else(|| {
                    Error::NullPointer("value selector requires a thunk scalar".into())
                })?;
                if bytes.len() != a.typ.size {
                    return Err(Error::InvalidValue(format!(
                        "thunk has {} bytes, matrix type has {}",
                        bytes.len(),
                        a.typ.size
                    )));
                }
                bytes.to_vec()
            }
        };
        let shim = value_pred(selector, a.typ.code);
        Ok(SelTest::Value(shim, operand))
    }

    #[inline]
    fn keep(&self, row: i64, col: i64, value: *const u8) -> bool {
        match self {
            SelTest::Position(pred, k) => pred(col - row, *k),
            SelTest::Value(shim, operand) => unsafe { shim(value, operand.as_ptr()) },
        }
    }
}

unsafe fn pred_value<T: Copy, F: fns::PredOp<T>>(x: *const u8, t: *const u8) -> bool {
    let a = unsafe { x.cast::<T>().read_unaligned() };
    let b = unsafe { t.cast::<T>().read_unaligned() };
    F::apply(a, b)
}

type ValuePred = unsafe fn(*const u8, *const u8) -> bool;

macro_rules! pred_over_types {
    ($f:ty, $code:expr) => {
        match $code {
            TypeCode::Bool => pred_value::<bool, $f> as ValuePred,
            TypeCode::Int8 => pred_value::<i8, $f> as ValuePred,
            TypeCode::UInt8 => pred_value::<u8, $f> as ValuePred,
            TypeCode::Int16 => pred_value::<i16, $f> as ValuePred,
            TypeCode::UInt16 => pred_value::<u16, $f> as ValuePred,
            TypeCode::Int32 => pred_value::<i32, $f> as ValuePred,
            TypeCode::UInt32 => pred_value::<u32, $f> as ValuePred,
            TypeCode::Int64 => pred_value::<i64, $f> as ValuePred,
            TypeCode::UInt64 => pred_value::<u64, $f> as ValuePred,
            TypeCode::Fp32 => pred_value::<f32, $f> as ValuePred,
            TypeCode::Fp64 => pred_value::<f64, $f> as ValuePred,
            TypeCode::User => unreachable!("checked builtin"),
        }
    };
}

fn value_pred(selector: Selector, code: TypeCode) -> ValuePred {
    match selector {
        Selector::Nonzero | Selector::NeThunk => pred_over_types!(fns::Ne, code),
        Selector::EqZero | Selector::EqThunk => pred_over_types!(fns::Eq, code),
        Selector::GtThunk => pred_over_types!(fns::Gt, code),
        Selector::GeThunk => pred_over_types!(fns::Ge, code),
        Selector::LtThunk => pred_over_types!(fns::Lt, code),
        Selector::LeThunk => pred_over_types!(fns::Le, code),
        _ => unreachable!("positional handled separately"),
    }
}

/// `T = select(A)`: two-phase count and fill over the stored vectors.
fn select_kernel(a: &Matrix, test: &SelTest, ctx: &Context) -> Result<Matrix> {
    let outer = a.outer_dim();
    let nvec = a.nvec();
    let size = a.typ.size;

    // (row, col) from (outer, inner) depends on orientation
    let by_col = a.orientation == Orientation::ByCol;

    // phase 1: survivors per stored vector, spread onto the full outer range
    let mut counts = vec![0usize; outer];
    let counts_addr = counts.as_mut_ptr() as usize;
    (0..nvec).into_par_iter().for_each(|k| {
        let j = a.vector_outer(k);
        let (s, e) = a.vector_range(k);
        let mut n = 0usize;
        for pos in s..e {
            let i = a.i[pos];
            let (row, col) = if by_col { (i, j) } else { (j, i) };
            if test.keep(row, col, unsafe { a.x.as_ptr().add(pos * size) }) {
                n += 1;
            }
        }
        unsafe {
            *(counts_addr as *mut usize).add(i64_to_usize(j)) = n;
        }
    });
    let p = prefix_sum(&counts);
    let nnz = i64_to_usize(p[outer]);
    let mut out_i = alloc_i64(nnz, "select indices")?;
    let mut out_x = alloc_u8(nnz * size, "select values")?;
    ctx.check()?;

    // phase 2: write survivors
    let oi_addr = out_i.as_mut_ptr() as usize;
    let ox_addr = out_x.as_mut_ptr() as usize;
    (0..nvec).into_par_iter().for_each(|k| {
        let j = a.vector_outer(k);
        let (s, e) = a.vector_range(k);
        let mut dst = i64_to_usize(p[i64_to_usize(j)]);
        let oi = oi_addr as *mut i64;
        let ox = ox_addr as *mut u8;
        for pos in s..e {
            let i = a.i[pos];
            let (row, col) = if by_col { (i, j) } else { (j, i) };
            unsafe {
                let v = a.x.as_ptr().add(pos * size);
                if test.keep(row, col, v) {
                    std::ptr::write(oi.add(dst), i);
                    std::ptr::copy_nonoverlapping(v, ox.add(dst * size), size);
                    dst += 1;
                }
            }
        }
    });

    let mut t = Matrix::from_parts(
        a.typ,
        a.nrows,
        a.ncols,
        a.orientation,
        None,
        p,
        out_i,
        out_x,
        false,
    )?;
    conform_hyper(&mut t);
    debug!(kept = t.nvals(), of = a.nvals(), "selection complete");
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_predicates() {
        // triu keeps col - row >= k
        let t = SelTest::Position(|d, k| d >= k, 0);
        assert!(t.keep(0, 2, std::ptr::null()));
        assert!(t.keep(1, 1, std::ptr::null()));
        assert!(!t.keep(2, 0, std::ptr::null()));
    }

    #[test]
    fn value_selector_rejects_user_types() {
        let a = Matrix::new(grebe_core::Type::user(16), 2, 2).unwrap();
        assert!(matches!(
            SelTest::new(Selector::Nonzero, &a, None),
            Err(Error::DomainMismatch(_))
        ));
    }

    #[test]
    fn thunk_length_is_validated() {
        let a = Matrix::new(grebe_core::Type::FP64, 2, 2).unwrap();
        assert!(matches!(
            SelTest::new(Selector::GtThunk, &a, Some(&[0u8; 3])),
            Err(Error::InvalidValue(_))
        ));
        assert!(matches!(
            SelTest::new(Selector::GtThunk, &a, None),
            Err(Error::NullPointer(_))
        ));
    }
}
