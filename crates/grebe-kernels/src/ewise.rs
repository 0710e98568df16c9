//! Element-wise set-union (`ewise_add`) and set-intersection
//! (`ewise_mult`).
//!
//! Both walk each pair of vectors with two cursors. Union emits the
//! smaller index (copying the value from the side that has it) and applies
//! the operator on ties; intersection advances past unmatched indices and
//! emits only ties. The structural count pass is shared; the fill pass is
//! dispatched through a switch factory — a monomorphized worker when the
//! operator is built-in and the types line up exactly, the byte-generic
//! worker otherwise (and always when any typecast is involved).

use grebe_core::ops::fns;
use grebe_core::{
    cast_factory, BinaryFn, BinaryOp, CastFn, Context, Descriptor, Error, Matrix, Opcode, Result,
    Type, TypeCode,
};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::accum_mask::accum_mask;
use crate::convert::{conform_hyper, materialize};
use crate::mask::{MaskCfg, MaskVec, MaskView};
use crate::util::{alloc_i64, alloc_u8, i64_to_usize, prefix_sum, usize_to_i64};
use crate::wait::{finalized, wait};

/// `C<M> = accum(C, A ⊕ B)` over the union of patterns.
pub fn ewise_add(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&BinaryOp>,
    op: &BinaryOp,
    a: &Matrix,
    b: &Matrix,
    desc: &Descriptor,
    ctx: &Context,
) -> Result<()> {
    ewise(c, mask, accum, op, a, b, desc, ctx, true)
}

/// `C<M> = accum(C, A ⊗ B)` over the intersection of patterns.
pub fn ewise_mult(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&BinaryOp>,
    op: &BinaryOp,
    a: &Matrix,
    b: &Matrix,
    desc: &Descriptor,
    ctx: &Context,
) -> Result<()> {
    ewise(c, mask, accum, op, a, b, desc, ctx, false)
}

#[allow(clippy::too_many_arguments)]
fn ewise(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&BinaryOp>,
    op: &BinaryOp,
    a: &Matrix,
    b: &Matrix,
    desc: &Descriptor,
    ctx: &Context,
    union_mode: bool,
) -> Result<()> {
    let ctx = desc
        .nthreads
        .map_or_else(|| ctx.clone(), |n| ctx.with_nthreads_max(n));

    // entry checks: dimensions after the descriptor transposes
    let (anr, anc) = eff_dims(a, desc.transpose_inp0);
    let (bnr, bnc) = eff_dims(b, desc.transpose_inp1);
    if anr != bnr || anc != bnc || c.nrows != anr || c.ncols != anc {
        return Err(Error::DimensionMismatch(format!(
            "output is {}-by-{}, first input is {anr}-by-{anc}, second input is {bnr}-by-{bnc}",
            c.nrows, c.ncols
        )));
    }
    if let Some(m) = mask {
        if m.nrows != c.nrows || m.ncols != c.ncols {
            return Err(Error::DimensionMismatch(format!(
                "mask is {}-by-{}, output is {}-by-{}",
                m.nrows, m.ncols, c.nrows, c.ncols
            )));
        }
    }

    // entry checks: domains
    if !a.typ.compatible(op.xtype) || !b.typ.compatible(op.ytype) {
        return Err(Error::DomainMismatch(format!(
            "inputs [{:?}, {:?}] cannot feed operator {}",
            a.typ.code, b.typ.code, op.name
        )));
    }
    check_output_domains(c.typ, accum, op.ztype)?;
    if union_mode && (!a.typ.compatible(c.typ) || !b.typ.compatible(c.typ)) {
        return Err(Error::DomainMismatch(
            "set-union copies each input into the output, so both must cast to it".into(),
        ));
    }

    wait(c, &ctx)?;
    let cfg = MaskCfg { structural: desc.mask_structure, complement: desc.mask_complement };

    // quick return: an empty non-complemented mask admits nothing
    if let Some(m) = mask {
        if m.nvals() == 0 && m.pending.is_empty() && !cfg.complement {
            if desc.replace {
                c.clear();
            }
            return Ok(());
        }
    }

    let af = finalized(a, &ctx)?;
    let bf = finalized(b, &ctx)?;
    let am = materialize(&af, desc.transpose_inp0, c.orientation, &ctx)?;
    let bm = materialize(&bf, desc.transpose_inp1, c.orientation, &ctx)?;

    let mf = match mask {
        Some(m) => Some(finalized(m, &ctx)?),
        None => None,
    };
    let mm = match &mf {
        Some(m) => Some(materialize(m, false, c.orientation, &ctx)?),
        None => None,
    };
    let mview = match &mm {
        Some(m) => Some(MaskView::new(m, cfg)?),
        None => None,
    };

    let t = ewise_kernel(&am, &bm, mview.as_ref(), op, union_mode, &ctx)?;
    ctx.check()?;
    accum_mask(c, mm.as_deref(), cfg, accum, t, desc.replace, &ctx)
}

fn eff_dims(m: &Matrix, transpose: bool) -> (usize, usize) {
    if transpose {
        (m.ncols, m.nrows)
    } else {
        (m.nrows, m.ncols)
    }
}

/// Shared entry check: the output type must absorb either the accumulated
/// or the freshly computed values.
pub(crate) fn check_output_domains(
    ctype: Type,
    accum: Option<&BinaryOp>,
    ttype: Type,
) -> Result<()> {
    match accum {
        None => {
            if !ttype.compatible(ctype) {
                return Err(Error::DomainMismatch(format!(
                    "result type {:?} cannot be cast to output type {:?}",
                    ttype.code, ctype.code
                )));
            }
        }
        Some(acc) => {
            if !ctype.compatible(acc.xtype)
                || !ttype.compatible(acc.ytype)
                || !acc.ztype.compatible(ctype)
            {
                return Err(Error::DomainMismatch(format!(
                    "accumulator {} cannot combine output type {:?} with result type {:?}",
                    acc.name, ctype.code, ttype.code
                )));
            }
        }
    }
    Ok(())
}

/// `T = A ⊕ B` (or `A ⊗ B`), all three in the same orientation, mask
/// already aligned. `T` gets the operator's output type.
pub(crate) fn ewise_kernel(
    a: &Matrix,
    b: &Matrix,
    mask: Option<&MaskView<'_>>,
    op: &BinaryOp,
    union_mode: bool,
    ctx: &Context,
) -> Result<Matrix> {
    debug_assert_eq!(a.orientation, b.orientation);
    let outer = a.outer_dim();
    let ztype = op.ztype;
    let fill = fill_for(op, a.typ, b.typ);
    let fctx = FillCtx::new(op, a.typ, b.typ);
    trace!(
        op = op.name,
        union = union_mode,
        generic = std::ptr::fn_addr_eq(fill, fill_generic as FillFn),
        "element-wise kernel"
    );

    // phase 1: merged size per vector
    let mut counts = vec![0usize; outer];
    counts.par_iter_mut().enumerate().for_each(|(j, cnt)| {
        let (ai, _) = vec_slices(a, j);
        let (bi, _) = vec_slices(b, j);
        let mv = mask.map(|m| m.vector(usize_to_i64(j)));
        *cnt = merge_count(ai, bi, mv.as_ref(), union_mode);
    });
    let p = prefix_sum(&counts);
    let nnz = i64_to_usize(p[outer]);
    let mut out_i = alloc_i64(nnz, "element-wise indices")?;
    let mut out_x = alloc_u8(nnz * ztype.size, "element-wise values")?;
    ctx.check()?;

    // phase 2: fill
    let oi_addr = out_i.as_mut_ptr() as usize;
    let ox_addr = out_x.as_mut_ptr() as usize;
    (0..outer).into_par_iter().for_each(|j| {
        let (ai, ax) = vec_slices(a, j);
        let (bi, bx) = vec_slices(b, j);
        let mv = mask.map(|m| m.vector(usize_to_i64(j)));
        let dst = i64_to_usize(p[j]);
        unsafe {
            let oi = (oi_addr as *mut i64).add(dst);
            let ox = (ox_addr as *mut u8).add(dst * ztype.size);
            let written = fill(ai, ax, bi, bx, mv.as_ref(), union_mode, &fctx, oi, ox);
            debug_assert_eq!(written, i64_to_usize(p[j + 1]) - dst);
        }
    });

    let mut t = Matrix::from_parts(
        ztype,
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
    debug!(nvals = t.nvals(), "element-wise result assembled");
    Ok(t)
}

pub(crate) fn vec_slices(m: &Matrix, j: usize) -> (&[i64], &[u8]) {
    match m.find_vector(usize_to_i64(j)) {
        Some(k) => {
            let (s, e) = m.vector_range(k);
            (&m.i[s..e], &m.x[s * m.typ.size..e * m.typ.size])
        }
        None => (&[], &[]),
    }
}

/// Structural two-cursor walk shared by both modes.
fn merge_count(
    ai: &[i64],
    bi: &[i64],
    mask: Option<&MaskVec<'_>>,
    union_mode: bool,
) -> usize {
    if let Some(m) = mask {
        if m.rejects_all() {
            return 0;
        }
    }
    let admit = |i: i64| mask.is_none_or(|m| m.admit(i));
    let mut pa = 0usize;
    let mut pb = 0usize;
    let mut cnt = 0usize;
    while pa < ai.len() && pb < bi.len() {
        let (ia, ib) = (ai[pa], bi[pb]);
        if ia < ib {
            if union_mode && admit(ia) {
                cnt += 1;
            }
            pa += 1;
        } else if ib < ia {
            if union_mode && admit(ib) {
                cnt += 1;
            }
            pb += 1;
        } else {
            if admit(ia) {
                cnt += 1;
            }
            pa += 1;
            pb += 1;
        }
    }
    if union_mode {
        cnt += ai[pa..].iter().filter(|&&i| admit(i)).count();
        cnt += bi[pb..].iter().filter(|&&i| admit(i)).count();
    }
    cnt
}

/// Everything the byte-generic fill needs; the typed fills only read the
/// mode and mask.
pub(crate) struct FillCtx {
    op: BinaryFn,
    asize: usize,
    bsize: usize,
    xsize: usize,
    ysize: usize,
    zsize: usize,
    cast_ax: Option<CastFn>,
    cast_by: Option<CastFn>,
    cast_az: Option<CastFn>,
    cast_bz: Option<CastFn>,
}

impl FillCtx {
    fn new(op: &BinaryOp, atype: Type, btype: Type) -> Self {
        let opt_cast = |to: Type, from: Type| -> Option<CastFn> {
            if to == from {
                None
            } else {
                cast_factory(to.code, from.code)
            }
        };
        Self {
            op: op.f,
            asize: atype.size,
            bsize: btype.size,
            xsize: op.xtype.size,
            ysize: op.ytype.size,
            zsize: op.ztype.size,
            cast_ax: opt_cast(op.xtype, atype),
            cast_by: opt_cast(op.ytype, btype),
            cast_az: opt_cast(op.ztype, atype),
            cast_bz: opt_cast(op.ztype, btype),
        }
    }
}

type FillFn = unsafe fn(
    ai: &[i64],
    ax: &[u8],
    bi: &[i64],
    bx: &[u8],
    mask: Option<&MaskVec<'_>>,
    union_mode: bool,
    fctx: &FillCtx,
    out_i: *mut i64,
    out_x: *mut u8,
) -> usize;

/// Switch factory: monomorphized fill when the operator is built-in and no
/// typecast is needed anywhere, generic fill otherwise.
fn fill_for(op: &BinaryOp, atype: Type, btype: Type) -> FillFn {
    let exact = atype == op.xtype
        && btype == op.ytype
        && op.xtype == op.ytype
        && op.ytype == op.ztype
        && atype == btype
        && atype.code.is_builtin();
    if !exact {
        return fill_generic;
    }
    macro_rules! arm {
        ($t:ty, $f:ty) => {
            fill_typed::<$t, $f> as FillFn
        };
    }
    match (op.opcode, atype.code) {
        (Opcode::Plus, TypeCode::Int32) => arm!(i32, fns::Plus),
        (Opcode::Plus, TypeCode::Int64) => arm!(i64, fns::Plus),
        (Opcode::Plus, TypeCode::Fp32) => arm!(f32, fns::Plus),
        (Opcode::Plus, TypeCode::Fp64) => arm!(f64, fns::Plus),
        (Opcode::Minus, TypeCode::Int32) => arm!(i32, fns::Minus),
        (Opcode::Minus, TypeCode::Int64) => arm!(i64, fns::Minus),
        (Opcode::Minus, TypeCode::Fp32) => arm!(f32, fns::Minus),
        (Opcode::Minus, TypeCode::Fp64) => arm!(f64, fns::Minus),
        (Opcode::Times, TypeCode::Int32) => arm!(i32, fns::Times),
        (Opcode::Times, TypeCode::Int64) => arm!(i64, fns::Times),
        (Opcode::Times, TypeCode::Fp32) => arm!(f32, fns::Times),
        (Opcode::Times, TypeCode::Fp64) => arm!(f64, fns::Times),
        (Opcode::Div, TypeCode::Fp32) => arm!(f32, fns::Div),
        (Opcode::Div, TypeCode::Fp64) => arm!(f64, fns::Div),
        (Opcode::Min, TypeCode::Int32) => arm!(i32, fns::Min),
        (Opcode::Min, TypeCode::Int64) => arm!(i64, fns::Min),
        (Opcode::Min, TypeCode::Fp32) => arm!(f32, fns::Min),
        (Opcode::Min, TypeCode::Fp64) => arm!(f64, fns::Min),
        (Opcode::Max, TypeCode::Int32) => arm!(i32, fns::Max),
        (Opcode::Max, TypeCode::Int64) => arm!(i64, fns::Max),
        (Opcode::Max, TypeCode::Fp32) => arm!(f32, fns::Max),
        (Opcode::Max, TypeCode::Fp64) => arm!(f64, fns::Max),
        (Opcode::First, TypeCode::Int64) => arm!(i64, fns::First),
        (Opcode::First, TypeCode::Fp64) => arm!(f64, fns::First),
        (Opcode::Second, TypeCode::Int64) => arm!(i64, fns::Second),
        (Opcode::Second, TypeCode::Fp64) => arm!(f64, fns::Second),
        (Opcode::Lor, TypeCode::Bool) => arm!(bool, fns::Lor),
        (Opcode::Land, TypeCode::Bool) => arm!(bool, fns::Land),
        (Opcode::Lxor, TypeCode::Bool) => arm!(bool, fns::Lxor),
        _ => fill_generic,
    }
}

/// Monomorphized fill: no casts, operator inlined.
unsafe fn fill_typed<T: Copy, F: fns::BinOp<T>>(
    ai: &[i64],
    ax: &[u8],
    bi: &[i64],
    bx: &[u8],
    mask: Option<&MaskVec<'_>>,
    union_mode: bool,
    _fctx: &FillCtx,
    out_i: *mut i64,
    out_x: *mut u8,
) -> usize {
    if let Some(m) = mask {
        if m.rejects_all() {
            return 0;
        }
    }
    let admit = |i: i64| mask.is_none_or(|m| m.admit(i));
    let axt = unsafe { grebe_core::types::typed_slice::<T>(ax) };
    let bxt = unsafe { grebe_core::types::typed_slice::<T>(bx) };
    let out = out_x.cast::<T>();
    let mut pa = 0usize;
    let mut pb = 0usize;
    let mut dst = 0usize;
    let mut emit = |i: i64, v: T, dst: &mut usize| unsafe {
        std::ptr::write(out_i.add(*dst), i);
        out.add(*dst).write_unaligned(v);
        *dst += 1;
    };
    while pa < ai.len() && pb < bi.len() {
        let (ia, ib) = (ai[pa], bi[pb]);
        if ia < ib {
            if union_mode && admit(ia) {
                emit(ia, axt[pa], &mut dst);
            }
            pa += 1;
        } else if ib < ia {
            if union_mode && admit(ib) {
                emit(ib, bxt[pb], &mut dst);
            }
            pb += 1;
        } else {
            if admit(ia) {
                emit(ia, F::apply(axt[pa], bxt[pb]), &mut dst);
            }
            pa += 1;
            pb += 1;
        }
    }
    if union_mode {
        while pa < ai.len() {
            if admit(ai[pa]) {
                emit(ai[pa], axt[pa], &mut dst);
            }
            pa += 1;
        }
        while pb < bi.len() {
            if admit(bi[pb]) {
                emit(bi[pb], bxt[pb], &mut dst);
            }
            pb += 1;
        }
    }
    dst
}

/// Byte-generic fill: value moves are memcpy-shaped, the operator and all
/// casts run through function pointers.
unsafe fn fill_generic(
    ai: &[i64],
    ax: &[u8],
    bi: &[i64],
    bx: &[u8],
    mask: Option<&MaskVec<'_>>,
    union_mode: bool,
    fctx: &FillCtx,
    out_i: *mut i64,
    out_x: *mut u8,
) -> usize {
    if let Some(m) = mask {
        if m.rejects_all() {
            return 0;
        }
    }
    let admit = |i: i64| mask.is_none_or(|m| m.admit(i));
    let mut xbuf = vec![0u8; fctx.xsize];
    let mut ybuf = vec![0u8; fctx.ysize];
    let mut zbuf = vec![0u8; fctx.zsize];
    let mut pa = 0usize;
    let mut pb = 0usize;
    let mut dst = 0usize;

    let copy_side = |src: &[u8], pos: usize, srcsize: usize, cast: Option<CastFn>,
                     dst: usize, out_x: *mut u8, zsize: usize| unsafe {
        let from = src.as_ptr().add(pos * srcsize);
        let to = out_x.add(dst * zsize);
        match cast {
            None => std::ptr::copy_nonoverlapping(from, to, zsize),
            Some(f) => f(to, from),
        }
    };

    while pa < ai.len() && pb < bi.len() {
        let (ia, ib) = (ai[pa], bi[pb]);
        if ia < ib {
            if union_mode && admit(ia) {
                unsafe { std::ptr::write(out_i.add(dst), ia) };
                copy_side(ax, pa, fctx.asize, fctx.cast_az, dst, out_x, fctx.zsize);
                dst += 1;
            }
            pa += 1;
        } else if ib < ia {
            if union_mode && admit(ib) {
                unsafe { std::ptr::write(out_i.add(dst), ib) };
                copy_side(bx, pb, fctx.bsize, fctx.cast_bz, dst, out_x, fctx.zsize);
                dst += 1;
            }
            pb += 1;
        } else {
            if admit(ia) {
                unsafe {
                    let xin = match fctx.cast_ax {
                        None => ax.as_ptr().add(pa * fctx.asize),
                        Some(f) => {
                            f(xbuf.as_mut_ptr(), ax.as_ptr().add(pa * fctx.asize));
                            xbuf.as_ptr()
                        }
                    };
                    let yin = match fctx.cast_by {
                        None => bx.as_ptr().add(pb * fctx.bsize),
                        Some(f) => {
                            f(ybuf.as_mut_ptr(), bx.as_ptr().add(pb * fctx.bsize));
                            ybuf.as_ptr()
                        }
                    };
                    (fctx.op)(zbuf.as_mut_ptr(), xin, yin);
                    std::ptr::write(out_i.add(dst), ia);
                    std::ptr::copy_nonoverlapping(
                        zbuf.as_ptr(),
                        out_x.add(dst * fctx.zsize),
                        fctx.zsize,
                    );
                }
                dst += 1;
            }
            pa += 1;
            pb += 1;
        }
    }
    if union_mode {
        while pa < ai.len() {
            if admit(ai[pa]) {
                unsafe { std::ptr::write(out_i.add(dst), ai[pa]) };
                copy_side(ax, pa, fctx.asize, fctx.cast_az, dst, out_x, fctx.zsize);
                dst += 1;
            }
            pa += 1;
        }
        while pb < bi.len() {
            if admit(bi[pb]) {
                unsafe { std::ptr::write(out_i.add(dst), bi[pb]) };
                copy_side(bx, pb, fctx.bsize, fctx.cast_bz, dst, out_x, fctx.zsize);
                dst += 1;
            }
            pb += 1;
        }
    }
    dst
}
