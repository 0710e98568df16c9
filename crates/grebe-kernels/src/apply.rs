//! Unary apply: `C<M> = accum(C, f(A))`.
//!
//! The result keeps `A`'s pattern; only the value array is recomputed, in
//! parallel chunks. Built-in operators on their own type run a
//! monomorphized chunk worker; anything else (including every typecast)
//! goes through the function-pointer path.

use grebe_core::ops::fns;
use grebe_core::types::{typed_slice, typed_slice_mut};
use grebe_core::{
    cast_factory, Context, Descriptor, Error, Matrix, Opcode, Result, TypeCode, UnaryOp,
};
use rayon::prelude::*;
use tracing::trace;

use crate::accum_mask::accum_mask;
use crate::convert::materialize;
use crate::ewise::check_output_domains;
use crate::mask::MaskCfg;
use crate::util::{alloc_u8, slice_flat};
use crate::wait::{finalized, wait};

pub fn apply(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&grebe_core::BinaryOp>,
    op: &UnaryOp,
    a: &Matrix,
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
    if !a.typ.compatible(op.xtype) {
        return Err(Error::DomainMismatch(format!(
            "input type {:?} cannot feed operator {}",
            a.typ.code, op.name
        )));
    }
    check_output_domains(c.typ, accum, op.ztype)?;

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
    let t = apply_kernel(&am, op, &ctx)?;
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

/// `T = f(A)`: same pattern, recomputed values.
pub(crate) fn apply_kernel(a: &Matrix, op: &UnaryOp, ctx: &Context) -> Result<Matrix> {
    let n = a.nstored();
    let mut out = alloc_u8(n * op.ztype.size, "apply values")?;

    if a.typ == op.xtype && op.xtype == op.ztype && a.typ.code.is_builtin() {
        if let Some(worker) = specialized_apply(op.opcode, a.typ.code) {
            trace!(op = op.name, "specialized apply worker");
            worker(a, &mut out);
            return finish(a, op, out);
        }
    }
    trace!(op = op.name, "generic apply worker");

    let cast = if a.typ == op.xtype {
        None
    } else {
        Some(cast_factory(op.xtype.code, a.typ.code).ok_or_else(|| {
            Error::DomainMismatch(format!(
                "cannot cast {:?} to {:?}",
                a.typ.code, op.xtype.code
            ))
        })?)
    };
    let asize = a.typ.size;
    let xsize = op.xtype.size;
    let zsize = op.ztype.size;
    let f = op.f;
    let nthreads = ctx.nthreads(n);
    let ranges = slice_flat(n, ctx.ntasks(n, nthreads));
    let out_addr = out.as_mut_ptr() as usize;
    ranges.into_par_iter().for_each(|(s, e)| {
        let optr = out_addr as *mut u8;
        let mut xbuf = vec![0u8; xsize];
        for k in s..e {
            unsafe {
                let src = a.x.as_ptr().add(k * asize);
                let xin = match cast {
                    None => src,
                    Some(cf) => {
                        cf(xbuf.as_mut_ptr(), src);
                        xbuf.as_ptr()
                    }
                };
                f(optr.add(k * zsize), xin);
            }
        }
    });
    finish(a, op, out)
}

fn finish(a: &Matrix, op: &UnaryOp, out: Vec<u8>) -> Result<Matrix> {
    Matrix::from_parts(
        op.ztype,
        a.nrows,
        a.ncols,
        a.orientation,
        a.h.clone(),
        a.p.clone(),
        a.i.clone(),
        out,
        false,
    )
}

type ApplyWorker = fn(&Matrix, &mut [u8]);

fn apply_typed<T, F>(a: &Matrix, out: &mut [u8])
where
    T: Copy + Send + Sync,
    F: fns::UnOp<T>,
{
    let src = unsafe { typed_slice::<T>(&a.x) };
    let dst = unsafe { typed_slice_mut::<T>(out) };
    dst.par_chunks_mut(4096)
        .zip(src.par_chunks(4096))
        .for_each(|(d, s)| {
            for (dv, &sv) in d.iter_mut().zip(s.iter()) {
                *dv = F::apply(sv);
            }
        });
}

macro_rules! apply_family {
    ($fname:ident, $op:ty, [$(($code:ident, $t:ty)),* $(,)?]) => {
        fn $fname(code: TypeCode) -> Option<ApplyWorker> {
            Some(match code {
                $(TypeCode::$code => apply_typed::<$t, $op> as ApplyWorker,)*
                _ => return None,
            })
        }
    };
}

apply_family!(identity_family, fns::Identity, [
    (Bool, bool), (Int8, i8), (UInt8, u8), (Int16, i16), (UInt16, u16),
    (Int32, i32), (UInt32, u32), (Int64, i64), (UInt64, u64), (Fp32, f32),
    (Fp64, f64),
]);
apply_family!(ainv_family, fns::Ainv, [
    (Int8, i8), (Int16, i16), (Int32, i32), (Int64, i64), (Fp32, f32), (Fp64, f64),
]);
apply_family!(abs_family, fns::Abs, [
    (Int8, i8), (Int16, i16), (Int32, i32), (Int64, i64), (Fp32, f32), (Fp64, f64),
]);
apply_family!(one_family, fns::One, [
    (Bool, bool), (Int32, i32), (Int64, i64), (Fp32, f32), (Fp64, f64),
]);

fn specialized_apply(opcode: Opcode, code: TypeCode) -> Option<ApplyWorker> {
    match opcode {
        Opcode::Identity => identity_family(code),
        Opcode::Ainv => ainv_family(code),
        Opcode::Abs => abs_family(code),
        Opcode::One => one_family(code),
        Opcode::Lnot if code == TypeCode::Bool => Some(apply_typed::<bool, fns::Lnot>),
        _ => None,
    }
}
