//! Reduction of all entries of a matrix to a scalar.
//!
//! The entry array is cut into `ntasks` contiguous slices; every task
//! folds its slice into a private accumulator seeded with the monoid
//! identity, and the partials are combined sequentially. A monoid with a
//! terminal value short-circuits: the task that reaches it publishes a
//! shared flag (release store) which the other tasks poll between blocks
//! (acquire load), never per element.
//!
//! The switch factory covers the built-in monoids over their own types;
//! everything else — user operators, and any reduction that needs a
//! typecast — runs the byte-generic worker.

use std::sync::atomic::{AtomicBool, Ordering};

use grebe_core::ops::fns;
use grebe_core::types::{scalar_bytes, scalar_from_bytes, typed_slice};
use grebe_core::{
    cast_factory, BinaryOp, CastFn, Context, Error, Matrix, Monoid, Opcode, Result, Type,
    TypeCode,
};
use rayon::prelude::*;
use tracing::{debug, trace};
use wide::f64x4;

use crate::ewise::check_output_domains;
use crate::util::slice_flat;
use crate::wait::finalized;

/// Entries folded between polls of the early-exit flag.
const REDUCE_BLOCK: usize = 1024;

/// `c = accum(c, reduce(A))`, writing the result into `c_out` as `ctype`.
///
/// An empty matrix reduces to the identity, and the accumulator is still
/// applied to it.
pub fn reduce_scalar(
    c_out: &mut [u8],
    ctype: Type,
    accum: Option<&BinaryOp>,
    monoid: &Monoid,
    a: &Matrix,
    ctx: &Context,
) -> Result<()> {
    let ztype = monoid.ztype();
    if c_out.len() != ctype.size {
        return Err(Error::InvalidValue(format!(
            "scalar buffer has {} bytes, output type has {}",
            c_out.len(),
            ctype.size
        )));
    }
    check_output_domains(ctype, accum, ztype)?;
    if !a.typ.compatible(ztype) {
        return Err(Error::DomainMismatch(format!(
            "matrix type {:?} cannot be cast into the monoid domain {:?}",
            a.typ.code,
            ztype.code
        )));
    }

    let af = finalized(a, ctx)?;
    let anz = af.nvals();
    let nthreads = ctx.nthreads(anz);
    let ntasks = ctx.ntasks(anz, nthreads);
    debug!(anz, ntasks, monoid = monoid.op.name, "reduce to scalar");

    let s = if anz == 0 {
        monoid.identity.clone()
    } else if af.typ == ztype {
        match specialized_reduce(monoid.op.opcode, ztype.code) {
            Some(worker) => {
                trace!(monoid = monoid.op.name, "specialized reduction worker");
                worker(monoid, &af, ntasks)
            }
            None => {
                trace!(monoid = monoid.op.name, "generic reduction worker");
                reduce_generic(monoid, &af, None, ntasks)
            }
        }
    } else {
        // a typecast is required, so the generic worker is unconditional
        let cast = cast_factory(ztype.code, af.typ.code).ok_or_else(|| {
            Error::DomainMismatch(format!(
                "cannot cast {:?} to {:?}",
                af.typ.code, ztype.code
            ))
        })?;
        trace!(monoid = monoid.op.name, "generic reduction worker with typecast");
        reduce_generic(monoid, &af, Some(cast), ntasks)
    };
    ctx.check()?;

    match accum {
        None => {
            // c = (ctype) s
            if ctype == ztype {
                c_out.copy_from_slice(&s);
            } else {
                let cast = cast_factory(ctype.code, ztype.code).ok_or_else(|| {
                    Error::DomainMismatch(format!(
                        "cannot cast {:?} to {:?}",
                        ztype.code, ctype.code
                    ))
                })?;
                unsafe { cast(c_out.as_mut_ptr(), s.as_ptr()) };
            }
        }
        Some(acc) => {
            // c = accum(c, s) with explicit casts on all three legs
            let mut xin = vec![0u8; acc.xtype.size];
            let mut yin = vec![0u8; acc.ytype.size];
            let mut zout = vec![0u8; acc.ztype.size];
            cast_into(&mut xin, acc.xtype, c_out, ctype)?;
            cast_into(&mut yin, acc.ytype, &s, ztype)?;
            acc.apply(&mut zout, &xin, &yin);
            let mut tmp = vec![0u8; ctype.size];
            cast_into(&mut tmp, ctype, &zout, acc.ztype)?;
            c_out.copy_from_slice(&tmp);
        }
    }
    Ok(())
}

fn cast_into(dst: &mut [u8], dtype: Type, src: &[u8], stype: Type) -> Result<()> {
    if dtype == stype {
        dst.copy_from_slice(src);
        return Ok(());
    }
    let cast = cast_factory(dtype.code, stype.code).ok_or_else(|| {
        Error::DomainMismatch(format!(
            "cannot cast {:?} to {:?}",
            stype.code, dtype.code
        ))
    })?;
    unsafe { cast(dst.as_mut_ptr(), src.as_ptr()) };
    Ok(())
}

type ReduceWorker = fn(&Monoid, &Matrix, usize) -> Vec<u8>;

macro_rules! reduce_family {
    ($fname:ident, $op:ty, [$(($code:ident, $t:ty)),* $(,)?]) => {
        fn $fname(code: TypeCode) -> Option<ReduceWorker> {
            Some(match code {
                $(TypeCode::$code => reduce_typed::<$t, $op> as ReduceWorker,)*
                _ => return None,
            })
        }
    };
}

reduce_family!(plus_family, fns::Plus, [
    (Bool, bool), (Int8, i8), (UInt8, u8), (Int16, i16), (UInt16, u16),
    (Int32, i32), (UInt32, u32), (Int64, i64), (UInt64, u64), (Fp32, f32),
]);
reduce_family!(times_family, fns::Times, [
    (Bool, bool), (Int8, i8), (UInt8, u8), (Int16, i16), (UInt16, u16),
    (Int32, i32), (UInt32, u32), (Int64, i64), (UInt64, u64), (Fp32, f32),
    (Fp64, f64),
]);
reduce_family!(min_family, fns::Min, [
    (Bool, bool), (Int8, i8), (UInt8, u8), (Int16, i16), (UInt16, u16),
    (Int32, i32), (UInt32, u32), (Int64, i64), (UInt64, u64), (Fp32, f32),
    (Fp64, f64),
]);
reduce_family!(max_family, fns::Max, [
    (Bool, bool), (Int8, i8), (UInt8, u8), (Int16, i16), (UInt16, u16),
    (Int32, i32), (UInt32, u32), (Int64, i64), (UInt64, u64), (Fp32, f32),
    (Fp64, f64),
]);

/// Look up the monomorphized worker for a built-in `(opcode, typecode)`
/// pair. `None` sends the dispatcher to the generic worker.
fn specialized_reduce(opcode: Opcode, code: TypeCode) -> Option<ReduceWorker> {
    match (opcode, code) {
        (Opcode::Plus, TypeCode::Fp64) => Some(reduce_plus_fp64),
        (Opcode::Plus, _) => plus_family(code),
        (Opcode::Times, _) => times_family(code),
        (Opcode::Min, _) => min_family(code),
        (Opcode::Max, _) => max_family(code),
        (Opcode::Lor, TypeCode::Bool) => Some(reduce_typed::<bool, fns::Lor>),
        (Opcode::Land, TypeCode::Bool) => Some(reduce_typed::<bool, fns::Land>),
        (Opcode::Lxor, TypeCode::Bool) => Some(reduce_typed::<bool, fns::Lxor>),
        _ => None,
    }
}

/// Monomorphized reduction over typed slices.
fn reduce_typed<T, F>(monoid: &Monoid, a: &Matrix, ntasks: usize) -> Vec<u8>
where
    T: Copy + PartialEq + Send + Sync,
    F: fns::BinOp<T>,
{
    let vals = unsafe { typed_slice::<T>(&a.x) };
    let id = scalar_from_bytes::<T>(&monoid.identity);
    let terminal = monoid.terminal.as_ref().map(|t| scalar_from_bytes::<T>(t));
    let ranges = slice_flat(vals.len(), ntasks);
    let early = AtomicBool::new(false);

    let partials: Vec<T> = ranges
        .into_par_iter()
        .map(|(s, e)| {
            let mut w = id;
            let mut pos = s;
            'outer: while pos < e {
                if early.load(Ordering::Acquire) {
                    break;
                }
                let block_end = (pos + REDUCE_BLOCK).min(e);
                match terminal {
                    None => {
                        for &v in &vals[pos..block_end] {
                            w = F::apply(w, v);
                        }
                    }
                    Some(t) => {
                        for &v in &vals[pos..block_end] {
                            w = F::apply(w, v);
                            if w == t {
                                early.store(true, Ordering::Release);
                                break 'outer;
                            }
                        }
                    }
                }
                pos = block_end;
            }
            w
        })
        .collect();

    let mut s = id;
    for w in partials {
        s = F::apply(s, w);
        if terminal == Some(s) {
            break;
        }
    }
    scalar_bytes(s)
}

/// PLUS over FP64: the one worker with a SIMD inner loop (4-lane
/// accumulator, remainder handled scalar). No terminal, so no polling.
fn reduce_plus_fp64(monoid: &Monoid, a: &Matrix, _ntasks: usize) -> Vec<u8> {
    let vals = unsafe { typed_slice::<f64>(&a.x) };
    let total: f64 = vals
        .par_chunks(4096)
        .map(|chunk| {
            let mut accv = f64x4::from([0.0, 0.0, 0.0, 0.0]);
            let mut i = 0usize;
            let limit4 = chunk.len() & !3;
            while i < limit4 {
                let v = unsafe {
                    let p = chunk.as_ptr().add(i).cast::<[f64; 4]>();
                    f64x4::new(core::ptr::read_unaligned(p))
                };
                accv += v;
                i += 4;
            }
            let arr = accv.to_array();
            let mut acc = arr[0] + arr[1] + arr[2] + arr[3];
            while i < chunk.len() {
                acc += chunk[i];
                i += 1;
            }
            acc
        })
        .sum();
    let id = scalar_from_bytes::<f64>(&monoid.identity);
    scalar_bytes(id + total)
}

/// Byte-generic reduction: the operator runs through a function pointer,
/// values move as `zsize`-byte blobs, the terminal compares bytewise, and
/// an optional per-element cast buffer bridges the matrix type into the
/// monoid domain.
fn reduce_generic(
    monoid: &Monoid,
    a: &Matrix,
    cast: Option<CastFn>,
    ntasks: usize,
) -> Vec<u8> {
    let zsize = monoid.ztype().size;
    let asize = a.typ.size;
    let freduce = monoid.op.f;
    let terminal = monoid.terminal.as_deref();
    let anz = a.nstored();
    let ranges = slice_flat(anz, ntasks);
    let early = AtomicBool::new(false);

    let partials: Vec<Vec<u8>> = ranges
        .into_par_iter()
        .map(|(s, e)| {
            let mut w = monoid.identity.clone();
            let mut awork = vec![0u8; zsize];
            let mut pos = s;
            'outer: while pos < e {
                if early.load(Ordering::Acquire) {
                    break;
                }
                let block_end = (pos + REDUCE_BLOCK).min(e);
                for k in pos..block_end {
                    unsafe {
                        let src = a.x.as_ptr().add(k * asize);
                        let operand = match cast {
                            None => src,
                            Some(f) => {
                                f(awork.as_mut_ptr(), src);
                                awork.as_ptr()
                            }
                        };
                        // the shim reads both inputs before writing, so
                        // w may alias the output
                        freduce(w.as_mut_ptr(), w.as_ptr(), operand);
                    }
                    if terminal == Some(w.as_slice()) {
                        early.store(true, Ordering::Release);
                        break 'outer;
                    }
                }
                pos = block_end;
            }
            w
        })
        .collect();

    let mut s = monoid.identity.clone();
    for w in partials {
        unsafe { freduce(s.as_mut_ptr(), s.as_ptr(), w.as_ptr()) };
        if terminal == Some(s.as_slice()) {
            break;
        }
    }
    s
}
