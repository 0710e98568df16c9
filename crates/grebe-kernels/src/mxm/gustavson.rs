//! Gustavson gather/scatter multiply.
//!
//! Each task owns a contiguous range of output vectors and a pooled
//! sauna. For output vector `j`, every selected source vector is scattered
//! into the dense accumulator: a slot whose mark is below the current
//! watermark is initialized with `mul(a, b)`, an occupied slot is updated
//! with `add`. Mask rejection happens before the scatter, so rejected
//! positions never touch the workspace. The touched slots are then sorted
//! and gathered into the output vector.

use grebe_core::ops::fns;
use grebe_core::types::typed_slice;
use grebe_core::{Matrix, Opcode, Result, TypeCode};
use rayon::prelude::*;
use tracing::trace;

use crate::mask::{MaskVec, MaskView};
use crate::sauna::SaunaGuard;
use crate::util::{i64_to_usize, prefix_sum, slice_vectors};

use super::{exact_semiring_types, Env};

type Worker = fn(&Matrix, &Matrix, Option<&MaskView<'_>>, &Env<'_>) -> Result<Matrix>;

macro_rules! semiring_arms {
    ($code:expr, [$(($tc:ident, $t:ty)),* $(,)?], $fm:ty, $fa:ty) => {
        match $code {
            $(TypeCode::$tc => Some(typed_worker::<$t, $fm, $fa> as Worker),)*
            _ => None,
        }
    };
}

/// Switch factory over `(add opcode, multiply opcode, type code)`. A miss
/// — or any combination that would need a typecast — runs the generic
/// worker.
fn specialized(env: &Env<'_>, source: &Matrix, combiner: &Matrix) -> Option<Worker> {
    if !exact_semiring_types(env.sr, source, combiner) {
        return None;
    }
    let code = env.ztype().code;
    match (env.sr.add.op.opcode, env.sr.mul.opcode) {
        (Opcode::Plus, Opcode::Times) => semiring_arms!(
            code,
            [(Int32, i32), (Int64, i64), (UInt64, u64), (Fp32, f32), (Fp64, f64)],
            fns::Times,
            fns::Plus
        ),
        (Opcode::Min, Opcode::Plus) => semiring_arms!(
            code,
            [(Int32, i32), (Int64, i64), (Fp32, f32), (Fp64, f64)],
            fns::Plus,
            fns::Min
        ),
        (Opcode::Max, Opcode::Plus) => semiring_arms!(
            code,
            [(Int32, i32), (Int64, i64), (Fp32, f32), (Fp64, f64)],
            fns::Plus,
            fns::Max
        ),
        (Opcode::Lor, Opcode::Land) => semiring_arms!(code, [(Bool, bool)], fns::Land, fns::Lor),
        _ => None,
    }
}

pub(super) fn dispatch(
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
    env: &Env<'_>,
) -> Result<Matrix> {
    match specialized(env, source, combiner) {
        Some(worker) => {
            trace!(semiring = env.sr.name, "specialized Gustavson worker");
            worker(source, combiner, mask, env)
        }
        None => {
            trace!(semiring = env.sr.name, "generic Gustavson worker");
            generic_worker(source, combiner, mask, env)
        }
    }
}

struct Segment {
    k0: usize,
    counts: Vec<usize>,
    ix: Vec<i64>,
    vx: Vec<u8>,
}

/// Monomorphized scatter: multiply and add inline, workspace slots typed.
fn typed_worker<T, FM, FA>(
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
    env: &Env<'_>,
) -> Result<Matrix>
where
    T: Copy + Send + Sync,
    FM: fns::BinOp<T>,
    FA: fns::BinOp<T>,
{
    let inner = source.inner_dim();
    let zsize = std::mem::size_of::<T>();
    let svals = unsafe { typed_slice::<T>(&source.x) };
    let cvals = unsafe { typed_slice::<T>(&combiner.x) };
    let flipxy = env.flipxy;

    let work = combiner.nstored().max(1);
    let nthreads = env.ctx.nthreads(work);
    let ranges = slice_vectors(combiner, env.ctx.ntasks(work, nthreads));

    let segments: Vec<Segment> = ranges
        .into_par_iter()
        .map(|(k0, k1)| {
            let mut sauna = SaunaGuard::acquire(inner, zsize);
            let mut seg = Segment {
                k0,
                counts: vec![0; k1 - k0],
                ix: Vec::new(),
                vx: Vec::new(),
            };
            if env.ctx.cancelled() {
                return seg;
            }
            let mut live: Vec<i64> = Vec::new();
            for k in k0..k1 {
                let j = combiner.vector_outer(k);
                let mv = mask.map(|m| m.vector(j));
                if mv.as_ref().is_some_and(MaskVec::rejects_all) {
                    continue;
                }
                let water = sauna.next_vector();
                let (w, marks) = unsafe { sauna.parts_typed_mut::<T>() };
                live.clear();
                let (cs, ce) = combiner.vector_range(k);
                for pos in cs..ce {
                    let Some(sk) = source.find_vector(combiner.i[pos]) else {
                        continue;
                    };
                    let scalar = cvals[pos];
                    let (ss, se) = source.vector_range(sk);
                    for sp in ss..se {
                        let i = source.i[sp];
                        if mv.as_ref().is_some_and(|m| !m.admit(i)) {
                            continue;
                        }
                        let prod = if flipxy {
                            FM::apply(scalar, svals[sp])
                        } else {
                            FM::apply(svals[sp], scalar)
                        };
                        let iu = i64_to_usize(i);
                        if marks[iu] == water {
                            w[iu] = FA::apply(w[iu], prod);
                        } else {
                            marks[iu] = water;
                            w[iu] = prod;
                            live.push(i);
                        }
                    }
                }
                live.sort_unstable();
                seg.counts[k - k0] = live.len();
                for &i in &live {
                    seg.ix.push(i);
                    let v = w[i64_to_usize(i)];
                    seg.vx.extend_from_slice(unsafe {
                        std::slice::from_raw_parts(std::ptr::from_ref(&v).cast::<u8>(), zsize)
                    });
                }
            }
            seg
        })
        .collect();

    env.ctx.check()?;
    assemble_segments(combiner, segments, env)
}

/// Byte-generic scatter: function-pointer multiply/add, memcpy-shaped
/// value moves.
fn generic_worker(
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
    env: &Env<'_>,
) -> Result<Matrix> {
    let inner = source.inner_dim();
    let zsize = env.ztype().size;
    let ssize = source.typ.size;
    let csize = combiner.typ.size;
    let mul = env.sr.mul.f;
    let add = env.sr.add.op.f;
    let flipxy = env.flipxy;

    let work = combiner.nstored().max(1);
    let nthreads = env.ctx.nthreads(work);
    let ranges = slice_vectors(combiner, env.ctx.ntasks(work, nthreads));

    let segments: Vec<Segment> = ranges
        .into_par_iter()
        .map(|(k0, k1)| {
            let mut sauna = SaunaGuard::acquire(inner, zsize);
            let mut seg = Segment {
                k0,
                counts: vec![0; k1 - k0],
                ix: Vec::new(),
                vx: Vec::new(),
            };
            if env.ctx.cancelled() {
                return seg;
            }
            let mut live: Vec<i64> = Vec::new();
            let mut prod = vec![0u8; zsize];
            for k in k0..k1 {
                let j = combiner.vector_outer(k);
                let mv = mask.map(|m| m.vector(j));
                if mv.as_ref().is_some_and(MaskVec::rejects_all) {
                    continue;
                }
                let water = sauna.next_vector();
                let (w, marks) = sauna.parts_bytes_mut();
                live.clear();
                let (cs, ce) = combiner.vector_range(k);
                for pos in cs..ce {
                    let Some(sk) = source.find_vector(combiner.i[pos]) else {
                        continue;
                    };
                    let scalar = unsafe { combiner.x.as_ptr().add(pos * csize) };
                    let (ss, se) = source.vector_range(sk);
                    for sp in ss..se {
                        let i = source.i[sp];
                        if mv.as_ref().is_some_and(|m| !m.admit(i)) {
                            continue;
                        }
                        let sval = unsafe { source.x.as_ptr().add(sp * ssize) };
                        unsafe {
                            if flipxy {
                                mul(prod.as_mut_ptr(), scalar, sval);
                            } else {
                                mul(prod.as_mut_ptr(), sval, scalar);
                            }
                        }
                        let iu = i64_to_usize(i);
                        let slot = unsafe { w.as_mut_ptr().add(iu * zsize) };
                        if marks[iu] == water {
                            // the shim reads both inputs before writing, so
                            // the slot may alias the output
                            unsafe { add(slot, slot, prod.as_ptr()) };
                        } else {
                            marks[iu] = water;
                            unsafe {
                                std::ptr::copy_nonoverlapping(prod.as_ptr(), slot, zsize);
                            }
                            live.push(i);
                        }
                    }
                }
                live.sort_unstable();
                seg.counts[k - k0] = live.len();
                let (w, _) = sauna.parts_bytes_mut();
                for &i in &live {
                    seg.ix.push(i);
                    let iu = i64_to_usize(i);
                    seg.vx.extend_from_slice(&w[iu * zsize..(iu + 1) * zsize]);
                }
            }
            seg
        })
        .collect();

    env.ctx.check()?;
    assemble_segments(combiner, segments, env)
}

/// Segments arrive in vector order, so concatenation in task order is the
/// final layout; only the pointer array needs the per-vector counts.
fn assemble_segments(
    combiner: &Matrix,
    segments: Vec<Segment>,
    env: &Env<'_>,
) -> Result<Matrix> {
    let outer = combiner.outer_dim();
    let zsize = env.ztype().size;
    let mut counts = vec![0usize; outer];
    for seg in &segments {
        for (off, &c) in seg.counts.iter().enumerate() {
            counts[i64_to_usize(combiner.vector_outer(seg.k0 + off))] = c;
        }
    }
    let p = prefix_sum(&counts);
    let nnz = i64_to_usize(p[outer]);
    let mut out_i = crate::util::alloc_i64(nnz, "multiply indices")?;
    let mut out_x = crate::util::alloc_u8(nnz * zsize, "multiply values")?;
    let mut dst = 0usize;
    for seg in segments {
        out_i[dst..dst + seg.ix.len()].copy_from_slice(&seg.ix);
        out_x[dst * zsize..dst * zsize + seg.vx.len()].copy_from_slice(&seg.vx);
        dst += seg.ix.len();
    }
    let (nrows, ncols) = env.tdims;
    let mut t = Matrix::from_parts(
        env.ztype(),
        nrows,
        ncols,
        env.orientation,
        None,
        p,
        out_i,
        out_x,
        false,
    )?;
    crate::convert::conform_hyper(&mut t);
    Ok(t)
}
