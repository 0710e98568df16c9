//! Dot-product multiply.
//!
//! For every admitted output position `(i, j)`, intersect source vector
//! `i` with combiner vector `j` by two-pointer walk and fold the products
//! with the add monoid. Candidates come from the mask when it is present
//! and not complemented (which is what makes this kernel win on very
//! sparse masks); otherwise every stored source vector is a candidate.
//!
//! Scheduling is dynamic: output vectors vary wildly in dot length, so
//! the per-vector tasks are left to the work-stealing scheduler rather
//! than pre-sliced.

use grebe_core::ops::fns;
use grebe_core::types::{scalar_from_bytes, typed_slice};
use grebe_core::{Matrix, Opcode, Result, TypeCode};
use rayon::prelude::*;
use tracing::trace;

use crate::mask::MaskView;

use super::{assemble_per_vector, dot_candidates, exact_semiring_types, Env};

type Worker = fn(&Matrix, &Matrix, Option<&MaskView<'_>>, &Env<'_>) -> Result<Matrix>;

macro_rules! semiring_arms {
    ($code:expr, [$(($tc:ident, $t:ty)),* $(,)?], $fm:ty, $fa:ty) => {
        match $code {
            $(TypeCode::$tc => Some(typed_worker::<$t, $fm, $fa> as Worker),)*
            _ => None,
        }
    };
}

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
            trace!(semiring = env.sr.name, "specialized dot worker");
            worker(source, combiner, mask, env)
        }
        None => {
            trace!(semiring = env.sr.name, "generic dot worker");
            generic_worker(source, combiner, mask, env)
        }
    }
}

/// Monomorphized dot products with inline terminal short-circuit.
fn typed_worker<T, FM, FA>(
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
    env: &Env<'_>,
) -> Result<Matrix>
where
    T: Copy + PartialEq + Send + Sync,
    FM: fns::BinOp<T>,
    FA: fns::BinOp<T>,
{
    let svals = unsafe { typed_slice::<T>(&source.x) };
    let cvals = unsafe { typed_slice::<T>(&combiner.x) };
    let terminal = env.sr.add.terminal.as_ref().map(|t| scalar_from_bytes::<T>(t));
    let flipxy = env.flipxy;
    let zsize = std::mem::size_of::<T>();

    let items: Vec<(Vec<i64>, Vec<u8>)> = (0..combiner.nvec())
        .into_par_iter()
        .map(|k| {
            let mut ix = Vec::new();
            let mut vx = Vec::new();
            if env.ctx.cancelled() {
                return (ix, vx);
            }
            let (cs, ce) = combiner.vector_range(k);
            if cs == ce {
                return (ix, vx);
            }
            let j = combiner.vector_outer(k);
            let mv = mask.map(|m| m.vector(j));
            for (i, sk) in dot_candidates(source, mv.as_ref()) {
                let (ss, se) = source.vector_range(sk);
                let mut pa = ss;
                let mut pb = cs;
                let mut cij = None::<T>;
                while pa < se && pb < ce {
                    let (ia, ib) = (source.i[pa], combiner.i[pb]);
                    if ia < ib {
                        pa += 1;
                    } else if ib < ia {
                        pb += 1;
                    } else {
                        let prod = if flipxy {
                            FM::apply(cvals[pb], svals[pa])
                        } else {
                            FM::apply(svals[pa], cvals[pb])
                        };
                        cij = Some(match cij {
                            None => prod,
                            Some(acc) => FA::apply(acc, prod),
                        });
                        if terminal.is_some() && cij == terminal {
                            break;
                        }
                        pa += 1;
                        pb += 1;
                    }
                }
                if let Some(v) = cij {
                    ix.push(i);
                    vx.extend_from_slice(unsafe {
                        std::slice::from_raw_parts(std::ptr::from_ref(&v).cast::<u8>(), zsize)
                    });
                }
            }
            (ix, vx)
        })
        .collect();

    env.ctx.check()?;
    assemble_per_vector(combiner, items, env)
}

/// Byte-generic dot products; the terminal compares bytewise.
fn generic_worker(
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
    env: &Env<'_>,
) -> Result<Matrix> {
    let ssize = source.typ.size;
    let csize = combiner.typ.size;
    let zsize = env.ztype().size;
    let mul = env.sr.mul.f;
    let add = env.sr.add.op.f;
    let terminal = env.sr.add.terminal.as_deref();
    let flipxy = env.flipxy;

    let items: Vec<(Vec<i64>, Vec<u8>)> = (0..combiner.nvec())
        .into_par_iter()
        .map(|k| {
            let mut ix = Vec::new();
            let mut vx = Vec::new();
            if env.ctx.cancelled() {
                return (ix, vx);
            }
            let (cs, ce) = combiner.vector_range(k);
            if cs == ce {
                return (ix, vx);
            }
            let j = combiner.vector_outer(k);
            let mv = mask.map(|m| m.vector(j));
            let mut cij = vec![0u8; zsize];
            let mut prod = vec![0u8; zsize];
            for (i, sk) in dot_candidates(source, mv.as_ref()) {
                let (ss, se) = source.vector_range(sk);
                let mut pa = ss;
                let mut pb = cs;
                let mut seen = false;
                while pa < se && pb < ce {
                    let (ia, ib) = (source.i[pa], combiner.i[pb]);
                    if ia < ib {
                        pa += 1;
                    } else if ib < ia {
                        pb += 1;
                    } else {
                        unsafe {
                            let sval = source.x.as_ptr().add(pa * ssize);
                            let cval = combiner.x.as_ptr().add(pb * csize);
                            if seen {
                                if flipxy {
                                    mul(prod.as_mut_ptr(), cval, sval);
                                } else {
                                    mul(prod.as_mut_ptr(), sval, cval);
                                }
                                add(cij.as_mut_ptr(), cij.as_ptr(), prod.as_ptr());
                            } else {
                                if flipxy {
                                    mul(cij.as_mut_ptr(), cval, sval);
                                } else {
                                    mul(cij.as_mut_ptr(), sval, cval);
                                }
                                seen = true;
                            }
                        }
                        if terminal == Some(cij.as_slice()) {
                            break;
                        }
                        pa += 1;
                        pb += 1;
                    }
                }
                if seen {
                    ix.push(i);
                    vx.extend_from_slice(&cij);
                }
            }
            (ix, vx)
        })
        .collect();

    env.ctx.check()?;
    assemble_per_vector(combiner, items, env)
}
