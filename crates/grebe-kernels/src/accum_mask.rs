//! Final masked accumulation: `C<M> = accum(C, T)`.
//!
//! The orchestrators compute a fresh `T` aligned with `C`'s orientation
//! and hand it here; this pass decides presence position by position and
//! only then swaps the rebuilt arrays into `C`, so a failed or cancelled
//! operation never leaves `C` half-written.
//!
//! Presence rules per position, with `admit` from the (optionally
//! complemented, optionally structural) mask:
//!
//! - admitted, in both: `accum(c, t)` if an accumulator is given, else `t`;
//! - admitted, only `T`: `t`;
//! - admitted, only `C`: kept with an accumulator, deleted without one;
//! - rejected: `C`'s entry survives unless `replace` clears it.

use grebe_core::{
    cast_factory, BinaryOp, CastFn, Context, Error, Matrix, Result, Type,
};
use rayon::prelude::*;
use tracing::trace;

use crate::convert::conform_hyper;
use crate::ewise::vec_slices;
use crate::mask::{MaskCfg, MaskView};
use crate::util::{alloc_i64, alloc_u8, i64_to_usize, prefix_sum, usize_to_i64};

fn opt_cast(to: Type, from: Type) -> Result<Option<CastFn>> {
    if to == from {
        return Ok(None);
    }
    cast_factory(to.code, from.code).map(Some).ok_or_else(|| {
        Error::DomainMismatch(format!(
            "cannot cast {:?} to {:?}",
            from.code, to.code
        ))
    })
}

pub(crate) fn accum_mask(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    cfg: MaskCfg,
    accum: Option<&BinaryOp>,
    t: Matrix,
    replace: bool,
    ctx: &Context,
) -> Result<()> {
    debug_assert!(c.is_finalized());
    debug_assert!(t.is_finalized());
    debug_assert_eq!(c.orientation, t.orientation);
    debug_assert_eq!((c.nrows, c.ncols), (t.nrows, t.ncols));

    // an empty mask resolves the whole operation up front
    let mut cfg = cfg;
    let mask = match mask {
        Some(m) if m.nvals() == 0 => {
            if cfg.complement {
                // the complement of an empty mask admits everything
                cfg.complement = false;
                None
            } else {
                if replace {
                    c.clear();
                }
                return Ok(());
            }
        }
        other => other,
    };

    // no mask matrix with the complement flag set: the implicit all-true
    // mask is inverted, so nothing is admitted
    if mask.is_none() && cfg.complement {
        if replace {
            c.clear();
        }
        return Ok(());
    }

    // no mask, no accumulator: C becomes T
    if mask.is_none() && accum.is_none() {
        return transplant(c, t, ctx);
    }

    let mview = match mask {
        Some(m) => Some(MaskView::new(m, cfg)?),
        None => None,
    };

    let cast_tc = opt_cast(c.typ, t.typ)?;
    let accum_casts = match accum {
        Some(acc) => Some((
            opt_cast(acc.xtype, c.typ)?,
            opt_cast(acc.ytype, t.typ)?,
            opt_cast(c.typ, acc.ztype)?,
        )),
        None => None,
    };

    let outer = c.outer_dim();
    let csize = c.typ.size;
    let tsize = t.typ.size;
    trace!(
        accum = accum.map(|a| a.name),
        masked = mask.is_some(),
        replace,
        "masked accumulation"
    );

    // phase 1: surviving entries per vector
    let mut counts = vec![0usize; outer];
    counts.par_iter_mut().enumerate().for_each(|(j, cnt)| {
        let (ci, _) = vec_slices(c, j);
        let (ti, _) = vec_slices(&t, j);
        let mv = mview.as_ref().map(|m| m.vector(usize_to_i64(j)));
        let mut pc = 0usize;
        let mut pt = 0usize;
        let mut n = 0usize;
        while pc < ci.len() || pt < ti.len() {
            let ic = if pc < ci.len() { ci[pc] } else { i64::MAX };
            let it = if pt < ti.len() { ti[pt] } else { i64::MAX };
            let i = ic.min(it);
            let in_c = ic == i;
            let in_t = it == i;
            let admit = mv.as_ref().map_or(!cfg.complement, |m| m.admit(i));
            let keep = if admit {
                in_t || (accum.is_some() && in_c)
            } else {
                in_c && !replace
            };
            if keep {
                n += 1;
            }
            if in_c {
                pc += 1;
            }
            if in_t {
                pt += 1;
            }
        }
        *cnt = n;
    });
    let p = prefix_sum(&counts);
    let nnz = i64_to_usize(p[outer]);
    let mut new_i = alloc_i64(nnz, "masked accumulation indices")?;
    let mut new_x = alloc_u8(nnz * csize, "masked accumulation values")?;
    ctx.check()?;

    // phase 2: write survivors
    let ni_addr = new_i.as_mut_ptr() as usize;
    let nx_addr = new_x.as_mut_ptr() as usize;
    (0..outer).into_par_iter().for_each(|j| {
        let (ci, cx) = vec_slices(c, j);
        let (ti, tx) = vec_slices(&t, j);
        let mv = mview.as_ref().map(|m| m.vector(usize_to_i64(j)));
        let ni = ni_addr as *mut i64;
        let nx = nx_addr as *mut u8;
        let mut dst = i64_to_usize(p[j]);
        let mut pc = 0usize;
        let mut pt = 0usize;
        let mut xbuf = vec![0u8; accum.map_or(0, |a| a.xtype.size)];
        let mut ybuf = vec![0u8; accum.map_or(0, |a| a.ytype.size)];
        let mut zbuf = vec![0u8; accum.map_or(0, |a| a.ztype.size)];
        while pc < ci.len() || pt < ti.len() {
            let ic = if pc < ci.len() { ci[pc] } else { i64::MAX };
            let it = if pt < ti.len() { ti[pt] } else { i64::MAX };
            let i = ic.min(it);
            let in_c = ic == i;
            let in_t = it == i;
            let admit = mv.as_ref().map_or(!cfg.complement, |m| m.admit(i));
            unsafe {
                if admit {
                    if in_c && in_t && accum.is_some() {
                        let acc = accum.expect("checked");
                        let (cast_cx, cast_ty, cast_zc) =
                            accum_casts.as_ref().expect("accum casts");
                        let cptr = cx.as_ptr().add(pc * csize);
                        let tptr = tx.as_ptr().add(pt * tsize);
                        let xin = match cast_cx {
                            None => cptr,
                            Some(f) => {
                                f(xbuf.as_mut_ptr(), cptr);
                                xbuf.as_ptr()
                            }
                        };
                        let yin = match cast_ty {
                            None => tptr,
                            Some(f) => {
                                f(ybuf.as_mut_ptr(), tptr);
                                ybuf.as_ptr()
                            }
                        };
                        (acc.f)(zbuf.as_mut_ptr(), xin, yin);
                        std::ptr::write(ni.add(dst), i);
                        match cast_zc {
                            None => std::ptr::copy_nonoverlapping(
                                zbuf.as_ptr(),
                                nx.add(dst * csize),
                                csize,
                            ),
                            Some(f) => f(nx.add(dst * csize), zbuf.as_ptr()),
                        }
                        dst += 1;
                    } else if in_t {
                        let tptr = tx.as_ptr().add(pt * tsize);
                        std::ptr::write(ni.add(dst), i);
                        match cast_tc {
                            None => std::ptr::copy_nonoverlapping(
                                tptr,
                                nx.add(dst * csize),
                                csize,
                            ),
                            Some(f) => f(nx.add(dst * csize), tptr),
                        }
                        dst += 1;
                    } else if in_c && accum.is_some() {
                        std::ptr::write(ni.add(dst), i);
                        std::ptr::copy_nonoverlapping(
                            cx.as_ptr().add(pc * csize),
                            nx.add(dst * csize),
                            csize,
                        );
                        dst += 1;
                    }
                } else if in_c && !replace {
                    std::ptr::write(ni.add(dst), i);
                    std::ptr::copy_nonoverlapping(
                        cx.as_ptr().add(pc * csize),
                        nx.add(dst * csize),
                        csize,
                    );
                    dst += 1;
                }
            }
            if in_c {
                pc += 1;
            }
            if in_t {
                pt += 1;
            }
        }
        debug_assert_eq!(dst, i64_to_usize(p[j + 1]));
    });

    c.h = None;
    c.p = p;
    c.i = new_i;
    c.x = new_x;
    conform_hyper(c);
    Ok(())
}

/// `C = T` with a typecast when the value types differ.
fn transplant(c: &mut Matrix, t: Matrix, ctx: &Context) -> Result<()> {
    if c.typ == t.typ {
        c.h = t.h;
        c.p = t.p;
        c.i = t.i;
        c.x = t.x;
        return Ok(());
    }
    let cast = cast_factory(c.typ.code, t.typ.code).ok_or_else(|| {
        Error::DomainMismatch(format!(
            "cannot cast {:?} to {:?}",
            t.typ.code, c.typ.code
        ))
    })?;
    let n = t.nstored();
    let csize = c.typ.size;
    let tsize = t.typ.size;
    let mut new_x = alloc_u8(n * csize, "output typecast values")?;
    ctx.check()?;
    let nx_addr = new_x.as_mut_ptr() as usize;
    let tx = &t.x;
    (0..n).into_par_iter().for_each(|pos| {
        let nx = nx_addr as *mut u8;
        unsafe { cast(nx.add(pos * csize), tx.as_ptr().add(pos * tsize)) };
    });
    c.h = t.h;
    c.p = t.p;
    c.i = t.i;
    c.x = new_x;
    Ok(())
}
