//! Transpose: `C<M> = accum(C, A')`.
//!
//! The logical transpose itself is a dimension swap; the real work is the
//! relayout into `C`'s storage orientation, done by the two-phase bucket
//! scatter in `convert`. A descriptor transpose on the input cancels the
//! operation's own transpose, which turns this into a masked copy.

use grebe_core::{BinaryOp, Context, Descriptor, Error, Matrix, Result};

use crate::accum_mask::accum_mask;
use crate::convert::materialize;
use crate::mask::MaskCfg;
use crate::wait::{finalized, wait};

pub fn transpose(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&BinaryOp>,
    a: &Matrix,
    desc: &Descriptor,
    ctx: &Context,
) -> Result<()> {
    let ctx = desc
        .nthreads
        .map_or_else(|| ctx.clone(), |n| ctx.with_nthreads_max(n));

    // INP0 transpose cancels the transpose: C<M> = accum(C, A)
    let do_transpose = !desc.transpose_inp0;
    let (anr, anc) = if do_transpose {
        (a.ncols, a.nrows)
    } else {
        (a.nrows, a.ncols)
    };
    if c.nrows != anr || c.ncols != anc {
        return Err(Error::DimensionMismatch(format!(
            "output is {}-by-{}, transposed input is {anr}-by-{anc}",
            c.nrows, c.ncols
        )));
    }
    if let Some(m) = mask {
        if m.nrows != c.nrows || m.ncols != c.ncols {
            return Err(Error::DimensionMismatch("mask shape differs from output".into()));
        }
    }
    crate::ewise::check_output_domains(c.typ, accum, a.typ)?;

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
    let t = materialize(&af, do_transpose, c.orientation, &ctx)?.into_owned();
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
