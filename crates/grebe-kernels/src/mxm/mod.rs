//! Masked sparse matrix multiply `C<M> = accum(C, A*B)` over a semiring.
//!
//! The orchestrator validates, finalizes, and conforms all operands into
//! the output's vector space, then hands off to one of three kernels
//! chosen by the planner (or pinned by the descriptor):
//!
//! - Gustavson: gather/scatter through a pooled dense workspace;
//! - dot product: index intersection per admitted output position;
//! - heap: k-way merge, for hypersparse operands.
//!
//! All three produce strictly sorted vectors and feed the same masked
//! accumulation epilogue, which is the only writer of `C`.
//!
//! Vector-space framing: when `C` is stored by column, output vector `j`
//! combines the vectors of `A` selected by `B(:,j)` and the multiply runs
//! as `mul(a, b)`. When `C` is stored by row, the roles swap — output
//! vector `j` (row `j`) combines the vectors of `B` selected by `A(j,:)`
//! — and the multiply arguments flip to preserve `mul(a, b)`.

mod dot;
mod gustavson;
mod heap;

use grebe_core::{
    AxbMethod, BinaryOp, Context, Descriptor, Error, Matrix, Orientation, Result, Semiring, Type,
};
use tracing::debug;

use crate::accum_mask::accum_mask;
use crate::convert::{conform_hyper, materialize};
use crate::ewise::check_output_domains;
use crate::mask::{MaskCfg, MaskView};
use crate::util::{i64_to_usize, prefix_sum};
use crate::wait::{finalized, wait};

#[allow(clippy::too_many_arguments)]
pub fn mxm(
    c: &mut Matrix,
    mask: Option<&Matrix>,
    accum: Option<&BinaryOp>,
    semiring: &Semiring,
    a: &Matrix,
    b: &Matrix,
    desc: &Descriptor,
    ctx: &Context,
) -> Result<()> {
    let ctx = desc
        .nthreads
        .map_or_else(|| ctx.clone(), |n| ctx.with_nthreads_max(n));

    // entry checks: dimensions after the descriptor transposes
    let (anr, anc) = if desc.transpose_inp0 {
        (a.ncols, a.nrows)
    } else {
        (a.nrows, a.ncols)
    };
    let (bnr, bnc) = if desc.transpose_inp1 {
        (b.ncols, b.nrows)
    } else {
        (b.nrows, b.ncols)
    };
    if anc != bnr || c.nrows != anr || c.ncols != bnc {
        return Err(Error::DimensionMismatch(format!(
            "cannot multiply {anr}-by-{anc} with {bnr}-by-{bnc} into {}-by-{}",
            c.nrows, c.ncols
        )));
    }
    if let Some(m) = mask {
        if m.nrows != c.nrows || m.ncols != c.ncols {
            return Err(Error::DimensionMismatch("mask shape differs from output".into()));
        }
    }

    // entry checks: domains
    if !a.typ.compatible(semiring.mul.xtype) || !b.typ.compatible(semiring.mul.ytype) {
        return Err(Error::DomainMismatch(format!(
            "inputs [{:?}, {:?}] cannot feed semiring {}",
            a.typ.code, b.typ.code, semiring.name
        )));
    }
    check_output_domains(c.typ, accum, semiring.ztype())?;

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
    let bf = finalized(b, &ctx)?;

    // conform both operands into C's vector space; see the module docs for
    // why the roles (and the multiply arguments) swap for by-row outputs
    let (source, combiner, flipxy) = match c.orientation {
        Orientation::ByCol => (
            materialize(&af, desc.transpose_inp0, Orientation::ByCol, &ctx)?,
            materialize(&bf, desc.transpose_inp1, Orientation::ByCol, &ctx)?,
            false,
        ),
        Orientation::ByRow => (
            materialize(&bf, desc.transpose_inp1, Orientation::ByRow, &ctx)?,
            materialize(&af, desc.transpose_inp0, Orientation::ByRow, &ctx)?,
            true,
        ),
    };

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

    let env = Env {
        sr: semiring,
        flipxy,
        tdims: (c.nrows, c.ncols),
        orientation: c.orientation,
        ctx: &ctx,
    };

    let method = plan(desc.axb, &source, &combiner, mview.as_ref());
    debug!(
        method = ?method,
        semiring = semiring.name,
        flipxy,
        "matrix multiply"
    );
    let t = match method {
        AxbMethod::Gustavson => gustavson::dispatch(&source, &combiner, mview.as_ref(), &env)?,
        AxbMethod::Dot => {
            // dot intersects whole vectors, so the gathered operand must be
            // re-stored with its vectors along the output's inner dimension
            let source_dot =
                materialize(&source, false, c.orientation.flipped(), &ctx)?;
            dot::dispatch(&source_dot, &combiner, mview.as_ref(), &env)?
        }
        AxbMethod::Heap => heap::compute(&source, &combiner, mview.as_ref(), &env)?,
        AxbMethod::Auto => unreachable!("plan() resolves Auto"),
    };
    ctx.check()?;
    accum_mask(c, mm.as_deref(), cfg, accum, t, desc.replace, &ctx)
}

/// Everything a multiply kernel needs besides the operand matrices.
pub(super) struct Env<'a> {
    pub sr: &'a Semiring,
    pub flipxy: bool,
    pub tdims: (usize, usize),
    pub orientation: Orientation,
    pub ctx: &'a Context,
}

impl Env<'_> {
    pub(super) fn ztype(&self) -> Type {
        self.sr.ztype()
    }
}

/// Pick a kernel from operand shapes when the descriptor says `Auto`.
fn plan(
    requested: AxbMethod,
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
) -> AxbMethod {
    if requested != AxbMethod::Auto {
        return requested;
    }
    if source.is_hyper() && combiner.is_hyper() {
        return AxbMethod::Heap;
    }
    // dot pays off when the mask admits few positions, or when the gathered
    // operand has few long vectors (structural iteration beats scatter)
    let mask_sparse = mask.is_some_and(|m| {
        !m.cfg().complement && m.nvals() <= combiner.outer_dim().max(1)
    });
    let tall_thin = source.nvec().max(1) * 64 <= source.inner_dim();
    if mask_sparse || tall_thin {
        return AxbMethod::Dot;
    }
    AxbMethod::Gustavson
}

/// Stitch per-vector outputs (in stored-vector order) into compressed
/// parts covering the full outer dimension.
pub(super) fn assemble_per_vector(
    combiner: &Matrix,
    items: Vec<(Vec<i64>, Vec<u8>)>,
    env: &Env<'_>,
) -> Result<Matrix> {
    let outer = combiner.outer_dim();
    let zsize = env.ztype().size;
    let mut counts = vec![0usize; outer];
    for (k, (ix, _)) in items.iter().enumerate() {
        counts[i64_to_usize(combiner.vector_outer(k))] = ix.len();
    }
    let p = prefix_sum(&counts);
    let nnz = i64_to_usize(p[outer]);
    let mut out_i = crate::util::alloc_i64(nnz, "multiply indices")?;
    let mut out_x = crate::util::alloc_u8(nnz * zsize, "multiply values")?;
    let mut dst = 0usize;
    for (ix, vx) in items {
        debug_assert_eq!(vx.len(), ix.len() * zsize);
        out_i[dst..dst + ix.len()].copy_from_slice(&ix);
        out_x[dst * zsize..dst * zsize + vx.len()].copy_from_slice(&vx);
        dst += ix.len();
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
    conform_hyper(&mut t);
    Ok(t)
}

/// Candidate output positions for one dot-product vector: either the
/// admitted mask entries or every stored source vector.
pub(super) fn dot_candidates(
    source: &Matrix,
    mask: Option<&crate::mask::MaskVec<'_>>,
) -> Vec<(i64, usize)> {
    match mask {
        Some(mv) if !mv.complemented() => {
            // mask-driven: only admitted positions, still in sorted order
            let mut out = Vec::with_capacity(mv.indices().len());
            for (pos, &i) in mv.indices().iter().enumerate() {
                if !mv.value_true_at(pos) {
                    continue;
                }
                if let Some(sk) = source.find_vector(i) {
                    out.push((i, sk));
                }
            }
            out
        }
        _ => {
            let mut out = Vec::with_capacity(source.nvec());
            for sk in 0..source.nvec() {
                let i = source.vector_outer(sk);
                if mask.is_some_and(|mv| !mv.admit(i)) {
                    continue;
                }
                out.push((i, sk));
            }
            out
        }
    }
}

/// The exact-match test shared by the multiply switch factories: the
/// specialized workers exist only when no operand or output needs a cast.
pub(super) fn exact_semiring_types(sr: &Semiring, source: &Matrix, combiner: &Matrix) -> bool {
    let t = sr.ztype();
    source.typ == t
        && combiner.typ == t
        && sr.mul.xtype == t
        && sr.mul.ytype == t
        && sr.mul.ztype == t
        && t.code.is_builtin()
}
