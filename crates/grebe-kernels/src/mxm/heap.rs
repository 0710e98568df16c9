//! Heap-merge multiply for hypersparse operands.
//!
//! Per output vector, the heads of the selected source vectors go into a
//! min-heap keyed by inner index; popping equal heads folds their
//! products, emitting the output vector already sorted without any dense
//! workspace. Hypersparse inputs are the target shape, so the merge is
//! structure-bound and runs on the byte-generic path only; the dispatcher
//! never asks for a monomorphized variant here.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use grebe_core::{Matrix, Result};
use rayon::prelude::*;
use tracing::trace;

use crate::mask::MaskView;

use super::{assemble_per_vector, Env};

struct Cursor {
    pos: usize,
    end: usize,
    /// Slot offset of the combiner entry that selected this source vector.
    scalar_pos: usize,
}

pub(super) fn compute(
    source: &Matrix,
    combiner: &Matrix,
    mask: Option<&MaskView<'_>>,
    env: &Env<'_>,
) -> Result<Matrix> {
    trace!(semiring = env.sr.name, "heap-merge worker");
    let ssize = source.typ.size;
    let csize = combiner.typ.size;
    let zsize = env.ztype().size;
    let mul = env.sr.mul.f;
    let add = env.sr.add.op.f;
    let flipxy = env.flipxy;

    let items: Vec<(Vec<i64>, Vec<u8>)> = (0..combiner.nvec())
        .into_par_iter()
        .map(|k| {
            let mut ix = Vec::new();
            let mut vx = Vec::new();
            if env.ctx.cancelled() {
                return (ix, vx);
            }
            let j = combiner.vector_outer(k);
            let mv = mask.map(|m| m.vector(j));
            if mv.as_ref().is_some_and(crate::mask::MaskVec::rejects_all) {
                return (ix, vx);
            }

            // one cursor per selected source vector
            let (cs, ce) = combiner.vector_range(k);
            let mut cursors: Vec<Cursor> = Vec::new();
            let mut heap: BinaryHeap<Reverse<(i64, usize)>> = BinaryHeap::new();
            for pos in cs..ce {
                let Some(sk) = source.find_vector(combiner.i[pos]) else {
                    continue;
                };
                let (ss, se) = source.vector_range(sk);
                if ss == se {
                    continue;
                }
                let slot = cursors.len();
                cursors.push(Cursor { pos: ss, end: se, scalar_pos: pos });
                heap.push(Reverse((source.i[ss], slot)));
            }

            let mut cij = vec![0u8; zsize];
            let mut prod = vec![0u8; zsize];
            while let Some(Reverse((i, slot))) = heap.pop() {
                // fold every head equal to i, starting with this one
                let mut seen = false;
                let mut advance = |slot: usize,
                                   cursors: &mut Vec<Cursor>,
                                   heap: &mut BinaryHeap<Reverse<(i64, usize)>>| {
                    let cur = &mut cursors[slot];
                    cur.pos += 1;
                    if cur.pos < cur.end {
                        heap.push(Reverse((source.i[cur.pos], slot)));
                    }
                };
                let mut fold = |slot: usize, seen: &mut bool, cursors: &Vec<Cursor>| {
                    let cur = &cursors[slot];
                    unsafe {
                        let sval = source.x.as_ptr().add(cur.pos * ssize);
                        let cval = combiner.x.as_ptr().add(cur.scalar_pos * csize);
                        let dst = if *seen { prod.as_mut_ptr() } else { cij.as_mut_ptr() };
                        if flipxy {
                            mul(dst, cval, sval);
                        } else {
                            mul(dst, sval, cval);
                        }
                        if *seen {
                            add(cij.as_mut_ptr(), cij.as_ptr(), prod.as_ptr());
                        }
                    }
                    *seen = true;
                };
                fold(slot, &mut seen, &cursors);
                advance(slot, &mut cursors, &mut heap);
                while let Some(&Reverse((inext, snext))) = heap.peek() {
                    if inext != i {
                        break;
                    }
                    heap.pop();
                    fold(snext, &mut seen, &cursors);
                    advance(snext, &mut cursors, &mut heap);
                }
                if mv.as_ref().is_some_and(|m| !m.admit(i)) {
                    continue;
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
