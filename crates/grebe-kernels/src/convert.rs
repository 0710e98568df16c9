//! Storage-form conversions: orientation relayout, logical transpose, and
//! the hypersparse/non-hypersparse flip.
//!
//! The relayout is a two-phase bucket scatter. Phase 1 counts entries per
//! destination vector; phase 2 has each task own a disjoint range of
//! destination vectors and scan the source for entries landing in its
//! range, so writes never contend and every destination vector comes out
//! sorted by construction.

use std::borrow::Cow;
use std::cell::RefCell;

use grebe_core::{Context, Matrix, Orientation, Result};
use rayon::prelude::*;
use thread_local::ThreadLocal;

use crate::util::{alloc_i64, alloc_u8, i64_to_usize, prefix_sum, usize_to_i64};

const PARALLEL_COUNT_NNZ: usize = 1 << 16;

/// Logical transpose for free: swap the dimensions and flip the
/// orientation flag. The arrays do not move.
pub(crate) fn reinterpret_transpose(a: &Matrix) -> Matrix {
    let mut t = a.clone();
    t.orientation = a.orientation.flipped();
    std::mem::swap(&mut t.nrows, &mut t.ncols);
    t
}

/// Re-store `a` (same logical matrix) in the `target` orientation.
pub(crate) fn conform_orientation(
    a: &Matrix,
    target: Orientation,
    ctx: &Context,
) -> Result<Matrix> {
    debug_assert!(a.is_finalized());
    if a.orientation == target {
        return Ok(a.clone());
    }
    let new_outer = a.inner_dim();
    let nnz = a.nstored();
    let size = a.typ.size;

    // phase 1: entries per destination vector
    let mut counts = vec![0usize; new_outer];
    if nnz >= PARALLEL_COUNT_NNZ {
        let tls: ThreadLocal<RefCell<Vec<usize>>> = ThreadLocal::new();
        a.i.par_chunks(8192).for_each(|chunk| {
            let cell = tls.get_or(|| RefCell::new(vec![0usize; new_outer]));
            let mut local = cell.borrow_mut();
            for &ii in chunk {
                local[i64_to_usize(ii)] += 1;
            }
        });
        for cell in tls {
            let local = cell.into_inner();
            for (d, v) in local.into_iter().enumerate() {
                counts[d] += v;
            }
        }
    } else {
        for &ii in &a.i {
            counts[i64_to_usize(ii)] += 1;
        }
    }
    let p = prefix_sum(&counts);

    let mut new_i = alloc_i64(nnz, "orientation relayout indices")?;
    let mut new_x = alloc_u8(nnz * size, "orientation relayout values")?;

    // phase 2: tasks own disjoint destination ranges, balanced by count
    let nthreads = ctx.nthreads(nnz);
    let ntasks = ctx.ntasks(nnz, nthreads).min(new_outer.max(1));
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let target_work = (nnz / ntasks.max(1)).max(1);
    let mut acc = 0usize;
    let mut d0 = 0usize;
    for (d, &c) in counts.iter().enumerate() {
        if acc == 0 {
            d0 = d;
        }
        acc += c;
        if acc >= target_work {
            ranges.push((d0, d + 1));
            acc = 0;
        }
    }
    if acc > 0 || ranges.is_empty() {
        ranges.push((d0.min(new_outer), new_outer));
    }

    let ni_addr = new_i.as_mut_ptr() as usize;
    let nx_addr = new_x.as_mut_ptr() as usize;
    ranges.into_par_iter().for_each(|(d0, d1)| {
        let ni = ni_addr as *mut i64;
        let nx = nx_addr as *mut u8;
        let mut cursor: Vec<usize> = (d0..d1).map(|d| i64_to_usize(p[d])).collect();
        for k in 0..a.nvec() {
            let j = a.vector_outer(k);
            let (s, e) = a.vector_range(k);
            for pos in s..e {
                let ii = i64_to_usize(a.i[pos]);
                if ii < d0 || ii >= d1 {
                    continue;
                }
                let dst = cursor[ii - d0];
                cursor[ii - d0] += 1;
                unsafe {
                    std::ptr::write(ni.add(dst), j);
                    std::ptr::copy_nonoverlapping(
                        a.x.as_ptr().add(pos * size),
                        nx.add(dst * size),
                        size,
                    );
                }
            }
        }
    });

    let mut out = Matrix::from_parts(
        a.typ, a.nrows, a.ncols, target, None, p, new_i, new_x, false,
    )?;
    conform_hyper(&mut out);
    Ok(out)
}

/// The logical matrix `a` (or its transpose) stored in `target`
/// orientation, borrowing when no work is needed.
pub(crate) fn materialize<'a>(
    a: &'a Matrix,
    transpose: bool,
    target: Orientation,
    ctx: &Context,
) -> Result<Cow<'a, Matrix>> {
    if transpose {
        let t = reinterpret_transpose(a);
        if t.orientation == target {
            Ok(Cow::Owned(t))
        } else {
            Ok(Cow::Owned(conform_orientation(&t, target, ctx)?))
        }
    } else if a.orientation == target {
        Ok(Cow::Borrowed(a))
    } else {
        Ok(Cow::Owned(conform_orientation(a, target, ctx)?))
    }
}

/// Flip between hypersparse and non-hypersparse storage when the density
/// of non-empty vectors crosses 1/16 of the outer dimension.
pub(crate) fn conform_hyper(a: &mut Matrix) {
    let outer = a.outer_dim();
    if outer == 0 {
        return;
    }
    let nonempty = (0..a.nvec())
        .filter(|&k| a.p[k + 1] > a.p[k])
        .count();
    if a.is_hyper() {
        if nonempty * 16 >= outer {
            to_non_hyper(a);
        } else if nonempty < a.nvec() {
            prune_empty_hyper(a);
        }
    } else if nonempty * 16 < outer {
        to_hyper(a);
    }
}

fn to_hyper(a: &mut Matrix) {
    debug_assert!(!a.is_hyper());
    let outer = a.outer_dim();
    let mut h = Vec::new();
    let mut p = vec![0i64];
    for j in 0..outer {
        if a.p[j + 1] > a.p[j] {
            h.push(usize_to_i64(j));
            p.push(a.p[j + 1]);
        }
    }
    a.h = Some(h);
    a.p = p;
}

fn prune_empty_hyper(a: &mut Matrix) {
    let h = a.h.take().expect("hypersparse");
    let mut new_h = Vec::with_capacity(h.len());
    let mut new_p = vec![0i64];
    for (k, &j) in h.iter().enumerate() {
        if a.p[k + 1] > a.p[k] {
            new_h.push(j);
            new_p.push(a.p[k + 1]);
        }
    }
    a.h = Some(new_h);
    a.p = new_p;
}

fn to_non_hyper(a: &mut Matrix) {
    let h = a.h.take().expect("hypersparse");
    let outer = a.outer_dim();
    let mut p = vec![0i64; outer + 1];
    let mut prev = 0usize;
    for (k, &j) in h.iter().enumerate() {
        let j = i64_to_usize(j);
        for slot in prev..=j {
            p[slot] = a.p[k];
        }
        p[j + 1] = a.p[k + 1];
        prev = j + 1;
    }
    for slot in prev..=outer {
        p[slot] = *a.p.last().expect("pointer array non-empty");
    }
    a.p = p;
}

#[cfg(test)]
mod tests {
    use super::*;
    use grebe_core::Type;

    fn sample() -> Matrix {
        // by-column 2x3: (0,0)=1, (1,0)=2, (1,2)=3
        Matrix::from_parts(
            Type::FP64,
            2,
            3,
            Orientation::ByCol,
            None,
            vec![0, 2, 2, 3],
            vec![0, 1, 1],
            [1.0f64, 2.0, 3.0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn reinterpret_swaps_dims_only() {
        let a = sample();
        let t = reinterpret_transpose(&a);
        assert_eq!((t.nrows, t.ncols), (3, 2));
        assert_eq!(t.orientation, Orientation::ByRow);
        // logical (0,0) of A' is A's (0,0)
        assert_eq!(t.get_entry::<f64>(0, 0), Some(1.0));
        assert_eq!(t.get_entry::<f64>(2, 1), Some(3.0));
    }

    #[test]
    fn conform_orientation_preserves_logical_matrix() {
        let a = sample();
        let r = conform_orientation(&a, Orientation::ByRow, &Context::new()).unwrap();
        assert_eq!(r.orientation, Orientation::ByRow);
        assert_eq!((r.nrows, r.ncols), (2, 3));
        r.check().unwrap();
        for row in 0..2 {
            for col in 0..3 {
                assert_eq!(
                    r.get_entry::<f64>(row, col),
                    a.get_entry::<f64>(row, col),
                    "mismatch at ({row},{col})"
                );
            }
        }
    }

    #[test]
    fn hyper_flip_round_trips() {
        // one nonempty column out of 64: flips to hypersparse
        let mut a = Matrix::from_parts(
            Type::BOOL,
            4,
            64,
            Orientation::ByCol,
            None,
            {
                let mut p = vec![0i64; 65];
                for slot in p.iter_mut().skip(10) {
                    *slot = 1;
                }
                p
            },
            vec![2],
            vec![1],
            true,
        )
        .unwrap();
        conform_hyper(&mut a);
        assert!(a.is_hyper());
        assert_eq!(a.h.as_deref(), Some(&[9i64][..]));
        a.check().unwrap();
        assert_eq!(a.get_entry::<bool>(2, 9), Some(true));
    }

    #[test]
    fn dense_hypersparse_flips_back() {
        // one nonempty vector out of four: 16 * 1 >= 4, so densify
        let mut a = Matrix::from_parts(
            Type::BOOL,
            4,
            4,
            Orientation::ByCol,
            Some(vec![3]),
            vec![0, 1],
            vec![2],
            vec![1],
            true,
        )
        .unwrap();
        conform_hyper(&mut a);
        assert!(!a.is_hyper());
        assert_eq!(a.p, vec![0, 0, 0, 0, 1]);
        a.check().unwrap();
        assert_eq!(a.get_entry::<bool>(2, 3), Some(true));
    }
}
