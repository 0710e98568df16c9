//! Matrix finalization: drain the pending bag and compact out zombies.
//!
//! After `wait` returns the matrix has strictly sorted live entries in
//! every vector, no pending tuples, and no zombies. The call is
//! idempotent. Orchestrators that need clean inputs call `finalized`,
//! which leaves the caller's matrix untouched and finalizes a working
//! clone only when there is deferred work.

use std::borrow::Cow;

use grebe_core::{is_zombie, Context, Elem, Error, Matrix, Orientation, Result, Type};
use rayon::prelude::*;
use tracing::debug;

use crate::convert::conform_hyper;
use crate::util::{alloc_i64, alloc_u8, i64_to_usize, prefix_sum, usize_to_i64};

/// Drain pending tuples and compact zombies, restoring the sorted-live
/// invariant. The matrix is unchanged on error.
pub fn wait(a: &mut Matrix, ctx: &Context) -> Result<()> {
    ctx.check()?;
    if a.nzombies > 0 {
        compact_zombies(a, ctx)?;
    }
    if !a.pending.is_empty() {
        merge_pending(a, ctx)?;
    }
    conform_hyper(a);
    debug_assert!(a.check().is_ok());
    Ok(())
}

/// Borrow `m` if it is already finalized, otherwise finalize a clone.
pub(crate) fn finalized<'a>(m: &'a Matrix, ctx: &Context) -> Result<Cow<'a, Matrix>> {
    if m.is_finalized() {
        Ok(Cow::Borrowed(m))
    } else {
        let mut c = m.clone();
        wait(&mut c, ctx)?;
        Ok(Cow::Owned(c))
    }
}

/// Read one element, finalizing first if pending tuples could hide it.
pub fn extract_element<T: Elem>(
    a: &mut Matrix,
    row: usize,
    col: usize,
    ctx: &Context,
) -> Result<Option<T>> {
    if a.typ.code != T::CODE {
        return Err(Error::DomainMismatch(format!(
            "matrix type {:?} does not match element type {:?}",
            a.typ.code,
            T::CODE
        )));
    }
    if row >= a.nrows || col >= a.ncols {
        return Err(Error::InvalidValue(format!(
            "index ({row},{col}) outside {}-by-{}",
            a.nrows, a.ncols
        )));
    }
    if !a.pending.is_empty() {
        wait(a, ctx)?;
    }
    Ok(a.get_entry::<T>(row, col))
}

/// Assemble a matrix from unordered tuples, combining duplicates with
/// `dup` (last write wins when absent). Shares the pending-merge machinery
/// with `wait`.
pub fn build_matrix(
    typ: Type,
    nrows: usize,
    ncols: usize,
    orientation: Orientation,
    rows: &[usize],
    cols: &[usize],
    values: &[u8],
    dup: Option<grebe_core::BinaryOp>,
    ctx: &Context,
) -> Result<Matrix> {
    if rows.len() != cols.len() || values.len() != rows.len() * typ.size {
        return Err(Error::InvalidValue(
            "tuple arrays must have matching lengths".into(),
        ));
    }
    let mut m = Matrix::new_with(typ, nrows, ncols, orientation)?;
    for (k, (&r, &c)) in rows.iter().zip(cols.iter()).enumerate() {
        if r >= nrows || c >= ncols {
            return Err(Error::InvalidValue(format!(
                "tuple index ({r},{c}) outside {nrows}-by-{ncols}"
            )));
        }
        let (outer, inner) = m.to_outer_inner(r, c);
        m.pending
            .push(outer, inner, &values[k * typ.size..(k + 1) * typ.size]);
    }
    m.pending.op = dup;
    wait(&mut m, ctx)?;
    Ok(m)
}

/// Typed convenience over [`build_matrix`] for tests and small inputs.
pub fn matrix_from_tuples<T: Elem>(
    nrows: usize,
    ncols: usize,
    orientation: Orientation,
    tuples: &[(usize, usize, T)],
) -> Result<Matrix> {
    let rows: Vec<usize> = tuples.iter().map(|t| t.0).collect();
    let cols: Vec<usize> = tuples.iter().map(|t| t.1).collect();
    let mut values = vec![0u8; tuples.len() * std::mem::size_of::<T>()];
    for (k, t) in tuples.iter().enumerate() {
        t.2.store(&mut values[k * std::mem::size_of::<T>()..]);
    }
    build_matrix(
        T::rtype(),
        nrows,
        ncols,
        orientation,
        &rows,
        &cols,
        &values,
        None,
        &Context::new(),
    )
}

/// Remove zombie slots, rewriting `(p, i, x)` in place.
fn compact_zombies(a: &mut Matrix, ctx: &Context) -> Result<()> {
    let nvec = a.nvec();
    let size = a.typ.size;
    let nnz = a.nstored();
    debug!(zombies = a.nzombies, "compacting zombies");

    // phase 1: live entries per vector
    let mut counts = vec![0usize; nvec];
    counts.par_iter_mut().enumerate().for_each(|(k, c)| {
        let (s, e) = (i64_to_usize(a.p[k]), i64_to_usize(a.p[k + 1]));
        *c = a.i[s..e].iter().filter(|&&ii| !is_zombie(ii)).count();
    });
    let new_p = prefix_sum(&counts);
    let live = i64_to_usize(new_p[nvec]);
    debug_assert_eq!(live, nnz - a.nzombies);

    let mut new_i = alloc_i64(live, "zombie compaction indices")?;
    let mut new_x = alloc_u8(live * size, "zombie compaction values")?;
    ctx.check()?;

    // phase 2: per-vector fill
    let ni_addr = new_i.as_mut_ptr() as usize;
    let nx_addr = new_x.as_mut_ptr() as usize;
    (0..nvec).into_par_iter().for_each(|k| {
        let (s, e) = (i64_to_usize(a.p[k]), i64_to_usize(a.p[k + 1]));
        let mut dst = i64_to_usize(new_p[k]);
        let ni = ni_addr as *mut i64;
        let nx = nx_addr as *mut u8;
        for pos in s..e {
            let ii = a.i[pos];
            if is_zombie(ii) {
                continue;
            }
            unsafe {
                std::ptr::write(ni.add(dst), ii);
                std::ptr::copy_nonoverlapping(
                    a.x.as_ptr().add(pos * size),
                    nx.add(dst * size),
                    size,
                );
            }
            dst += 1;
        }
    });

    a.p = new_p;
    a.i = new_i;
    a.x = new_x;
    a.nzombies = 0;
    Ok(())
}

/// Sort the pending bag, combine duplicate tuples, and merge the result
/// with the existing sorted vectors.
fn merge_pending(a: &mut Matrix, ctx: &Context) -> Result<()> {
    debug_assert_eq!(a.nzombies, 0);
    let pending = std::mem::take(&mut a.pending);
    let size = a.typ.size;
    let outer = a.outer_dim();
    debug!(tuples = pending.len(), "assembling pending tuples");

    // stable argsort by (outer, inner); ties keep insertion order so the
    // last write wins under the overwrite policy
    let n = pending.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&k| (pending.outer[k], pending.inner[k]));

    // combine duplicates
    let mut pout: Vec<i64> = Vec::with_capacity(n);
    let mut pin: Vec<i64> = Vec::with_capacity(n);
    let mut pval: Vec<u8> = Vec::with_capacity(n * size);
    let mut k = 0usize;
    while k < n {
        let key = (pending.outer[order[k]], pending.inner[order[k]]);
        let mut chosen = pending.x[order[k] * size..(order[k] + 1) * size].to_vec();
        let mut r = k + 1;
        while r < n && (pending.outer[order[r]], pending.inner[order[r]]) == key {
            let next = &pending.x[order[r] * size..(order[r] + 1) * size];
            match &pending.op {
                Some(op) => {
                    let mut z = vec![0u8; size];
                    op.apply(&mut z, &chosen, next);
                    chosen = z;
                }
                None => chosen.copy_from_slice(next),
            }
            r += 1;
        }
        pout.push(key.0);
        pin.push(key.1);
        pval.extend_from_slice(&chosen);
        k = r;
    }

    // pointer array over the deduplicated tuples, by outer vector
    let mut pend_ptr = vec![0i64; outer + 1];
    for &j in &pout {
        pend_ptr[i64_to_usize(j) + 1] += 1;
    }
    for j in 0..outer {
        pend_ptr[j + 1] += pend_ptr[j];
    }

    // phase 1: merged size per vector (union; a collision counts once)
    let mut counts = vec![0usize; outer];
    counts.par_iter_mut().enumerate().for_each(|(j, c)| {
        let (es, ee) = match a.find_vector(usize_to_i64(j)) {
            Some(k) => a.vector_range(k),
            None => (0, 0),
        };
        let (qs, qe) = (
            i64_to_usize(pend_ptr[j]),
            i64_to_usize(pend_ptr[j + 1]),
        );
        let mut pa = es;
        let mut pb = qs;
        let mut cnt = 0usize;
        while pa < ee || pb < qe {
            let ia = if pa < ee { a.i[pa] } else { i64::MAX };
            let ib = if pb < qe { pin[pb] } else { i64::MAX };
            if ia < ib {
                pa += 1;
            } else if ib < ia {
                pb += 1;
            } else {
                pa += 1;
                pb += 1;
            }
            cnt += 1;
        }
        *c = cnt;
    });
    let new_p = prefix_sum(&counts);
    let total = i64_to_usize(new_p[outer]);
    let mut new_i = alloc_i64(total, "pending merge indices")?;
    let mut new_x = alloc_u8(total * size, "pending merge values")?;
    ctx.check()?;

    // phase 2: merge fill; a collision with an existing entry combines
    // through the pending op, or overwrites when there is none
    let ni_addr = new_i.as_mut_ptr() as usize;
    let nx_addr = new_x.as_mut_ptr() as usize;
    let pend_op = pending.op.clone();
    (0..outer).into_par_iter().for_each(|j| {
        let (es, ee) = match a.find_vector(usize_to_i64(j)) {
            Some(k) => a.vector_range(k),
            None => (0, 0),
        };
        let (qs, qe) = (
            i64_to_usize(pend_ptr[j]),
            i64_to_usize(pend_ptr[j + 1]),
        );
        let ni = ni_addr as *mut i64;
        let nx = nx_addr as *mut u8;
        let mut dst = i64_to_usize(new_p[j]);
        let mut pa = es;
        let mut pb = qs;
        while pa < ee || pb < qe {
            let ia = if pa < ee { a.i[pa] } else { i64::MAX };
            let ib = if pb < qe { pin[pb] } else { i64::MAX };
            unsafe {
                if ia < ib {
                    std::ptr::write(ni.add(dst), ia);
                    std::ptr::copy_nonoverlapping(
                        a.x.as_ptr().add(pa * size),
                        nx.add(dst * size),
                        size,
                    );
                    pa += 1;
                } else if ib < ia {
                    std::ptr::write(ni.add(dst), ib);
                    std::ptr::copy_nonoverlapping(
                        pval.as_ptr().add(pb * size),
                        nx.add(dst * size),
                        size,
                    );
                    pb += 1;
                } else {
                    std::ptr::write(ni.add(dst), ia);
                    match &pend_op {
                        Some(op) => {
                            let mut z = vec![0u8; size];
                            op.apply(
                                &mut z,
                                &a.x[pa * size..(pa + 1) * size],
                                &pval[pb * size..(pb + 1) * size],
                            );
                            std::ptr::copy_nonoverlapping(z.as_ptr(), nx.add(dst * size), size);
                        }
                        None => {
                            std::ptr::copy_nonoverlapping(
                                pval.as_ptr().add(pb * size),
                                nx.add(dst * size),
                                size,
                            );
                        }
                    }
                    pa += 1;
                    pb += 1;
                }
            }
            dst += 1;
        }
    });

    a.h = None;
    a.p = new_p;
    a.i = new_i;
    a.x = new_x;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grebe_core::{flip_index, BinaryOp, TypeCode};

    #[test]
    fn wait_drains_pending() {
        let mut a = Matrix::new(Type::FP64, 3, 3).unwrap();
        a.set_element(2, 1, 4.0f64).unwrap();
        a.set_element(0, 1, 1.0f64).unwrap();
        a.set_element(2, 1, 9.0f64).unwrap(); // later write wins
        wait(&mut a, &Context::new()).unwrap();
        assert!(a.is_finalized());
        assert_eq!(a.nvals(), 2);
        assert_eq!(a.get_entry::<f64>(2, 1), Some(9.0));
        assert_eq!(a.get_entry::<f64>(0, 1), Some(1.0));
    }

    #[test]
    fn wait_is_idempotent() {
        let mut a = Matrix::new(Type::INT32, 4, 4).unwrap();
        a.set_element(1, 2, 5i32).unwrap();
        wait(&mut a, &Context::new()).unwrap();
        let snapshot = (a.p.clone(), a.i.clone(), a.x.clone());
        wait(&mut a, &Context::new()).unwrap();
        assert_eq!((a.p, a.i, a.x), snapshot);
    }

    #[test]
    fn pending_op_combines_duplicates() {
        let plus = BinaryOp::plus(TypeCode::Int32).unwrap();
        let vals: Vec<u8> = [3i32, 4, 5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let m = build_matrix(
            Type::INT32,
            2,
            2,
            Orientation::ByCol,
            &[0, 0, 1],
            &[1, 1, 0],
            &vals,
            Some(plus),
            &Context::new(),
        )
        .unwrap();
        assert_eq!(m.get_entry::<i32>(0, 1), Some(7));
        assert_eq!(m.get_entry::<i32>(1, 0), Some(5));
    }

    #[test]
    fn pending_merges_into_existing_entries() {
        let mut a = matrix_from_tuples::<i32>(2, 2, Orientation::ByCol, &[(0, 0, 10)]).unwrap();
        // collision with the stored entry is an in-place overwrite
        a.set_element(0, 0, 11i32).unwrap();
        assert!(a.pending.is_empty());
        // a genuinely new position rides the pending bag
        a.set_element(1, 1, 3i32).unwrap();
        assert_eq!(a.pending.len(), 1);
        wait(&mut a, &Context::new()).unwrap();
        assert_eq!(a.get_entry::<i32>(0, 0), Some(11));
        assert_eq!(a.get_entry::<i32>(1, 1), Some(3));
    }

    #[test]
    fn zombies_are_compacted() {
        let mut a = matrix_from_tuples::<f64>(
            3,
            2,
            Orientation::ByCol,
            &[(0, 0, 1.0), (2, 0, 2.0), (1, 1, 3.0)],
        )
        .unwrap();
        // kill (2,0)
        a.i[1] = flip_index(a.i[1]);
        a.nzombies = 1;
        wait(&mut a, &Context::new()).unwrap();
        assert_eq!(a.nzombies, 0);
        assert_eq!(a.nvals(), 2);
        assert_eq!(a.get_entry::<f64>(2, 0), None);
        assert_eq!(a.get_entry::<f64>(0, 0), Some(1.0));
        a.check().unwrap();
    }

    #[test]
    fn extract_element_triggers_wait() {
        let mut a = Matrix::new(Type::FP64, 2, 2).unwrap();
        a.set_element(1, 0, 2.5f64).unwrap();
        let got = extract_element::<f64>(&mut a, 1, 0, &Context::new()).unwrap();
        assert_eq!(got, Some(2.5));
        assert!(a.is_finalized());
        let missing = extract_element::<f64>(&mut a, 0, 0, &Context::new()).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn build_flips_sparse_output_to_hypersparse() {
        let m = matrix_from_tuples::<i32>(8, 1000, Orientation::ByCol, &[(1, 3, 5), (2, 900, 6)])
            .unwrap();
        assert!(m.is_hyper());
        assert_eq!(m.nvec(), 2);
        assert_eq!(m.get_entry::<i32>(2, 900), Some(6));
    }
}
