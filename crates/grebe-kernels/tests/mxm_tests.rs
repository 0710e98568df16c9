//! Multiply-specific coverage: method equivalence, orientations, masks,
//! typecasting, and the generic path for user-defined operators.

use grebe_core::{
    AxbMethod, BinaryOp, Context, Descriptor, Elem, Matrix, Monoid, Orientation, Semiring, Type,
    TypeCode,
};
use grebe_kernels::{matrix_from_tuples, mxm};

fn dense<T: Elem>(m: &Matrix) -> Vec<Vec<Option<T>>> {
    (0..m.nrows)
        .map(|r| (0..m.ncols).map(|c| m.get_entry::<T>(r, c)).collect())
        .collect()
}

fn sample_pair() -> (Matrix, Matrix) {
    // A: 4x3, B: 3x4, irregular patterns
    let a = matrix_from_tuples::<f64>(
        4,
        3,
        Orientation::ByCol,
        &[
            (0, 0, 1.0),
            (2, 0, -2.0),
            (1, 1, 3.0),
            (3, 1, 0.5),
            (0, 2, 4.0),
            (2, 2, 1.5),
        ],
    )
    .unwrap();
    let b = matrix_from_tuples::<f64>(
        3,
        4,
        Orientation::ByCol,
        &[
            (0, 0, 2.0),
            (1, 0, -1.0),
            (2, 1, 3.0),
            (0, 2, 1.0),
            (1, 3, 5.0),
            (2, 3, -0.5),
        ],
    )
    .unwrap();
    (a, b)
}

#[test]
fn all_three_methods_agree() {
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut reference: Option<Vec<Vec<Option<f64>>>> = None;
    for method in [AxbMethod::Gustavson, AxbMethod::Dot, AxbMethod::Heap] {
        let mut c = Matrix::new(Type::FP64, 4, 4).unwrap();
        mxm(
            &mut c,
            None,
            None,
            &sr,
            &a,
            &b,
            &Descriptor::new().axb_method(method),
            &Context::new(),
        )
        .unwrap();
        let d = dense::<f64>(&c);
        match &reference {
            None => reference = Some(d),
            Some(r) => assert_eq!(&d, r, "method {method:?} disagrees"),
        }
    }
}

#[test]
fn by_row_output_matches_by_column() {
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut c_col = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c_col, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();

    let mut c_row = Matrix::new_with(Type::FP64, 4, 4, Orientation::ByRow).unwrap();
    mxm(&mut c_row, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();
    assert_eq!(dense::<f64>(&c_col), dense::<f64>(&c_row));
}

#[test]
fn by_row_inputs_match_by_column_inputs() {
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut c_ref = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c_ref, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();

    // rebuild the same logical inputs stored by row
    let tuples_of = |m: &Matrix| {
        let mut t = Vec::new();
        for r in 0..m.nrows {
            for c in 0..m.ncols {
                if let Some(v) = m.get_entry::<f64>(r, c) {
                    t.push((r, c, v));
                }
            }
        }
        t
    };
    let ar = matrix_from_tuples::<f64>(4, 3, Orientation::ByRow, &tuples_of(&a)).unwrap();
    let br = matrix_from_tuples::<f64>(3, 4, Orientation::ByRow, &tuples_of(&b)).unwrap();
    let mut c = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c, None, None, &sr, &ar, &br, &Descriptor::new(), &Context::new()).unwrap();
    assert_eq!(dense::<f64>(&c), dense::<f64>(&c_ref));
}

#[test]
fn descriptor_transposes_inputs() {
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();

    // C = A' * B' computed directly vs. via pre-transposed tuples
    let mut c = Matrix::new(Type::FP64, 3, 3).unwrap();
    mxm(
        &mut c,
        None,
        None,
        &sr,
        &a,
        &b,
        &Descriptor::new().transpose_inp0().transpose_inp1(),
        &Context::new(),
    )
    .unwrap();

    let flip = |m: &Matrix| {
        let mut t = Vec::new();
        for r in 0..m.nrows {
            for cc in 0..m.ncols {
                if let Some(v) = m.get_entry::<f64>(r, cc) {
                    t.push((cc, r, v));
                }
            }
        }
        t
    };
    let at = matrix_from_tuples::<f64>(3, 4, Orientation::ByCol, &flip(&a)).unwrap();
    let bt = matrix_from_tuples::<f64>(4, 3, Orientation::ByCol, &flip(&b)).unwrap();
    let mut c_ref = Matrix::new(Type::FP64, 3, 3).unwrap();
    mxm(&mut c_ref, None, None, &sr, &at, &bt, &Descriptor::new(), &Context::new()).unwrap();
    assert_eq!(dense::<f64>(&c), dense::<f64>(&c_ref));
}

#[test]
fn no_mask_equals_all_true_mask() {
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut c_ref = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c_ref, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();

    let mut ones = Vec::new();
    for r in 0..4 {
        for c in 0..4 {
            ones.push((r, c, true));
        }
    }
    let mask = matrix_from_tuples::<bool>(4, 4, Orientation::ByCol, &ones).unwrap();
    let mut c = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c, Some(&mask), None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();
    assert_eq!(dense::<f64>(&c), dense::<f64>(&c_ref));
}

#[test]
fn no_mask_equals_all_true_mask_under_complement() {
    // the implicit all-true mask, complemented, admits nothing — exactly
    // like an explicit all-true mask with the complement flag
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut ones = Vec::new();
    for r in 0..4 {
        for c in 0..4 {
            ones.push((r, c, true));
        }
    }
    let mask = matrix_from_tuples::<bool>(4, 4, Orientation::ByCol, &ones).unwrap();
    let init = [(0usize, 0usize, 7.0f64), (3, 3, -1.0)];

    let desc = Descriptor::new().complement_mask();
    let mut c_none = matrix_from_tuples::<f64>(4, 4, Orientation::ByCol, &init).unwrap();
    mxm(&mut c_none, None, None, &sr, &a, &b, &desc, &Context::new()).unwrap();
    let mut c_ones = matrix_from_tuples::<f64>(4, 4, Orientation::ByCol, &init).unwrap();
    mxm(&mut c_ones, Some(&mask), None, &sr, &a, &b, &desc, &Context::new()).unwrap();
    assert_eq!(dense::<f64>(&c_none), dense::<f64>(&c_ones));
    assert_eq!(c_none.get_entry::<f64>(0, 0), Some(7.0));
    assert_eq!(c_none.nvals(), 2);

    // with replace, both clear the rejected output
    let desc_r = Descriptor::new().complement_mask().replace_output();
    let mut r_none = matrix_from_tuples::<f64>(4, 4, Orientation::ByCol, &init).unwrap();
    mxm(&mut r_none, None, None, &sr, &a, &b, &desc_r, &Context::new()).unwrap();
    let mut r_ones = matrix_from_tuples::<f64>(4, 4, Orientation::ByCol, &init).unwrap();
    mxm(&mut r_ones, Some(&mask), None, &sr, &a, &b, &desc_r, &Context::new()).unwrap();
    assert_eq!(r_none.nvals(), 0);
    assert_eq!(r_ones.nvals(), 0);
}

#[test]
fn complemented_mask_admits_the_inverse() {
    let (a, b) = sample_pair();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut full = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut full, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();

    let mask =
        matrix_from_tuples::<bool>(4, 4, Orientation::ByCol, &[(0, 0, true), (2, 1, true)])
            .unwrap();
    let mut kept = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut kept, Some(&mask), None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();
    let mut dropped = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(
        &mut dropped,
        Some(&mask),
        None,
        &sr,
        &a,
        &b,
        &Descriptor::new().complement_mask(),
        &Context::new(),
    )
    .unwrap();

    // kept ∪ dropped = full, kept ∩ dropped = ∅
    for r in 0..4 {
        for c in 0..4 {
            let f = full.get_entry::<f64>(r, c);
            let k = kept.get_entry::<f64>(r, c);
            let d = dropped.get_entry::<f64>(r, c);
            assert!(k.is_none() || d.is_none());
            assert_eq!(k.or(d), f, "mismatch at ({r},{c})");
        }
    }
}

#[test]
fn hypersparse_inputs_use_heap_and_agree() {
    // two vectors out of 10_000 columns: both operands hypersparse
    let a = matrix_from_tuples::<i64>(
        10_000,
        10_000,
        Orientation::ByCol,
        &[(3, 17, 2), (4000, 17, 3), (3, 9000, 5)],
    )
    .unwrap();
    let b = matrix_from_tuples::<i64>(
        10_000,
        10_000,
        Orientation::ByCol,
        &[(17, 40, 7), (9000, 40, 11)],
    )
    .unwrap();
    assert!(a.is_hyper() && b.is_hyper());
    let sr = Semiring::plus_times(TypeCode::Int64).unwrap();

    let mut auto = Matrix::new(Type::INT64, 10_000, 10_000).unwrap();
    mxm(&mut auto, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();
    let mut forced = Matrix::new(Type::INT64, 10_000, 10_000).unwrap();
    mxm(
        &mut forced,
        None,
        None,
        &sr,
        &a,
        &b,
        &Descriptor::new().axb_method(AxbMethod::Gustavson),
        &Context::new(),
    )
    .unwrap();

    // C(3,40) = 2*7 + 5*11 = 69, C(4000,40) = 3*7 = 21
    assert_eq!(auto.get_entry::<i64>(3, 40), Some(69));
    assert_eq!(auto.get_entry::<i64>(4000, 40), Some(21));
    assert_eq!(auto.nvals(), 2);
    assert_eq!(forced.get_entry::<i64>(3, 40), Some(69));
    assert_eq!(forced.nvals(), 2);
}

#[test]
fn user_defined_semiring_runs_generic() {
    // user-defined plus/times over FP64 must match the built-in semiring
    unsafe fn umul(z: *mut u8, x: *const u8, y: *const u8) {
        let a = unsafe { x.cast::<f64>().read_unaligned() };
        let b = unsafe { y.cast::<f64>().read_unaligned() };
        unsafe { z.cast::<f64>().write_unaligned(a * b) };
    }
    unsafe fn uadd(z: *mut u8, x: *const u8, y: *const u8) {
        let a = unsafe { x.cast::<f64>().read_unaligned() };
        let b = unsafe { y.cast::<f64>().read_unaligned() };
        unsafe { z.cast::<f64>().write_unaligned(a + b) };
    }
    let mul = BinaryOp::user(Type::FP64, Type::FP64, Type::FP64, umul);
    let add = BinaryOp::user(Type::FP64, Type::FP64, Type::FP64, uadd);
    let monoid = Monoid::new(add, 0.0f64.to_le_bytes().to_vec(), None).unwrap();
    let sr = Semiring::new("user_plus_times", monoid, mul).unwrap();

    let (a, b) = sample_pair();
    let mut c = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();

    let builtin = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut c_ref = Matrix::new(Type::FP64, 4, 4).unwrap();
    mxm(&mut c_ref, None, None, &builtin, &a, &b, &Descriptor::new(), &Context::new()).unwrap();
    assert_eq!(dense::<f64>(&c), dense::<f64>(&c_ref));
}

#[test]
fn typecast_inputs_take_the_generic_path() {
    // i32 inputs through an FP64 semiring
    let a = matrix_from_tuples::<i32>(2, 2, Orientation::ByCol, &[(0, 0, 2), (1, 1, 3)]).unwrap();
    let b = matrix_from_tuples::<i32>(2, 2, Orientation::ByCol, &[(0, 0, 5), (1, 0, 4)]).unwrap();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut c = Matrix::new(Type::FP64, 2, 2).unwrap();
    mxm(&mut c, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()).unwrap();
    assert_eq!(
        dense::<f64>(&c),
        vec![vec![Some(10.0), None], vec![Some(12.0), None]]
    );
}

#[test]
fn accum_merges_into_existing_output() {
    let a = matrix_from_tuples::<f64>(2, 2, Orientation::ByCol, &[(0, 0, 2.0)]).unwrap();
    let b = matrix_from_tuples::<f64>(2, 2, Orientation::ByCol, &[(0, 0, 3.0)]).unwrap();
    let mut c =
        matrix_from_tuples::<f64>(2, 2, Orientation::ByCol, &[(0, 0, 10.0), (1, 1, 1.0)])
            .unwrap();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let plus = BinaryOp::plus(TypeCode::Fp64).unwrap();
    mxm(
        &mut c,
        None,
        Some(&plus),
        &sr,
        &a,
        &b,
        &Descriptor::new(),
        &Context::new(),
    )
    .unwrap();
    // (0,0): accum(10, 6) = 16; (1,1): kept because accum is union-shaped
    assert_eq!(c.get_entry::<f64>(0, 0), Some(16.0));
    assert_eq!(c.get_entry::<f64>(1, 1), Some(1.0));
}

#[test]
fn dimension_mismatch_is_rejected_up_front() {
    let a = matrix_from_tuples::<f64>(2, 3, Orientation::ByCol, &[(0, 0, 1.0)]).unwrap();
    let b = matrix_from_tuples::<f64>(2, 2, Orientation::ByCol, &[(0, 0, 1.0)]).unwrap();
    let sr = Semiring::plus_times(TypeCode::Fp64).unwrap();
    let mut c = Matrix::new(Type::FP64, 2, 2).unwrap();
    assert!(matches!(
        mxm(&mut c, None, None, &sr, &a, &b, &Descriptor::new(), &Context::new()),
        Err(grebe_core::Error::DimensionMismatch(_))
    ));
}
