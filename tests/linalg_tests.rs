use matrix_calc::operation::{MatrixOperation, QrMode};
use matrix_calc::{Matrix, MatrixDataType, MatrixEngine};
use ndarray::{Array2, ShapeBuilder};

fn to_nd(rows: usize, columns: usize, entries: &[f64]) -> Array2<f64> {
    Array2::from_shape_vec((rows, columns).f(), entries.to_vec()).unwrap()
}

/// Columns `first..=last` of a column-major entry list, as their own matrix
fn columns_of(rows: usize, entries: &[f64], first: usize, last: usize) -> Array2<f64> {
    to_nd(rows, last - first + 1, &entries[first * rows..(last + 1) * rows])
}

fn assert_nd_close(found: &Array2<f64>, expected: &Array2<f64>, tolerance: f64) {
    assert_eq!(found.dim(), expected.dim());
    for (f, e) in found.iter().zip(expected.iter()) {
        assert!(
            (f - e).abs() < tolerance,
            "expected {:?}, found {:?}",
            expected,
            found
        );
    }
}

fn assert_close(found: &[f64], expected: &[f64]) {
    assert_eq!(found.len(), expected.len());
    for (f, e) in found.iter().zip(expected) {
        assert!(
            (f - e).abs() < 1e-8,
            "expected {:?}, found {:?}",
            expected,
            found
        );
    }
}

async fn run_qr(engine: &MatrixEngine, a: &Matrix, x: Option<&Matrix>, mode: QrMode) -> Vec<f64> {
    let (m, n) = (a.rows(), a.columns());
    let columns = match mode {
        QrMode::FullQr => n + m,
        QrMode::ReducedQr => n + n,
        _ => n + 1,
    };
    let out = engine.matrix(m, columns, MatrixDataType::F64).unwrap();
    let operation = MatrixOperation::qr(engine.registry(), a, x, mode).unwrap();
    let mut inputs = vec![a.clone()];
    if let Some(x) = x {
        inputs.push(x.clone());
    }
    engine.execute(operation, &out, &inputs).await.unwrap();
    out.read().await.unwrap()
}

// column-major 4 x 3, full column rank
const A43: [f64; 12] = [
    1.0, 2.0, 0.0, -1.0, // column 0
    0.0, 1.0, 1.0, 2.0, // column 1
    3.0, -1.0, 2.0, 0.5, // column 2
];

#[tokio::test]
async fn full_qr_reconstructs_the_input() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(4, 3, MatrixDataType::F64, &A43)
        .unwrap();

    let entries = run_qr(&engine, &a, None, QrMode::FullQr).await;
    let q = columns_of(4, &entries, 0, 3);
    let r = columns_of(4, &entries, 4, 6);

    // Q is orthogonal
    assert_nd_close(&q.t().dot(&q), &Array2::eye(4), 1e-8);

    // R is upper triangular
    for j in 0..3 {
        for i in (j + 1)..4 {
            assert!(r[(i, j)].abs() < 1e-8);
        }
    }

    // Q R gives the input back
    assert_nd_close(&q.dot(&r), &to_nd(4, 3, &A43), 1e-8);
}

#[tokio::test]
async fn reduced_qr_reconstructs_the_input() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(4, 3, MatrixDataType::F64, &A43)
        .unwrap();

    let entries = run_qr(&engine, &a, None, QrMode::ReducedQr).await;
    let q = columns_of(4, &entries, 0, 2);
    let r_region = columns_of(4, &entries, 3, 5);

    // only the top n x n of the triangular region is meaningful
    let mut r = Array2::<f64>::zeros((3, 3));
    for j in 0..3 {
        for i in 0..=j {
            r[(i, j)] = r_region[(i, j)];
        }
        for i in (j + 1)..4 {
            assert!(r_region[(i, j)].abs() < 1e-8);
        }
    }

    assert_nd_close(&q.t().dot(&q), &Array2::eye(3), 1e-8);
    assert_nd_close(&q.dot(&r), &to_nd(4, 3, &A43), 1e-8);
}

#[tokio::test]
async fn qr_of_the_identity_is_trivial() {
    let engine = MatrixEngine::new().await;
    let eye = engine.eye(2, MatrixDataType::F64).unwrap();

    let entries = run_qr(&engine, &eye, None, QrMode::ReducedQr).await;
    let q = columns_of(2, &entries, 0, 1);
    let r = columns_of(2, &entries, 2, 3);

    // the factorization is exact, up to the sign of the reflectors
    assert_nd_close(&q.dot(&r), &Array2::eye(2), 1e-12);
    assert!(r[(1, 0)].abs() < 1e-12);
    assert!((r[(0, 0)].abs() - 1.0).abs() < 1e-12);
    assert!((r[(1, 1)].abs() - 1.0).abs() < 1e-12);
}

#[tokio::test]
async fn the_vector_modes_agree_with_the_explicit_factors() {
    let engine = MatrixEngine::new().await;
    let a_values: [f64; 15] = [
        2.0, 0.0, 1.0, -1.0, 3.0, // column 0
        1.0, 1.0, 0.0, 2.0, -2.0, // column 1
        0.5, -1.0, 2.0, 1.0, 0.0, // column 2
    ];
    let x_values: [f64; 5] = [1.0, -2.0, 0.0, 3.0, 1.5];

    let a = engine
        .matrix_with_values(5, 3, MatrixDataType::F64, &a_values)
        .unwrap();
    let x = engine
        .matrix_with_values(5, 1, MatrixDataType::F64, &x_values)
        .unwrap();

    let full = run_qr(&engine, &a, None, QrMode::FullQr).await;
    let q = columns_of(5, &full, 0, 4);
    let x_nd = to_nd(5, 1, &x_values);
    let qtx_expected = q.t().dot(&x_nd);

    // Q'x
    let entries = run_qr(&engine, &a, Some(&x), QrMode::QtX).await;
    let qtx = &entries[0..5];
    for i in 0..5 {
        assert!((qtx[i] - qtx_expected[(i, 0)]).abs() < 1e-8);
    }

    // reduced Q'x only promises the first n entries
    let entries = run_qr(&engine, &a, Some(&x), QrMode::ReducedQtX).await;
    for i in 0..3 {
        assert!((entries[i] - qtx_expected[(i, 0)]).abs() < 1e-8);
    }

    // Qx undoes Q'x
    let y = engine
        .matrix_with_values(5, 1, MatrixDataType::F64, qtx)
        .unwrap();
    let entries = run_qr(&engine, &a, Some(&y), QrMode::QX).await;
    assert_close(&entries[0..5], &x_values);
}

#[tokio::test]
async fn backsub_solves_a_triangular_system() {
    let engine = MatrixEngine::new().await;

    // [ b | R ] with R = [[2, 1, -1], [0, 3, 2], [0, 0, 4]] and x = [1, -1, 2]
    let input = engine
        .matrix_with_values(
            3,
            4,
            MatrixDataType::F64,
            &[
                -1.0, 1.0, 8.0, // b
                2.0, 0.0, 0.0, // R column 0
                1.0, 3.0, 0.0, // R column 1
                -1.0, 2.0, 4.0, // R column 2
            ],
        )
        .unwrap();
    let out = engine.matrix(3, 1, MatrixDataType::F64).unwrap();

    let operation = MatrixOperation::backsub(engine.registry(), &input).unwrap();
    engine
        .execute(operation, &out, &[input.clone()])
        .await
        .unwrap();

    assert_close(&out.read().await.unwrap(), &[1.0, -1.0, 2.0]);
}

#[tokio::test]
async fn least_squares_solves_a_square_system_exactly() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 1.0, 1.0, -1.0])
        .unwrap();
    let b = engine
        .matrix_with_values(2, 1, MatrixDataType::F64, &[2.0, 0.0])
        .unwrap();

    // low-level path
    let out = engine.matrix(2, 1, MatrixDataType::F64).unwrap();
    let operation = MatrixOperation::lssolve(engine.registry(), &a, &b).unwrap();
    engine
        .execute(operation, &out, &[a.clone(), b.clone()])
        .await
        .unwrap();
    assert_close(&out.read().await.unwrap(), &[1.0, 1.0]);

    // expression path
    let x = engine.matrix(2, 1, MatrixDataType::F64).unwrap();
    x.set_to(&a.expr().ldiv(&b.expr()).unwrap()).await.unwrap();
    assert_close(&x.read().await.unwrap(), &[1.0, 1.0]);
}

#[tokio::test]
async fn least_squares_recovers_a_consistent_overdetermined_solution() {
    let engine = MatrixEngine::new().await;
    let a_values: [f64; 8] = [1.0, 2.0, -1.0, 0.5, 3.0, 1.0, 0.0, 2.0];
    let a_nd = to_nd(4, 2, &a_values);
    let x_true = to_nd(2, 1, &[2.0, -1.0]);
    let b_nd = a_nd.dot(&x_true);

    let a = engine
        .matrix_with_values(4, 2, MatrixDataType::F64, &a_values)
        .unwrap();
    let b = engine
        .matrix_with_values(4, 1, MatrixDataType::F64, b_nd.as_slice_memory_order().unwrap())
        .unwrap();

    let x = engine.matrix(2, 1, MatrixDataType::F64).unwrap();
    x.set_to(&a.expr().ldiv(&b.expr()).unwrap()).await.unwrap();
    assert_close(&x.read().await.unwrap(), &[2.0, -1.0]);
}

#[tokio::test]
async fn least_squares_residuals_are_orthogonal_to_the_columns() {
    let engine = MatrixEngine::new().await;
    let a_values: [f64; 6] = [1.0, 1.0, 1.0, 0.0, 1.0, 2.0];
    let b_values: [f64; 3] = [6.0, 0.0, 0.0];

    let a = engine
        .matrix_with_values(3, 2, MatrixDataType::F64, &a_values)
        .unwrap();
    let b = engine
        .matrix_with_values(3, 1, MatrixDataType::F64, &b_values)
        .unwrap();

    let x = engine.matrix(2, 1, MatrixDataType::F64).unwrap();
    x.set_to(&a.expr().ldiv(&b.expr()).unwrap()).await.unwrap();

    let a_nd = to_nd(3, 2, &a_values);
    let x_nd = to_nd(2, 1, &x.read().await.unwrap());
    let residual = to_nd(3, 1, &b_values) - a_nd.dot(&x_nd);
    let gradient = a_nd.t().dot(&residual);
    assert!(gradient[(0, 0)].abs() < 1e-8);
    assert!(gradient[(1, 0)].abs() < 1e-8);
}

#[tokio::test]
async fn small_inverses_cancel_their_matrix() {
    let engine = MatrixEngine::new().await;

    let b2 = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[3.0, 1.0, 2.0, 1.0])
        .unwrap();
    let c = engine.matrix(2, 2, MatrixDataType::F64).unwrap();
    c.set_to(&b2.expr().times(&b2.expr().inverse().unwrap()).unwrap())
        .await
        .unwrap();
    assert_close(&c.read().await.unwrap(), &[1.0, 0.0, 0.0, 1.0]);

    let b3_values: [f64; 9] = [2.0, 0.0, 1.0, -1.0, 3.0, 0.0, 0.0, 1.0, 1.0];
    let b3 = engine
        .matrix_with_values(3, 3, MatrixDataType::F64, &b3_values)
        .unwrap();
    let a = engine
        .matrix_with_values(
            3,
            3,
            MatrixDataType::F64,
            &[1.0, 4.0, 7.0, 2.0, 5.0, 8.0, 3.0, 6.0, 10.0],
        )
        .unwrap();

    // (A B) B^-1 comes back to A
    let product = a.expr().times(&b3.expr()).unwrap();
    let recovered = product.times(&b3.expr().inverse().unwrap()).unwrap();
    let out = engine.matrix(3, 3, MatrixDataType::F64).unwrap();
    out.set_to(&recovered).await.unwrap();
    assert_close(
        &out.read().await.unwrap(),
        &[1.0, 4.0, 7.0, 2.0, 5.0, 8.0, 3.0, 6.0, 10.0],
    );
}
