use matrix_calc::{MatrixDataType, MatrixEngine};
use ndarray::{array, Array2, ShapeBuilder};

/// Wraps column-major entries read from a matrix into an ndarray
fn to_nd(rows: usize, columns: usize, entries: &[f64]) -> Array2<f64> {
    Array2::from_shape_vec((rows, columns).f(), entries.to_vec()).unwrap()
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
            (f - e).abs() < 1e-9,
            "expected {:?}, found {:?}",
            expected,
            found
        );
    }
}

#[tokio::test]
async fn multiplying_by_the_identity_changes_nothing() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 3.0, 2.0, 4.0])
        .unwrap();
    let eye = engine.eye(2, MatrixDataType::F64).unwrap();
    let c = engine.matrix(2, 2, MatrixDataType::F64).unwrap();

    c.set_to(&a.expr().times(&eye.expr()).unwrap()).await.unwrap();

    assert_close(&c.read().await.unwrap(), &[1.0, 3.0, 2.0, 4.0]);
}

#[tokio::test]
async fn expression_arithmetic_matches_ndarray() {
    let engine = MatrixEngine::new().await;
    let a_nd = array![[1.0, -2.0], [0.5, 3.0], [4.0, 1.0]];
    let b_nd = array![[2.0, 2.0], [-1.0, 0.0], [3.0, -3.0]];

    let a = engine
        .matrix_with_values(3, 2, MatrixDataType::F64, &[1.0, 0.5, 4.0, -2.0, 3.0, 1.0])
        .unwrap();
    let b = engine
        .matrix_with_values(3, 2, MatrixDataType::F64, &[2.0, -1.0, 3.0, 2.0, 0.0, -3.0])
        .unwrap();

    // ((a + b) .* b - a) * 2
    let expr = a
        .expr()
        .plus(&b.expr())
        .unwrap()
        .comp_mult(&b.expr())
        .unwrap()
        .minus(&a.expr())
        .unwrap()
        .times_scalar(2.0)
        .unwrap();

    let c = engine.matrix(3, 2, MatrixDataType::F64).unwrap();
    c.set_to(&expr).await.unwrap();

    let expected = ((&a_nd + &b_nd) * &b_nd - &a_nd) * 2.0;
    let found = to_nd(3, 2, &c.read().await.unwrap());
    assert_nd_close(&found, &expected, 1e-9);
}

#[tokio::test]
async fn products_match_ndarray() {
    let engine = MatrixEngine::new().await;
    let a_nd = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
    let b_nd = array![[1.0, 0.5], [-1.0, 2.0], [0.0, 1.0]];

    let a = engine
        .matrix_with_values(2, 3, MatrixDataType::F64, &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0])
        .unwrap();
    let b = engine
        .matrix_with_values(3, 2, MatrixDataType::F64, &[1.0, -1.0, 0.0, 0.5, 2.0, 1.0])
        .unwrap();

    // plain product
    let c = engine.matrix(2, 2, MatrixDataType::F64).unwrap();
    c.set_to(&a.expr().times(&b.expr()).unwrap()).await.unwrap();
    assert_nd_close(&to_nd(2, 2, &c.read().await.unwrap()), &a_nd.dot(&b_nd), 1e-9);

    // transposed products go through their own kernels and must agree
    let ct = engine.matrix(3, 3, MatrixDataType::F64).unwrap();
    ct.set_to(&a.expr().transpose().unwrap().times(&a.expr()).unwrap())
        .await
        .unwrap();
    assert_nd_close(
        &to_nd(3, 3, &ct.read().await.unwrap()),
        &a_nd.t().dot(&a_nd),
        1e-9,
    );

    let crt = engine.matrix(2, 2, MatrixDataType::F64).unwrap();
    crt.set_to(&a.expr().times(&a.expr().transpose().unwrap()).unwrap())
        .await
        .unwrap();
    assert_nd_close(
        &to_nd(2, 2, &crt.read().await.unwrap()),
        &a_nd.dot(&a_nd.t()),
        1e-9,
    );

    // matrix by column vector
    let x = engine
        .matrix_with_values(3, 1, MatrixDataType::F64, &[1.0, 2.0, -1.0])
        .unwrap();
    let y = engine.matrix(2, 1, MatrixDataType::F64).unwrap();
    y.set_to(&a.expr().times(&x.expr()).unwrap()).await.unwrap();
    assert_close(&y.read().await.unwrap(), &[2.0, 8.0]);

    // outer product of a column by a row
    let u = engine
        .matrix_with_values(2, 1, MatrixDataType::F64, &[1.0, 2.0])
        .unwrap();
    let v = engine
        .matrix_with_values(1, 3, MatrixDataType::F64, &[3.0, 4.0, 5.0])
        .unwrap();
    let w = engine.matrix(2, 3, MatrixDataType::F64).unwrap();
    w.set_to(&u.expr().times(&v.expr()).unwrap()).await.unwrap();
    assert_close(&w.read().await.unwrap(), &[3.0, 6.0, 4.0, 8.0, 5.0, 10.0]);
}

#[tokio::test]
async fn a_read_issued_after_a_write_observes_it() {
    let engine = MatrixEngine::new().await;
    let a = engine.matrix(8, 8, MatrixDataType::F64).unwrap();

    // detached write: not awaited, but queued before the read
    a.fill_sync(7.0).unwrap();

    let entries = a.read().await.unwrap();
    assert!(entries.iter().all(|&x| x == 7.0));
}

#[tokio::test]
async fn views_share_storage_with_their_parent() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(
            3,
            3,
            MatrixDataType::F64,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        )
        .unwrap();

    // writing through a block shows up in the parent
    let bottom_right = a.block(1, 2, 1, 2).await.unwrap();
    bottom_right.fill(0.0).await.unwrap();
    assert_close(
        &a.read().await.unwrap(),
        &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 7.0, 0.0, 0.0],
    );

    // the diagonal is a strided view over the same data
    let diagonal = a.diagonal().await.unwrap();
    assert_close(&diagonal.read().await.unwrap(), &[1.0, 0.0, 0.0]);

    // rows and columns are 1 x n and n x 1 views
    let row = a.row(0).await.unwrap();
    assert_close(&row.read().await.unwrap(), &[1.0, 4.0, 7.0]);
    let column = a.column(0).await.unwrap();
    assert_close(&column.read().await.unwrap(), &[1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn block_sub_expressions_compile_and_run() {
    let engine = MatrixEngine::new().await;
    let a = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    let b = engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[5.0, 6.0, 7.0, 8.0])
        .unwrap();

    // take the first column of (a + b) without materializing anything extra
    let sum_column = a.expr().plus(&b.expr()).unwrap().column(0).unwrap();
    let c = engine.matrix(2, 1, MatrixDataType::F64).unwrap();
    c.set_to(&sum_column).await.unwrap();

    assert_close(&c.read().await.unwrap(), &[6.0, 8.0]);
}

#[tokio::test]
async fn big_products_cross_the_worker_and_come_back_right() {
    let engine = MatrixEngine::new().await;
    let n = 50;

    // 3 n^2 elements is far beyond the local-dispatch threshold
    let a_values: Vec<f64> = (0..n * n).map(|i| ((i * 7 + 3) % 11) as f64 - 5.0).collect();
    let b_values: Vec<f64> = (0..n * n).map(|i| ((i * 5 + 1) % 13) as f64 - 6.0).collect();

    let a = engine
        .matrix_with_values(n, n, MatrixDataType::F64, &a_values)
        .unwrap();
    let b = engine
        .matrix_with_values(n, n, MatrixDataType::F64, &b_values)
        .unwrap();
    let c = engine.matrix(n, n, MatrixDataType::F64).unwrap();

    c.set_to(&a.expr().times(&b.expr()).unwrap()).await.unwrap();

    let a_nd = to_nd(n, n, &a_values);
    let b_nd = to_nd(n, n, &b_values);
    let found = to_nd(n, n, &c.read().await.unwrap());
    assert_nd_close(&found, &a_nd.dot(&b_nd), 1e-6);
}

#[tokio::test]
async fn construction_errors_are_caught_early() {
    let engine = MatrixEngine::new().await;

    assert!(engine.matrix(0, 3, MatrixDataType::F64).is_err());
    assert!(engine
        .matrix_with_values(2, 2, MatrixDataType::F64, &[1.0, 2.0, 3.0])
        .is_err());

    let a = engine.matrix(2, 3, MatrixDataType::F64).unwrap();
    let b = engine.matrix(3, 3, MatrixDataType::F64).unwrap();

    // shape mismatches surface while building the expression
    assert!(a.expr().plus(&b.expr()).is_err());
    assert!(b.expr().times(&a.expr()).is_err());

    // mixed precisions don't combine
    let c = engine.matrix(2, 3, MatrixDataType::F32).unwrap();
    assert!(a.expr().plus(&c.expr()).is_err());

    // out-of-range access
    assert!(a.at(5, 0).await.is_err());
    assert!(a.block(0, 2, 0, 1).await.is_err());
}

#[tokio::test]
async fn fill_and_at_work_together() {
    let engine = MatrixEngine::new().await;
    let a = engine.matrix(3, 2, MatrixDataType::F32).unwrap();

    a.fill(2.5).await.unwrap();
    assert_eq!(a.at(2, 1).await.unwrap(), 2.5);

    let eye = engine.eye(3, MatrixDataType::F32).unwrap();
    assert_eq!(eye.at(1, 1).await.unwrap(), 1.0);
    assert_eq!(eye.at(2, 0).await.unwrap(), 0.0);
}
