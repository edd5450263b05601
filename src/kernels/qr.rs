//! Householder QR decomposition
//!
//! One kernel, five modes. The output buffer always carries the upper triangular
//! factor in its trailing columns; what lands in the leading columns depends on
//! the mode: the unitary factor (full or reduced), or the input vector with the
//! reflectors applied to it (`Q'x`, `Qx`, `reduced-Q'x`).

use super::{dot, norm2};
use crate::datatype::Scalar;
use crate::errors::OperationError;
use crate::operation::{OperationArgs, OperationHeader, QrMode};

/// QR decomposition; the output becomes [ Q | R ], [ Q'x | R ] or [ Qx | R ]
pub fn qr<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let stride = header.stride;
    let (orows, ocolumns) = (header.rows, header.columns);
    let irows = header.rows_of_inputs[0];
    let icolumns = header.columns_of_inputs[0];
    let istride = header.stride_of_inputs[0];
    let input = inputs[0];
    let OperationArgs::Qr { mode } = header.custom else {
        return Err(OperationError::MissingArguments("qr"));
    };
    let want_matrices = matches!(mode, QrMode::FullQr | QrMode::ReducedQr);

    // input matrix is m x n and should be such that m >= n
    if irows < icolumns {
        return Err(OperationError::QrShape {
            rows: irows,
            columns: icolumns,
        });
    }
    if orows != irows {
        return Err(OperationError::QrOutputShape {
            expected_rows: irows,
            expected_columns: ocolumns,
            rows: orows,
            columns: ocolumns,
        });
    }

    // the reflection vectors, one per column of the input
    let mut reflect = vec![T::ZERO; irows * icolumns];

    // the upper triangular factor R lives in the trailing columns of the output
    let rstride = stride;
    let rbase = if !want_matrices {
        stride
    } else if mode == QrMode::ReducedQr {
        icolumns * stride
    } else {
        irows * stride
    };

    // copy input[:,:] to triangular[:,:]
    for j in 0..icolumns {
        let (rj, ij) = (rbase + j * rstride, j * istride);
        output[rj..rj + irows].copy_from_slice(&input[ij..ij + irows]);
    }

    // compute the reflection vectors and the upper triangular matrix R
    for k in 0..icolumns {
        let fkk = k * irows + k; // reflector index
        let rkk = rbase + k * rstride + k; // upper-triangular R
        let n = irows - k; // the k-th reflection vector has n components
        let sign = if output[rkk] >= T::ZERO { T::ONE } else { -T::ONE };

        // use reflect[k.., k] to temporarily store the k-th reflection vector
        for i in 0..n {
            reflect[fkk + i] = output[rkk + i];
        }
        let pivot_norm = norm2(&reflect[fkk..fkk + n]);
        reflect[fkk] += sign * pivot_norm; // 1st coordinate

        // normalize the k-th reflection vector
        let norm = norm2(&reflect[fkk..fkk + n]);
        for i in 0..n {
            reflect[fkk + i] = reflect[fkk + i] / norm;
        }

        // apply the Householder reflector to the trailing columns of R,
        // triangular[k.., j] -= 2 (v . triangular[k.., j]) v
        for j in k..icolumns {
            let cj = rbase + j * rstride + k;
            let mut d = T::ZERO;
            for i in 0..n {
                d += reflect[fkk + i] * output[cj + i];
            }
            let d2 = d + d;
            for i in 0..n {
                output[cj + i] -= d2 * reflect[fkk + i];
            }
        }
    }

    // compute the unitary matrix Q, or apply the reflectors to x
    match mode {
        // full QR: Q is m x m, R is m x n
        QrMode::FullQr => {
            if ocolumns != icolumns + irows {
                return Err(OperationError::QrOutputShape {
                    expected_rows: irows,
                    expected_columns: icolumns + irows,
                    rows: orows,
                    columns: ocolumns,
                });
            }
            compute_unitary(output, &reflect, stride, irows, icolumns, irows);
        }

        // reduced QR: Q is m x n, R is n x n
        QrMode::ReducedQr => {
            if ocolumns != icolumns + icolumns {
                return Err(OperationError::QrOutputShape {
                    expected_rows: irows,
                    expected_columns: icolumns + icolumns,
                    rows: orows,
                    columns: ocolumns,
                });
            }
            compute_unitary(output, &reflect, stride, irows, icolumns, icolumns);
        }

        // y = Q'x: the reflectors are applied in ascending order
        QrMode::QtX => {
            let (m, n) = (irows, icolumns);
            check_vector_shapes(header, m, n)?;
            let x = inputs[1];
            output[..m].copy_from_slice(&x[..m]);

            for k in 0..n {
                let fk = k * irows;
                apply_reflector(&mut output[..m], &reflect[fk..], k);
            }
        }

        // y = Qx: the reflectors are applied in descending order
        QrMode::QX => {
            let (m, n) = (irows, icolumns);
            check_vector_shapes(header, m, n)?;
            let x = inputs[1];
            output[..m].copy_from_slice(&x[..m]);

            for k in (0..n).rev() {
                let fk = k * irows;
                apply_reflector(&mut output[..m], &reflect[fk..], k);
            }
        }

        // y = Q'x via the reduced factor: y[j] = x . (Q e_j), j < n
        QrMode::ReducedQtX => {
            let (m, n) = (irows, icolumns);
            check_vector_shapes(header, m, n)?;
            let x = inputs[1];
            let mut e = vec![T::ZERO; m];

            for j in 0..n {
                e.fill(T::ZERO);
                e[j] = T::ONE;

                // compute Q e_j = ( Q_1 ... Q_n ) e_j
                for k in (0..n).rev() {
                    let fk = k * irows;
                    apply_reflector(&mut e, &reflect[fk..], k);
                }

                output[j] = dot(&x[..m], &e);
            }
        }
    }

    Ok(())
}

/// Applies Householder reflectors to the basis vectors e_1 .. e_q, writing the
/// resulting unitary factor in the first q columns of the output
fn compute_unitary<T: Scalar>(
    output: &mut [T],
    reflect: &[T],
    stride: usize,
    irows: usize,
    icolumns: usize,
    qcolumns: usize,
) {
    output[..stride * qcolumns].fill(T::ZERO);

    for j in 0..qcolumns {
        let qj = j * stride;
        output[qj + j] = T::ONE; // e_j = [ 0 0 ... 1 ... 0 0 ]^T

        // compute Q e_j = ( Q_1 ... Q_n ) e_j
        for k in (0..icolumns).rev() {
            let fk = k * irows;
            apply_reflector(&mut output[qj..qj + irows], &reflect[fk..fk + irows], k);
        }
    }
}

/// One reflector step, y[k..] -= 2 (v[k..] . y[k..]) v[k..]
fn apply_reflector<T: Scalar>(y: &mut [T], v: &[T], k: usize) {
    let m = y.len();
    let mut d = T::ZERO;
    for i in k..m {
        d += y[i] * v[i];
    }
    let d2 = d + d;
    for i in k..m {
        y[i] -= d2 * v[i];
    }
}

/// Shared shape validation for the vector modes
fn check_vector_shapes(
    header: &OperationHeader,
    m: usize,
    n: usize,
) -> Result<(), OperationError> {
    let xrows = header.rows_of_inputs[1];
    let xcolumns = header.columns_of_inputs[1];

    if m != xrows || xcolumns != 1 {
        return Err(OperationError::QrOutputShape {
            expected_rows: m,
            expected_columns: 1,
            rows: xrows,
            columns: xcolumns,
        });
    }
    if m != header.rows || header.columns != 1 + n {
        return Err(OperationError::QrOutputShape {
            expected_rows: m,
            expected_columns: 1 + n,
            rows: header.rows,
            columns: header.columns,
        });
    }
    Ok(())
}
