//! Solvers for linear systems of equations

use super::qr;
use crate::datatype::Scalar;
use crate::errors::OperationError;
use crate::operation::{OperationArgs, OperationHeader, QrMode};

/// Back-substitution: solves R x = b for x, where R is n x n upper triangular
///
/// Takes a single n x (n+1) input of the form [ b | R ]. The diagonal of R is
/// not checked: a zero pivot shows up as NaN or infinity in the solution, it is
/// the caller's job to feed a well conditioned system.
pub fn backsub<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns) = (header.rows, header.columns);
    let input = inputs[0];
    let irows = header.rows_of_inputs[0];
    let icolumns = header.columns_of_inputs[0];
    let istride = header.stride_of_inputs[0];

    if icolumns != irows + 1 {
        return Err(OperationError::BacksubShape {
            rows: irows,
            columns: icolumns,
        });
    }
    if rows != irows || columns != 1 {
        return Err(OperationError::BacksubOutputShape {
            expected: irows,
            rows,
            columns,
        });
    }

    // b is the first column of the input, R starts one column in
    let n = irows;
    let b = |i: usize| input[i];
    let r = |i: usize, j: usize| input[istride * (j + 1) + i];

    output[n - 1] = b(n - 1) / r(n - 1, n - 1);
    for j in (0..n - 1).rev() {
        let mut xj = b(j);
        for i in j + 1..n {
            xj -= output[i] * r(j, i);
        }
        output[j] = xj / r(j, j);
    }
    Ok(())
}

/// Least-squares solution of A x = b, where A is m x n, b is m x 1 and m >= n
///
/// Runs the reduced-Q'x QR mode on [ A | b ] to get [ Q'b | R ] in a scratch
/// buffer, then back-substitutes on its top n x (n+1) block (the bottom rows are
/// zeros).
pub fn lssolve<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (m, n) = (header.rows_of_inputs[0], header.columns_of_inputs[0]);
    let dtype = header.dtype;
    let mut tmp = vec![T::ZERO; m * (n + 1)];

    // find [ Q'b | R ] with the reduced QR of A
    let mut qr_header = OperationHeader::raw("qr", dtype, m, n + 1, m);
    qr_header.rows_of_inputs = header.rows_of_inputs.clone();
    qr_header.columns_of_inputs = header.columns_of_inputs.clone();
    qr_header.stride_of_inputs = header.stride_of_inputs.clone();
    qr_header.length = tmp.len();
    qr_header.custom = OperationArgs::Qr {
        mode: QrMode::ReducedQtX,
    };
    qr::qr(&qr_header, &mut tmp, inputs)?;

    // solve R x = Q'b for x on the top n x (n+1) block of [ Q'b | R ]
    let mut bs_header = OperationHeader::raw("backsub", dtype, n, 1, header.stride);
    bs_header.rows_of_inputs = vec![n];
    bs_header.columns_of_inputs = vec![n + 1];
    bs_header.stride_of_inputs = vec![m];
    bs_header.length = output.len();
    backsub(&bs_header, output, &[&tmp])
}
