//! Closed-form inverse of small square matrices

use crate::datatype::Scalar;
use crate::errors::OperationError;
use crate::operation::OperationHeader;

/// Inverse of a square matrix up to 3 x 3
///
/// Singular inputs are not detected, the division by a zero determinant shows up
/// as infinities in the output.
pub fn inverse<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns) = (header.rows_of_inputs[0], header.columns_of_inputs[0]);

    match (rows, columns) {
        (1, 1) => inverse1(header, output, inputs),
        (2, 2) => inverse2(header, output, inputs),
        (3, 3) => inverse3(header, output, inputs),
        _ => {
            return Err(OperationError::ShapeMismatch {
                method: "inverse".to_string(),
                expected_rows: rows.min(3),
                expected_columns: rows.min(3),
                rows,
                columns,
            })
        }
    }
    Ok(())
}

fn inverse1<T: Scalar>(_header: &OperationHeader, output: &mut [T], inputs: &[&[T]]) {
    output[0] = T::ONE / inputs[0][0];
}

fn inverse2<T: Scalar>(header: &OperationHeader, output: &mut [T], inputs: &[&[T]]) {
    let stride = header.stride;
    let istride = header.stride_of_inputs[0];
    let input = inputs[0];

    let a11 = input[0];
    let a21 = input[1];
    let a12 = input[istride];
    let a22 = input[1 + istride];

    let det = a11 * a22 - a12 * a21;
    let d = T::ONE / det;

    output[0] = a22 * d;
    output[1] = -a21 * d;
    output[stride] = -a12 * d;
    output[1 + stride] = a11 * d;
}

fn inverse3<T: Scalar>(header: &OperationHeader, output: &mut [T], inputs: &[&[T]]) {
    let stride = header.stride;
    let istride = header.stride_of_inputs[0];
    let input = inputs[0];

    let a11 = input[0];
    let a21 = input[1];
    let a31 = input[2];
    let a12 = input[istride];
    let a22 = input[1 + istride];
    let a32 = input[2 + istride];
    let a13 = input[istride + istride];
    let a23 = input[1 + istride + istride];
    let a33 = input[2 + istride + istride];

    // cofactors along the first column
    let b1 = a33 * a22 - a32 * a23;
    let b2 = a33 * a12 - a32 * a13;
    let b3 = a23 * a12 - a22 * a13;

    let det = a11 * b1 - a21 * b2 + a31 * b3;
    let d = T::ONE / det;

    let stride2 = stride + stride;
    output[0] = b1 * d;
    output[1] = -(a33 * a21 - a31 * a23) * d;
    output[2] = (a32 * a21 - a31 * a22) * d;
    output[stride] = -b2 * d;
    output[1 + stride] = (a33 * a11 - a31 * a13) * d;
    output[2 + stride] = -(a32 * a11 - a31 * a12) * d;
    output[stride2] = b3 * d;
    output[1 + stride2] = -(a23 * a11 - a21 * a13) * d;
    output[2 + stride2] = (a22 * a11 - a21 * a12) * d;
}
