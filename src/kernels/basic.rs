//! Basic dense matrix kernels
//!
//! All buffers are column-major; `stride` is the distance between the starts of
//! two consecutive columns, in elements. Shapes are validated before dispatch, so
//! the kernels here trust their headers.

use crate::datatype::Scalar;
use crate::errors::OperationError;
use crate::operation::{OperationArgs, OperationHeader};

/// Fill the matrix with a constant value
pub fn fill<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    _inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let OperationArgs::Fill { value } = header.custom else {
        return Err(OperationError::MissingArguments("fill"));
    };
    let value = T::from_f64(value);

    // memset-like fast path for contiguous outputs
    if rows * columns == output.len() {
        output.fill(value);
        return Ok(());
    }

    for j in 0..columns {
        let oj = j * stride;
        output[oj..oj + rows].fill(value);
    }
    Ok(())
}

/// Copy matrix
pub fn copy<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let istride = header.stride_of_inputs[0];
    let input = inputs[0];

    // memcpy-like fast path for contiguous buffers
    if output.len() == input.len() && rows * columns == output.len() {
        output.copy_from_slice(input);
        return Ok(());
    }

    for j in 0..columns {
        let oj = j * stride;
        let ij = j * istride;
        output[oj..oj + rows].copy_from_slice(&input[ij..ij + rows]);
    }
    Ok(())
}

/// Transpose matrix
pub fn transpose<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let istride = header.stride_of_inputs[0];
    let input = inputs[0];

    for i in 0..rows {
        let ii = i * istride;
        for j in 0..columns {
            output[j * stride + i] = input[ii + j];
        }
    }
    Ok(())
}

/// Add two matrices
pub fn add<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let (a, b) = (inputs[0], inputs[1]);

    for j in 0..columns {
        let (oj, aj, bj) = (j * stride, j * stride_a, j * stride_b);
        for i in 0..rows {
            output[oj + i] = a[aj + i] + b[bj + i];
        }
    }
    Ok(())
}

/// Subtract two matrices
pub fn subtract<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let (a, b) = (inputs[0], inputs[1]);

    for j in 0..columns {
        let (oj, aj, bj) = (j * stride, j * stride_a, j * stride_b);
        for i in 0..rows {
            output[oj + i] = a[aj + i] - b[bj + i];
        }
    }
    Ok(())
}

/// Multiply two matrices, C = A B
pub fn multiply<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let (columns_a, columns_b) = (header.columns_of_inputs[0], header.columns_of_inputs[1]);
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let (a, b) = (inputs[0], inputs[1]);

    clear(output, rows, columns, stride);

    // the contraction index stays in the outer loops for cache locality: both
    // A and C are walked down their columns in the innermost loop
    for k in 0..columns_b {
        let (ok, bk) = (k * stride, k * stride_b);
        for j in 0..columns_a {
            let (aj, bjk) = (j * stride_a, b[bk + j]);
            for i in 0..rows {
                output[ok + i] += a[aj + i] * bjk;
            }
        }
    }
    Ok(())
}

/// Multiply transposing the left operand, C = A^T B
pub fn multiplylt<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let stride = header.stride;
    let (columns_a, columns_b) = (header.columns_of_inputs[0], header.columns_of_inputs[1]);
    let rows_b = header.rows_of_inputs[1];
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let (a, b) = (inputs[0], inputs[1]);

    for k in 0..columns_b {
        let (ok, bk) = (k * stride, k * stride_b);
        for j in 0..columns_a {
            let aj = j * stride_a;
            let mut sum = T::ZERO;
            for i in 0..rows_b {
                sum += a[aj + i] * b[bk + i];
            }
            output[ok + j] = sum;
        }
    }
    Ok(())
}

/// Multiply transposing the right operand, C = A B^T
pub fn multiplyrt<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let columns_a = header.columns_of_inputs[0];
    let rows_b = header.rows_of_inputs[1];
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let (a, b) = (inputs[0], inputs[1]);

    clear(output, rows, columns, stride);

    for j in 0..columns_a {
        let (aj, bj) = (j * stride_a, j * stride_b);
        for k in 0..rows_b {
            let (ok, bkj) = (k * stride, b[bj + k]);
            for i in 0..rows {
                output[ok + i] += a[aj + i] * bkj;
            }
        }
    }
    Ok(())
}

/// Multiply by a column vector, y = A x
pub fn multiplyvec<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let irows = header.rows_of_inputs[0];
    let icolumns = header.columns_of_inputs[0];
    let istride = header.stride_of_inputs[0];
    let (a, x) = (inputs[0], inputs[1]);

    output[..irows].fill(T::ZERO);

    for j in 0..icolumns {
        let (aj, xj) = (j * istride, x[j]);
        for i in 0..irows {
            output[i] += a[aj + i] * xj;
        }
    }
    Ok(())
}

/// Multiply by a constant
pub fn scale<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let istride = header.stride_of_inputs[0];
    let OperationArgs::Scale { factor } = header.custom else {
        return Err(OperationError::MissingArguments("scale"));
    };
    let factor = T::from_f64(factor);
    let input = inputs[0];

    for j in 0..columns {
        let (oj, ij) = (j * stride, j * istride);
        for i in 0..rows {
            output[oj + i] = input[ij + i] * factor;
        }
    }
    Ok(())
}

/// Component-wise multiplication
pub fn compmult<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let (a, b) = (inputs[0], inputs[1]);

    for j in 0..columns {
        let (oj, aj, bj) = (j * stride, j * stride_a, j * stride_b);
        for i in 0..rows {
            output[oj + i] = a[aj + i] * b[bj + i];
        }
    }
    Ok(())
}

/// Outer product of an m x 1 vector by a 1 x n vector
pub fn outer<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let stride_b = header.stride_of_inputs[1];
    let (a, b) = (inputs[0], inputs[1]);

    for j in 0..columns {
        let (oj, bj) = (j * stride, b[j * stride_b]);
        for i in 0..rows {
            output[oj + i] = a[i] * bj;
        }
    }
    Ok(())
}

/// Fused linear combination, C = alpha A + beta B
///
/// The output is allowed to alias either input; the dispatcher snapshots the
/// inputs before the call, so there is nothing special to do here.
pub fn addinplace<T: Scalar>(
    header: &OperationHeader,
    output: &mut [T],
    inputs: &[&[T]],
) -> Result<(), OperationError> {
    let (rows, columns, stride) = (header.rows, header.columns, header.stride);
    let (stride_a, stride_b) = (header.stride_of_inputs[0], header.stride_of_inputs[1]);
    let OperationArgs::AddInPlace { alpha, beta } = header.custom else {
        return Err(OperationError::MissingArguments("addinplace"));
    };
    let (alpha, beta) = (T::from_f64(alpha), T::from_f64(beta));
    let (a, b) = (inputs[0], inputs[1]);

    for j in 0..columns {
        let (oj, aj, bj) = (j * stride, j * stride_a, j * stride_b);
        for i in 0..rows {
            output[oj + i] = alpha * a[aj + i] + beta * b[bj + i];
        }
    }
    Ok(())
}

/// Zeroes a strided output, with a fast path for the contiguous case
fn clear<T: Scalar>(output: &mut [T], rows: usize, columns: usize, stride: usize) {
    if rows * columns == output.len() {
        output.fill(T::ZERO);
        return;
    }
    for j in 0..columns {
        let oj = j * stride;
        output[oj..oj + rows].fill(T::ZERO);
    }
}
