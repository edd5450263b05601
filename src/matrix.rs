//! The matrix value type
//!
//! A [`Matrix`] is a cheap-to-clone handle: shape and dtype plus a view into a
//! shared storage arena, and a handle to the engine it belongs to. Two clones of
//! the same matrix are the *same* matrix (identity is the shared allocation, not
//! the contents); views created with [`Matrix::block`] or [`Matrix::diagonal`]
//! are distinct matrices over the same arena.
//!
//! Everything that reads or writes entries goes through the engine's queue, so a
//! read issued after a write is guaranteed to observe it.

use crate::buffer::{self, MatrixBuffer};
use crate::datatype::MatrixDataType;
use crate::engine::EngineShared;
use crate::errors::MatrixError;
use crate::expression::MatrixExpr;
use crate::operation::MatrixOperation;
use std::sync::Arc;

pub(crate) struct MatrixInner {
    rows: usize,
    columns: usize,
    stride: usize,
    dtype: MatrixDataType,
    buffer: MatrixBuffer,
    engine: Arc<EngineShared>,
}

/// A dense column-major matrix handle
#[derive(Clone)]
pub struct Matrix {
    inner: Arc<MatrixInner>,
}

impl Matrix {
    /// Allocates a fresh matrix on its own arena, optionally initialized with
    /// column-major `values`
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        rows: usize,
        columns: usize,
        dtype: MatrixDataType,
        values: Option<&[f64]>,
    ) -> Result<Matrix, MatrixError> {
        if rows == 0 || columns == 0 {
            return Err(MatrixError::InvalidDimensions { rows, columns });
        }
        if let Some(values) = values {
            if values.len() != rows * columns {
                return Err(MatrixError::IncorrectLength {
                    rows,
                    columns,
                    found: values.len(),
                });
            }
        }

        // freshly allocated matrices are always tightly packed
        let stride = rows;
        let buffer = MatrixBuffer::new(dtype, stride * columns, values)?;
        Matrix::from_parts(engine, rows, columns, stride, buffer)
    }

    /// Wraps an existing buffer view in a matrix
    pub(crate) fn from_parts(
        engine: Arc<EngineShared>,
        rows: usize,
        columns: usize,
        stride: usize,
        buffer: MatrixBuffer,
    ) -> Result<Matrix, MatrixError> {
        if rows == 0 || columns == 0 {
            return Err(MatrixError::InvalidDimensions { rows, columns });
        }
        if stride < rows {
            return Err(MatrixError::InvalidStride { stride, rows });
        }

        let addressed = (columns - 1) * stride + rows;
        if addressed > buffer.len() {
            return Err(MatrixError::BufferTooShort {
                rows,
                columns,
                stride,
                length: buffer.len(),
            });
        }

        Ok(Matrix {
            inner: Arc::new(MatrixInner {
                rows,
                columns,
                stride,
                dtype: buffer.dtype(),
                buffer,
                engine,
            }),
        })
    }

    pub fn rows(&self) -> usize {
        self.inner.rows
    }

    pub fn columns(&self) -> usize {
        self.inner.columns
    }

    /// Distance between the starts of two consecutive columns, in elements
    pub fn stride(&self) -> usize {
        self.inner.stride
    }

    pub fn dtype(&self) -> MatrixDataType {
        self.inner.dtype
    }

    /// Whether `self` and `other` are the same matrix (same handle, not just
    /// equal contents)
    pub fn same(&self, other: &Matrix) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn buffer(&self) -> &MatrixBuffer {
        &self.inner.buffer
    }

    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.inner.engine
    }

    pub(crate) fn lock(&self) {
        self.inner.buffer.lock();
    }

    pub(crate) fn unlock(&self) {
        self.inner.buffer.unlock();
    }

    /// A writable view over the given sub-block (inclusive ranges)
    ///
    /// Waits until no operation is touching the arena before carving the view.
    pub async fn block(
        &self,
        first_row: usize,
        last_row: usize,
        first_column: usize,
        last_column: usize,
    ) -> Result<Matrix, MatrixError> {
        let (rows, columns, stride) = (self.rows(), self.columns(), self.stride());
        if first_row > last_row
            || last_row >= rows
            || first_column > last_column
            || last_column >= columns
        {
            return Err(MatrixError::InvalidBlock {
                first_row,
                last_row,
                first_column,
                last_column,
                rows,
                columns,
            });
        }

        let block_rows = last_row - first_row + 1;
        let block_columns = last_column - first_column + 1;
        let begin = first_column * stride + first_row;
        let length = (block_columns - 1) * stride + block_rows;

        let buffer = self.inner.buffer.shared(begin, length).await?;
        Matrix::from_parts(
            Arc::clone(&self.inner.engine),
            block_rows,
            block_columns,
            stride,
            buffer,
        )
    }

    /// The i-th row, as a 1 x columns view
    pub async fn row(&self, index: usize) -> Result<Matrix, MatrixError> {
        self.block(index, index, 0, self.columns() - 1).await
    }

    /// The j-th column, as a rows x 1 view
    pub async fn column(&self, index: usize) -> Result<Matrix, MatrixError> {
        self.block(0, self.rows() - 1, index, index).await
    }

    /// The main diagonal, as a 1 x min(rows, columns) view with stride + 1
    pub async fn diagonal(&self) -> Result<Matrix, MatrixError> {
        let stride = self.stride();
        let entries = self.rows().min(self.columns());
        let length = (entries - 1) * (stride + 1) + 1;

        let buffer = self.inner.buffer.shared(0, length).await?;
        Matrix::from_parts(
            Arc::clone(&self.inner.engine),
            1,
            entries,
            stride + 1,
            buffer,
        )
    }

    /// Waits for every operation previously scheduled on this matrix
    ///
    /// Implemented by pushing a no-op through the queue: when it resolves,
    /// everything submitted before it has run.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let operation = MatrixOperation::nop(&self.inner.engine.registry, self)?;
        self.inner
            .engine
            .queue
            .enqueue(operation, self.clone(), Vec::new())
            .await?;
        Ok(())
    }

    /// Reads the entries, in column-major order, as `f64`
    pub async fn read(&self) -> anyhow::Result<Vec<f64>> {
        self.sync().await?;
        self.inner.buffer.ready().await;

        let (rows, columns, stride, dtype) =
            (self.rows(), self.columns(), self.stride(), self.dtype());
        Ok(self.inner.buffer.with_bytes(|bytes| {
            let mut entries = Vec::with_capacity(rows * columns);
            for j in 0..columns {
                for i in 0..rows {
                    entries.push(buffer::decode(dtype, bytes, j * stride + i));
                }
            }
            entries
        }))
    }

    /// Reads a single entry
    pub async fn at(&self, row: usize, column: usize) -> anyhow::Result<f64> {
        if row >= self.rows() || column >= self.columns() {
            return Err(MatrixError::InvalidBlock {
                first_row: row,
                last_row: row,
                first_column: column,
                last_column: column,
                rows: self.rows(),
                columns: self.columns(),
            }
            .into());
        }

        self.sync().await?;
        self.inner.buffer.ready().await;

        let (stride, dtype) = (self.stride(), self.dtype());
        Ok(self
            .inner
            .buffer
            .with_bytes(|bytes| buffer::decode(dtype, bytes, column * stride + row)))
    }

    /// Fills the matrix with a constant and waits for it
    pub async fn fill(&self, value: f64) -> anyhow::Result<()> {
        let operation = MatrixOperation::fill(&self.inner.engine.registry, self, value)?;
        self.inner
            .engine
            .queue
            .enqueue(operation, self.clone(), Vec::new())
            .await?;
        Ok(())
    }

    /// Fills the matrix with a constant without waiting: the operation is
    /// queued and this returns immediately. A later `read()` will observe it.
    pub fn fill_sync(&self, value: f64) -> Result<(), MatrixError> {
        let operation = MatrixOperation::fill(&self.inner.engine.registry, self, value)?;
        drop(
            self.inner
                .engine
                .queue
                .submit(operation, self.clone(), Vec::new()),
        );
        Ok(())
    }

    /// Evaluates `expr` and writes the result into this matrix
    pub async fn set_to(&self, expr: &MatrixExpr) -> anyhow::Result<()> {
        expr.assign_to(self).await
    }

    /// This matrix as a leaf expression
    pub fn expr(&self) -> MatrixExpr {
        MatrixExpr::from(self)
    }
}

impl std::fmt::Debug for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows())
            .field("columns", &self.columns())
            .field("stride", &self.stride())
            .field("dtype", &self.dtype())
            .finish()
    }
}
