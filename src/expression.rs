//! Lazy matrix expressions and their compilation
//!
//! Expressions are immutable trees built with the fluent methods on
//! [`MatrixExpr`]; nothing runs until [`Matrix::set_to`] is called. Compilation
//! happens in two phases: the tree is first bound to matrices (every inner node
//! gets a preallocated temporary, views get materialized), then `pack()` walks
//! it in post-order with an explicit stack and flattens it into a single
//! `sequence` operation over a distinct-matrix registry.
//!
//! Sharing a sub-expression between two parents is free: a shared node owns one
//! temporary and emits one step, however many times it appears.

use crate::datatype::MatrixDataType;
use crate::engine::EngineShared;
use crate::errors::MatrixError;
use crate::kernels::KernelRegistry;
use crate::matrix::Matrix;
use crate::operation::{MatrixOperation, SequenceStep};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryKernel {
    Transpose,
    Inverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryKernel {
    Add,
    Subtract,
    Multiply,
    MultiplyLt,
    MultiplyRt,
    MultiplyVec,
    Outer,
    CompMult,
    Ldiv,
}

enum ExprKind {
    Leaf(Matrix),
    Unary {
        kernel: UnaryKernel,
        operand: MatrixExpr,
        output: Matrix,
    },
    Binary {
        kernel: BinaryKernel,
        left: MatrixExpr,
        right: MatrixExpr,
        output: Matrix,
    },
    Scale {
        operand: MatrixExpr,
        factor: f64,
        output: Matrix,
    },
    Block {
        operand: MatrixExpr,
        first_row: usize,
        last_row: usize,
        first_column: usize,
        last_column: usize,
        view: OnceLock<Matrix>,
    },
    Diagonal {
        operand: MatrixExpr,
        view: OnceLock<Matrix>,
    },
}

struct ExprNode {
    rows: usize,
    columns: usize,
    dtype: MatrixDataType,
    kind: ExprKind,
}

/// A lazy matrix expression
///
/// Cloning is cheap and shares the node, which is what makes diamonds (one
/// sub-expression used in two places) evaluate once.
#[derive(Clone)]
pub struct MatrixExpr {
    node: Arc<ExprNode>,
}

impl MatrixExpr {
    fn wrap(rows: usize, columns: usize, dtype: MatrixDataType, kind: ExprKind) -> MatrixExpr {
        MatrixExpr {
            node: Arc::new(ExprNode {
                rows,
                columns,
                dtype,
                kind,
            }),
        }
    }

    pub fn rows(&self) -> usize {
        self.node.rows
    }

    pub fn columns(&self) -> usize {
        self.node.columns
    }

    pub fn dtype(&self) -> MatrixDataType {
        self.node.dtype
    }

    fn engine(&self) -> Arc<EngineShared> {
        match &self.node.kind {
            ExprKind::Leaf(matrix) => Arc::clone(matrix.engine()),
            ExprKind::Unary { output, .. }
            | ExprKind::Binary { output, .. }
            | ExprKind::Scale { output, .. } => Arc::clone(output.engine()),
            ExprKind::Block { operand, .. } | ExprKind::Diagonal { operand, .. } => {
                operand.engine()
            }
        }
    }

    /// Preallocates the temporary holding this node's value
    fn temp(&self, rows: usize, columns: usize) -> Result<Matrix, MatrixError> {
        Matrix::new(self.engine(), rows, columns, self.dtype(), None)
    }

    fn unary(&self, kernel: UnaryKernel, rows: usize, columns: usize) -> Result<MatrixExpr, MatrixError> {
        let output = self.temp(rows, columns)?;
        Ok(MatrixExpr::wrap(
            rows,
            columns,
            self.dtype(),
            ExprKind::Unary {
                kernel,
                operand: self.clone(),
                output,
            },
        ))
    }

    fn binary(
        &self,
        kernel: BinaryKernel,
        other: &MatrixExpr,
        rows: usize,
        columns: usize,
    ) -> Result<MatrixExpr, MatrixError> {
        if other.dtype() != self.dtype() {
            return Err(MatrixError::IncompatibleType {
                expected: self.dtype().name().to_string(),
                found: other.dtype().name().to_string(),
            });
        }

        let output = self.temp(rows, columns)?;
        Ok(MatrixExpr::wrap(
            rows,
            columns,
            self.dtype(),
            ExprKind::Binary {
                kernel,
                left: self.clone(),
                right: other.clone(),
                output,
            },
        ))
    }

    fn expect_shape(
        &self,
        method: &str,
        other: &MatrixExpr,
        rows: usize,
        columns: usize,
    ) -> Result<(), MatrixError> {
        if other.rows() != rows || other.columns() != columns {
            return Err(MatrixError::IncompatibleShape {
                method: method.to_string(),
                expected_rows: rows,
                expected_columns: columns,
                rows: other.rows(),
                columns: other.columns(),
            });
        }
        Ok(())
    }

    /// Element-wise sum
    pub fn plus(&self, other: &MatrixExpr) -> Result<MatrixExpr, MatrixError> {
        self.expect_shape("add", other, self.rows(), self.columns())?;
        self.binary(BinaryKernel::Add, other, self.rows(), self.columns())
    }

    /// Element-wise difference
    pub fn minus(&self, other: &MatrixExpr) -> Result<MatrixExpr, MatrixError> {
        self.expect_shape("subtract", other, self.rows(), self.columns())?;
        self.binary(BinaryKernel::Subtract, other, self.rows(), self.columns())
    }

    /// Matrix product
    ///
    /// Products against a transposed operand, by a column vector and outer
    /// products of two vectors are recognized here and compile to the
    /// specialized kernels, without materializing any intermediate.
    pub fn times(&self, other: &MatrixExpr) -> Result<MatrixExpr, MatrixError> {
        // A^T B without materializing A^T
        if let ExprKind::Unary {
            kernel: UnaryKernel::Transpose,
            operand,
            ..
        } = &self.node.kind
        {
            operand.expect_shape("multiplylt", other, operand.rows(), other.columns())?;
            return operand.binary(BinaryKernel::MultiplyLt, other, self.rows(), other.columns());
        }

        // A B^T without materializing B^T
        if let ExprKind::Unary {
            kernel: UnaryKernel::Transpose,
            operand,
            ..
        } = &other.node.kind
        {
            self.expect_shape("multiplyrt", operand, operand.rows(), self.columns())?;
            return self.binary(BinaryKernel::MultiplyRt, operand, self.rows(), operand.rows());
        }

        self.expect_shape("multiply", other, self.columns(), other.columns())?;

        // outer product of a column vector by a row vector
        if self.columns() == 1 && other.rows() == 1 {
            return self.binary(BinaryKernel::Outer, other, self.rows(), other.columns());
        }

        // matrix-vector product
        if other.columns() == 1 {
            return self.binary(BinaryKernel::MultiplyVec, other, self.rows(), 1);
        }

        self.binary(BinaryKernel::Multiply, other, self.rows(), other.columns())
    }

    /// Multiplication by a scalar
    pub fn times_scalar(&self, factor: f64) -> Result<MatrixExpr, MatrixError> {
        let output = self.temp(self.rows(), self.columns())?;
        Ok(MatrixExpr::wrap(
            self.rows(),
            self.columns(),
            self.dtype(),
            ExprKind::Scale {
                operand: self.clone(),
                factor,
                output,
            },
        ))
    }

    /// Component-wise product
    pub fn comp_mult(&self, other: &MatrixExpr) -> Result<MatrixExpr, MatrixError> {
        self.expect_shape("compmult", other, self.rows(), self.columns())?;
        self.binary(BinaryKernel::CompMult, other, self.rows(), self.columns())
    }

    pub fn transpose(&self) -> Result<MatrixExpr, MatrixError> {
        self.unary(UnaryKernel::Transpose, self.columns(), self.rows())
    }

    /// Closed-form inverse, only square matrices up to 3 x 3
    pub fn inverse(&self) -> Result<MatrixExpr, MatrixError> {
        if self.rows() != self.columns() || self.rows() > 3 {
            return Err(MatrixError::UnsupportedInverse {
                rows: self.rows(),
                columns: self.columns(),
            });
        }
        self.unary(UnaryKernel::Inverse, self.rows(), self.columns())
    }

    /// Least-squares solution x of `self` x = b, m equations and n unknowns
    pub fn ldiv(&self, b: &MatrixExpr) -> Result<MatrixExpr, MatrixError> {
        let (m, n) = (self.rows(), self.columns());
        if m < n {
            return Err(MatrixError::UnderdeterminedSystem {
                rows: m,
                columns: n,
            });
        }
        self.expect_shape("lssolve", b, m, 1)?;
        self.binary(BinaryKernel::Ldiv, b, n, 1)
    }

    /// Read-only view over a sub-block of this expression (inclusive ranges)
    pub fn block(
        &self,
        first_row: usize,
        last_row: usize,
        first_column: usize,
        last_column: usize,
    ) -> Result<MatrixExpr, MatrixError> {
        if first_row > last_row
            || last_row >= self.rows()
            || first_column > last_column
            || last_column >= self.columns()
        {
            return Err(MatrixError::InvalidBlock {
                first_row,
                last_row,
                first_column,
                last_column,
                rows: self.rows(),
                columns: self.columns(),
            });
        }

        Ok(MatrixExpr::wrap(
            last_row - first_row + 1,
            last_column - first_column + 1,
            self.dtype(),
            ExprKind::Block {
                operand: self.clone(),
                first_row,
                last_row,
                first_column,
                last_column,
                view: OnceLock::new(),
            },
        ))
    }

    /// Read-only view over the i-th row
    pub fn row(&self, index: usize) -> Result<MatrixExpr, MatrixError> {
        self.block(index, index, 0, self.columns() - 1)
    }

    /// Read-only view over the j-th column
    pub fn column(&self, index: usize) -> Result<MatrixExpr, MatrixError> {
        self.block(0, self.rows() - 1, index, index)
    }

    /// Read-only view over the main diagonal
    pub fn diagonal(&self) -> Result<MatrixExpr, MatrixError> {
        Ok(MatrixExpr::wrap(
            1,
            self.rows().min(self.columns()),
            self.dtype(),
            ExprKind::Diagonal {
                operand: self.clone(),
                view: OnceLock::new(),
            },
        ))
    }

    fn children(&self) -> Vec<MatrixExpr> {
        match &self.node.kind {
            ExprKind::Leaf(_) => Vec::new(),
            ExprKind::Unary { operand, .. }
            | ExprKind::Scale { operand, .. }
            | ExprKind::Block { operand, .. }
            | ExprKind::Diagonal { operand, .. } => vec![operand.clone()],
            ExprKind::Binary { left, right, .. } => vec![left.clone(), right.clone()],
        }
    }

    /// The matrix holding this node's value once evaluated
    fn output(&self) -> Result<Matrix, MatrixError> {
        match &self.node.kind {
            ExprKind::Leaf(matrix) => Ok(matrix.clone()),
            ExprKind::Unary { output, .. }
            | ExprKind::Binary { output, .. }
            | ExprKind::Scale { output, .. } => Ok(output.clone()),
            ExprKind::Block { view, .. } | ExprKind::Diagonal { view, .. } => {
                view.get().cloned().ok_or(MatrixError::ViewNotMaterialized)
            }
        }
    }

    /// Creates the matrix views behind `block()` / `diagonal()` nodes
    ///
    /// Views are carved over the operand's output matrix and each needs to
    /// await arena readiness, which is why this phase is async and runs before
    /// the synchronous tree building. Post-order, so nested views see their
    /// operand already materialized.
    pub(crate) async fn materialize_views(&self) -> Result<(), MatrixError> {
        let mut stack = vec![(self.clone(), false)];
        while let Some((expr, visited)) = stack.pop() {
            if !visited {
                stack.push((expr.clone(), true));
                for child in expr.children() {
                    stack.push((child, false));
                }
                continue;
            }

            match &expr.node.kind {
                ExprKind::Block {
                    operand,
                    first_row,
                    last_row,
                    first_column,
                    last_column,
                    view,
                } => {
                    if view.get().is_none() {
                        let matrix = operand
                            .output()?
                            .block(*first_row, *last_row, *first_column, *last_column)
                            .await?;
                        let _ = view.set(matrix);
                    }
                }
                ExprKind::Diagonal { operand, view } => {
                    if view.get().is_none() {
                        let matrix = operand.output()?.diagonal().await?;
                        let _ = view.set(matrix);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Binds every node to its operation and output matrix
    pub(crate) fn to_tree(
        &self,
        registry: &KernelRegistry,
    ) -> Result<BoundMatrixOperationTree, MatrixError> {
        match &self.node.kind {
            ExprKind::Leaf(matrix) => Ok(BoundMatrixOperationTree::leaf(matrix.clone())),

            // views are pass-through nodes: no operation of their own, but the
            // operand's operations still get emitted underneath
            ExprKind::Block { operand, .. } | ExprKind::Diagonal { operand, .. } => {
                let child = operand.to_tree(registry)?;
                BoundMatrixOperationTree::new(None, self.output()?, vec![child])
            }

            ExprKind::Unary {
                kernel,
                operand,
                output,
            } => {
                let child = operand.to_tree(registry)?;
                let input = operand.output()?;
                let operation = match kernel {
                    UnaryKernel::Transpose => MatrixOperation::transpose(registry, &input)?,
                    UnaryKernel::Inverse => MatrixOperation::inverse(registry, &input)?,
                };
                BoundMatrixOperationTree::new(Some(operation), output.clone(), vec![child])
            }

            ExprKind::Binary {
                kernel,
                left,
                right,
                output,
            } => {
                let left_tree = left.to_tree(registry)?;
                let right_tree = right.to_tree(registry)?;
                let (a, b) = (left.output()?, right.output()?);
                let operation = match kernel {
                    BinaryKernel::Add => MatrixOperation::add(registry, &a, &b)?,
                    BinaryKernel::Subtract => MatrixOperation::subtract(registry, &a, &b)?,
                    BinaryKernel::Multiply => MatrixOperation::multiply(registry, &a, &b)?,
                    BinaryKernel::MultiplyLt => MatrixOperation::multiplylt(registry, &a, &b)?,
                    BinaryKernel::MultiplyRt => MatrixOperation::multiplyrt(registry, &a, &b)?,
                    BinaryKernel::MultiplyVec => MatrixOperation::multiplyvec(registry, &a, &b)?,
                    BinaryKernel::Outer => MatrixOperation::outer(registry, &a, &b)?,
                    BinaryKernel::CompMult => MatrixOperation::compmult(registry, &a, &b)?,
                    BinaryKernel::Ldiv => MatrixOperation::lssolve(registry, &a, &b)?,
                };
                BoundMatrixOperationTree::new(
                    Some(operation),
                    output.clone(),
                    vec![left_tree, right_tree],
                )
            }

            ExprKind::Scale {
                operand,
                factor,
                output,
            } => {
                let child = operand.to_tree(registry)?;
                let operation = MatrixOperation::scale(registry, &operand.output()?, *factor)?;
                BoundMatrixOperationTree::new(Some(operation), output.clone(), vec![child])
            }
        }
    }

    /// Compiles the expression and queues it, writing the result into `target`
    pub(crate) async fn assign_to(&self, target: &Matrix) -> anyhow::Result<()> {
        if target.rows() != self.rows() || target.columns() != self.columns() {
            return Err(MatrixError::IncompatibleShape {
                method: "set_to".to_string(),
                expected_rows: self.rows(),
                expected_columns: self.columns(),
                rows: target.rows(),
                columns: target.columns(),
            }
            .into());
        }
        if target.dtype() != self.dtype() {
            return Err(MatrixError::IncompatibleType {
                expected: self.dtype().name().to_string(),
                found: target.dtype().name().to_string(),
            }
            .into());
        }

        self.materialize_views().await?;

        let engine = target.engine().clone();
        let registry = &engine.registry;

        // the root is a copy of the expression's value into the target; for a
        // plain leaf this degenerates into a one-step copy sequence
        let tree = self.to_tree(registry)?;
        let source = tree.output().clone();
        let copy = MatrixOperation::copy(registry, target, &source)?;
        let root = BoundMatrixOperationTree::new(Some(copy), target.clone(), vec![tree])?;

        let bound = root.pack(registry)?;
        if let Some(operation) = bound.operation {
            engine
                .queue
                .enqueue(operation, bound.output, bound.inputs)
                .await?;
        }
        Ok(())
    }
}

impl From<&Matrix> for MatrixExpr {
    fn from(matrix: &Matrix) -> MatrixExpr {
        MatrixExpr::wrap(
            matrix.rows(),
            matrix.columns(),
            matrix.dtype(),
            ExprKind::Leaf(matrix.clone()),
        )
    }
}

/// An operation bound to its output and input matrices
///
/// `operation` is `None` for pass-through leaves (plain matrices and views).
pub struct BoundMatrixOperation {
    pub operation: Option<MatrixOperation>,
    pub output: Matrix,
    pub inputs: Vec<Matrix>,
}

/// A tree of bound operations, mirroring the expression that built it
pub struct BoundMatrixOperationTree {
    bound: BoundMatrixOperation,
    children: Vec<BoundMatrixOperationTree>,
}

impl BoundMatrixOperationTree {
    /// Wraps `operation` and its children; the children's outputs become the
    /// operation's inputs, and the counts must agree
    pub fn new(
        operation: Option<MatrixOperation>,
        output: Matrix,
        children: Vec<BoundMatrixOperationTree>,
    ) -> Result<BoundMatrixOperationTree, MatrixError> {
        let inputs: Vec<Matrix> = children.iter().map(|c| c.bound.output.clone()).collect();
        if let Some(operation) = &operation {
            if operation.input_count() != inputs.len() {
                return Err(MatrixError::MalformedTree {
                    inputs: operation.input_count(),
                    children: inputs.len(),
                });
            }
        }

        Ok(BoundMatrixOperationTree {
            bound: BoundMatrixOperation {
                operation,
                output,
                inputs,
            },
            children,
        })
    }

    /// A pass-through node holding a plain matrix
    pub fn leaf(matrix: Matrix) -> BoundMatrixOperationTree {
        BoundMatrixOperationTree {
            bound: BoundMatrixOperation {
                operation: None,
                output: matrix,
                inputs: Vec::new(),
            },
            children: Vec::new(),
        }
    }

    pub fn output(&self) -> &Matrix {
        &self.bound.output
    }

    /// Flattens the tree into one `sequence` operation
    ///
    /// Explicit-stack post-order walk, two visits per node: children are
    /// emitted before their parent, pass-through nodes emit nothing, and a
    /// node whose output was already emitted (a diamond) is skipped. Matrices
    /// are registered by identity with a last-occurrence search, so each
    /// physically distinct matrix appears exactly once in the registry.
    pub fn pack(self, registry: &KernelRegistry) -> Result<BoundMatrixOperation, MatrixError> {
        enum Frame {
            Enter(BoundMatrixOperationTree),
            Emit(BoundMatrixOperation),
        }

        let root_output = self.bound.output.clone();
        let mut matrices: Vec<Matrix> = Vec::new();
        let mut steps: Vec<SequenceStep> = Vec::new();

        let mut stack = vec![Frame::Enter(self)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(node) => {
                    let BoundMatrixOperationTree { bound, children } = node;
                    stack.push(Frame::Emit(bound));
                    for child in children.into_iter().rev() {
                        stack.push(Frame::Enter(child));
                    }
                }
                Frame::Emit(bound) => {
                    let Some(operation) = bound.operation else {
                        continue;
                    };

                    let output_index = find_or_add(&mut matrices, &bound.output);
                    if steps.iter().any(|step| step.output_index == output_index) {
                        continue;
                    }

                    let input_indices = bound
                        .inputs
                        .iter()
                        .map(|input| find_or_add(&mut matrices, input))
                        .collect();
                    steps.push(SequenceStep {
                        header: operation.into_header(),
                        output_index,
                        input_indices,
                    });
                }
            }
        }

        let operation = MatrixOperation::sequence(registry, &root_output, &matrices, steps)?;
        Ok(BoundMatrixOperation {
            operation: Some(operation),
            output: root_output,
            inputs: matrices,
        })
    }
}

fn find_or_add(matrices: &mut Vec<Matrix>, matrix: &Matrix) -> usize {
    match matrices.iter().rposition(|m| m.same(matrix)) {
        Some(index) => index,
        None => {
            matrices.push(matrix.clone());
            matrices.len() - 1
        }
    }
}
