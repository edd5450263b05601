//! Operation descriptors and their dispatch
//!
//! A [`MatrixOperation`] is built ahead of time: the constructor validates the
//! kernel name against the registry and freezes the shapes the operation was
//! designed for. What travels to the kernel (possibly across the worker channel)
//! is the [`OperationHeader`], a plain serializable record; strides, byte offsets
//! and storage indices are only resolved right before dispatch, because views can
//! be created between compiling an expression and running it.

use crate::buffer::{MatrixBuffer, RawBuffer};
use crate::datatype::MatrixDataType;
use crate::errors::{MatrixError, OperationError};
use crate::kernels::{self, KernelRegistry};
use crate::matrix::Matrix;
use crate::worker::MatrixWorker;
use serde::{Deserialize, Serialize};

/// Operations on at most this many elements (output and inputs combined) run on
/// the calling task; anything bigger goes to the worker thread
pub const SMALL_WORKLOAD_THRESHOLD: usize = 2048;

/// Modes of the `qr` kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QrMode {
    /// Q is m x m, R is m x n, output is [ Q | R ]
    #[serde(rename = "full-qr")]
    FullQr,
    /// Q is m x n, R is n x n, output is [ Q | R ]
    #[serde(rename = "reduced-qr")]
    ReducedQr,
    /// applies Q^T to a vector, output is [ Q'x | R ]
    #[serde(rename = "Q'x")]
    QtX,
    /// applies Q to a vector, output is [ Qx | R ]
    #[serde(rename = "Qx")]
    QX,
    /// Q'x through the reduced factor, only the first n entries are meaningful
    #[serde(rename = "reduced-Q'x")]
    ReducedQtX,
}

/// Kernel-specific payload of a header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationArgs {
    None,
    Fill { value: f64 },
    Scale { factor: f64 },
    AddInPlace { alpha: f64, beta: f64 },
    Qr { mode: QrMode },
    Sequence { steps: Vec<SequenceStep> },
}

/// One step of a packed operation sequence
///
/// The indices point into the distinct-matrix registry of the wrapping
/// `sequence` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub header: OperationHeader,
    pub output_index: usize,
    pub input_indices: Vec<usize>,
}

/// Everything a kernel needs to know, in one serializable record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationHeader {
    pub method: String,
    pub dtype: MatrixDataType,

    // output metadata
    pub rows: usize,
    pub columns: usize,
    pub stride: usize,
    pub byte_offset: usize,
    pub length: usize,
    pub storage: usize,

    // input metadata, one entry per input
    pub rows_of_inputs: Vec<usize>,
    pub columns_of_inputs: Vec<usize>,
    pub stride_of_inputs: Vec<usize>,
    pub byte_offset_of_inputs: Vec<usize>,
    pub length_of_inputs: Vec<usize>,
    pub storage_of_inputs: Vec<usize>,

    pub custom: OperationArgs,
}

impl OperationHeader {
    /// A header with no inputs and nothing resolved, mostly useful for kernels
    /// that build sub-problems for other kernels
    pub(crate) fn raw(
        method: &str,
        dtype: MatrixDataType,
        rows: usize,
        columns: usize,
        stride: usize,
    ) -> OperationHeader {
        OperationHeader {
            method: method.to_string(),
            dtype,
            rows,
            columns,
            stride,
            byte_offset: 0,
            length: 0,
            storage: 0,
            rows_of_inputs: Vec::new(),
            columns_of_inputs: Vec::new(),
            stride_of_inputs: Vec::new(),
            byte_offset_of_inputs: Vec::new(),
            length_of_inputs: Vec::new(),
            storage_of_inputs: Vec::new(),
            custom: OperationArgs::None,
        }
    }

    fn for_matrices(
        method: &str,
        dtype: MatrixDataType,
        rows: usize,
        columns: usize,
        inputs: &[&Matrix],
        custom: OperationArgs,
    ) -> OperationHeader {
        let mut header = OperationHeader::raw(method, dtype, rows, columns, 0);
        header.rows_of_inputs = inputs.iter().map(|m| m.rows()).collect();
        header.columns_of_inputs = inputs.iter().map(|m| m.columns()).collect();
        header.stride_of_inputs = vec![0; inputs.len()];
        header.byte_offset_of_inputs = vec![0; inputs.len()];
        header.length_of_inputs = vec![0; inputs.len()];
        header.storage_of_inputs = vec![0; inputs.len()];
        header.custom = custom;
        header
    }
}

/// A validated, reusable operation descriptor
#[derive(Debug)]
pub struct MatrixOperation {
    header: OperationHeader,
}

impl MatrixOperation {
    fn create(
        registry: &KernelRegistry,
        method: &str,
        rows: usize,
        columns: usize,
        dtype: MatrixDataType,
        inputs: &[&Matrix],
        custom: OperationArgs,
    ) -> Result<MatrixOperation, MatrixError> {
        if !registry.contains(method) {
            return Err(MatrixError::UnknownKernel(method.to_string()));
        }
        for input in inputs {
            if input.dtype() != dtype {
                return Err(MatrixError::IncompatibleType {
                    expected: dtype.name().to_string(),
                    found: input.dtype().name().to_string(),
                });
            }
        }

        Ok(MatrixOperation {
            header: OperationHeader::for_matrices(method, dtype, rows, columns, inputs, custom),
        })
    }

    /// No-operation; scheduling one of these is how `sync()` works
    pub fn nop(registry: &KernelRegistry, target: &Matrix) -> Result<MatrixOperation, MatrixError> {
        Self::create(
            registry,
            kernels::NOP,
            target.rows(),
            target.columns(),
            target.dtype(),
            &[],
            OperationArgs::None,
        )
    }

    /// Fill `target` with a constant
    pub fn fill(
        registry: &KernelRegistry,
        target: &Matrix,
        value: f64,
    ) -> Result<MatrixOperation, MatrixError> {
        Self::create(
            registry,
            "fill",
            target.rows(),
            target.columns(),
            target.dtype(),
            &[],
            OperationArgs::Fill { value },
        )
    }

    /// Copy `source` into a target of the same shape
    pub fn copy(
        registry: &KernelRegistry,
        target: &Matrix,
        source: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("copy", source, target.rows(), target.columns())?;
        Self::create(
            registry,
            "copy",
            target.rows(),
            target.columns(),
            target.dtype(),
            &[source],
            OperationArgs::None,
        )
    }

    pub fn transpose(
        registry: &KernelRegistry,
        input: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        Self::create(
            registry,
            "transpose",
            input.columns(),
            input.rows(),
            input.dtype(),
            &[input],
            OperationArgs::None,
        )
    }

    pub fn add(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("add", b, a.rows(), a.columns())?;
        Self::create(
            registry,
            "add",
            a.rows(),
            a.columns(),
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    pub fn subtract(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("subtract", b, a.rows(), a.columns())?;
        Self::create(
            registry,
            "subtract",
            a.rows(),
            a.columns(),
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    pub fn compmult(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("compmult", b, a.rows(), a.columns())?;
        Self::create(
            registry,
            "compmult",
            a.rows(),
            a.columns(),
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    /// C = A B
    pub fn multiply(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("multiply", b, a.columns(), b.columns())?;
        Self::create(
            registry,
            "multiply",
            a.rows(),
            b.columns(),
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    /// C = A^T B, without materializing the transpose
    pub fn multiplylt(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("multiplylt", b, a.rows(), b.columns())?;
        Self::create(
            registry,
            "multiplylt",
            a.columns(),
            b.columns(),
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    /// C = A B^T, without materializing the transpose
    pub fn multiplyrt(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("multiplyrt", b, b.rows(), a.columns())?;
        Self::create(
            registry,
            "multiplyrt",
            a.rows(),
            b.rows(),
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    /// y = A x for a column vector x
    pub fn multiplyvec(
        registry: &KernelRegistry,
        a: &Matrix,
        x: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("multiplyvec", x, a.columns(), 1)?;
        Self::create(
            registry,
            "multiplyvec",
            a.rows(),
            1,
            a.dtype(),
            &[a, x],
            OperationArgs::None,
        )
    }

    /// Outer product of an m x 1 vector by a 1 x n vector
    pub fn outer(
        registry: &KernelRegistry,
        u: &Matrix,
        v: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("outer", u, u.rows(), 1)?;
        expect_shape("outer", v, 1, v.columns())?;
        Self::create(
            registry,
            "outer",
            u.rows(),
            v.columns(),
            u.dtype(),
            &[u, v],
            OperationArgs::None,
        )
    }

    pub fn scale(
        registry: &KernelRegistry,
        input: &Matrix,
        factor: f64,
    ) -> Result<MatrixOperation, MatrixError> {
        Self::create(
            registry,
            "scale",
            input.rows(),
            input.columns(),
            input.dtype(),
            &[input],
            OperationArgs::Scale { factor },
        )
    }

    /// C = alpha A + beta B; the output may alias an input
    pub fn addinplace(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
        alpha: f64,
        beta: f64,
    ) -> Result<MatrixOperation, MatrixError> {
        expect_shape("addinplace", b, a.rows(), a.columns())?;
        Self::create(
            registry,
            "addinplace",
            a.rows(),
            a.columns(),
            a.dtype(),
            &[a, b],
            OperationArgs::AddInPlace { alpha, beta },
        )
    }

    /// Closed-form inverse, square matrices up to 3 x 3 only
    pub fn inverse(
        registry: &KernelRegistry,
        input: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        if input.rows() != input.columns() || input.rows() > 3 {
            return Err(MatrixError::UnsupportedInverse {
                rows: input.rows(),
                columns: input.columns(),
            });
        }
        Self::create(
            registry,
            "inverse",
            input.rows(),
            input.columns(),
            input.dtype(),
            &[input],
            OperationArgs::None,
        )
    }

    /// QR decomposition of an m x n input with m >= n
    ///
    /// The vector modes take the vector as `x`; the matrix modes ignore it.
    /// The output shape depends on the mode, see [`QrMode`].
    pub fn qr(
        registry: &KernelRegistry,
        input: &Matrix,
        x: Option<&Matrix>,
        mode: QrMode,
    ) -> Result<MatrixOperation, MatrixError> {
        let (m, n) = (input.rows(), input.columns());
        if m < n {
            return Err(MatrixError::IncompatibleShape {
                method: "qr".to_string(),
                expected_rows: n,
                expected_columns: n,
                rows: m,
                columns: n,
            });
        }

        let columns = match mode {
            QrMode::FullQr => n + m,
            QrMode::ReducedQr => n + n,
            QrMode::QtX | QrMode::QX | QrMode::ReducedQtX => n + 1,
        };

        match mode {
            QrMode::FullQr | QrMode::ReducedQr => Self::create(
                registry,
                "qr",
                m,
                columns,
                input.dtype(),
                &[input],
                OperationArgs::Qr { mode },
            ),
            _ => {
                let x = x.ok_or(MatrixError::IncompatibleShape {
                    method: "qr".to_string(),
                    expected_rows: m,
                    expected_columns: 1,
                    rows: 0,
                    columns: 0,
                })?;
                expect_shape("qr", x, m, 1)?;
                Self::create(
                    registry,
                    "qr",
                    m,
                    columns,
                    input.dtype(),
                    &[input, x],
                    OperationArgs::Qr { mode },
                )
            }
        }
    }

    /// Back-substitution over a single [ b | R ] input of shape n x (n+1)
    pub fn backsub(
        registry: &KernelRegistry,
        input: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        if input.columns() != input.rows() + 1 {
            return Err(MatrixError::IncompatibleShape {
                method: "backsub".to_string(),
                expected_rows: input.rows(),
                expected_columns: input.rows() + 1,
                rows: input.rows(),
                columns: input.columns(),
            });
        }
        Self::create(
            registry,
            "backsub",
            input.rows(),
            1,
            input.dtype(),
            &[input],
            OperationArgs::None,
        )
    }

    /// Least-squares solution of A x = b, m equations and n unknowns, m >= n
    pub fn lssolve(
        registry: &KernelRegistry,
        a: &Matrix,
        b: &Matrix,
    ) -> Result<MatrixOperation, MatrixError> {
        let (m, n) = (a.rows(), a.columns());
        if m < n {
            return Err(MatrixError::UnderdeterminedSystem {
                rows: m,
                columns: n,
            });
        }
        expect_shape("lssolve", b, m, 1)?;
        Self::create(
            registry,
            "lssolve",
            n,
            1,
            a.dtype(),
            &[a, b],
            OperationArgs::None,
        )
    }

    /// A packed step list over a distinct-matrix registry, dispatched as one
    /// atomic scheduler entry
    pub fn sequence(
        registry: &KernelRegistry,
        output: &Matrix,
        matrices: &[Matrix],
        steps: Vec<SequenceStep>,
    ) -> Result<MatrixOperation, MatrixError> {
        let inputs: Vec<&Matrix> = matrices.iter().collect();
        Self::create(
            registry,
            kernels::SEQUENCE,
            output.rows(),
            output.columns(),
            output.dtype(),
            &inputs,
            OperationArgs::Sequence { steps },
        )
    }

    pub fn method(&self) -> &str {
        &self.header.method
    }

    pub fn input_count(&self) -> usize {
        self.header.length_of_inputs.len()
    }

    /// The packed steps, when this is a `sequence` operation
    pub fn steps(&self) -> Option<&[SequenceStep]> {
        match &self.header.custom {
            OperationArgs::Sequence { steps } => Some(steps),
            _ => None,
        }
    }

    pub(crate) fn into_header(self) -> OperationHeader {
        self.header
    }

    /// Checks the actual matrices against the shapes the operation was built
    /// for; this runs immediately before dispatch, never earlier
    fn assert_compatibility(
        &self,
        output: &Matrix,
        inputs: &[Matrix],
    ) -> Result<(), OperationError> {
        let header = &self.header;

        if output.rows() != header.rows || output.columns() != header.columns {
            return Err(OperationError::ShapeMismatch {
                method: header.method.clone(),
                expected_rows: header.rows,
                expected_columns: header.columns,
                rows: output.rows(),
                columns: output.columns(),
            });
        }
        if output.dtype() != header.dtype {
            return Err(OperationError::TypeMismatch {
                method: header.method.clone(),
                expected: header.dtype.name().to_string(),
                found: output.dtype().name().to_string(),
            });
        }
        if inputs.len() != header.rows_of_inputs.len() {
            return Err(OperationError::InputCountMismatch {
                method: header.method.clone(),
                expected: header.rows_of_inputs.len(),
                found: inputs.len(),
            });
        }
        for (i, input) in inputs.iter().enumerate() {
            if input.rows() != header.rows_of_inputs[i]
                || input.columns() != header.columns_of_inputs[i]
            {
                return Err(OperationError::ShapeMismatch {
                    method: header.method.clone(),
                    expected_rows: header.rows_of_inputs[i],
                    expected_columns: header.columns_of_inputs[i],
                    rows: input.rows(),
                    columns: input.columns(),
                });
            }
            if input.dtype() != header.dtype {
                return Err(OperationError::TypeMismatch {
                    method: header.method.clone(),
                    expected: header.dtype.name().to_string(),
                    found: input.dtype().name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolves strides, offsets and storage indices against the actual
    /// matrices; returns the deduplicated arena list, in storage-index order
    fn refresh(&mut self, output: &Matrix, inputs: &[Matrix]) -> Vec<MatrixBuffer> {
        let mut arenas: Vec<MatrixBuffer> = Vec::new();
        Self::update_header(&mut self.header, output, inputs, &mut arenas);

        // steps address the same storage table as the wrapping operation
        if let OperationArgs::Sequence { steps } = &mut self.header.custom {
            for step in steps.iter_mut() {
                let step_output = inputs[step.output_index].clone();
                let step_inputs: Vec<Matrix> = step
                    .input_indices
                    .iter()
                    .map(|&i| inputs[i].clone())
                    .collect();
                Self::update_header(&mut step.header, &step_output, &step_inputs, &mut arenas);
            }
        }

        arenas
    }

    fn update_header(
        header: &mut OperationHeader,
        output: &Matrix,
        inputs: &[Matrix],
        arenas: &mut Vec<MatrixBuffer>,
    ) {
        header.stride = output.stride();
        header.byte_offset = output.buffer().byte_offset();
        header.length = output.buffer().len();
        header.storage = storage_index(arenas, output.buffer());

        for (i, input) in inputs.iter().enumerate() {
            header.stride_of_inputs[i] = input.stride();
            header.byte_offset_of_inputs[i] = input.buffer().byte_offset();
            header.length_of_inputs[i] = input.buffer().len();
            header.storage_of_inputs[i] = storage_index(arenas, input.buffer());
        }
    }

    /// Runs the operation to completion
    ///
    /// Validation, then metadata refresh, then the local-or-worker decision by
    /// workload size. The storages are moved out of their arenas for the
    /// duration of the call and reinstalled afterwards, whichever path ran.
    /// This never touches the arena locks, the scheduler handles those.
    pub(crate) async fn run(
        &mut self,
        output: &Matrix,
        inputs: &[Matrix],
        worker: &MatrixWorker,
        registry: &KernelRegistry,
    ) -> Result<(), OperationError> {
        self.assert_compatibility(output, inputs)?;

        if self.header.method == kernels::NOP {
            return Ok(());
        }

        let arenas = self.refresh(output, inputs);
        let workload =
            self.header.length + self.header.length_of_inputs.iter().sum::<usize>();

        let mut storages: Vec<_> = arenas.iter().map(|b| b.take_storage()).collect();
        let result = if workload <= SMALL_WORKLOAD_THRESHOLD {
            registry.execute(&self.header, &mut storages)
        } else {
            let byte_lengths: Vec<usize> = storages.iter().map(|s| s.byte_len()).collect();
            match worker.run(&self.header, storages).await {
                Ok((returned, result)) => {
                    storages = returned;
                    result
                }
                Err(error) => {
                    // the storages died with the worker; reinstall blank ones
                    // of the right size, later reads then see zeros instead
                    // of panicking on an empty arena
                    for (buffer, length) in arenas.iter().zip(byte_lengths) {
                        buffer.replace(RawBuffer::with_byte_len(length));
                    }
                    return Err(error);
                }
            }
        };

        for (buffer, storage) in arenas.iter().zip(storages) {
            buffer.replace(storage);
        }
        result
    }
}

fn expect_shape(
    method: &str,
    matrix: &Matrix,
    rows: usize,
    columns: usize,
) -> Result<(), MatrixError> {
    if matrix.rows() != rows || matrix.columns() != columns {
        return Err(MatrixError::IncompatibleShape {
            method: method.to_string(),
            expected_rows: rows,
            expected_columns: columns,
            rows: matrix.rows(),
            columns: matrix.columns(),
        });
    }
    Ok(())
}

fn storage_index(arenas: &mut Vec<MatrixBuffer>, buffer: &MatrixBuffer) -> usize {
    match arenas.iter().position(|b| b.same_arena(buffer)) {
        Some(index) => index,
        None => {
            arenas.push(buffer.clone());
            arenas.len() - 1
        }
    }
}
