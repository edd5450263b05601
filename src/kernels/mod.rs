//! The compiled kernel library and its registry
//!
//! Kernels are plain functions over typed slices, written once and monomorphized
//! for `f32` and `f64`. The [`KernelRegistry`] maps kernel names to the compiled
//! functions; the orchestrator and the worker thread share the very same registry
//! instance, there is no per-thread codegen of any kind.
//!
//! A kernel never sees a matrix: it gets an [`OperationHeader`] (shapes, strides,
//! offsets) plus raw storages, with the input regions snapshotted into owned
//! buffers before the call. The snapshot is what makes aliasing a non-issue: an
//! output is free to overlap any of its inputs, the kernel still reads a
//! consistent copy.

pub mod basic;
pub mod inverse;
pub mod qr;
pub mod solve;

use crate::buffer::RawBuffer;
use crate::datatype::{MatrixDataType, Scalar};
use crate::errors::{MatrixError, OperationError};
use crate::operation::{OperationArgs, OperationHeader};
use std::collections::HashMap;

pub(crate) const NOP: &str = "nop";
pub(crate) const SEQUENCE: &str = "sequence";

/// A registered kernel
///
/// Most kernels are `Typed`: one monomorphization per precision, dispatched on the
/// header's dtype after the storage views have been carved out. `Raw` kernels work
/// on the storages themselves and may call back into the registry; the step
/// interpreter is one of those.
pub enum Kernel {
    Typed {
        single: fn(&OperationHeader, &mut [f32], &[&[f32]]) -> Result<(), OperationError>,
        double: fn(&OperationHeader, &mut [f64], &[&[f64]]) -> Result<(), OperationError>,
    },
    Raw(fn(&OperationHeader, &mut [RawBuffer], &KernelRegistry) -> Result<(), OperationError>),
}

/// Maps kernel names to compiled functions
pub struct KernelRegistry {
    kernels: HashMap<String, Kernel>,
}

impl KernelRegistry {
    /// An empty registry, for when the default library is not wanted
    pub fn new() -> KernelRegistry {
        KernelRegistry {
            kernels: HashMap::new(),
        }
    }

    /// The registry with every built-in kernel already registered
    pub fn with_default_library() -> KernelRegistry {
        let mut registry = KernelRegistry::new();

        // registration of the built-ins can't collide, the unwrap-free way to
        // say that is to ignore the result of a fresh insert
        let builtin = |registry: &mut KernelRegistry, name: &str, kernel: Kernel| {
            let _ = registry.register(name, kernel);
        };

        builtin(&mut registry, NOP, Kernel::Raw(nop));
        builtin(&mut registry, SEQUENCE, Kernel::Raw(sequence));
        builtin(&mut registry, "fill", Kernel::Typed { single: basic::fill::<f32>, double: basic::fill::<f64> });
        builtin(&mut registry, "copy", Kernel::Typed { single: basic::copy::<f32>, double: basic::copy::<f64> });
        builtin(&mut registry, "transpose", Kernel::Typed { single: basic::transpose::<f32>, double: basic::transpose::<f64> });
        builtin(&mut registry, "add", Kernel::Typed { single: basic::add::<f32>, double: basic::add::<f64> });
        builtin(&mut registry, "subtract", Kernel::Typed { single: basic::subtract::<f32>, double: basic::subtract::<f64> });
        builtin(&mut registry, "multiply", Kernel::Typed { single: basic::multiply::<f32>, double: basic::multiply::<f64> });
        builtin(&mut registry, "multiplylt", Kernel::Typed { single: basic::multiplylt::<f32>, double: basic::multiplylt::<f64> });
        builtin(&mut registry, "multiplyrt", Kernel::Typed { single: basic::multiplyrt::<f32>, double: basic::multiplyrt::<f64> });
        builtin(&mut registry, "multiplyvec", Kernel::Typed { single: basic::multiplyvec::<f32>, double: basic::multiplyvec::<f64> });
        builtin(&mut registry, "scale", Kernel::Typed { single: basic::scale::<f32>, double: basic::scale::<f64> });
        builtin(&mut registry, "compmult", Kernel::Typed { single: basic::compmult::<f32>, double: basic::compmult::<f64> });
        builtin(&mut registry, "outer", Kernel::Typed { single: basic::outer::<f32>, double: basic::outer::<f64> });
        builtin(&mut registry, "addinplace", Kernel::Typed { single: basic::addinplace::<f32>, double: basic::addinplace::<f64> });
        builtin(&mut registry, "qr", Kernel::Typed { single: qr::qr::<f32>, double: qr::qr::<f64> });
        builtin(&mut registry, "backsub", Kernel::Typed { single: solve::backsub::<f32>, double: solve::backsub::<f64> });
        builtin(&mut registry, "lssolve", Kernel::Typed { single: solve::lssolve::<f32>, double: solve::lssolve::<f64> });
        builtin(&mut registry, "inverse", Kernel::Typed { single: inverse::inverse::<f32>, double: inverse::inverse::<f64> });

        registry
    }

    /// Registers a new kernel under `name`
    ///
    /// # Errors
    /// - if the name is not a valid identifier
    /// - if a kernel with that name already exists (redefining is not allowed)
    pub fn register(&mut self, name: &str, kernel: Kernel) -> Result<(), MatrixError> {
        if !is_valid_kernel_name(name) {
            return Err(MatrixError::InvalidKernelName(name.to_string()));
        }
        if self.kernels.contains_key(name) {
            return Err(MatrixError::DuplicateKernel(name.to_string()));
        }

        self.kernels.insert(name.to_string(), kernel);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    /// Runs the kernel named by `header.method` over the given storages
    ///
    /// This is the single entry point used by both the local path and the worker
    /// thread.
    pub(crate) fn execute(
        &self,
        header: &OperationHeader,
        storages: &mut [RawBuffer],
    ) -> Result<(), OperationError> {
        let kernel = self
            .kernels
            .get(&header.method)
            .ok_or_else(|| OperationError::UnknownMethod(header.method.clone()))?;

        match kernel {
            Kernel::Raw(f) => f(header, storages, self),
            Kernel::Typed { single, double } => {
                let element_size = header.dtype.byte_size();

                // snapshot the input regions, see the module docs
                let mut inputs = Vec::with_capacity(header.length_of_inputs.len());
                for i in 0..header.length_of_inputs.len() {
                    let storage = storages
                        .get(header.storage_of_inputs[i])
                        .ok_or_else(|| storage_fault("input storage index out of range"))?;
                    let begin = header.byte_offset_of_inputs[i];
                    let end = begin + header.length_of_inputs[i] * element_size;
                    let region = storage
                        .bytes()
                        .get(begin..end)
                        .ok_or_else(|| storage_fault("input region out of range"))?;
                    inputs.push(RawBuffer::from_bytes(region));
                }

                let storage = storages
                    .get_mut(header.storage)
                    .ok_or_else(|| storage_fault("output storage index out of range"))?;
                let begin = header.byte_offset;
                let end = begin + header.length * element_size;
                let output = storage
                    .bytes_mut()
                    .get_mut(begin..end)
                    .ok_or_else(|| storage_fault("output region out of range"))?;

                match header.dtype {
                    MatrixDataType::F32 => {
                        let output = cast_mut::<f32>(output)?;
                        let views = cast_all::<f32>(&inputs)?;
                        single(header, output, &views)
                    }
                    MatrixDataType::F64 => {
                        let output = cast_mut::<f64>(output)?;
                        let views = cast_all::<f64>(&inputs)?;
                        double(header, output, &views)
                    }
                }
            }
        }
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        KernelRegistry::with_default_library()
    }
}

/// Kernel names follow identifier rules, like the built-ins do
fn is_valid_kernel_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn storage_fault(what: &str) -> OperationError {
    OperationError::Storage(what.to_string())
}

fn cast_mut<T: Scalar>(bytes: &mut [u8]) -> Result<&mut [T], OperationError> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|e| OperationError::Storage(format!("{:?}", e)))
}

fn cast_all<T: Scalar>(buffers: &[RawBuffer]) -> Result<Vec<&[T]>, OperationError> {
    buffers
        .iter()
        .map(|b| {
            bytemuck::try_cast_slice(b.bytes())
                .map_err(|e| OperationError::Storage(format!("{:?}", e)))
        })
        .collect()
}

/// No-operation, used to synchronize with the queue
fn nop(
    _header: &OperationHeader,
    _storages: &mut [RawBuffer],
    _registry: &KernelRegistry,
) -> Result<(), OperationError> {
    Ok(())
}

/// Interprets a packed step list, running each step in order
///
/// Every step carries its own header, already resolved against the same storage
/// table, so this is just a loop over [`KernelRegistry::execute`].
fn sequence(
    header: &OperationHeader,
    storages: &mut [RawBuffer],
    registry: &KernelRegistry,
) -> Result<(), OperationError> {
    let OperationArgs::Sequence { steps } = &header.custom else {
        return Err(OperationError::MissingArguments(SEQUENCE));
    };

    for step in steps {
        registry.execute(&step.header, storages)?;
    }
    Ok(())
}

/// Euclidean dot product of two equally sized slices
pub(crate) fn dot<T: Scalar>(u: &[T], v: &[T]) -> T {
    let mut sum = T::ZERO;
    for i in 0..u.len().min(v.len()) {
        sum += u[i] * v[i];
    }
    sum
}

/// Euclidean norm of a slice
pub(crate) fn norm2<T: Scalar>(v: &[T]) -> T {
    dot(v, v).sqrt()
}
