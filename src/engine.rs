//! The engine: kernel registry + worker + queue, wired together
//!
//! There is no global state anywhere in this crate: every matrix belongs to an
//! engine, and the engine owns the services the matrix needs to schedule work.
//! Creating two engines gives two fully independent pipelines.

use crate::datatype::MatrixDataType;
use crate::errors::MatrixError;
use crate::kernels::KernelRegistry;
use crate::matrix::Matrix;
use crate::operation::MatrixOperation;
use crate::queue::OperationsQueue;
use crate::worker::MatrixWorker;
use std::sync::Arc;

pub(crate) struct EngineShared {
    pub(crate) registry: Arc<KernelRegistry>,
    pub(crate) queue: OperationsQueue,
}

/// Factory for matrices and entry point for running operations
///
/// Cloning shares the underlying services. Dropping the last handle (and the
/// last matrix) shuts down the drain task and the worker thread.
#[derive(Clone)]
pub struct MatrixEngine {
    shared: Arc<EngineShared>,
}

impl MatrixEngine {
    /// An engine with the default kernel library
    ///
    /// Async because it spawns the queue's drain task, which needs a runtime.
    pub async fn new() -> MatrixEngine {
        Self::with_registry(KernelRegistry::with_default_library()).await
    }

    /// An engine over a custom registry, for user-registered kernels
    pub async fn with_registry(registry: KernelRegistry) -> MatrixEngine {
        let registry = Arc::new(registry);
        let worker = Arc::new(MatrixWorker::spawn(Arc::clone(&registry)));
        let queue = OperationsQueue::start(worker, Arc::clone(&registry));

        MatrixEngine {
            shared: Arc::new(EngineShared { registry, queue }),
        }
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.shared.registry
    }

    /// A zero-initialized rows x columns matrix
    pub fn matrix(
        &self,
        rows: usize,
        columns: usize,
        dtype: MatrixDataType,
    ) -> Result<Matrix, MatrixError> {
        Matrix::new(Arc::clone(&self.shared), rows, columns, dtype, None)
    }

    /// A matrix initialized with the given column-major values
    pub fn matrix_with_values(
        &self,
        rows: usize,
        columns: usize,
        dtype: MatrixDataType,
        values: &[f64],
    ) -> Result<Matrix, MatrixError> {
        Matrix::new(Arc::clone(&self.shared), rows, columns, dtype, Some(values))
    }

    /// The size x size identity matrix
    pub fn eye(&self, size: usize, dtype: MatrixDataType) -> Result<Matrix, MatrixError> {
        let mut values = vec![0.0; size * size];
        for i in 0..size {
            values[i * size + i] = 1.0;
        }
        self.matrix_with_values(size, size, dtype, &values)
    }

    /// Schedules a standalone operation and waits for it
    ///
    /// This is the low-level way in, for operations the expression builder has
    /// no syntax for (the QR modes, back-substitution) and for user-registered
    /// kernels.
    pub async fn execute(
        &self,
        operation: MatrixOperation,
        output: &Matrix,
        inputs: &[Matrix],
    ) -> anyhow::Result<()> {
        self.shared
            .queue
            .enqueue(operation, output.clone(), inputs.to_vec())
            .await?;
        Ok(())
    }
}
