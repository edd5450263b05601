//! The operations queue
//!
//! One queue per engine, explicitly handed to whoever needs to schedule work.
//! Submitting locks the matrices synchronously, so ordering is decided at the
//! moment of the call; a single drain task then runs the operations strictly one
//! at a time, unlocks, and resolves the completion future. First in, first out,
//! no cancellation.

use crate::errors::OperationError;
use crate::kernels::KernelRegistry;
use crate::matrix::Matrix;
use crate::operation::MatrixOperation;
use crate::worker::MatrixWorker;
use futures_channel::oneshot;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Task {
    operation: MatrixOperation,
    output: Matrix,
    inputs: Vec<Matrix>,
    done: oneshot::Sender<Result<(), OperationError>>,
}

/// Handle to the scheduler of one engine
pub struct OperationsQueue {
    tasks: mpsc::UnboundedSender<Task>,
}

impl OperationsQueue {
    /// Starts the drain task; it stops when the last queue handle is dropped
    pub(crate) fn start(worker: Arc<MatrixWorker>, registry: Arc<KernelRegistry>) -> OperationsQueue {
        let (tasks, mut incoming) = mpsc::unbounded_channel::<Task>();

        tokio::spawn(async move {
            while let Some(mut task) = incoming.recv().await {
                log::debug!(
                    "queue: running \"{}\" for a {} x {} output",
                    task.operation.method(),
                    task.output.rows(),
                    task.output.columns()
                );

                let result = task
                    .operation
                    .run(&task.output, &task.inputs, &worker, &registry)
                    .await;

                for input in &task.inputs {
                    input.unlock();
                }
                task.output.unlock();

                // nobody waiting on a detached submission is fine
                let _ = task.done.send(result);
            }
        });

        OperationsQueue { tasks }
    }

    /// Locks the matrices and queues the operation; the receiver resolves when
    /// the operation has run and the locks are gone
    pub(crate) fn submit(
        &self,
        operation: MatrixOperation,
        output: Matrix,
        inputs: Vec<Matrix>,
    ) -> oneshot::Receiver<Result<(), OperationError>> {
        output.lock();
        for input in &inputs {
            input.lock();
        }

        let (done, receiver) = oneshot::channel();
        let task = Task {
            operation,
            output,
            inputs,
            done,
        };

        if let Err(rejected) = self.tasks.send(task) {
            // the drain task is gone; undo the locks, the dropped sender turns
            // into a canceled receiver on the caller's side
            let task = rejected.0;
            for input in &task.inputs {
                input.unlock();
            }
            task.output.unlock();
        }
        receiver
    }

    /// [`OperationsQueue::submit`] plus waiting for the completion
    pub(crate) async fn enqueue(
        &self,
        operation: MatrixOperation,
        output: Matrix,
        inputs: Vec<Matrix>,
    ) -> Result<(), OperationError> {
        match self.submit(operation, output, inputs).await {
            Ok(result) => result,
            Err(_canceled) => Err(OperationError::QueueClosed),
        }
    }
}
