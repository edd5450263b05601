//! Bridge to the worker thread that runs the heavy kernels
//!
//! The worker is one long-lived OS thread, statically linked against the same
//! kernel registry the orchestrator uses. Requests and responses carry the
//! storages by move, never by copy, plus a wrapping message id; the id is mostly
//! useful for tracing, since the per-request response channel already correlates
//! replies.

use crate::buffer::RawBuffer;
use crate::errors::OperationError;
use crate::kernels::{self, KernelRegistry};
use crate::operation::OperationHeader;
use futures_channel::oneshot;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};

// of the form 2^n - 1, message ids wrap around this
const MAX_MESSAGE_ID: u32 = (1 << 30) - 1;

struct Request {
    id: u32,
    header: OperationHeader,
    storages: Vec<RawBuffer>,
    done: oneshot::Sender<Response>,
}

struct Response {
    id: u32,
    storages: Vec<RawBuffer>,
    result: Result<(), OperationError>,
}

/// Handle to the worker thread
pub struct MatrixWorker {
    requests: Mutex<mpsc::Sender<Request>>,
    next_id: AtomicU32,
}

impl MatrixWorker {
    /// Spawns the worker thread; it exits on its own once every handle to it is
    /// gone
    pub(crate) fn spawn(registry: Arc<KernelRegistry>) -> MatrixWorker {
        let (requests, incoming) = mpsc::channel::<Request>();

        std::thread::spawn(move || {
            for mut request in incoming {
                log::debug!(
                    "worker: request #{} \"{}\" ({} x {})",
                    request.id,
                    request.header.method,
                    request.header.rows,
                    request.header.columns
                );

                let result = registry.execute(&request.header, &mut request.storages);
                if let Err(error) = &result {
                    log::warn!("worker: request #{} failed: {}", request.id, error);
                }

                // the storages travel back even on failure, so the arenas can
                // be made whole again
                let _ = request.done.send(Response {
                    id: request.id,
                    storages: request.storages,
                    result,
                });
            }
        });

        MatrixWorker {
            requests: Mutex::new(requests),
            next_id: AtomicU32::new(0),
        }
    }

    /// Ships a computation to the worker thread
    ///
    /// Returns the storages together with the kernel's own verdict. The outer
    /// error is a channel fault: the worker died before answering, in which
    /// case the storages are gone with it.
    pub(crate) async fn run(
        &self,
        header: &OperationHeader,
        storages: Vec<RawBuffer>,
    ) -> Result<(Vec<RawBuffer>, Result<(), OperationError>), OperationError> {
        // a no-op has no reason to cross the channel
        if header.method == kernels::NOP {
            return Ok((storages, Ok(())));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) & MAX_MESSAGE_ID;
        let (done, response) = oneshot::channel();
        let request = Request {
            id,
            header: header.clone(),
            storages,
            done,
        };

        {
            let sender = match self.requests.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sender.send(request).map_err(|_| {
                OperationError::WorkerError("the worker is no longer running".to_string())
            })?;
        }

        let response = response.await.map_err(|_| {
            OperationError::WorkerError("the worker dropped the request".to_string())
        })?;
        debug_assert_eq!(response.id, id);

        Ok((response.storages, response.result))
    }
}
