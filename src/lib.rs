/*!
This crate is a small engine for dense matrix computations which are built lazily and run in the background

Matrices never compute anything when you chain operations on them: an expression like `a.expr().times(&b.expr())`
only builds a tree. Calling `set_to` compiles that tree into a flat sequence of primitive kernel calls
(deduplicating shared sub-expressions along the way) and hands it to the engine's queue, which runs strictly
one operation at a time while keeping every storage buffer locked for exactly as long as it is in use.
Heavy operations are shipped to a background worker thread, moving the storage buffers back and forth instead
of copying them; small ones run right on the scheduler, since the round trip would cost more than the kernel.

The kernel set is closed but the registry is not: custom kernels can be registered by name and dispatched
through [`engine::MatrixEngine::execute`], the same low-level path the QR decomposition modes use.

Reading a matrix is async on purpose. A read issued after a write is guaranteed to observe it, because the
read itself goes through the queue; intermediate polls are possible, but if you poll after every operation
you are paying the synchronization you were supposed to be saving.

*/

pub mod buffer;
pub mod datatype;
pub mod engine;
pub mod errors;
pub mod expression;
pub mod kernels;
pub mod matrix;
pub mod operation;
pub mod queue;
pub mod worker;

pub use datatype::MatrixDataType;
pub use engine::MatrixEngine;
pub use expression::MatrixExpr;
pub use matrix::Matrix;

#[cfg(test)]
mod tests;
