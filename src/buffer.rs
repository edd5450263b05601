//! Shared storage arenas and the views over them
//!
//! Every matrix ultimately points into one [`MatrixBuffer`], which is a lightweight
//! (offset, length) view over a reference counted storage arena. All the views over
//! the same arena share one pending-operation counter, so locking any of them locks
//! the whole family as a single unit. This is flat on purpose: there is no parent /
//! child bookkeeping to walk, a view is just a window.
//!
//! The arena also owns the raw storage itself, which can be taken out wholesale to
//! be moved to the worker thread and reinstalled afterwards, see
//! [`MatrixBuffer::take_storage`] and [`MatrixBuffer::replace`].

use crate::datatype::MatrixDataType;
use crate::errors::MatrixError;
use futures_channel::oneshot;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Raw byte storage with 8 byte alignment
///
/// A plain `Vec<u8>` only guarantees alignment 1, which is not enough to
/// reinterpret the bytes as `f64` slices. Backing the bytes with `u64` words keeps
/// every aligned offset castable with [`bytemuck`].
#[derive(Debug, Clone, Default)]
pub struct RawBuffer {
    words: Vec<u64>,
    len: usize,
}

impl RawBuffer {
    /// Creates a zero-filled buffer of `len` bytes
    pub fn with_byte_len(len: usize) -> RawBuffer {
        RawBuffer {
            words: vec![0u64; (len + 7) / 8],
            len,
        }
    }

    /// Copies `bytes` into a freshly aligned buffer
    pub fn from_bytes(bytes: &[u8]) -> RawBuffer {
        let mut buffer = RawBuffer::with_byte_len(bytes.len());
        buffer.bytes_mut().copy_from_slice(bytes);
        buffer
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

/// Reads the element at `index` (in elements, not bytes) out of a raw byte region
pub(crate) fn decode(dtype: MatrixDataType, bytes: &[u8], index: usize) -> f64 {
    let at = index * dtype.byte_size();
    match dtype {
        MatrixDataType::F32 => {
            bytemuck::pod_read_unaligned::<f32>(&bytes[at..at + 4]) as f64
        }
        MatrixDataType::F64 => bytemuck::pod_read_unaligned::<f64>(&bytes[at..at + 8]),
    }
}

/// Writes `value` at `index` (in elements) into a raw byte region
pub(crate) fn encode(dtype: MatrixDataType, bytes: &mut [u8], index: usize, value: f64) {
    let at = index * dtype.byte_size();
    match dtype {
        MatrixDataType::F32 => {
            bytes[at..at + 4].copy_from_slice(bytemuck::bytes_of(&(value as f32)))
        }
        MatrixDataType::F64 => bytes[at..at + 8].copy_from_slice(bytemuck::bytes_of(&value)),
    }
}

/// Shared state of one storage arena
#[derive(Debug)]
struct ArenaState {
    data: RawBuffer,
    /// number of operations currently scheduled or running on this arena
    pending: usize,
    /// tasks waiting for the arena to become idle, woken in FIFO order
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A view over a shared storage arena
///
/// Cloning is cheap and every clone keeps pointing at the same storage. `offset`
/// and `length` are measured in elements of `dtype`.
#[derive(Debug, Clone)]
pub struct MatrixBuffer {
    arena: Arc<Mutex<ArenaState>>,
    dtype: MatrixDataType,
    offset: usize,
    length: usize,
}

impl MatrixBuffer {
    /// Allocates a fresh arena of `length` elements, optionally initialized with
    /// `values` (converted to the storage precision)
    pub fn new(
        dtype: MatrixDataType,
        length: usize,
        values: Option<&[f64]>,
    ) -> Result<MatrixBuffer, MatrixError> {
        let mut data = RawBuffer::with_byte_len(length * dtype.byte_size());
        if let Some(values) = values {
            if values.len() > length {
                return Err(MatrixError::InvalidRange {
                    begin: 0,
                    end: values.len(),
                    length,
                });
            }
            let bytes = data.bytes_mut();
            for (i, &value) in values.iter().enumerate() {
                encode(dtype, bytes, i, value);
            }
        }

        Ok(MatrixBuffer {
            arena: Arc::new(Mutex::new(ArenaState {
                data,
                pending: 0,
                waiters: VecDeque::new(),
            })),
            dtype,
            offset: 0,
            length,
        })
    }

    pub fn dtype(&self) -> MatrixDataType {
        self.dtype
    }

    /// Length of the view, in elements
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Offset of the view from the start of the arena, in bytes
    pub fn byte_offset(&self) -> usize {
        self.offset * self.dtype.byte_size()
    }

    /// Whether two views live on the same arena
    pub fn same_arena(&self, other: &MatrixBuffer) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena)
    }

    /// Marks one more operation in flight on this arena
    pub fn lock(&self) {
        let mut state = self.state();
        state.pending += 1;
    }

    /// Marks one operation as finished; when the count returns to zero every
    /// waiter queued so far is woken, in the order it arrived
    pub fn unlock(&self) {
        let woken = {
            let mut state = self.state();
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 {
                std::mem::take(&mut state.waiters)
            } else {
                VecDeque::new()
            }
        };
        for waiter in woken {
            let _ = waiter.send(());
        }
    }

    /// Resolves once the arena is idle
    ///
    /// If another operation sneaks in between the wake-up and the re-check, the
    /// wait simply starts over; a waiter never runs while the arena is locked.
    pub async fn ready(&self) {
        loop {
            let rx = {
                let mut state = self.state();
                if state.pending == 0 {
                    return;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };
            // a canceled sender just means the arena went away from under us,
            // loop around and re-check
            let _ = rx.await;
        }
    }

    /// Number of operations currently holding the arena
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.state().pending
    }

    /// Takes the whole arena storage out, leaving it empty
    ///
    /// This is the moving half of the worker handshake; the caller is expected to
    /// [`MatrixBuffer::replace`] the storage once the computation is done.
    pub fn take_storage(&self) -> RawBuffer {
        std::mem::take(&mut self.state().data)
    }

    /// Reinstalls a storage previously taken with [`MatrixBuffer::take_storage`]
    pub fn replace(&self, data: RawBuffer) {
        self.state().data = data;
    }

    /// Creates a child view over `[begin, begin + length)` of this view
    ///
    /// Waits for the arena to be idle first, so the new view never observes a
    /// half-written state.
    pub async fn shared(&self, begin: usize, length: usize) -> Result<MatrixBuffer, MatrixError> {
        if begin + length > self.length {
            return Err(MatrixError::InvalidRange {
                begin,
                end: begin + length,
                length: self.length,
            });
        }

        self.ready().await;
        Ok(MatrixBuffer {
            arena: Arc::clone(&self.arena),
            dtype: self.dtype,
            offset: self.offset + begin,
            length,
        })
    }

    /// Runs `f` over the bytes of this view
    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.state();
        let begin = self.byte_offset();
        let end = begin + self.length * self.dtype.byte_size();
        f(&state.data.bytes()[begin..end])
    }

    /// Runs `f` over the mutable bytes of this view
    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state();
        let begin = self.byte_offset();
        let end = begin + self.length * self.dtype.byte_size();
        f(&mut state.data.bytes_mut()[begin..end])
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        match self.arena.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
