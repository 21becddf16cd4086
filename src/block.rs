//! Block Buffers
//!
//! Preallocated f32 scratch storage for block processing. Every per-port
//! buffer a voice needs is acquired from a [`BufferPool`] up front so the
//! audio path never allocates; buffers are addressed by plain indices to
//! keep the inner loops free of string or map lookups.

/// Upper bound on the host block length. `process_audio` accepts any
/// block of 1..=`MAX_BLOCK_SIZE` frames (128 is the typical worklet size).
pub const MAX_BLOCK_SIZE: usize = 2048;

/// A pool of equally sized f32 buffers backed by one contiguous allocation.
///
/// Indices returned by [`BufferPool::acquire`] stay valid until
/// [`BufferPool::reset`]; the pool only ever grows.
#[derive(Debug, Clone)]
pub struct BufferPool {
    data: Vec<f32>,
    buffer_len: usize,
    count: usize,
}

impl BufferPool {
    /// Create a pool of `buffer_len`-sample buffers, preallocating room
    /// for `initial_capacity` of them.
    pub fn new(buffer_len: usize, initial_capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(buffer_len * initial_capacity),
            buffer_len,
            count: 0,
        }
    }

    /// Length in samples of every buffer in the pool.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Number of buffers handed out so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Acquire a zeroed buffer and return its index.
    pub fn acquire(&mut self) -> usize {
        let idx = self.count;
        self.data.resize(self.data.len() + self.buffer_len, 0.0);
        self.count += 1;
        idx
    }

    /// Drop all buffers, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.count = 0;
    }

    #[inline]
    pub fn buffer(&self, idx: usize) -> &[f32] {
        let start = idx * self.buffer_len;
        &self.data[start..start + self.buffer_len]
    }

    #[inline]
    pub fn buffer_mut(&mut self, idx: usize) -> &mut [f32] {
        let start = idx * self.buffer_len;
        &mut self.data[start..start + self.buffer_len]
    }

    /// Zero one buffer.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        self.buffer_mut(idx).fill(0.0);
    }

    /// Zero every buffer in the pool.
    pub fn clear_all(&mut self) {
        self.data.fill(0.0);
    }

    /// Fill one buffer with a constant.
    #[inline]
    pub fn fill(&mut self, idx: usize, value: f32) {
        self.buffer_mut(idx).fill(value);
    }

    /// Copy `src` into a buffer; a single-element `src` is broadcast, a
    /// shorter `src` is extended with its last value.
    pub fn copy_in(&mut self, idx: usize, src: &[f32]) {
        let dst = self.buffer_mut(idx);
        match src.len() {
            0 => dst.fill(0.0),
            1 => dst.fill(src[0]),
            n if n >= dst.len() => dst.copy_from_slice(&src[..dst.len()]),
            n => {
                dst[..n].copy_from_slice(src);
                dst[n..].fill(src[n - 1]);
            }
        }
    }

    /// Borrow `count` consecutively acquired buffers as one region.
    ///
    /// Buffers acquired back to back are adjacent in storage, so a run of
    /// them can be handed out as a single slice and split without any
    /// bookkeeping allocation.
    #[inline]
    pub fn buffers(&self, first: usize, count: usize) -> &[f32] {
        let start = first * self.buffer_len;
        &self.data[start..start + count * self.buffer_len]
    }

    /// Mutable variant of [`BufferPool::buffers`].
    #[inline]
    pub fn buffers_mut(&mut self, first: usize, count: usize) -> &mut [f32] {
        let start = first * self.buffer_len;
        &mut self.data[start..start + count * self.buffer_len]
    }
}
