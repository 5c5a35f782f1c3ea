//! Sample history for streaming FIR filters.
//!
//! [`HistoryRing`] keeps the last `len` input samples as one contiguous slice
//! without modulo indexing. The backing store is `len * factor` long and the
//! write cursor walks downwards, so the newest sample is always at the start of
//! the window. When the cursor reaches the bottom it jumps back to the top and
//! the `len - 1` most recent samples are replicated there, which happens once
//! every `len * (factor - 1) + 1` pushes.

/// Circular sample history with replicated wrap-around.
#[derive(Debug, Clone)]
pub struct HistoryRing<T> {
    buf: Vec<T>,
    len: usize,
    index: usize,
}

impl<T: Copy + Default> HistoryRing<T> {
    /// Create a history window of `len` samples backed by `len * factor` slots.
    ///
    /// # Panics
    ///
    /// Panics if `len` is 0 or `factor` is smaller than 2.
    pub fn new(len: usize, factor: usize) -> Self {
        assert!(len > 0, "History length must be greater than 0");
        assert!(factor >= 2, "Size factor must be at least 2");
        Self {
            buf: vec![T::default(); len * factor],
            len,
            index: 0,
        }
    }

    /// Window length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: a window holds at least one sample.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Size of the backing store.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Current write cursor.
    pub fn cursor(&self) -> usize {
        self.index
    }

    /// Store `sample` as the newest entry of the window.
    ///
    /// Call [`advance`](Self::advance) once the window has been consumed.
    #[inline]
    pub fn push(&mut self, sample: T) {
        self.buf[self.index] = sample;
    }

    /// The last `len` samples, newest first.
    #[inline]
    pub fn window(&self) -> &[T] {
        &self.buf[self.index..self.index + self.len]
    }

    /// Move the cursor to the next (older-to-newer) slot.
    #[inline]
    pub fn advance(&mut self) {
        if self.index == 0 {
            self.index = self.len * (self.buf.len() / self.len - 1);
            let top = self.index + 1;
            self.buf.copy_within(0..self.len - 1, top);
        } else {
            self.index -= 1;
        }
    }

    /// Zero the history and rewind the cursor.
    pub fn reset(&mut self) {
        self.buf.fill(T::default());
        self.index = 0;
    }
}
