//! Buffer handoff between the USB event thread and the conversion thread.
//!
//! The queue owns a fixed arena of [`RawBuffer`]s. The producer never blocks:
//! a completed transfer buffer is swapped for a spare one, or handed straight
//! back when no spare is left (the buffer is dropped). The consumer is the
//! only side allowed to wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::queue::ArrayQueue;

use crate::error::{Error, Result};
use crate::unpack::packed_sample_count;

/// Lock a mutex, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed-size byte buffer moved between transfers, the queue and the worker.
///
/// Deliberately not `Clone`: at any instant exactly one owner holds it.
#[derive(Debug)]
pub struct RawBuffer {
    id: usize,
    data: Box<[u8]>,
    len: usize,
}

impl RawBuffer {
    /// Allocate a zeroed buffer of `size` bytes.
    pub fn try_new(id: usize, size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::NoMemory("raw sample buffer"))?;
        data.resize(size, 0);
        Ok(Self {
            id,
            data: data.into_boxed_slice(),
            len: 0,
        })
    }

    /// Arena slot this buffer was allocated for.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing store, for the transport to fill.
    pub fn as_mut_capacity(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark `len` bytes valid (clamped to the capacity).
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }
}

/// Counters kept by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Buffers handed to the consumer side.
    pub published_buffers: u64,
    /// Buffers discarded because the queue was full.
    pub dropped_buffers: u64,
    /// Samples carried by the dropped buffers.
    pub dropped_samples: u64,
}

/// Single-producer / single-consumer handoff queue.
///
/// `filled` holds published buffers in arrival order. `spare` holds the
/// buffers the producer may swap in. A buffer taken by the consumer is in
/// neither until it is released, so at most `depth` buffers are ever pending.
#[derive(Debug)]
pub struct HandoffQueue {
    filled: ArrayQueue<RawBuffer>,
    spare: ArrayQueue<RawBuffer>,
    waiting: Mutex<bool>,
    ready: Condvar,
    packed: bool,
    published: AtomicU64,
    dropped_buffers: AtomicU64,
    dropped_samples: AtomicU64,
}

impl HandoffQueue {
    /// Create a queue of `depth` slots, each backed by a `buffer_size` byte buffer.
    ///
    /// `packed` tells the drop accounting how many samples a buffer carries.
    pub fn new(depth: usize, buffer_size: usize, packed: bool) -> Result<Self> {
        if depth == 0 {
            return Err(Error::invalid_param("queue depth must be at least 1"));
        }
        let spare = ArrayQueue::new(depth);
        for id in 0..depth {
            // Cannot overflow: exactly `depth` pushes into a queue of `depth`
            let _ = spare.push(RawBuffer::try_new(id, buffer_size)?);
        }
        Ok(Self {
            filled: ArrayQueue::new(depth),
            spare,
            waiting: Mutex::new(false),
            ready: Condvar::new(),
            packed,
            published: AtomicU64::new(0),
            dropped_buffers: AtomicU64::new(0),
            dropped_samples: AtomicU64::new(0),
        })
    }

    /// Number of slots.
    pub fn depth(&self) -> usize {
        self.spare.capacity()
    }

    /// Published buffers not yet taken.
    pub fn pending(&self) -> usize {
        self.filled.len()
    }

    /// Publish a completed buffer. Never blocks.
    ///
    /// Returns the buffer the producer should resubmit: a spare when the
    /// publish succeeded, or `buffer` itself when the queue was full and its
    /// contents were dropped.
    pub fn publish(&self, buffer: RawBuffer) -> RawBuffer {
        let Some(spare) = self.spare.pop() else {
            return self.drop_buffer(buffer);
        };

        match self.filled.push(buffer) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                self.signal();
                spare
            }
            Err(buffer) => {
                let _ = self.spare.push(spare);
                self.drop_buffer(buffer)
            }
        }
    }

    fn drop_buffer(&self, buffer: RawBuffer) -> RawBuffer {
        let dropped = self.dropped_buffers.fetch_add(1, Ordering::Relaxed) + 1;
        self.dropped_samples
            .fetch_add(self.sample_count(&buffer), Ordering::Relaxed);
        tracing::trace!(buffer = buffer.id(), dropped, "handoff queue full, dropping buffer");
        buffer
    }

    /// Samples held by the valid bytes of `buffer`.
    fn sample_count(&self, buffer: &RawBuffer) -> u64 {
        let samples = if self.packed {
            packed_sample_count(buffer.len())
        } else {
            buffer.len() / 2
        };
        samples as u64
    }

    /// Wake the consumer if it is parked.
    fn signal(&self) {
        let waiting = lock(&self.waiting);
        if *waiting {
            self.ready.notify_one();
        }
    }

    /// Take the oldest published buffer, parking while the queue is empty.
    ///
    /// Returns `None` once `active` reports false and nothing is pending.
    /// `active` is re-checked after every [`wake`](Self::wake).
    pub fn take(&self, active: impl Fn() -> bool) -> Option<RawBuffer> {
        let mut waiting = lock(&self.waiting);
        loop {
            if let Some(buffer) = self.filled.pop() {
                *waiting = false;
                return Some(buffer);
            }
            if !active() {
                *waiting = false;
                return None;
            }
            *waiting = true;
            waiting = self
                .ready
                .wait(waiting)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Give a taken buffer back so the producer can reuse it.
    pub fn release(&self, buffer: RawBuffer) {
        if let Err(buffer) = self.spare.push(buffer) {
            tracing::warn!(buffer = buffer.id(), "released a buffer the queue did not hand out");
        }
    }

    /// Wake a parked consumer so it re-evaluates its exit condition.
    pub fn wake(&self) {
        let _waiting = lock(&self.waiting);
        self.ready.notify_all();
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published_buffers: self.published.load(Ordering::Relaxed),
            dropped_buffers: self.dropped_buffers.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
        }
    }

    /// Total samples dropped so far.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn force_waiting(&self, value: bool) {
        *lock(&self.waiting) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const SIZE: usize = 64;

    fn incoming(id: usize, fill: u8) -> RawBuffer {
        let mut buffer = RawBuffer::try_new(id, SIZE).unwrap();
        buffer.as_mut_capacity().fill(fill);
        buffer.set_len(SIZE);
        buffer
    }

    #[test]
    fn test_nine_into_eight_drops_exactly_one() {
        let queue = HandoffQueue::new(8, SIZE, false).unwrap();
        let mut published = HashSet::new();
        let mut producer_side = HashSet::new();

        for n in 0..9 {
            let id = 100 + n;
            let returned = queue.publish(incoming(id, n as u8));
            published.insert(id);

            // The producer never gets back a buffer the queue still holds
            if returned.id() != id {
                assert!(!published.contains(&returned.id()));
            }
            assert!(producer_side.insert(returned.id()), "buffer {} owned twice", returned.id());
        }

        let stats = queue.stats();
        assert_eq!(stats.published_buffers, 8);
        assert_eq!(stats.dropped_buffers, 1);
        assert_eq!(stats.dropped_samples, 32);
        assert!(producer_side.contains(&108), "the ninth buffer is the dropped one");

        let taken: Vec<usize> = std::iter::from_fn(|| queue.take(|| false).map(|b| b.id())).collect();
        assert_eq!(taken, (100..108).collect::<Vec<_>>());
        for id in &taken {
            assert!(!producer_side.contains(id));
        }
    }

    #[test]
    fn test_fifo_order_and_contents() {
        let queue = HandoffQueue::new(4, SIZE, false).unwrap();
        for n in 0..3u8 {
            let spare = queue.publish(incoming(10 + n as usize, n));
            assert!(spare.id() < 4);
        }
        for n in 0..3u8 {
            let buffer = queue.take(|| true).unwrap();
            assert_eq!(buffer.as_slice(), &[n; SIZE][..]);
            queue.release(buffer);
        }
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_released_buffers_are_reused() {
        let queue = HandoffQueue::new(2, SIZE, false).unwrap();
        let mut buffer = incoming(50, 1);
        for _ in 0..10 {
            buffer = queue.publish(buffer);
            let taken = queue.take(|| true).unwrap();
            queue.release(taken);
        }
        assert_eq!(queue.stats().dropped_buffers, 0);
        assert_eq!(queue.stats().published_buffers, 10);
    }

    #[test]
    fn test_consumer_wakes_on_publish() {
        let queue = Arc::new(HandoffQueue::new(8, SIZE, false).unwrap());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take(|| true).map(|b| b.id()))
        };

        thread::sleep(Duration::from_millis(50));
        let _spare = queue.publish(incoming(77, 7));

        assert_eq!(consumer.join().unwrap(), Some(77));
    }

    #[test]
    fn test_wake_releases_consumer_on_stop() {
        let queue = Arc::new(HandoffQueue::new(8, SIZE, false).unwrap());
        let active = Arc::new(AtomicBool::new(true));
        let consumer = {
            let queue = Arc::clone(&queue);
            let active = Arc::clone(&active);
            thread::spawn(move || queue.take(|| active.load(Ordering::SeqCst)).is_none())
        };

        thread::sleep(Duration::from_millis(50));
        active.store(false, Ordering::SeqCst);
        queue.wake();

        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_stale_waiting_flag_does_not_overfill() {
        let queue = HandoffQueue::new(8, SIZE, false).unwrap();
        for n in 0..8 {
            let _ = queue.publish(incoming(200 + n, 0));
        }

        // A consumer that parked and has not yet cleared its flag
        queue.force_waiting(true);
        let returned = queue.publish(incoming(300, 0));

        assert_eq!(returned.id(), 300);
        assert_eq!(queue.pending(), 8);
        assert_eq!(queue.stats().dropped_buffers, 1);
    }

    #[test]
    fn test_short_transfer_drop_counts_valid_samples() {
        let queue = HandoffQueue::new(1, SIZE, false).unwrap();
        let _ = queue.publish(incoming(1, 0));

        let mut short = RawBuffer::try_new(2, SIZE).unwrap();
        short.set_len(10);
        let _ = queue.publish(short);
        assert_eq!(queue.stats().dropped_samples, 5);

        let packed = HandoffQueue::new(1, 48, true).unwrap();
        let mut full = RawBuffer::try_new(3, 48).unwrap();
        full.set_len(48);
        let _ = packed.publish(full);
        let mut partial = RawBuffer::try_new(4, 48).unwrap();
        partial.set_len(24);
        let _ = packed.publish(partial);
        assert_eq!(packed.stats().dropped_samples, 16);
    }

    #[test]
    fn test_zero_depth_rejected() {
        assert!(matches!(
            HandoffQueue::new(0, SIZE, false),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn test_set_len_clamps() {
        let mut buffer = RawBuffer::try_new(0, 16).unwrap();
        buffer.set_len(100);
        assert_eq!(buffer.len(), 16);
        assert!(!buffer.is_empty());
    }
}
