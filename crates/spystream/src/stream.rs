//! Stream controller: runs the transfer engine and the conversion worker as
//! one logical stream.
//!
//! ```text
//! Idle --start()--> Streaming --callback Break / transfer error--> StopRequested
//!   ^                   |                                              |
//!   +-----stop()--------+----------------------stop()------------------+
//! ```

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::iqconverter::validate_kernel;
use crate::kernels::{HB_KERNEL_FLOAT, HB_KERNEL_INT16};
use crate::queue::{lock, HandoffQueue, RawBuffer};
use crate::transfer::{cancel_and_drain, BulkTransport, TransferEngine};
use crate::unpack::packed_sample_count;
use crate::worker::{ConversionWorker, SampleBlock, SampleType};

/// Transfers kept in flight on the sample endpoint.
pub const DEFAULT_TRANSFER_COUNT: usize = 16;

/// Slots in the handoff queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Bounded wait of one event pump.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

/// Transfer size with 16-bit samples.
pub const BUFFER_SIZE: usize = 262_144;

/// Transfer size with 12-bit packing.
pub const PACKED_BUFFER_SIZE: usize = 147_456;

/// Why a stream ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StopReason {
    /// A bulk transfer completed with an error or could not be resubmitted.
    Transfer = 1,
    /// The transport event pump failed.
    EventLoop = 2,
    /// The application callback panicked.
    Callback = 3,
}

/// Flags shared by the controller, the event thread and the worker.
#[derive(Debug, Default)]
pub(crate) struct StreamFlags {
    streaming: AtomicBool,
    stop_requested: AtomicBool,
    failure: AtomicU8,
    blocks: AtomicU64,
}

impl StreamFlags {
    pub(crate) fn begin(&self) {
        self.failure.store(0, Ordering::SeqCst);
        self.blocks.store(0, Ordering::Relaxed);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.streaming.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Streaming and nobody asked to stop.
    pub(crate) fn is_active(&self) -> bool {
        self.is_streaming() && !self.stop_requested()
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Disable streaming. The first reason recorded wins.
    pub(crate) fn fail(&self, reason: StopReason) {
        let _ = self
            .failure
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
    }

    pub(crate) fn failure(&self) -> Option<StopReason> {
        match self.failure.load(Ordering::SeqCst) {
            1 => Some(StopReason::Transfer),
            2 => Some(StopReason::EventLoop),
            3 => Some(StopReason::Callback),
            _ => None,
        }
    }

    pub(crate) fn finish(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    pub(crate) fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Streaming state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No threads running; configuration may change.
    Idle,
    /// Transfers and conversion are running.
    Streaming,
    /// The stream is winding down and waits for [`StreamController::stop`].
    StopRequested,
}

/// Stream configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// 12-bit packed transfers.
    pub packing: bool,
    pub sample_type: SampleType,
    /// Transfers kept in flight.
    pub transfer_count: usize,
    /// Handoff queue slots.
    pub queue_depth: usize,
    /// Event pump timeout.
    pub event_timeout: Duration,
    /// Half-band kernel for the float domain.
    pub kernel_float32: Vec<f32>,
    /// Half-band kernel for the Q15 domain.
    pub kernel_int16: Vec<i16>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            packing: false,
            sample_type: SampleType::Float32Iq,
            transfer_count: DEFAULT_TRANSFER_COUNT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            kernel_float32: HB_KERNEL_FLOAT.to_vec(),
            kernel_int16: HB_KERNEL_INT16.to_vec(),
        }
    }
}

impl StreamConfig {
    pub fn with_packing(mut self, packing: bool) -> Self {
        self.packing = packing;
        self
    }

    pub fn with_sample_type(mut self, sample_type: SampleType) -> Self {
        self.sample_type = sample_type;
        self
    }

    pub fn with_transfer_count(mut self, count: usize) -> Self {
        self.transfer_count = count;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Bytes per transfer for the current packing mode.
    pub fn buffer_size(&self) -> usize {
        if self.packing {
            PACKED_BUFFER_SIZE
        } else {
            BUFFER_SIZE
        }
    }

    /// Raw samples per transfer for the current packing mode.
    pub fn samples_per_buffer(&self) -> usize {
        if self.packing {
            packed_sample_count(PACKED_BUFFER_SIZE)
        } else {
            BUFFER_SIZE / 2
        }
    }

    /// Check every field the stream depends on.
    pub fn validate(&self) -> Result<()> {
        if self.transfer_count == 0 {
            return Err(Error::invalid_param("transfer count must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(Error::invalid_param("queue depth must be at least 1"));
        }
        validate_kernel(&self.kernel_float32)?;
        validate_kernel(&self.kernel_int16)
    }
}

/// Counters of the current (or last) stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Blocks delivered to the callback.
    pub blocks: u64,
    /// Buffers that reached the conversion side.
    pub published_buffers: u64,
    /// Buffers dropped because the queue was full.
    pub dropped_buffers: u64,
    /// Samples carried by the dropped buffers.
    pub dropped_samples: u64,
}

/// Threads of a running stream.
struct Running {
    engine: TransferEngine,
    worker: JoinHandle<()>,
}

/// Owns one stream over a [`BulkTransport`].
///
/// # Example
///
/// ```no_run
/// use std::ops::ControlFlow;
/// use spystream::{Airspy, SampleType, StreamConfig, StreamController};
///
/// let device = Airspy::open_first()?;
/// let config = StreamConfig::default().with_sample_type(SampleType::Int16Iq);
/// let mut stream = StreamController::with_config(device.bulk_transport(), config)?;
///
/// device.start_rx(&mut stream, |block| {
///     println!("{} samples", block.count());
///     ControlFlow::Continue(())
/// })?;
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// device.stop_rx(&mut stream)?;
/// # Ok::<(), spystream::Error>(())
/// ```
pub struct StreamController<T: BulkTransport> {
    transport: Arc<Mutex<T>>,
    config: StreamConfig,
    flags: Arc<StreamFlags>,
    queue: Option<Arc<HandoffQueue>>,
    running: Option<Running>,
}

impl<T: BulkTransport> StreamController<T> {
    /// Create an idle controller with the default configuration.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            config: StreamConfig::default(),
            flags: Arc::new(StreamFlags::default()),
            queue: None,
            running: None,
        }
    }

    /// Create an idle controller, rejecting an invalid configuration.
    pub fn with_config(transport: T, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let mut controller = Self::new(transport);
        controller.config = config;
        Ok(controller)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        match &self.running {
            None => StreamState::Idle,
            Some(_) if self.flags.is_active() => StreamState::Streaming,
            Some(_) => StreamState::StopRequested,
        }
    }

    /// True while transfers are flowing and no stop was requested.
    pub fn is_streaming(&self) -> bool {
        self.running.is_some() && self.flags.is_active()
    }

    /// Health of the current (or last) stream.
    ///
    /// Failures inside the stream threads are only reported here.
    pub fn status(&self) -> Result<()> {
        match self.flags.failure() {
            Some(StopReason::Transfer | StopReason::Callback) => Err(Error::StreamingThread),
            Some(StopReason::EventLoop) => Err(Error::StreamingStopped),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> StreamStats {
        let queue = self
            .queue
            .as_ref()
            .map(|q| q.stats())
            .unwrap_or_default();
        StreamStats {
            blocks: self.flags.blocks(),
            published_buffers: queue.published_buffers,
            dropped_buffers: queue.dropped_buffers,
            dropped_samples: queue.dropped_samples,
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Switch 12-bit packing. Changes the transfer size.
    pub fn set_packing(&mut self, packing: bool) -> Result<()> {
        self.ensure_idle()?;
        self.config.packing = packing;
        Ok(())
    }

    pub fn set_sample_type(&mut self, sample_type: SampleType) -> Result<()> {
        self.ensure_idle()?;
        self.config.sample_type = sample_type;
        Ok(())
    }

    /// Install a custom float half-band kernel.
    pub fn set_conversion_filter_float32(&mut self, kernel: &[f32]) -> Result<()> {
        self.ensure_idle()?;
        validate_kernel(kernel)?;
        self.config.kernel_float32 = kernel.to_vec();
        Ok(())
    }

    /// Install a custom Q15 half-band kernel.
    pub fn set_conversion_filter_int16(&mut self, kernel: &[i16]) -> Result<()> {
        self.ensure_idle()?;
        validate_kernel(kernel)?;
        self.config.kernel_int16 = kernel.to_vec();
        Ok(())
    }

    /// Start streaming into `callback`.
    ///
    /// The callback runs on the conversion thread; returning
    /// `ControlFlow::Break(())` ends the stream after the current block.
    pub fn start<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&SampleBlock<'_>) -> ControlFlow<()> + Send + 'static,
    {
        self.ensure_idle()?;
        let config = &self.config;

        let queue = Arc::new(HandoffQueue::new(
            config.queue_depth,
            config.buffer_size(),
            config.packing,
        )?);
        let buffers = (0..config.transfer_count)
            .map(|i| RawBuffer::try_new(config.queue_depth + i, config.buffer_size()))
            .collect::<Result<Vec<_>>>()?;
        let worker = ConversionWorker::new(config)?;
        let timeout = config.event_timeout;

        self.flags.begin();
        self.queue = Some(Arc::clone(&queue));

        {
            let mut transport = lock(&self.transport);
            for buffer in buffers {
                if let Err(e) = transport.submit(buffer) {
                    tracing::warn!("failed to submit bulk transfer: {}", e);
                    cancel_and_drain(&mut *transport, timeout);
                    self.flags.finish();
                    return Err(e);
                }
            }
        }

        let worker = match worker.spawn(Arc::clone(&queue), Arc::clone(&self.flags), callback) {
            Ok(handle) => handle,
            Err(e) => {
                self.flags.finish();
                cancel_and_drain(&mut *lock(&self.transport), timeout);
                return Err(e);
            }
        };

        let engine = match TransferEngine::spawn(
            Arc::clone(&self.transport),
            Arc::clone(&queue),
            Arc::clone(&self.flags),
            timeout,
        ) {
            Ok(engine) => engine,
            Err(e) => {
                self.flags.request_stop();
                self.flags.finish();
                queue.wake();
                let _ = worker.join();
                cancel_and_drain(&mut *lock(&self.transport), timeout);
                return Err(e);
            }
        };

        self.running = Some(Running { engine, worker });
        tracing::info!(
            sample_type = %self.config.sample_type,
            packing = self.config.packing,
            transfers = self.config.transfer_count,
            "stream started"
        );
        Ok(())
    }

    /// Stop the stream and join both threads. Does nothing when idle.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        self.flags.request_stop();
        if let Some(queue) = &self.queue {
            queue.wake();
        }

        let engine = running.engine.join();
        let worker = running
            .worker
            .join()
            .map_err(|_| Error::Other("conversion thread panicked".to_string()));
        self.flags.finish();

        let stats = self.stats();
        tracing::info!(
            blocks = stats.blocks,
            dropped_buffers = stats.dropped_buffers,
            "stream stopped"
        );
        engine.and(worker)
    }
}

impl<T: BulkTransport> Drop for StreamController<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::debug!("error while stopping stream on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_geometry() {
        let config = StreamConfig::default();
        assert_eq!(config.buffer_size(), 262_144);
        assert_eq!(config.samples_per_buffer(), 131_072);

        let packed = config.with_packing(true);
        assert_eq!(packed.buffer_size(), 147_456);
        assert_eq!(packed.samples_per_buffer(), 98_304);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer_count, 16);
        assert_eq!(config.queue_depth, 8);
        assert_eq!(config.event_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StreamConfig::default().with_queue_depth(0);
        assert!(matches!(config.validate(), Err(Error::InvalidParam(_))));

        let mut config = StreamConfig::default();
        config.kernel_float32.pop();
        assert!(matches!(config.validate(), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn test_flags_first_failure_wins() {
        let flags = StreamFlags::default();
        flags.begin();
        assert!(flags.is_active());

        flags.fail(StopReason::Transfer);
        flags.fail(StopReason::EventLoop);
        assert_eq!(flags.failure(), Some(StopReason::Transfer));
        assert!(!flags.is_streaming());

        flags.begin();
        assert_eq!(flags.failure(), None);
        assert!(flags.is_active());
    }

    #[test]
    fn test_stop_request_deactivates() {
        let flags = StreamFlags::default();
        flags.begin();
        flags.request_stop();
        assert!(flags.is_streaming());
        assert!(!flags.is_active());
    }
}
