//! Bulk transfer engine.
//!
//! A [`BulkTransport`] keeps a pool of buffers queued on the sample endpoint.
//! The engine thread pumps its events, publishes every completed buffer to the
//! [`HandoffQueue`] and immediately resubmits whatever buffer the queue hands
//! back, so ingestion never waits on the conversion side.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::queue::{lock, HandoffQueue, RawBuffer};
use crate::stream::{StopReason, StreamFlags};

/// Upper bound on event pumps while waiting for cancelled transfers.
const MAX_CANCEL_ROUNDS: usize = 8;

/// Outcome of one bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Data arrived; `buffer.len()` bytes are valid.
    Completed,
    /// The transfer was cancelled before completing.
    Cancelled,
    /// The transfer failed at the USB level.
    Error,
}

/// A finished transfer and the buffer it owned.
#[derive(Debug)]
pub struct Completion {
    pub buffer: RawBuffer,
    pub status: TransferStatus,
}

impl Completion {
    pub fn new(buffer: RawBuffer, status: TransferStatus) -> Self {
        Self { buffer, status }
    }

    /// Number of valid bytes delivered.
    pub fn length(&self) -> usize {
        self.buffer.len()
    }
}

/// Asynchronous bulk IN endpoint.
///
/// Completions are only ever reported from inside
/// [`handle_events`](Self::handle_events), which the engine calls from its own
/// thread.
pub trait BulkTransport: Send + 'static {
    /// Queue `buffer` for the next transfer.
    fn submit(&mut self, buffer: RawBuffer) -> Result<()>;

    /// Cancel every outstanding transfer. Their buffers come back as
    /// [`TransferStatus::Cancelled`] completions.
    fn cancel_all(&mut self);

    /// Number of submitted transfers not yet reported.
    fn in_flight(&self) -> usize;

    /// Wait up to `timeout` for transfer activity and append what finished.
    fn handle_events(&mut self, timeout: Duration, completions: &mut Vec<Completion>) -> Result<()>;
}

/// Cancel outstanding transfers and pump until their buffers have come back.
pub(crate) fn cancel_and_drain<T: BulkTransport>(transport: &mut T, timeout: Duration) {
    transport.cancel_all();
    let mut completions = Vec::new();
    for _ in 0..MAX_CANCEL_ROUNDS {
        if transport.in_flight() == 0 {
            return;
        }
        if let Err(e) = transport.handle_events(timeout, &mut completions) {
            tracing::debug!("event pump failed while draining cancelled transfers: {}", e);
            return;
        }
        completions.clear();
    }
    tracing::warn!(
        "{} transfers still in flight after cancellation",
        transport.in_flight()
    );
}

/// Owns the USB event thread of one stream.
#[derive(Debug)]
pub(crate) struct TransferEngine {
    handle: JoinHandle<()>,
}

impl TransferEngine {
    /// Spawn the event thread.
    ///
    /// The transport must already have its transfer pool submitted. It stays
    /// locked by the engine thread until that thread exits.
    pub(crate) fn spawn<T: BulkTransport>(
        transport: Arc<Mutex<T>>,
        queue: Arc<HandoffQueue>,
        flags: Arc<StreamFlags>,
        timeout: Duration,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("spystream-usb".to_string())
            .spawn(move || run(&transport, &queue, &flags, timeout))
            .map_err(Error::Thread)?;
        Ok(Self { handle })
    }

    /// Wait for the event thread to exit.
    pub(crate) fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| Error::Other("USB event thread panicked".to_string()))
    }
}

fn run<T: BulkTransport>(
    transport: &Mutex<T>,
    queue: &HandoffQueue,
    flags: &StreamFlags,
    timeout: Duration,
) {
    let mut transport = lock(transport);
    let mut completions = Vec::with_capacity(transport.in_flight());
    tracing::debug!("USB event thread started with {} transfers", transport.in_flight());

    while flags.is_active() {
        if let Err(e) = transport.handle_events(timeout, &mut completions) {
            tracing::warn!("USB event handling failed: {}", e);
            flags.fail(StopReason::EventLoop);
            break;
        }

        for completion in completions.drain(..) {
            match completion.status {
                TransferStatus::Completed if flags.is_active() => {
                    let next = queue.publish(completion.buffer);
                    if let Err(e) = transport.submit(next) {
                        tracing::warn!("failed to resubmit bulk transfer: {}", e);
                        flags.fail(StopReason::Transfer);
                    }
                }
                TransferStatus::Completed | TransferStatus::Cancelled => {}
                TransferStatus::Error => {
                    tracing::warn!(buffer = completion.buffer.id(), "bulk transfer failed");
                    flags.fail(StopReason::Transfer);
                }
            }
        }
    }

    cancel_and_drain(&mut *transport, timeout);
    queue.wake();
    tracing::debug!("USB event thread exiting");
}
