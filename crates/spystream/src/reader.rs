//! Pull-style adapters over the callback API.
//!
//! Both readers copy every block out as `Vec<Complex<f32>>` into a bounded
//! channel. When the channel is full the block is dropped, so a slow reader
//! never stalls the conversion thread. Dropping a reader stops its stream.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use crossbeam::channel::{self, Receiver, TrySendError};
use futures::Stream;
use num_complex::Complex;

use crate::error::Result;
use crate::stream::{StreamController, StreamStats};
use crate::transfer::BulkTransport;

/// Blocks buffered between the conversion thread and the reader.
pub const DEFAULT_READER_CAPACITY: usize = 32;

/// Blocking iterator over converted blocks.
///
/// # Example
///
/// ```no_run
/// use spystream::{Airspy, BlockReader, StreamController};
///
/// let device = Airspy::open_first()?;
/// device.set_receiver_mode(spystream::ReceiverMode::Rx)?;
/// let reader = BlockReader::start(StreamController::new(device.bulk_transport()))?;
///
/// for block in reader.take(10) {
///     println!("Got {} samples", block.len());
/// }
/// # Ok::<(), spystream::Error>(())
/// ```
pub struct BlockReader<T: BulkTransport> {
    stream: StreamController<T>,
    rx: Receiver<Vec<Complex<f32>>>,
}

impl<T: BulkTransport> BlockReader<T> {
    /// Start `stream` with the default channel capacity.
    pub fn start(stream: StreamController<T>) -> Result<Self> {
        Self::with_capacity(stream, DEFAULT_READER_CAPACITY)
    }

    pub fn with_capacity(mut stream: StreamController<T>, capacity: usize) -> Result<Self> {
        let (tx, rx) = channel::bounded(capacity.max(1));
        stream.start(move |block| match tx.try_send(block.to_complex()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(TrySendError::Full(_)) => {
                tracing::trace!("reader channel full, dropping block");
                ControlFlow::Continue(())
            }
            Err(TrySendError::Disconnected(_)) => ControlFlow::Break(()),
        })?;
        Ok(Self { stream, rx })
    }

    pub fn controller(&self) -> &StreamController<T> {
        &self.stream
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// Stop the stream and hand the controller back.
    pub fn into_controller(self) -> Result<StreamController<T>> {
        let Self { mut stream, .. } = self;
        stream.stop()?;
        Ok(stream)
    }
}

impl<T: BulkTransport> Iterator for BlockReader<T> {
    type Item = Vec<Complex<f32>>;

    /// Returns `None` once the stream has ended and every buffered block was read.
    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Asynchronous stream of converted blocks.
///
/// ```no_run
/// use futures::StreamExt;
/// use spystream::{Airspy, AsyncBlockReader, StreamController};
///
/// # async fn example() -> Result<(), spystream::Error> {
/// let device = Airspy::open_first()?;
/// device.set_receiver_mode(spystream::ReceiverMode::Rx)?;
/// let mut reader = AsyncBlockReader::start(StreamController::new(device.bulk_transport()))?;
///
/// while let Some(block) = reader.next().await {
///     println!("Got {} samples", block.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct AsyncBlockReader<T: BulkTransport> {
    stream: StreamController<T>,
    rx: tokio::sync::mpsc::Receiver<Vec<Complex<f32>>>,
}

impl<T: BulkTransport> AsyncBlockReader<T> {
    pub fn start(stream: StreamController<T>) -> Result<Self> {
        Self::with_capacity(stream, DEFAULT_READER_CAPACITY)
    }

    pub fn with_capacity(mut stream: StreamController<T>, capacity: usize) -> Result<Self> {
        use tokio::sync::mpsc::error::TrySendError;

        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        stream.start(move |block| match tx.try_send(block.to_complex()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(TrySendError::Full(_)) => {
                tracing::trace!("reader channel full, dropping block");
                ControlFlow::Continue(())
            }
            Err(TrySendError::Closed(_)) => ControlFlow::Break(()),
        })?;
        Ok(Self { stream, rx })
    }

    pub fn controller(&self) -> &StreamController<T> {
        &self.stream
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// Stop the stream and hand the controller back.
    pub fn into_controller(self) -> Result<StreamController<T>> {
        let Self { mut stream, .. } = self;
        stream.stop()?;
        Ok(stream)
    }
}

impl<T: BulkTransport> Stream for AsyncBlockReader<T> {
    type Item = Vec<Complex<f32>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
