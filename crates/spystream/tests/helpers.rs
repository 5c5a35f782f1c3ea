//! Test helpers: a scripted bulk transport and synthetic ADC signals

#![allow(dead_code)]

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spystream::{
    BulkTransport, Completion, Error, RawBuffer, StreamController, StreamState, TransferStatus,
};

/// One scripted transfer outcome
#[derive(Debug, Clone)]
pub enum Step {
    /// Complete the next transfer with these bytes
    Payload(Vec<u8>),
    /// Complete the next transfer with an error
    Fail,
}

/// Counters visible from the test while the transport is owned by the stream
#[derive(Debug, Default)]
pub struct Probe {
    pub submitted: AtomicUsize,
    pub delivered: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub in_flight: AtomicUsize,
}

/// Bulk transport replaying a script of completions
///
/// With a gate, step `k` is only delivered once the gate counter has reached
/// `k - max_ahead + 1`, which keeps a test consumer from falling behind.
pub struct MockTransport {
    script: VecDeque<Step>,
    pending: VecDeque<RawBuffer>,
    cancelled: Vec<RawBuffer>,
    gate: Option<(Arc<AtomicUsize>, usize)>,
    fail_submit_after: Option<usize>,
    sent: usize,
    probe: Arc<Probe>,
}

impl MockTransport {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: script.into(),
            pending: VecDeque::new(),
            cancelled: Vec::new(),
            gate: None,
            fail_submit_after: None,
            sent: 0,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn idle() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_gate(mut self, gate: Arc<AtomicUsize>, max_ahead: usize) -> Self {
        self.gate = Some((gate, max_ahead));
        self
    }

    /// Accept `count` submissions, then refuse every further one.
    pub fn with_fail_submit_after(mut self, count: usize) -> Self {
        self.fail_submit_after = Some(count);
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }

    fn may_send(&self) -> bool {
        match &self.gate {
            Some((gate, max_ahead)) => self.sent < gate.load(Ordering::SeqCst) + max_ahead,
            None => true,
        }
    }

    fn sync_probe(&self) {
        self.probe
            .in_flight
            .store(self.in_flight(), Ordering::SeqCst);
    }
}

impl BulkTransport for MockTransport {
    fn submit(&mut self, buffer: RawBuffer) -> spystream::Result<()> {
        let accepted = self.probe.submitted.load(Ordering::SeqCst);
        if self.fail_submit_after.is_some_and(|limit| accepted >= limit) {
            return Err(Error::StreamingError(format!(
                "submit of buffer {} refused",
                buffer.id()
            )));
        }
        self.pending.push_back(buffer);
        self.probe.submitted.fetch_add(1, Ordering::SeqCst);
        self.sync_probe();
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.cancelled.extend(self.pending.drain(..));
        self.sync_probe();
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.cancelled.len()
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> spystream::Result<()> {
        for buffer in self.cancelled.drain(..) {
            self.probe.cancelled.fetch_add(1, Ordering::SeqCst);
            completions.push(Completion::new(buffer, TransferStatus::Cancelled));
        }

        let ready = !self.script.is_empty() && !self.pending.is_empty() && self.may_send();
        if !ready {
            self.sync_probe();
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            return Ok(());
        }

        let (Some(step), Some(mut buffer)) = (self.script.pop_front(), self.pending.pop_front())
        else {
            return Ok(());
        };
        self.sent += 1;
        match step {
            Step::Payload(bytes) => {
                let n = bytes.len().min(buffer.capacity());
                buffer.as_mut_capacity()[..n].copy_from_slice(&bytes[..n]);
                buffer.set_len(n);
                self.probe.delivered.fetch_add(1, Ordering::SeqCst);
                completions.push(Completion::new(buffer, TransferStatus::Completed));
            }
            Step::Fail => {
                buffer.set_len(0);
                completions.push(Completion::new(buffer, TransferStatus::Error));
            }
        }
        self.sync_probe();
        Ok(())
    }
}

/// Unsigned 12-bit samples of a real cosine at `freq` cycles per sample,
/// continuing the phase from sample `offset`
pub fn tone_samples(freq: f64, amplitude: f64, offset: usize, count: usize) -> Vec<u16> {
    (offset..offset + count)
        .map(|n| (2048.0 + amplitude * (2.0 * PI * freq * n as f64).cos()).round() as u16)
        .collect()
}

/// Little-endian 16-bit payload
pub fn to_bytes(samples: &[u16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// 12-bit packed payload (eight samples per three little-endian words)
pub fn pack_samples(samples: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() / 8 * 12);
    for s in samples.chunks_exact(8) {
        let s: Vec<u32> = s.iter().map(|&x| (x & 0xfff) as u32).collect();
        let w0 = (s[0] << 20) | (s[1] << 8) | (s[2] >> 4);
        let w1 = ((s[2] & 0xf) << 28) | (s[3] << 16) | (s[4] << 4) | (s[5] >> 8);
        let w2 = ((s[5] & 0xff) << 24) | (s[6] << 12) | s[7];
        for w in [w0, w1, w2] {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }
    out
}

/// `count` consecutive unpacked payloads of one continuous tone
pub fn tone_script(freq: f64, samples_per_buffer: usize, count: usize) -> Vec<Step> {
    (0..count)
        .map(|k| {
            let samples = tone_samples(freq, 1000.0, k * samples_per_buffer, samples_per_buffer);
            Step::Payload(to_bytes(&samples))
        })
        .collect()
}

/// Poll `cond` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Wait for a stream to leave the `Streaming` state
pub fn wait_for_end<T: BulkTransport>(stream: &StreamController<T>) -> bool {
    wait_until(Duration::from_secs(60), || stream.state() != StreamState::Streaming)
}
