//! Continuous sample streaming from the data-in endpoint.
//!
//! A unit streams through exactly one asynchronous bulk-in transfer that is
//! resubmitted from its own completion callback. The callback runs on the
//! registry's event-pump thread, so the application callback it invokes
//! must not block: a slow consumer stalls every unit sharing the pump.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start--> Armed --first buffer--> Streaming
//!   ^                 \                      |
//!   |                  +-------stop----------+--> Cancelling --complete--> Idle
//!   |                                        |
//!   +-------------terminal status------------+
//! ```
//!
//! # Channel streaming
//!
//! [`channel_callback`] adapts the pipeline to a bounded
//! [`tokio::sync::mpsc`] channel read through a [`SampleReceiver`]. The
//! pump side never waits on the channel: when the consumer lags, buffers
//! are dropped and counted.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use perseus_core::transport::{Completion, CompletionCallback, TransferAction, TransferStatus};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bytes in one I/Q sample of the narrowband bitstreams.
pub const DEFAULT_BYTES_PER_SAMPLE: usize = 6;

/// Application callback receiving each full sample buffer.
pub type SampleCallback = Box<dyn FnMut(&[u8]) + Send>;

// ---------------------------------------------------------------------------
// StreamState
// ---------------------------------------------------------------------------

/// Where a unit's input pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No transfer allocated.
    Idle,
    /// Transfer submitted, no buffer received yet.
    Armed,
    /// At least one full buffer delivered.
    Streaming,
    /// Cancellation requested, waiting for the final completion.
    Cancelling,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Armed,
            2 => StreamState::Streaming,
            3 => StreamState::Cancelling,
            _ => StreamState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Armed => 1,
            StreamState::Streaming => 2,
            StreamState::Cancelling => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamShared
// ---------------------------------------------------------------------------

/// State shared between the owning unit and the completion callback.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    state: AtomicU8,
    cancel_requested: AtomicBool,
    complete: AtomicBool,
    bytes: AtomicU64,
    buffers: AtomicU64,
    short_buffers: AtomicU64,
}

impl StreamShared {
    pub(crate) fn armed() -> Arc<Self> {
        let shared = StreamShared::default();
        shared.set_state(StreamState::Armed);
        Arc::new(shared)
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Flag cancellation. Returns `false` if it was already requested.
    pub(crate) fn request_cancel(&self) -> bool {
        self.set_state(StreamState::Cancelling);
        !self.cancel_requested.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// The transfer reached its final completion; the pipeline is idle
    /// until the unit frees it.
    fn mark_complete(&self) {
        self.set_state(StreamState::Idle);
        self.complete.store(true, Ordering::Release);
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    pub(crate) fn short_buffers(&self) -> u64 {
        self.short_buffers.load(Ordering::Relaxed)
    }
}

/// Build the transfer completion callback for one stream.
///
/// | Completion                  | Action                                  |
/// |-----------------------------|-----------------------------------------|
/// | any, cancel requested       | mark complete (idle), release           |
/// | completed, full length      | deliver, count bytes, resubmit          |
/// | completed, short            | warn, drop, resubmit                    |
/// | timed out                   | log, resubmit                           |
/// | anything else               | mark complete (idle), release           |
pub(crate) fn completion_handler(
    shared: Arc<StreamShared>,
    mut app: SampleCallback,
) -> CompletionCallback {
    Box::new(move |done: &Completion<'_>| {
        if shared.cancel_requested.load(Ordering::Acquire) {
            shared.mark_complete();
            return TransferAction::Release;
        }
        match done.status {
            TransferStatus::Completed if done.data.len() == done.requested => {
                if shared.state() == StreamState::Armed {
                    shared.set_state(StreamState::Streaming);
                }
                app(done.data);
                shared.bytes.fetch_add(done.data.len() as u64, Ordering::Relaxed);
                shared.buffers.fetch_add(1, Ordering::Relaxed);
                TransferAction::Resubmit
            }
            TransferStatus::Completed => {
                shared.short_buffers.fetch_add(1, Ordering::Relaxed);
                warn!(
                    received = done.data.len(),
                    requested = done.requested,
                    "short sample buffer dropped"
                );
                TransferAction::Resubmit
            }
            TransferStatus::TimedOut => {
                debug!("sample transfer timed out, resubmitting");
                TransferAction::Resubmit
            }
            status => {
                warn!(%status, "sample transfer ended");
                shared.mark_complete();
                TransferAction::Release
            }
        }
    })
}

// ---------------------------------------------------------------------------
// StreamStats
// ---------------------------------------------------------------------------

/// Throughput summary of a stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStats {
    /// Bytes delivered to the application.
    pub bytes: u64,
    /// Full buffers delivered.
    pub buffers: u64,
    /// Short buffers dropped.
    pub short_buffers: u64,
    /// Time from start to stop (or to now while running).
    pub elapsed: Duration,
    pub bytes_per_sample: usize,
}

impl StreamStats {
    /// Samples delivered, in thousands.
    pub fn kilo_samples(&self) -> f64 {
        if self.bytes_per_sample == 0 {
            return 0.0;
        }
        self.bytes as f64 / self.bytes_per_sample as f64 / 1000.0
    }

    /// Average rate in kS/s. Zero before any time has elapsed.
    pub fn rate_ksps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.kilo_samples() / secs
    }
}

impl std::fmt::Display for StreamStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Elapsed time : {:.3} s - kSamples read: {:.0} - Rate: {:.1} kS/s",
            self.elapsed.as_secs_f64(),
            self.kilo_samples(),
            self.rate_ksps()
        )
    }
}

// ---------------------------------------------------------------------------
// Channel adapter
// ---------------------------------------------------------------------------

/// One buffer of raw samples delivered through a [`SampleReceiver`].
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub data: Bytes,
    /// Position of this buffer in the stream, counting dropped ones.
    pub sequence: u64,
}

/// Receives sample buffers from a unit's input stream.
///
/// The stream ends when the unit stops streaming and the sender is
/// dropped, at which point [`recv()`](SampleReceiver::recv) returns `None`.
pub struct SampleReceiver {
    rx: mpsc::Receiver<SampleBuffer>,
    dropped: Arc<AtomicU64>,
}

impl SampleReceiver {
    pub fn new(rx: mpsc::Receiver<SampleBuffer>, dropped: Arc<AtomicU64>) -> Self {
        SampleReceiver { rx, dropped }
    }

    pub async fn recv(&mut self) -> Option<SampleBuffer> {
        self.rx.recv().await
    }

    /// Non-async receive for callers outside a runtime.
    pub fn try_recv(&mut self) -> Option<SampleBuffer> {
        self.rx.try_recv().ok()
    }

    /// Buffers dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build a bounded channel and the pump-side callback feeding it.
pub fn channel_callback(capacity: usize) -> (SampleCallback, SampleReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&dropped);
    let mut sequence = 0u64;

    let callback: SampleCallback = Box::new(move |data: &[u8]| {
        let buffer = SampleBuffer {
            data: Bytes::copy_from_slice(data),
            sequence,
        };
        sequence += 1;
        match tx.try_send(buffer) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!(dropped = total, "sample consumer lagging, buffers dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    (callback, SampleReceiver::new(rx, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn completion(status: TransferStatus, data: &[u8], requested: usize) -> Completion<'_> {
        Completion {
            status,
            data,
            requested,
        }
    }

    fn recording() -> (SampleCallback, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: SampleCallback = Box::new(move |data: &[u8]| sink.lock().unwrap().push(data.len()));
        (cb, seen)
    }

    #[test]
    fn full_buffers_are_delivered_and_resubmitted() {
        let shared = StreamShared::armed();
        let (app, seen) = recording();
        let mut handler = completion_handler(Arc::clone(&shared), app);
        let data = [0u8; 1024];

        for _ in 0..5 {
            let action = handler(&completion(TransferStatus::Completed, &data, 1024));
            assert_eq!(action, TransferAction::Resubmit);
        }
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(shared.bytes(), 5120);
        assert_eq!(shared.buffers(), 5);
        assert_eq!(shared.state(), StreamState::Streaming);
        assert!(!shared.is_complete());
    }

    #[test]
    fn short_buffer_dropped_but_resubmitted() {
        let shared = StreamShared::armed();
        let (app, seen) = recording();
        let mut handler = completion_handler(Arc::clone(&shared), app);
        let data = [0u8; 100];

        let action = handler(&completion(TransferStatus::Completed, &data, 1024));
        assert_eq!(action, TransferAction::Resubmit);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(shared.bytes(), 0);
        assert_eq!(shared.short_buffers(), 1);
        assert_eq!(shared.state(), StreamState::Armed);
    }

    #[test]
    fn timeout_resubmits() {
        let shared = StreamShared::armed();
        let (app, _) = recording();
        let mut handler = completion_handler(Arc::clone(&shared), app);
        let action = handler(&completion(TransferStatus::TimedOut, &[], 1024));
        assert_eq!(action, TransferAction::Resubmit);
        assert!(!shared.is_complete());
    }

    #[test]
    fn terminal_statuses_end_the_stream() {
        for status in [
            TransferStatus::Error,
            TransferStatus::Cancelled,
            TransferStatus::Stall,
            TransferStatus::NoDevice,
            TransferStatus::Overflow,
            TransferStatus::Unknown(-42),
        ] {
            let shared = StreamShared::armed();
            let (app, seen) = recording();
            let mut handler = completion_handler(Arc::clone(&shared), app);
            let action = handler(&completion(status, &[], 1024));
            assert_eq!(action, TransferAction::Release, "{status}");
            assert!(shared.is_complete());
            assert_eq!(shared.state(), StreamState::Idle, "{status}");
            assert!(seen.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn cancel_wins_over_data() {
        let shared = StreamShared::armed();
        let (app, seen) = recording();
        let mut handler = completion_handler(Arc::clone(&shared), app);
        assert!(shared.request_cancel());
        assert!(!shared.request_cancel());
        assert_eq!(shared.state(), StreamState::Cancelling);

        let data = [0u8; 16];
        let action = handler(&completion(TransferStatus::Completed, &data, 16));
        assert_eq!(action, TransferAction::Release);
        assert!(shared.is_complete());
        assert_eq!(shared.state(), StreamState::Idle);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn stats_rates() {
        let stats = StreamStats {
            bytes: 1_152_000,
            buffers: 1000,
            short_buffers: 0,
            elapsed: Duration::from_secs(2),
            bytes_per_sample: 6,
        };
        assert!((stats.kilo_samples() - 192.0).abs() < 1e-9);
        assert!((stats.rate_ksps() - 96.0).abs() < 1e-9);
        assert!(stats.to_string().contains("Rate: 96.0 kS/s"));

        let idle = StreamStats {
            elapsed: Duration::ZERO,
            ..stats
        };
        assert_eq!(idle.rate_ksps(), 0.0);
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (mut cb, mut rx) = channel_callback(4);
        cb(&[1, 2, 3]);
        cb(&[4, 5, 6]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(&first.data[..], &[1, 2, 3]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn channel_drops_when_full() {
        let (mut cb, mut rx) = channel_callback(2);
        for i in 0..5u8 {
            cb(&[i]);
        }
        assert_eq!(rx.dropped(), 3);
        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);

        // Sequence numbers keep counting across drops.
        cb(&[9]);
        assert_eq!(rx.recv().await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn channel_closes_with_callback() {
        let (cb, mut rx) = channel_callback(1);
        drop(cb);
        assert!(rx.recv().await.is_none());
    }
}
