//! Acquisition thread: the driver's blocking read and the producer callback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::agc::{block_extremes, AmplitudeMonitor};
use crate::buffering::{Producer, SampleProducer};
use crate::device::{DriverResult, SdrDevice};
use crate::ipc::events::{SessionStatus, SessionStatusEvent};

pub struct StreamDiagnostics {
    pub blocks_delivered: AtomicUsize,
    pub blocks_discarded: AtomicUsize,
    pub bytes_dropped: AtomicUsize,
    pub agc_steps_up: AtomicUsize,
    pub agc_steps_down: AtomicUsize,
    pub overload_warnings: AtomicUsize,
}

impl Default for StreamDiagnostics {
    fn default() -> Self {
        Self {
            blocks_delivered: AtomicUsize::new(0),
            blocks_discarded: AtomicUsize::new(0),
            bytes_dropped: AtomicUsize::new(0),
            agc_steps_up: AtomicUsize::new(0),
            agc_steps_down: AtomicUsize::new(0),
            overload_warnings: AtomicUsize::new(0),
        }
    }
}

impl StreamDiagnostics {
    pub fn reset(&self) {
        self.blocks_delivered.store(0, Ordering::Relaxed);
        self.blocks_discarded.store(0, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
        self.agc_steps_up.store(0, Ordering::Relaxed);
        self.agc_steps_down.store(0, Ordering::Relaxed);
        self.overload_warnings.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            blocks_discarded: self.blocks_discarded.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            agc_steps_up: self.agc_steps_up.load(Ordering::Relaxed),
            agc_steps_down: self.agc_steps_down.load(Ordering::Relaxed),
            overload_warnings: self.overload_warnings.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub blocks_delivered: usize,
    pub blocks_discarded: usize,
    pub bytes_dropped: usize,
    pub agc_steps_up: usize,
    pub agc_steps_down: usize,
    pub overload_warnings: usize,
}

/// Everything the producer callback touches. Owned by the acquisition
/// thread while streaming and handed back to the session on join.
pub(crate) struct BlockSink {
    producer: SampleProducer,
    block_len: usize,
    running: Arc<AtomicBool>,
    monitor: Arc<AmplitudeMonitor>,
    diagnostics: Arc<StreamDiagnostics>,
}

impl BlockSink {
    pub fn new(
        producer: SampleProducer,
        block_len: usize,
        running: Arc<AtomicBool>,
        monitor: Arc<AmplitudeMonitor>,
        diagnostics: Arc<StreamDiagnostics>,
    ) -> Self {
        Self {
            producer,
            block_len,
            running,
            monitor,
            diagnostics,
        }
    }

    /// Producer callback, once per driver block.
    ///
    /// Never blocks: when the ring is full the tail of the block is dropped.
    pub fn on_block(&mut self, block: &[u8]) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }

        if block.len() != self.block_len {
            let seen = self.diagnostics.blocks_discarded.fetch_add(1, Ordering::Relaxed);
            if seen == 0 {
                warn!(
                    len = block.len(),
                    expected = self.block_len,
                    "discarding block of unexpected size"
                );
            } else {
                debug!(len = block.len(), "discarding block of unexpected size");
            }
            return;
        }

        let accepted = self.producer.push_slice(block);
        if accepted < block.len() {
            let dropped = block.len() - accepted;
            self.diagnostics
                .bytes_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            warn!(dropped, "sample ring full, dropping rest of block");
        }

        let (min, max) = block_extremes(block);
        self.monitor.record(min, max);
        self.diagnostics
            .blocks_delivered
            .fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) type AcquisitionHandle = JoinHandle<(BlockSink, DriverResult<()>)>;

/// Session state the acquisition thread updates when the driver read
/// returns without a stop request (end of capture, driver error).
pub(crate) struct StreamEnd {
    pub running: Arc<AtomicBool>,
    pub status: Arc<Mutex<SessionStatus>>,
    pub status_tx: broadcast::Sender<SessionStatusEvent>,
}

impl StreamEnd {
    /// Returns `true` when the read ended on its own.
    pub fn finish(&self, result: &DriverResult<()>) -> bool {
        // `stop_streaming` clears `running` before cancelling.
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let (status, detail) = match result {
            Ok(()) => (SessionStatus::Stopped, "driver read ended".to_string()),
            Err(e) => (SessionStatus::Error, e.to_string()),
        };
        *self.status.lock() = status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status,
            detail: Some(detail),
        });
        true
    }
}

/// Spawn the thread that parks inside `read_async`. The sink comes back
/// through the join handle so the ring survives a restart.
pub(crate) fn spawn(
    device: Arc<dyn SdrDevice>,
    mut sink: BlockSink,
    end: StreamEnd,
) -> std::io::Result<AcquisitionHandle> {
    thread::Builder::new()
        .name("dabrx-acquisition".into())
        .spawn(move || {
            let block_len = sink.block_len as u32;
            info!(block_len, "acquisition started");
            let result = device.read_async(&mut |block| sink.on_block(block), block_len);
            let ended_early = end.finish(&result);
            match &result {
                Ok(()) if ended_early => warn!("driver read ended without a stop request"),
                Ok(()) => info!("acquisition stopped"),
                Err(e) => error!(error = %e, "driver read ended with an error"),
            }
            (sink, result)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_sample_ring, Observer};

    fn sink(capacity: usize, block_len: usize) -> (BlockSink, crate::buffering::SampleConsumer) {
        let (producer, consumer) = create_sample_ring(capacity);
        let sink = BlockSink::new(
            producer,
            block_len,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AmplitudeMonitor::default()),
            Arc::new(StreamDiagnostics::default()),
        );
        (sink, consumer)
    }

    #[test]
    fn block_is_pushed_and_measured() {
        let (mut sink, consumer) = sink(64, 8);
        sink.on_block(&[128, 127, 40, 200, 128, 128, 128, 128]);
        assert_eq!(consumer.occupied_len(), 8);
        let snap = sink.monitor.snapshot();
        assert_eq!((snap.min, snap.max, snap.generation), (40, 200, 1));
    }

    #[test]
    fn wrong_size_block_is_discarded() {
        let (mut sink, consumer) = sink(64, 8);
        sink.on_block(&[0u8; 6]);
        assert_eq!(consumer.occupied_len(), 0);
        assert_eq!(sink.monitor.snapshot().generation, 0);
        assert_eq!(sink.diagnostics.snapshot().blocks_discarded, 1);
    }

    #[test]
    fn full_ring_drops_the_tail() {
        let (mut sink, consumer) = sink(12, 8);
        sink.on_block(&[1u8; 8]);
        sink.on_block(&[2u8; 8]);
        assert_eq!(consumer.occupied_len(), 12);
        let snap = sink.diagnostics.snapshot();
        assert_eq!(snap.bytes_dropped, 4);
        assert_eq!(snap.blocks_delivered, 2);
    }

    fn stream_end(running: bool) -> (StreamEnd, broadcast::Receiver<SessionStatusEvent>) {
        let (status_tx, status_rx) = broadcast::channel(4);
        let end = StreamEnd {
            running: Arc::new(AtomicBool::new(running)),
            status: Arc::new(Mutex::new(SessionStatus::Streaming)),
            status_tx,
        };
        (end, status_rx)
    }

    #[test]
    fn read_ending_on_its_own_reports_stopped() {
        let (end, mut rx) = stream_end(true);
        assert!(end.finish(&Ok(())));
        assert!(!end.running.load(Ordering::SeqCst));
        assert_eq!(*end.status.lock(), SessionStatus::Stopped);
        assert_eq!(rx.try_recv().expect("event").status, SessionStatus::Stopped);
    }

    #[test]
    fn driver_error_reports_error() {
        let (end, mut rx) = stream_end(true);
        let err = crate::device::DriverError::new("rtlsdr_read_async", -4);
        assert!(end.finish(&Err(err)));
        assert_eq!(*end.status.lock(), SessionStatus::Error);
        let event = rx.try_recv().expect("event");
        assert_eq!(event.status, SessionStatus::Error);
        assert!(event.detail.expect("detail").contains("-4"));
    }

    #[test]
    fn requested_stop_is_left_to_the_session() {
        let (end, mut rx) = stream_end(false);
        assert!(!end.finish(&Ok(())));
        assert_eq!(*end.status.lock(), SessionStatus::Streaming);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callback_is_inert_when_not_running() {
        let (mut sink, consumer) = sink(64, 8);
        sink.running.store(false, Ordering::SeqCst);
        sink.on_block(&[5u8; 8]);
        assert_eq!(consumer.occupied_len(), 0);
    }
}
