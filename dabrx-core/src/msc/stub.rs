//! `StubBackend`: placeholder decoder that measures instead of decoding.
//!
//! Lets the whole intake → demux → dispatch path run end to end without an
//! FEC or audio stack. Each stub publishes its counters through a shared
//! [`StubStats`] handle so tests and the benchmark can observe delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::backend::{
    AudioDescriptor, Backend, BackendError, BackendFactory, BackendKind, PacketDescriptor,
};

#[derive(Debug)]
pub struct StubStats {
    pub kind: BackendKind,
    pub subchannel_id: u8,
    pub frames: AtomicUsize,
    pub soft_bits: AtomicUsize,
    /// Hard-decision ones seen so far (soft bit > 0).
    pub ones: AtomicU64,
    pub stopped: AtomicBool,
}

impl StubStats {
    fn new(kind: BackendKind, subchannel_id: u8) -> Self {
        Self {
            kind,
            subchannel_id,
            frames: AtomicUsize::new(0),
            soft_bits: AtomicUsize::new(0),
            ones: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct StubBackend {
    stats: Arc<StubStats>,
}

impl StubBackend {
    pub fn new(kind: BackendKind, subchannel_id: u8) -> Self {
        Self {
            stats: Arc::new(StubStats::new(kind, subchannel_id)),
        }
    }

    pub fn stats(&self) -> Arc<StubStats> {
        Arc::clone(&self.stats)
    }
}

impl Backend for StubBackend {
    fn process(&mut self, soft_bits: &[i16]) -> Result<(), BackendError> {
        if self.stats.is_stopped() {
            return Err(BackendError::new("stub backend already stopped"));
        }
        let ones = soft_bits.iter().filter(|&&b| b > 0).count() as u64;
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .soft_bits
            .fetch_add(soft_bits.len(), Ordering::Relaxed);
        self.stats.ones.fetch_add(ones, Ordering::Relaxed);
        Ok(())
    }

    fn stop_running(&mut self) {
        debug!(subchannel = self.stats.subchannel_id, "StubBackend::stop_running");
        self.stats.stopped.store(true, Ordering::SeqCst);
    }
}

/// Builds a [`StubBackend`] for every descriptor and keeps their stats.
#[derive(Default)]
pub struct StubBackendFactory {
    built: Mutex<Vec<Arc<StubStats>>>,
}

impl StubBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats of every backend built so far, in build order.
    pub fn built(&self) -> Vec<Arc<StubStats>> {
        self.built.lock().clone()
    }

    fn build(&self, kind: BackendKind, subchannel_id: u8) -> Box<dyn Backend> {
        let backend = StubBackend::new(kind, subchannel_id);
        self.built.lock().push(backend.stats());
        Box::new(backend)
    }
}

impl BackendFactory for StubBackendFactory {
    fn audio(&self, descriptor: &AudioDescriptor) -> Result<Box<dyn Backend>, BackendError> {
        debug!(
            subchannel = descriptor.subchannel_id,
            protection = %descriptor.protection_label(),
            dab_plus = descriptor.is_dab_plus(),
            "building stub audio backend"
        );
        Ok(self.build(BackendKind::Audio, descriptor.subchannel_id))
    }

    fn data(&self, descriptor: &PacketDescriptor) -> Result<Box<dyn Backend>, BackendError> {
        debug!(
            subchannel = descriptor.subchannel_id,
            packet_address = descriptor.packet_address,
            "building stub data backend"
        );
        Ok(self.build(BackendKind::Data, descriptor.subchannel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_frames_and_hard_ones() {
        let mut stub = StubBackend::new(BackendKind::Audio, 3);
        let stats = stub.stats();
        stub.process(&[5, -5, 0, 9]).unwrap();
        stub.process(&[1; 64]).unwrap();
        assert_eq!(stats.frames(), 2);
        assert_eq!(stats.soft_bits.load(Ordering::Relaxed), 68);
        assert_eq!(stats.ones.load(Ordering::Relaxed), 66);
    }

    #[test]
    fn stopped_stub_refuses_work() {
        let mut stub = StubBackend::new(BackendKind::Data, 1);
        stub.stop_running();
        assert!(stub.stats().is_stopped());
        assert!(stub.process(&[0; 64]).is_err());
    }

    #[test]
    fn factory_tracks_what_it_built() {
        let factory = StubBackendFactory::new();
        factory
            .audio(&AudioDescriptor::default())
            .expect("audio stub");
        factory
            .data(&PacketDescriptor {
                subchannel_id: 7,
                ..PacketDescriptor::default()
            })
            .expect("data stub");
        let built = factory.built();
        assert_eq!(built.len(), 2);
        assert_eq!(built[1].kind, BackendKind::Data);
        assert_eq!(built[1].subchannel_id, 7);
    }
}
