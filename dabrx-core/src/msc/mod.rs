//! `MscHandler`: CIF assembly and sub-channel dispatch.
//!
//! ```text
//! demodulator ──process_block(bits, n)──► CifAccumulator ──(last block)──► BackendRegistry
//!                                                                            │ per backend:
//!                                                                            └► Backend::process(CU range)
//! control thread ──register_* / reset──────────────────────────────────────► BackendRegistry
//! ```
//!
//! Two locks, always taken in this order: the accumulator (contended only
//! by the block source) and the registry (shared with the control thread).
//! Dispatch holds the registry lock for the whole copy + process pass, so
//! `reset` waits for an in-flight CIF and never drops a backend mid-call.

pub mod backend;
pub mod cif;
pub mod registry;
pub mod stub;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::MscConfig;
use crate::error::Result;
use crate::ipc::events::DispatchEvent;

use backend::{AudioDescriptor, Backend, BackendFactory, BackendKind, PacketDescriptor};
use cif::{CifAccumulator, TransmissionMode};
use registry::{BackendEntry, BackendRegistry};

const BROADCAST_CAP: usize = 256;

pub struct DemuxDiagnostics {
    pub blocks_in: AtomicUsize,
    pub blocks_rejected: AtomicUsize,
    pub cifs_dispatched: AtomicUsize,
    pub cifs_discarded: AtomicUsize,
    pub dispatch_failures: AtomicUsize,
}

impl Default for DemuxDiagnostics {
    fn default() -> Self {
        Self {
            blocks_in: AtomicUsize::new(0),
            blocks_rejected: AtomicUsize::new(0),
            cifs_dispatched: AtomicUsize::new(0),
            cifs_discarded: AtomicUsize::new(0),
            dispatch_failures: AtomicUsize::new(0),
        }
    }
}

impl DemuxDiagnostics {
    pub fn snapshot(&self) -> DemuxSnapshot {
        DemuxSnapshot {
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
            cifs_dispatched: self.cifs_dispatched.load(Ordering::Relaxed),
            cifs_discarded: self.cifs_discarded.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemuxSnapshot {
    pub blocks_in: usize,
    pub blocks_rejected: usize,
    pub cifs_dispatched: usize,
    pub cifs_discarded: usize,
    pub dispatch_failures: usize,
}

/// What `process_block` did with a block.
#[derive(Debug, Clone)]
pub enum BlockOutcome {
    /// Stored; the CIF is not complete yet.
    Accumulating { block_index: usize },
    /// Completed a CIF while no backend was registered.
    Discarded,
    /// Completed and dispatched a CIF.
    Dispatched(DispatchEvent),
}

pub struct MscHandler {
    accumulator: Mutex<CifAccumulator>,
    registry: Mutex<BackendRegistry>,
    /// True while at least one backend is registered.
    work_to_do: AtomicBool,
    factory: Arc<dyn BackendFactory>,
    diagnostics: DemuxDiagnostics,
    dispatch_tx: broadcast::Sender<DispatchEvent>,
}

impl MscHandler {
    pub fn new(mut config: MscConfig, factory: Arc<dyn BackendFactory>) -> Self {
        config.normalize();
        let mode = TransmissionMode::from_number(config.mode);
        info!(
            ?mode,
            blocks_per_cif = mode.blocks_per_cif(),
            bits_per_block = mode.bits_per_block(),
            "MSC handler ready"
        );
        let (dispatch_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            accumulator: Mutex::new(CifAccumulator::new(mode)),
            registry: Mutex::new(BackendRegistry::default()),
            work_to_do: AtomicBool::new(false),
            factory,
            diagnostics: DemuxDiagnostics::default(),
            dispatch_tx,
        }
    }

    /// Feed one deinterleaved MSC block.
    ///
    /// # Errors
    /// `DabError::BlockLength` when `bits` is not one block for this mode.
    pub fn process_block(&self, bits: &[i16], block_number: i32) -> Result<BlockOutcome> {
        let mut acc = self.accumulator.lock();
        let block_index = match acc.write_block(bits, block_number) {
            Ok(index) => index,
            Err(e) => {
                self.diagnostics
                    .blocks_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.diagnostics.blocks_in.fetch_add(1, Ordering::Relaxed);

        if !acc.is_last(block_index) {
            return Ok(BlockOutcome::Accumulating { block_index });
        }
        if !self.work_to_do.load(Ordering::SeqCst) {
            self.diagnostics
                .cifs_discarded
                .fetch_add(1, Ordering::Relaxed);
            return Ok(BlockOutcome::Discarded);
        }

        let mut registry = self.registry.lock();
        let cif_count = acc.advance_cif_count();
        let event = registry.dispatch(&acc, cif_count);
        drop(registry);

        self.diagnostics
            .cifs_dispatched
            .fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .dispatch_failures
            .fetch_add(event.failures.len(), Ordering::Relaxed);
        let _ = self.dispatch_tx.send(event.clone());
        Ok(BlockOutcome::Dispatched(event))
    }

    /// Build an audio backend for `descriptor` and register it.
    ///
    /// # Errors
    /// - `DabError::SubChannelOutOfRange` / `SubChannelOverlap` for a bad range.
    /// - `DabError::Backend` when the factory refuses the descriptor.
    pub fn register_audio_backend(&self, descriptor: &AudioDescriptor) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.validate(descriptor.start_addr, descriptor.length)?;
        let backend = self.factory.audio(descriptor)?;
        info!(
            subchannel = descriptor.subchannel_id,
            start_addr = descriptor.start_addr,
            length = descriptor.length,
            bit_rate = descriptor.bit_rate,
            protection = %descriptor.protection_label(),
            dab_plus = descriptor.is_dab_plus(),
            "audio backend registered"
        );
        self.push_locked(
            &mut registry,
            BackendEntry::new(
                BackendKind::Audio,
                descriptor.start_addr,
                descriptor.length,
                backend,
            ),
        );
        Ok(())
    }

    /// Build a packet-data backend for `descriptor` and register it.
    ///
    /// # Errors
    /// As [`register_audio_backend`](Self::register_audio_backend).
    pub fn register_data_backend(&self, descriptor: &PacketDescriptor) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.validate(descriptor.start_addr, descriptor.length)?;
        let backend = self.factory.data(descriptor)?;
        info!(
            subchannel = descriptor.subchannel_id,
            start_addr = descriptor.start_addr,
            length = descriptor.length,
            packet_address = descriptor.packet_address,
            protection = %descriptor.protection_label(),
            "data backend registered"
        );
        self.push_locked(
            &mut registry,
            BackendEntry::new(
                BackendKind::Data,
                descriptor.start_addr,
                descriptor.length,
                backend,
            ),
        );
        Ok(())
    }

    /// Register an already-built backend for CUs `start_addr..start_addr + length`.
    ///
    /// # Errors
    /// `DabError::SubChannelOutOfRange` / `SubChannelOverlap`; the backend is
    /// stopped and dropped.
    pub fn register_backend(
        &self,
        kind: BackendKind,
        start_addr: usize,
        length: usize,
        mut backend: Box<dyn Backend>,
    ) -> Result<()> {
        let mut registry = self.registry.lock();
        if let Err(e) = registry.validate(start_addr, length) {
            backend.stop_running();
            return Err(e);
        }
        debug!(?kind, start_addr, length, "backend registered");
        self.push_locked(
            &mut registry,
            BackendEntry::new(kind, start_addr, length, backend),
        );
        Ok(())
    }

    /// Stop and drop every backend. Waits for an in-flight dispatch.
    pub fn reset(&self) {
        let mut registry = self.registry.lock();
        let stopped = registry.stop_all();
        self.work_to_do.store(false, Ordering::SeqCst);
        if stopped > 0 {
            info!(stopped, "MSC backends reset");
        }
    }

    /// Same as [`reset`](Self::reset).
    pub fn stop_processing(&self) {
        self.reset();
    }

    /// Rolling counter (0..=3) of the last dispatched CIF.
    pub fn cif_count(&self) -> u8 {
        self.accumulator.lock().cif_count()
    }

    pub fn mode(&self) -> TransmissionMode {
        self.accumulator.lock().mode()
    }

    pub fn blocks_per_cif(&self) -> usize {
        self.accumulator.lock().blocks_per_cif()
    }

    pub fn bits_per_block(&self) -> usize {
        self.accumulator.lock().bits_per_block()
    }

    pub fn backend_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// `(start_addr, length, kind)` of every backend, in dispatch order.
    pub fn backend_ranges(&self) -> Vec<(usize, usize, BackendKind)> {
        self.registry.lock().ranges()
    }

    pub fn has_work(&self) -> bool {
        self.work_to_do.load(Ordering::SeqCst)
    }

    pub fn diagnostics_snapshot(&self) -> DemuxSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn subscribe_dispatch(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatch_tx.subscribe()
    }

    fn push_locked(&self, registry: &mut BackendRegistry, entry: BackendEntry) {
        registry.push(entry);
        self.work_to_do.store(registry.has_active(), Ordering::SeqCst);
    }
}

impl Drop for MscHandler {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DabError;
    use stub::StubBackendFactory;

    fn handler(mode: u8) -> (MscHandler, Arc<StubBackendFactory>) {
        let factory = Arc::new(StubBackendFactory::new());
        let handler = MscHandler::new(MscConfig { mode }, factory.clone());
        (handler, factory)
    }

    fn feed_cif(handler: &MscHandler) -> Vec<BlockOutcome> {
        let bits = vec![1i16; handler.bits_per_block()];
        (0..handler.blocks_per_cif() as i32)
            .map(|n| handler.process_block(&bits, 4 + n).expect("block accepted"))
            .collect()
    }

    #[test]
    fn idle_handler_discards_complete_cifs() {
        let (handler, _factory) = handler(2);
        let outcomes = feed_cif(&handler);
        assert!(matches!(outcomes.last(), Some(BlockOutcome::Discarded)));
        assert_eq!(handler.cif_count(), 0);
        assert_eq!(handler.diagnostics_snapshot().cifs_discarded, 1);
    }

    #[test]
    fn registered_audio_backend_receives_its_range() {
        let (handler, factory) = handler(1);
        handler
            .register_audio_backend(&AudioDescriptor {
                subchannel_id: 2,
                start_addr: 100,
                length: 48,
                ..AudioDescriptor::default()
            })
            .expect("register audio");
        assert!(handler.has_work());

        let outcomes = feed_cif(&handler);
        match outcomes.last() {
            Some(BlockOutcome::Dispatched(event)) => {
                assert_eq!(event.delivered, 1);
                assert_eq!(event.cif_count, 1);
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
        let stats = &factory.built()[0];
        assert_eq!(stats.frames(), 1);
        assert_eq!(stats.soft_bits.load(Ordering::Relaxed), 48 * 64);
    }

    #[test]
    fn overlapping_registration_is_refused() {
        let (handler, factory) = handler(1);
        handler
            .register_data_backend(&PacketDescriptor {
                start_addr: 0,
                length: 10,
                ..PacketDescriptor::default()
            })
            .expect("first range");
        let err = handler
            .register_audio_backend(&AudioDescriptor {
                start_addr: 5,
                length: 10,
                ..AudioDescriptor::default()
            })
            .unwrap_err();
        assert!(matches!(err, DabError::SubChannelOverlap { .. }));
        assert_eq!(handler.backend_count(), 1);
        assert_eq!(factory.built().len(), 1);
    }

    #[test]
    fn reset_stops_backends_and_clears_work() {
        let (handler, factory) = handler(4);
        handler
            .register_audio_backend(&AudioDescriptor {
                start_addr: 0,
                length: 4,
                ..AudioDescriptor::default()
            })
            .expect("register audio");
        handler.reset();
        assert!(!handler.has_work());
        assert_eq!(handler.backend_count(), 0);
        assert!(factory.built()[0].is_stopped());
    }

    #[test]
    fn short_block_is_rejected() {
        let (handler, _factory) = handler(1);
        let err = handler.process_block(&[0i16; 10], 4).unwrap_err();
        assert!(matches!(err, DabError::BlockLength { .. }));
        assert_eq!(handler.diagnostics_snapshot().blocks_rejected, 1);
    }
}
