//! `DeviceSession`: one opened dongle and its streaming threads.
//!
//! ## Lifecycle
//!
//! ```text
//! DeviceSession::open()      → driver bound, device opened, gain applied, status = Idle
//!     └─► start_streaming()  → ring flushed, acquisition + AGC threads spawned, status = Streaming
//!         └─► stop_streaming() → read cancelled, both threads joined, status = Stopped
//!         └─► read ends by itself → running cleared, status = Stopped (EOF) or Error
//! drop                       → stop_streaming(), device closed
//! ```
//!
//! `start_streaming()` / `stop_streaming()` are idempotent. The ring's
//! producer half moves into the acquisition thread while streaming and
//! comes back on join, so a session can be restarted any number of times.
//!
//! ## Threading
//!
//! - acquisition thread: parked in `SdrDevice::read_async`, runs the
//!   producer callback per block;
//! - AGC thread: wakes every `agc_tick_ms`, steps the gain;
//! - caller: `pull_samples` and the control surface.

pub mod acquisition;
pub mod agc;
pub mod gain;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use num_complex::Complex32;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::buffering::{convert, create_sample_ring, Consumer, Observer, SampleConsumer};
use crate::config::SessionConfig;
use crate::device::{SdrDevice, SdrLibrary, OPT_STRING_SYMBOL, REQUIRED_SYMBOLS};
use crate::error::{DabError, Result};
use crate::ipc::events::{GainEvent, GainReason, OverloadEvent, SessionStatus, SessionStatusEvent};

use acquisition::{AcquisitionHandle, BlockSink, StreamDiagnostics, StreamEnd, StreamSnapshot};
use agc::{AgcContext, AmplitudeMonitor};
use gain::{GainControl, GainTable};

/// Fixed dongle sample rate: 2.048 MS/s, the DAB baseband rate.
pub const INPUT_RATE: u32 = 2_048_000;

/// Raw bytes per sample (8-bit I + 8-bit Q).
pub const BIT_DEPTH: u32 = 8;

const BROADCAST_CAP: usize = 256;

/// How often `stop_streaming` re-issues the driver cancel while waiting.
const CANCEL_RETRY: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Workers {
    /// Present while stopped.
    sink: Option<BlockSink>,
    acquisition: Option<AcquisitionHandle>,
    agc: Option<JoinHandle<()>>,
    agc_stop: Option<Sender<()>>,
}

struct PullState {
    consumer: SampleConsumer,
    scratch: Vec<u8>,
}

/// An opened sample source with its ring buffer and AGC.
///
/// `DeviceSession` is `Send + Sync`; wrap it in an `Arc` to share the
/// control surface between threads.
pub struct DeviceSession {
    device: Arc<dyn SdrDevice>,
    gain: Arc<GainControl>,
    monitor: Arc<AmplitudeMonitor>,
    diagnostics: Arc<StreamDiagnostics>,
    running: Arc<AtomicBool>,
    frequency: AtomicU32,
    ppm_correction: i32,
    device_options: Option<String>,
    supports_options: bool,
    agc_tick: Duration,
    block_len: usize,
    pull: Mutex<PullState>,
    workers: Mutex<Workers>,
    status: Arc<Mutex<SessionStatus>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    gain_tx: broadcast::Sender<GainEvent>,
    overload_tx: broadcast::Sender<OverloadEvent>,
}

impl DeviceSession {
    /// Bind the driver, open the device and bring it to a known state.
    ///
    /// # Errors
    /// - `DabError::Binding` when a mandatory driver capability is missing.
    /// - `DabError::NoDeviceFound` when the driver reports zero devices.
    /// - `DabError::OpenFailed` / `DabError::SampleRateRejected` from the driver.
    /// - `DabError::EmptyGainTable` when the tuner reports no gains.
    ///
    /// All of these are fatal; the device (if opened) is closed before
    /// returning.
    pub fn open(library: &dyn SdrLibrary, mut config: SessionConfig) -> Result<Self> {
        config.normalize();
        info!(driver = library.name(), "opening sample source");

        // (a) capability binding
        if let Some(symbol) = REQUIRED_SYMBOLS.iter().copied().find(|s| !library.resolve(s)) {
            error!(symbol, "driver capability missing");
            return Err(DabError::Binding { symbol });
        }
        let supports_options = library.resolve(OPT_STRING_SYMBOL);
        if !supports_options {
            debug!("driver has no option-string support");
        }

        // (b) enumeration
        let count = library.device_count();
        if count == 0 {
            error!("no devices found");
            return Err(DabError::NoDeviceFound);
        }

        // (c) serial lookup, falling back to the configured index
        let mut index = config.device_index;
        if let Some(serial) = config.device_serial.as_deref() {
            match library.index_by_serial(serial) {
                Some(found) => index = found,
                None => warn!(serial, fallback = index, "serial not found, using index"),
            }
        }

        // (d) open
        let device: Arc<dyn SdrDevice> = Arc::from(library.open(index).map_err(|e| {
            error!(index, error = %e, "opening device failed");
            DabError::OpenFailed {
                index,
                code: e.code,
            }
        })?);

        // (e) sample rate; `device` drops (and closes) on the error path.
        device.set_sample_rate(INPUT_RATE).map_err(|e| {
            error!(rate = INPUT_RATE, error = %e, "sample rate rejected");
            DabError::SampleRateRejected {
                rate: INPUT_RATE,
                code: e.code,
            }
        })?;
        info!(index, sample_rate = device.sample_rate(), "device open");

        // (f) gain table, (g) percent → index
        let table = GainTable::new(device.tuner_gains())?;
        let initial_index = table.index_for_percent(config.gain_percent);
        info!(gains = ?table.steps(), initial_index, "tuner gain table");

        // (h) ppm + centre frequency
        let frequency = config.resolved_frequency();
        if config.ppm_correction != 0 {
            if let Err(e) = device.set_freq_correction(config.ppm_correction) {
                warn!(ppm = config.ppm_correction, error = %e, "frequency correction failed");
            }
        }
        if let Err(e) = device.set_center_freq(frequency) {
            warn!(frequency, error = %e, "tuning failed");
        }

        // (i) manual tuner gain; the software AGC owns the gain path.
        if let Err(e) = device.set_tuner_gain_mode(true) {
            warn!(error = %e, "switching to manual gain failed");
        }

        if supports_options {
            if let Some(options) = config.device_options.as_deref() {
                apply_options(device.as_ref(), options);
            }
        }

        // (j) ring
        let running = Arc::new(AtomicBool::new(false));
        let monitor = Arc::new(AmplitudeMonitor::default());
        let diagnostics = Arc::new(StreamDiagnostics::default());
        let (producer, consumer) = create_sample_ring(config.ring_capacity);
        let sink = BlockSink::new(
            producer,
            config.block_len,
            Arc::clone(&running),
            Arc::clone(&monitor),
            Arc::clone(&diagnostics),
        );

        // (k) initial gain, hardware AGC flag, software AGC on
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (gain_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (overload_tx, _) = broadcast::channel(BROADCAST_CAP);
        let gain = Arc::new(GainControl::new(
            Arc::clone(&device),
            table,
            initial_index,
            gain_tx.clone(),
        ));
        gain.set_index(initial_index, GainReason::Manual)?;
        gain.set_hardware_agc(config.hardware_agc);
        gain.set_software_agc(config.software_agc);

        Ok(Self {
            device,
            gain,
            monitor,
            diagnostics,
            running,
            frequency: AtomicU32::new(frequency),
            ppm_correction: config.ppm_correction,
            device_options: config.device_options.clone(),
            supports_options,
            agc_tick: Duration::from_millis(config.effective_agc_tick_ms()),
            block_len: config.block_len,
            pull: Mutex::new(PullState {
                consumer,
                scratch: Vec::with_capacity(config.block_len),
            }),
            workers: Mutex::new(Workers {
                sink: Some(sink),
                ..Workers::default()
            }),
            status: Arc::new(Mutex::new(SessionStatus::Idle)),
            status_tx,
            gain_tx,
            overload_tx,
        })
    }

    /// Start acquisition at the current frequency. No-op when running.
    pub fn start_streaming(&self) -> Result<()> {
        self.restart_streaming(self.frequency())
    }

    /// Start acquisition at `frequency_hz`. No-op when already running.
    ///
    /// # Errors
    /// `DabError::Driver` when the driver buffer reset fails, or `Io` when a
    /// thread cannot be spawned. The session stays stopped in both cases.
    pub fn restart_streaming(&self, frequency_hz: u32) -> Result<()> {
        let mut workers = self.workers.lock();
        let reader_alive = workers
            .acquisition
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if self.running.load(Ordering::SeqCst) && reader_alive {
            return Ok(());
        }
        if workers.acquisition.is_some() {
            // The previous read ended on its own; reap it to get the sink back.
            debug!("reaping finished acquisition thread");
            self.stop_locked(&mut workers);
        }
        let Some(sink) = workers.sink.take() else {
            return Err(anyhow::anyhow!("acquisition sink missing").into());
        };

        self.pull.lock().consumer.clear();
        if let Err(e) = self.device.reset_buffer() {
            workers.sink = Some(sink);
            error!(error = %e, "driver buffer reset failed");
            return Err(e.into());
        }

        self.frequency.store(frequency_hz, Ordering::SeqCst);
        if let Err(e) = self.device.set_center_freq(frequency_hz) {
            warn!(frequency_hz, error = %e, "tuning failed");
        }
        self.gain.reapply();
        self.gain.set_hardware_agc(self.gain.hardware_agc());
        if self.supports_options {
            if let Some(options) = self.device_options.as_deref() {
                apply_options(self.device.as_ref(), options);
            }
        }

        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);

        // Published before the thread exists so a read that ends at once
        // is not overwritten.
        self.set_status(SessionStatus::Streaming, Some(format!("{frequency_hz} Hz")));
        let end = StreamEnd {
            running: Arc::clone(&self.running),
            status: Arc::clone(&self.status),
            status_tx: self.status_tx.clone(),
        };
        let acquisition = match acquisition::spawn(Arc::clone(&self.device), sink, end) {
            Ok(handle) => handle,
            Err(e) => {
                // The sink moved into the failed closure; rebuild the ring.
                self.running.store(false, Ordering::SeqCst);
                workers.sink = Some(self.rebuild_ring());
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                return Err(e.into());
            }
        };

        let (stop_tx, stop_rx) = bounded(1);
        let ctx = AgcContext {
            gain: Arc::clone(&self.gain),
            monitor: Arc::clone(&self.monitor),
            running: Arc::clone(&self.running),
            diagnostics: Arc::clone(&self.diagnostics),
            overload_tx: self.overload_tx.clone(),
            tick: self.agc_tick,
            stop_rx,
        };
        let agc = thread::Builder::new()
            .name("dabrx-agc".into())
            .spawn(move || agc::run(ctx));

        workers.acquisition = Some(acquisition);
        match agc {
            Ok(handle) => {
                workers.agc = Some(handle);
                workers.agc_stop = Some(stop_tx);
            }
            Err(e) => {
                self.stop_locked(&mut workers);
                self.set_status(SessionStatus::Error, Some(e.to_string()));
                return Err(e.into());
            }
        }

        info!(frequency_hz, "streaming started");
        Ok(())
    }

    /// Cancel the driver read and join both threads. No-op when stopped.
    pub fn stop_streaming(&self) {
        let mut workers = self.workers.lock();
        if !self.running.load(Ordering::SeqCst) && workers.acquisition.is_none() {
            return;
        }
        self.stop_locked(&mut workers);
        info!("streaming stopped");
        self.set_status(SessionStatus::Stopped, None);
    }

    /// Retune. Takes effect immediately, streaming or not.
    pub fn set_frequency(&self, frequency_hz: u32) -> Result<()> {
        self.frequency.store(frequency_hz, Ordering::SeqCst);
        self.device.set_center_freq(frequency_hz)?;
        debug!(frequency_hz, "retuned");
        Ok(())
    }

    /// Select gain table entry `index`.
    ///
    /// # Errors
    /// `DabError::GainIndexOutOfRange`; the previous gain is kept.
    pub fn set_gain(&self, index: usize) -> Result<()> {
        self.gain.set_index(index, GainReason::Manual)
    }

    /// Select the gain entry at `percent` of the table.
    pub fn set_gain_percent(&self, percent: u8) -> Result<()> {
        let index = self.gain.table().index_for_percent(percent);
        self.gain.set_index(index, GainReason::Manual)
    }

    /// Toggle the RTL2832 digital AGC. The tuner gain path is unaffected.
    pub fn set_hw_agc(&self, enabled: bool) {
        self.gain.set_hardware_agc(enabled);
    }

    /// Toggle the software AGC. Turning it off re-applies the current gain.
    pub fn set_agc(&self, enabled: bool) {
        self.gain.set_software_agc(enabled);
    }

    /// Discard everything buffered so far.
    pub fn reset_buffer(&self) {
        self.pull.lock().consumer.clear();
    }

    /// Up to `max_count` complex samples. Never blocks.
    pub fn pull_samples(&self, max_count: usize) -> Vec<Complex32> {
        let mut out = Vec::with_capacity(max_count.min(self.available_samples()));
        self.pull_samples_into(max_count, &mut out);
        out
    }

    /// Append up to `max_count` samples to `out`, returning how many.
    ///
    /// Only what is buffered is copied; a huge `max_count` costs nothing.
    pub fn pull_samples_into(&self, max_count: usize, out: &mut Vec<Complex32>) -> usize {
        let mut pull = self.pull.lock();
        let PullState { consumer, scratch } = &mut *pull;
        let want = max_count.saturating_mul(2).min(consumer.occupied_len()) & !1;
        scratch.resize(want, 0);
        let n = consumer.pop_slice(scratch);
        convert::convert_into(&scratch[..n], out)
    }

    /// Complete samples currently buffered.
    pub fn available_samples(&self) -> usize {
        self.pull.lock().consumer.occupied_len() / 2
    }

    pub fn gain_count(&self) -> usize {
        self.gain.table().len()
    }

    pub fn gain_table(&self) -> &[i32] {
        self.gain.table().steps()
    }

    pub fn gain_index(&self) -> usize {
        self.gain.current_index()
    }

    /// Current tuner gain in tenths of a dB.
    pub fn current_gain(&self) -> i32 {
        self.gain.current_tenth_db()
    }

    pub fn bit_depth(&self) -> u32 {
        BIT_DEPTH
    }

    /// Rate reported back by the driver.
    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate()
    }

    pub fn frequency(&self) -> u32 {
        self.frequency.load(Ordering::SeqCst)
    }

    pub fn ppm_correction(&self) -> i32 {
        self.ppm_correction
    }

    pub fn software_agc(&self) -> bool {
        self.gain.software_agc()
    }

    pub fn hardware_agc(&self) -> bool {
        self.gain.hardware_agc()
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Latest block extremes seen by the AGC.
    pub fn amplitude(&self) -> agc::AmplitudeSnapshot {
        self.monitor.snapshot()
    }

    pub fn diagnostics_snapshot(&self) -> StreamSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_gain(&self) -> broadcast::Receiver<GainEvent> {
        self.gain_tx.subscribe()
    }

    pub fn subscribe_overload(&self) -> broadcast::Receiver<OverloadEvent> {
        self.overload_tx.subscribe()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn stop_locked(&self, workers: &mut Workers) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(stop) = workers.agc_stop.take() {
            let _ = stop.try_send(());
        }

        if let Some(handle) = workers.acquisition.take() {
            // A cancel that lands before the driver entered its read is
            // ignored, so keep issuing it until the thread is gone.
            let mut last_cancel: Option<Instant> = None;
            while !handle.is_finished() {
                if last_cancel.map_or(true, |t| t.elapsed() >= CANCEL_RETRY) {
                    if let Err(e) = self.device.cancel_async() {
                        warn!(error = %e, "cancel_async failed");
                    }
                    last_cancel = Some(Instant::now());
                }
                thread::sleep(Duration::from_millis(1));
            }
            match handle.join() {
                Ok((sink, _)) => workers.sink = Some(sink),
                Err(_) => {
                    error!("acquisition thread panicked");
                    workers.sink = Some(self.rebuild_ring());
                }
            }
        }

        if let Some(handle) = workers.agc.take() {
            if handle.join().is_err() {
                error!("AGC thread panicked");
            }
        }
    }

    /// Fresh ring after a producer half was lost.
    fn rebuild_ring(&self) -> BlockSink {
        let mut pull = self.pull.lock();
        let capacity = pull.consumer.capacity().get();
        let (producer, consumer) = create_sample_ring(capacity);
        pull.consumer = consumer;
        BlockSink::new(
            producer,
            self.block_len,
            Arc::clone(&self.running),
            Arc::clone(&self.monitor),
            Arc::clone(&self.diagnostics),
        )
    }

    fn set_status(&self, new_status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(SessionStatusEvent {
            status: new_status,
            detail,
        });
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop_streaming();
        debug!("session closed");
    }
}

fn apply_options(device: &dyn SdrDevice, options: &str) {
    match device.set_opt_string(options) {
        Ok(()) => debug!(options, "device options applied"),
        Err(e) => warn!(options, error = %e, "device options rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimulatedConfig, SimulatedLibrary, R820T_GAINS};

    fn open(config: SimulatedConfig, session: SessionConfig) -> (DeviceSession, SimulatedLibrary) {
        let lib = SimulatedLibrary::new(config);
        let s = DeviceSession::open(&lib, session).expect("open session");
        (s, lib)
    }

    #[test]
    fn construction_applies_initial_state() {
        let (session, lib) = open(
            SimulatedConfig::default(),
            SessionConfig {
                frequency_hz: 227_360_000,
                ppm_correction: 7,
                gain_percent: 50,
                hardware_agc: true,
                device_options: Some("bias=1".into()),
                ..SessionConfig::default()
            },
        );
        let probe = lib.probe();
        assert_eq!(probe.sample_rate.load(Ordering::SeqCst), INPUT_RATE);
        assert_eq!(probe.center_freq.load(Ordering::SeqCst), 227_360_000);
        assert_eq!(probe.ppm.load(Ordering::SeqCst), 7);
        assert!(probe.manual_gain_mode.load(Ordering::SeqCst));
        assert!(probe.hardware_agc.load(Ordering::SeqCst));
        assert_eq!(probe.options.lock().as_deref(), Some("bias=1"));

        assert_eq!(session.gain_index(), 14);
        assert_eq!(session.current_gain(), R820T_GAINS[14]);
        assert_eq!(session.gain_count(), R820T_GAINS.len());
        assert_eq!(session.bit_depth(), 8);
        assert_eq!(session.sample_rate(), INPUT_RATE);
        assert!(session.software_agc());
        assert!(!session.is_running());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn zero_ppm_is_not_written() {
        let (_session, lib) = open(SimulatedConfig::default(), SessionConfig::default());
        assert_eq!(lib.probe().ppm.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pull_on_idle_session_returns_nothing() {
        let (session, _lib) = open(SimulatedConfig::default(), SessionConfig::default());
        assert!(session.pull_samples(1024).is_empty());
        assert_eq!(session.available_samples(), 0);
    }

    #[test]
    fn unbounded_pull_returns_only_what_is_buffered() {
        let (session, _lib) = open(
            SimulatedConfig {
                block_interval: Duration::from_millis(1),
                ..SimulatedConfig::default()
            },
            SessionConfig {
                software_agc: false,
                ..SessionConfig::default()
            },
        );
        assert!(session.pull_samples(usize::MAX).is_empty());
        let mut out = Vec::new();
        assert_eq!(session.pull_samples_into(usize::MAX, &mut out), 0);

        session.start_streaming().expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.available_samples() < session.block_len() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        session.stop_streaming();

        let buffered = session.available_samples();
        assert!(buffered >= session.block_len());
        assert_eq!(session.pull_samples(usize::MAX).len(), buffered);
        assert_eq!(session.available_samples(), 0);
        assert!(session.pull_samples(usize::MAX).is_empty());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let (session, lib) = open(SimulatedConfig::default(), SessionConfig::default());
        session.stop_streaming();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(lib.probe().cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_gain_percent_uses_the_table() {
        let (session, _lib) = open(SimulatedConfig::default(), SessionConfig::default());
        session.set_gain_percent(100).expect("top of table");
        assert_eq!(session.gain_index(), R820T_GAINS.len() - 1);
        session.set_gain_percent(0).expect("bottom of table");
        assert_eq!(session.current_gain(), 0);
    }

    #[test]
    fn options_skipped_without_driver_support() {
        let (_session, lib) = open(
            SimulatedConfig {
                supports_options: false,
                ..SimulatedConfig::default()
            },
            SessionConfig {
                device_options: Some("bias=1".into()),
                ..SessionConfig::default()
            },
        );
        assert_eq!(*lib.probe().options.lock(), None);
    }
}
