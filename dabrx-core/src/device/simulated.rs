//! `SimulatedLibrary`: in-process stand-in for a dongle.
//!
//! Generates a sine-like I/Q carrier whose amplitude follows the applied
//! tuner gain, so the software AGC sees clipping at high gain and headroom at
//! low gain. Every knob that a construction or runtime failure depends on
//! (missing symbols, failed open, rejected sample rate, failing gain calls,
//! wrong-size blocks) is configurable, and a shared [`SimulatedProbe`]
//! records what the session did to the device.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use super::{DriverError, DriverResult, SdrDevice, SdrLibrary};

/// R820T gain steps in tenths of a dB.
pub const R820T_GAINS: &[i32] = &[
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364,
    372, 386, 402, 421, 434, 439, 445, 480, 496,
];

/// Knobs for the simulated dongle.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub device_count: u32,
    /// Serial number per device index.
    pub serials: Vec<String>,
    pub gains: Vec<i32>,
    /// Symbols `resolve` reports as absent.
    pub missing_symbols: Vec<String>,
    /// Status returned from `open`, if it should fail.
    pub open_status: Option<i32>,
    /// Status returned from `set_sample_rate`, if it should fail.
    pub sample_rate_status: Option<i32>,
    /// Make every `set_tuner_gain` call fail.
    pub fail_gain_calls: bool,
    /// Whether `rtlsdr_set_opt_string` is available.
    pub supports_options: bool,
    /// Peak deviation from 128 at 0 dB of tuner gain.
    pub base_amplitude: f32,
    /// Pause between delivered blocks.
    pub block_interval: Duration,
    /// Deliver every n-th block truncated to half length.
    pub short_block_every: Option<u32>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            serials: vec!["00000001".into()],
            gains: R820T_GAINS.to_vec(),
            missing_symbols: Vec::new(),
            open_status: None,
            sample_rate_status: None,
            fail_gain_calls: false,
            supports_options: true,
            base_amplitude: 4.0,
            block_interval: Duration::from_millis(2),
            short_block_every: None,
        }
    }
}

/// Observations shared between the library, its devices and the test.
#[derive(Debug, Default)]
pub struct SimulatedProbe {
    pub opened_index: AtomicI32,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub sample_rate: AtomicU32,
    pub center_freq: AtomicU32,
    pub ppm: AtomicI32,
    pub manual_gain_mode: AtomicBool,
    pub hardware_agc: AtomicBool,
    pub tuner_gain: AtomicI32,
    pub buffer_resets: AtomicUsize,
    pub reads_started: AtomicUsize,
    pub reads_finished: AtomicUsize,
    pub cancels: AtomicUsize,
    pub blocks_sent: AtomicUsize,
    pub gain_history: Mutex<Vec<i32>>,
    pub options: Mutex<Option<String>>,
}

impl SimulatedProbe {
    pub fn gain_history(&self) -> Vec<i32> {
        self.gain_history.lock().clone()
    }
}

pub struct SimulatedLibrary {
    config: SimulatedConfig,
    probe: Arc<SimulatedProbe>,
}

impl SimulatedLibrary {
    pub fn new(config: SimulatedConfig) -> Self {
        let probe = Arc::new(SimulatedProbe {
            opened_index: AtomicI32::new(-1),
            ..SimulatedProbe::default()
        });
        Self { config, probe }
    }

    /// Handle for inspecting what the session did.
    pub fn probe(&self) -> Arc<SimulatedProbe> {
        Arc::clone(&self.probe)
    }
}

impl Default for SimulatedLibrary {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl SdrLibrary for SimulatedLibrary {
    fn name(&self) -> &str {
        "simulated"
    }

    fn resolve(&self, symbol: &str) -> bool {
        if symbol == super::OPT_STRING_SYMBOL && !self.config.supports_options {
            return false;
        }
        !self.config.missing_symbols.iter().any(|s| s == symbol)
    }

    fn device_count(&self) -> u32 {
        self.config.device_count
    }

    fn index_by_serial(&self, serial: &str) -> Option<u32> {
        self.config
            .serials
            .iter()
            .take(self.config.device_count as usize)
            .position(|s| s == serial)
            .map(|i| i as u32)
    }

    fn open(&self, index: u32) -> DriverResult<Box<dyn SdrDevice>> {
        if let Some(code) = self.config.open_status {
            return Err(DriverError::new("rtlsdr_open", code));
        }
        if index >= self.config.device_count {
            return Err(DriverError::new("rtlsdr_open", -1));
        }
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.opened_index.store(index as i32, Ordering::SeqCst);
        debug!(index, "simulated device opened");

        let (cancel_tx, cancel_rx) = bounded(1);
        Ok(Box::new(SimulatedDevice {
            config: self.config.clone(),
            probe: Arc::clone(&self.probe),
            cancel_tx,
            cancel_rx,
            phase: AtomicU32::new(0),
        }))
    }
}

struct SimulatedDevice {
    config: SimulatedConfig,
    probe: Arc<SimulatedProbe>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    phase: AtomicU32,
}

impl SimulatedDevice {
    /// Fill `block` with the carrier at the currently applied gain.
    fn synthesize(&self, block: &mut [u8]) {
        let gain_db = self.probe.tuner_gain.load(Ordering::Relaxed) as f32 / 10.0;
        let amplitude = self.config.base_amplitude * 10f32.powf(gain_db / 20.0);
        let mut phase = self.phase.load(Ordering::Relaxed);
        for iq in block.chunks_mut(2) {
            let angle = phase as f32 * 0.05;
            let i = 128.0 + amplitude * angle.cos();
            let q = 128.0 + amplitude * angle.sin();
            iq[0] = i.round().clamp(0.0, 255.0) as u8;
            if let Some(q_byte) = iq.get_mut(1) {
                *q_byte = q.round().clamp(0.0, 255.0) as u8;
            }
            phase = phase.wrapping_add(1);
        }
        self.phase.store(phase, Ordering::Relaxed);
    }
}

impl SdrDevice for SimulatedDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()> {
        if let Some(code) = self.config.sample_rate_status {
            return Err(DriverError::new("rtlsdr_set_sample_rate", code));
        }
        self.probe.sample_rate.store(rate, Ordering::SeqCst);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.probe.sample_rate.load(Ordering::SeqCst)
    }

    fn set_center_freq(&self, hz: u32) -> DriverResult<()> {
        self.probe.center_freq.store(hz, Ordering::SeqCst);
        Ok(())
    }

    fn center_freq(&self) -> u32 {
        self.probe.center_freq.load(Ordering::SeqCst)
    }

    fn tuner_gains(&self) -> Vec<i32> {
        self.config.gains.clone()
    }

    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult<()> {
        self.probe.manual_gain_mode.store(manual, Ordering::SeqCst);
        Ok(())
    }

    fn set_tuner_gain(&self, tenth_db: i32) -> DriverResult<()> {
        if self.config.fail_gain_calls {
            return Err(DriverError::new("rtlsdr_set_tuner_gain", -5));
        }
        self.probe.tuner_gain.store(tenth_db, Ordering::SeqCst);
        self.probe.gain_history.lock().push(tenth_db);
        Ok(())
    }

    fn tuner_gain(&self) -> i32 {
        self.probe.tuner_gain.load(Ordering::SeqCst)
    }

    fn set_agc_mode(&self, enabled: bool) -> DriverResult<()> {
        self.probe.hardware_agc.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_freq_correction(&self, ppm: i32) -> DriverResult<()> {
        self.probe.ppm.store(ppm, Ordering::SeqCst);
        Ok(())
    }

    fn reset_buffer(&self) -> DriverResult<()> {
        self.probe.buffer_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[u8]), buf_len: u32) -> DriverResult<()> {
        // A cancel issued outside a read is ignored, as librtlsdr does.
        while self.cancel_rx.try_recv().is_ok() {}
        self.probe.reads_started.fetch_add(1, Ordering::SeqCst);
        let mut block = vec![0u8; buf_len as usize];
        let mut sent = 0u32;

        loop {
            sent = sent.wrapping_add(1);
            let len = match self.config.short_block_every {
                Some(n) if n > 0 && sent % n == 0 => block.len() / 2,
                _ => block.len(),
            };
            self.synthesize(&mut block[..len]);
            callback(&block[..len]);
            self.probe.blocks_sent.fetch_add(1, Ordering::Relaxed);

            match self.cancel_rx.recv_timeout(self.config.block_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        self.probe.reads_finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_async(&self) -> DriverResult<()> {
        self.probe.cancels.fetch_add(1, Ordering::SeqCst);
        // A pending cancel is already queued when the slot is full.
        let _ = self.cancel_tx.try_send(());
        Ok(())
    }

    fn set_opt_string(&self, options: &str) -> DriverResult<()> {
        *self.probe.options.lock() = Some(options.to_string());
        Ok(())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        debug!("simulated device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_lookup_respects_device_count() {
        let lib = SimulatedLibrary::new(SimulatedConfig {
            device_count: 1,
            serials: vec!["A".into(), "B".into()],
            ..SimulatedConfig::default()
        });
        assert_eq!(lib.index_by_serial("A"), Some(0));
        assert_eq!(lib.index_by_serial("B"), None);
    }

    fn capture_one_block(dev: &dyn SdrDevice, len: u32) -> Vec<u8> {
        let mut captured = Vec::new();
        dev.read_async(
            &mut |b| {
                captured.extend_from_slice(b);
                dev.cancel_async().expect("cancel");
            },
            len,
        )
        .expect("read");
        captured
    }

    #[test]
    fn amplitude_follows_tuner_gain() {
        let lib = SimulatedLibrary::default();
        let dev = lib.open(0).expect("open simulated device");

        dev.set_tuner_gain(0).expect("set gain");
        let quiet = capture_one_block(dev.as_ref(), 512);
        dev.set_tuner_gain(496).expect("set gain");
        let loud = capture_one_block(dev.as_ref(), 512);

        let spread = |b: &[u8]| b.iter().max().unwrap() - b.iter().min().unwrap();
        assert!(spread(&loud) > spread(&quiet));
        assert!(loud.contains(&0) || loud.contains(&255));
    }

    #[test]
    fn short_blocks_are_delivered_on_schedule() {
        let lib = SimulatedLibrary::new(SimulatedConfig {
            short_block_every: Some(1),
            ..SimulatedConfig::default()
        });
        let dev = lib.open(0).expect("open simulated device");
        let block = capture_one_block(dev.as_ref(), 512);
        assert_eq!(block.len(), 256);
    }

    #[test]
    fn dropping_the_device_counts_a_close() {
        let lib = SimulatedLibrary::default();
        let probe = lib.probe();
        let dev = lib.open(0).expect("open simulated device");
        drop(dev);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }
}
