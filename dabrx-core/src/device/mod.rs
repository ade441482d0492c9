//! Sample-source driver abstraction.
//!
//! The streaming session never talks to a vendor library directly. It binds a
//! [`SdrLibrary`] (enumeration + open) once at construction and then drives
//! the returned [`SdrDevice`] from three threads:
//!
//! - the acquisition thread, parked inside [`SdrDevice::read_async`];
//! - the AGC thread, calling [`SdrDevice::set_tuner_gain`];
//! - the control thread, calling everything else (including
//!   [`SdrDevice::cancel_async`] to unblock the acquisition thread).
//!
//! All device methods therefore take `&self`; implementations use interior
//! mutability. Dropping the device closes it.
//!
//! Implementations:
//! - [`simulated::SimulatedLibrary`]: deterministic signal generator for tests.
//! - [`file::FileLibrary`]: replays raw `u8` I/Q or WAV captures.
//! - `rtlsdr::RtlSdrLibrary`: system librtlsdr (feature `rtlsdr`).

pub mod file;
pub mod simulated;

#[cfg(feature = "rtlsdr")]
#[allow(unsafe_code)]
pub mod rtlsdr;

use thiserror::Error;

/// Capabilities the session refuses to run without.
pub const REQUIRED_SYMBOLS: &[&str] = &[
    "rtlsdr_get_device_count",
    "rtlsdr_get_index_by_serial",
    "rtlsdr_open",
    "rtlsdr_close",
    "rtlsdr_set_sample_rate",
    "rtlsdr_get_sample_rate",
    "rtlsdr_get_tuner_gains",
    "rtlsdr_set_tuner_gain_mode",
    "rtlsdr_set_agc_mode",
    "rtlsdr_set_tuner_gain",
    "rtlsdr_get_tuner_gain",
    "rtlsdr_set_center_freq",
    "rtlsdr_get_center_freq",
    "rtlsdr_set_freq_correction",
    "rtlsdr_reset_buffer",
    "rtlsdr_read_async",
    "rtlsdr_cancel_async",
];

/// Only present in some librtlsdr forks.
pub const OPT_STRING_SYMBOL: &str = "rtlsdr_set_opt_string";

/// A driver call returned a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed with status {code}")]
pub struct DriverError {
    pub call: &'static str,
    pub code: i32,
}

impl DriverError {
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Library-level entry points: symbol binding, enumeration and open.
pub trait SdrLibrary: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Whether the capability named `symbol` is available.
    fn resolve(&self, symbol: &str) -> bool;

    fn device_count(&self) -> u32;

    /// Device index for a serial number, `None` when no device matches.
    fn index_by_serial(&self, serial: &str) -> Option<u32>;

    /// Open the device at `index`.
    ///
    /// # Errors
    /// The driver status code wrapped in a [`DriverError`].
    fn open(&self, index: u32) -> DriverResult<Box<dyn SdrDevice>>;
}

/// An opened device. Dropping it closes the device.
pub trait SdrDevice: Send + Sync + 'static {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()>;

    fn sample_rate(&self) -> u32;

    fn set_center_freq(&self, hz: u32) -> DriverResult<()>;

    fn center_freq(&self) -> u32;

    /// Supported tuner gains in tenths of a dB.
    fn tuner_gains(&self) -> Vec<i32>;

    /// `true` selects manual tuner gain, `false` lets the tuner decide.
    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult<()>;

    /// Apply a tuner gain in tenths of a dB.
    fn set_tuner_gain(&self, tenth_db: i32) -> DriverResult<()>;

    fn tuner_gain(&self) -> i32;

    /// The RTL2832 digital AGC. Independent from the tuner gain mode.
    fn set_agc_mode(&self, enabled: bool) -> DriverResult<()>;

    fn set_freq_correction(&self, ppm: i32) -> DriverResult<()>;

    fn reset_buffer(&self) -> DriverResult<()>;

    /// Block the calling thread, invoking `callback` once per delivered
    /// block of (nominally) `buf_len` bytes, until [`cancel_async`] is called
    /// or the source is exhausted.
    ///
    /// [`cancel_async`]: SdrDevice::cancel_async
    fn read_async(&self, callback: &mut dyn FnMut(&[u8]), buf_len: u32) -> DriverResult<()>;

    /// Make a pending [`read_async`](SdrDevice::read_async) return.
    fn cancel_async(&self) -> DriverResult<()>;

    /// Free-form driver options. Only called when the library resolved
    /// [`OPT_STRING_SYMBOL`].
    fn set_opt_string(&self, _options: &str) -> DriverResult<()> {
        Err(DriverError::new(OPT_STRING_SYMBOL, -1))
    }
}
