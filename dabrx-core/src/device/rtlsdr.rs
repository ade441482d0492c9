//! `RtlSdrLibrary`: the system librtlsdr, linked at build time.
//!
//! Every mandatory entry point is linked, so `resolve` succeeds for all of
//! them. `rtlsdr_set_opt_string` only exists in some forks and is not
//! linked; it reports as absent.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_uchar, c_void};
use std::ptr;

use tracing::{debug, info};

use super::{DriverError, DriverResult, SdrDevice, SdrLibrary, OPT_STRING_SYMBOL};

/// librtlsdr's default number of USB transfer buffers.
const ASYNC_BUF_NUM: u32 = 15;

type RtlSdrDev = c_void;
type ReadAsyncCallback = unsafe extern "C" fn(buf: *mut c_uchar, len: u32, ctx: *mut c_void);

extern "C" {
    fn rtlsdr_get_device_count() -> u32;
    fn rtlsdr_get_index_by_serial(serial: *const c_char) -> c_int;
    fn rtlsdr_open(dev: *mut *mut RtlSdrDev, index: u32) -> c_int;
    fn rtlsdr_close(dev: *mut RtlSdrDev) -> c_int;
    fn rtlsdr_set_sample_rate(dev: *mut RtlSdrDev, rate: u32) -> c_int;
    fn rtlsdr_get_sample_rate(dev: *mut RtlSdrDev) -> u32;
    fn rtlsdr_get_tuner_gains(dev: *mut RtlSdrDev, gains: *mut c_int) -> c_int;
    fn rtlsdr_set_tuner_gain_mode(dev: *mut RtlSdrDev, manual: c_int) -> c_int;
    fn rtlsdr_set_agc_mode(dev: *mut RtlSdrDev, on: c_int) -> c_int;
    fn rtlsdr_set_tuner_gain(dev: *mut RtlSdrDev, gain: c_int) -> c_int;
    fn rtlsdr_get_tuner_gain(dev: *mut RtlSdrDev) -> c_int;
    fn rtlsdr_set_center_freq(dev: *mut RtlSdrDev, freq: u32) -> c_int;
    fn rtlsdr_get_center_freq(dev: *mut RtlSdrDev) -> u32;
    fn rtlsdr_set_freq_correction(dev: *mut RtlSdrDev, ppm: c_int) -> c_int;
    fn rtlsdr_reset_buffer(dev: *mut RtlSdrDev) -> c_int;
    fn rtlsdr_read_async(
        dev: *mut RtlSdrDev,
        cb: ReadAsyncCallback,
        ctx: *mut c_void,
        buf_num: u32,
        buf_len: u32,
    ) -> c_int;
    fn rtlsdr_cancel_async(dev: *mut RtlSdrDev) -> c_int;
}

fn check(call: &'static str, code: c_int) -> DriverResult<()> {
    if code < 0 {
        Err(DriverError::new(call, code))
    } else {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RtlSdrLibrary;

impl SdrLibrary for RtlSdrLibrary {
    fn name(&self) -> &str {
        "librtlsdr"
    }

    fn resolve(&self, symbol: &str) -> bool {
        symbol != OPT_STRING_SYMBOL
    }

    fn device_count(&self) -> u32 {
        unsafe { rtlsdr_get_device_count() }
    }

    fn index_by_serial(&self, serial: &str) -> Option<u32> {
        let serial = CString::new(serial).ok()?;
        let index = unsafe { rtlsdr_get_index_by_serial(serial.as_ptr()) };
        u32::try_from(index).ok()
    }

    fn open(&self, index: u32) -> DriverResult<Box<dyn SdrDevice>> {
        let mut dev: *mut RtlSdrDev = ptr::null_mut();
        check("rtlsdr_open", unsafe { rtlsdr_open(&mut dev, index) })?;
        if dev.is_null() {
            return Err(DriverError::new("rtlsdr_open", -1));
        }
        info!(index, "librtlsdr device opened");
        Ok(Box::new(RtlSdrDevice { dev }))
    }
}

/// Owned `rtlsdr_dev_t *`.
struct RtlSdrDevice {
    dev: *mut RtlSdrDev,
}

// librtlsdr serialises register access internally; the session calls
// `cancel_async` and gain setters from other threads while `read_async`
// blocks, exactly as the C API is meant to be used.
unsafe impl Send for RtlSdrDevice {}
unsafe impl Sync for RtlSdrDevice {}

/// `ctx` points at a `&mut dyn FnMut(&[u8])` living on `read_async`'s stack.
unsafe extern "C" fn forward_block(buf: *mut c_uchar, len: u32, ctx: *mut c_void) {
    if buf.is_null() || ctx.is_null() {
        return;
    }
    let callback = &mut *(ctx as *mut &mut dyn FnMut(&[u8]));
    let block = std::slice::from_raw_parts(buf, len as usize);
    callback(block);
}

impl SdrDevice for RtlSdrDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()> {
        check("rtlsdr_set_sample_rate", unsafe {
            rtlsdr_set_sample_rate(self.dev, rate)
        })
    }

    fn sample_rate(&self) -> u32 {
        unsafe { rtlsdr_get_sample_rate(self.dev) }
    }

    fn set_center_freq(&self, hz: u32) -> DriverResult<()> {
        check("rtlsdr_set_center_freq", unsafe {
            rtlsdr_set_center_freq(self.dev, hz)
        })
    }

    fn center_freq(&self) -> u32 {
        unsafe { rtlsdr_get_center_freq(self.dev) }
    }

    fn tuner_gains(&self) -> Vec<i32> {
        let count = unsafe { rtlsdr_get_tuner_gains(self.dev, ptr::null_mut()) };
        if count <= 0 {
            return Vec::new();
        }
        let mut gains = vec![0 as c_int; count as usize];
        let filled = unsafe { rtlsdr_get_tuner_gains(self.dev, gains.as_mut_ptr()) };
        gains.truncate(filled.max(0) as usize);
        gains
    }

    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult<()> {
        check("rtlsdr_set_tuner_gain_mode", unsafe {
            rtlsdr_set_tuner_gain_mode(self.dev, c_int::from(manual))
        })
    }

    fn set_tuner_gain(&self, tenth_db: i32) -> DriverResult<()> {
        check("rtlsdr_set_tuner_gain", unsafe {
            rtlsdr_set_tuner_gain(self.dev, tenth_db)
        })
    }

    fn tuner_gain(&self) -> i32 {
        unsafe { rtlsdr_get_tuner_gain(self.dev) }
    }

    fn set_agc_mode(&self, enabled: bool) -> DriverResult<()> {
        check("rtlsdr_set_agc_mode", unsafe {
            rtlsdr_set_agc_mode(self.dev, c_int::from(enabled))
        })
    }

    fn set_freq_correction(&self, ppm: i32) -> DriverResult<()> {
        check("rtlsdr_set_freq_correction", unsafe {
            rtlsdr_set_freq_correction(self.dev, ppm)
        })
    }

    fn reset_buffer(&self) -> DriverResult<()> {
        check("rtlsdr_reset_buffer", unsafe { rtlsdr_reset_buffer(self.dev) })
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[u8]), buf_len: u32) -> DriverResult<()> {
        let mut callback = callback;
        let ctx = &mut callback as *mut &mut dyn FnMut(&[u8]) as *mut c_void;
        debug!(buf_len, "entering rtlsdr_read_async");
        check("rtlsdr_read_async", unsafe {
            rtlsdr_read_async(self.dev, forward_block, ctx, ASYNC_BUF_NUM, buf_len)
        })
    }

    fn cancel_async(&self) -> DriverResult<()> {
        check("rtlsdr_cancel_async", unsafe { rtlsdr_cancel_async(self.dev) })
    }
}

impl Drop for RtlSdrDevice {
    fn drop(&mut self) {
        unsafe {
            rtlsdr_close(self.dev);
        }
        debug!("librtlsdr device closed");
    }
}
