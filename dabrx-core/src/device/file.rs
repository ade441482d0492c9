//! `FileLibrary`: replays recorded I/Q captures as if they came from a dongle.
//!
//! Two formats are understood:
//!
//! - [`CaptureFormat::RawU8`]: interleaved unsigned 8-bit I/Q, exactly what
//!   an RTL-SDR delivers (e.g. `rtl_sdr -s 2048000 capture.raw`).
//! - [`CaptureFormat::Wav`]: a two-channel WAV file (I left, Q right) with
//!   8-bit, 16-bit or float samples, re-quantised to unsigned bytes.
//!
//! Gain, frequency and AGC calls are accepted and remembered but have no
//! effect on the replayed signal.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DriverError, DriverResult, SdrDevice, SdrLibrary};
use crate::session::INPUT_RATE;

/// Gain table reported by file sources; values are accepted and ignored.
const FILE_GAINS: &[i32] = &[0, 100, 200, 300, 400];

/// On-disk layout of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    RawU8,
    Wav,
}

impl CaptureFormat {
    /// Guess from the file extension: `.wav` is WAV, anything else raw.
    pub fn from_path(path: &Path) -> Self {
        let is_wav = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav {
            CaptureFormat::Wav
        } else {
            CaptureFormat::RawU8
        }
    }
}

/// Single-device "library" backed by one capture file.
#[derive(Debug, Clone)]
pub struct FileLibrary {
    path: PathBuf,
    format: CaptureFormat,
    /// Deliver blocks at the nominal 2.048 MS/s instead of as fast as possible.
    paced: bool,
    /// Rewind at end of file instead of returning from `read_async`.
    repeat: bool,
}

impl FileLibrary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = CaptureFormat::from_path(&path);
        Self {
            path,
            format,
            paced: true,
            repeat: false,
        }
    }

    pub fn with_format(mut self, format: CaptureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }
}

impl SdrLibrary for FileLibrary {
    fn name(&self) -> &str {
        "file"
    }

    fn resolve(&self, symbol: &str) -> bool {
        symbol != super::OPT_STRING_SYMBOL
    }

    fn device_count(&self) -> u32 {
        u32::from(self.path.is_file())
    }

    fn index_by_serial(&self, _serial: &str) -> Option<u32> {
        None
    }

    fn open(&self, index: u32) -> DriverResult<Box<dyn SdrDevice>> {
        if index != 0 {
            return Err(DriverError::new("rtlsdr_open", -1));
        }
        let source = CaptureSource::open(&self.path, self.format).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "cannot open capture");
            DriverError::new("rtlsdr_open", -2)
        })?;
        info!(path = %self.path.display(), format = ?self.format, "capture opened");

        let (cancel_tx, cancel_rx) = bounded(1);
        Ok(Box::new(FileDevice {
            source: Mutex::new(source),
            paced: self.paced,
            repeat: self.repeat,
            sample_rate: AtomicU32::new(INPUT_RATE),
            center_freq: AtomicU32::new(0),
            tuner_gain: AtomicI32::new(0),
            hardware_agc: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        }))
    }
}

enum CaptureSource {
    Raw(BufReader<File>),
    Wav(hound::WavReader<BufReader<File>>),
}

impl CaptureSource {
    fn open(path: &Path, format: CaptureFormat) -> crate::error::Result<Self> {
        match format {
            CaptureFormat::RawU8 => Ok(Self::Raw(BufReader::new(File::open(path)?))),
            CaptureFormat::Wav => {
                let reader = hound::WavReader::open(path)?;
                let spec = reader.spec();
                if spec.channels != 2 {
                    return Err(anyhow::anyhow!(
                        "I/Q WAV must have 2 channels, found {}",
                        spec.channels
                    )
                    .into());
                }
                Ok(Self::Wav(reader))
            }
        }
    }

    /// Fill `block` completely. Returns `false` at end of input.
    fn fill(&mut self, block: &mut [u8]) -> io::Result<bool> {
        match self {
            Self::Raw(reader) => match reader.read_exact(block) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
                Err(e) => Err(e),
            },
            Self::Wav(reader) => {
                let spec = reader.spec();
                let mut filled = 0;
                match spec.sample_format {
                    hound::SampleFormat::Float => {
                        for sample in reader.samples::<f32>().take(block.len()) {
                            let v = sample.map_err(hound_to_io)?;
                            block[filled] = (v * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8;
                            filled += 1;
                        }
                    }
                    hound::SampleFormat::Int if spec.bits_per_sample <= 8 => {
                        for sample in reader.samples::<i8>().take(block.len()) {
                            let v = sample.map_err(hound_to_io)?;
                            block[filled] = (i16::from(v) + 128) as u8;
                            filled += 1;
                        }
                    }
                    hound::SampleFormat::Int => {
                        for sample in reader.samples::<i16>().take(block.len()) {
                            let v = sample.map_err(hound_to_io)?;
                            block[filled] = ((v >> 8) + 128) as u8;
                            filled += 1;
                        }
                    }
                }
                Ok(filled == block.len())
            }
        }
    }

    fn rewind(&mut self) -> io::Result<()> {
        match self {
            Self::Raw(reader) => reader.seek(SeekFrom::Start(0)).map(|_| ()),
            Self::Wav(reader) => reader.seek(0),
        }
    }
}

fn hound_to_io(e: hound::Error) -> io::Error {
    match e {
        hound::Error::IoError(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

struct FileDevice {
    source: Mutex<CaptureSource>,
    paced: bool,
    repeat: bool,
    sample_rate: AtomicU32,
    center_freq: AtomicU32,
    tuner_gain: AtomicI32,
    hardware_agc: AtomicBool,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl FileDevice {
    /// Wall-clock duration of `bytes` interleaved I/Q bytes.
    fn block_duration(&self, bytes: usize) -> Duration {
        let rate = self.sample_rate.load(Ordering::Relaxed).max(1);
        Duration::from_secs_f64((bytes / 2) as f64 / f64::from(rate))
    }
}

impl SdrDevice for FileDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult<()> {
        self.sample_rate.store(rate, Ordering::Relaxed);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    fn set_center_freq(&self, hz: u32) -> DriverResult<()> {
        self.center_freq.store(hz, Ordering::Relaxed);
        Ok(())
    }

    fn center_freq(&self) -> u32 {
        self.center_freq.load(Ordering::Relaxed)
    }

    fn tuner_gains(&self) -> Vec<i32> {
        FILE_GAINS.to_vec()
    }

    fn set_tuner_gain_mode(&self, _manual: bool) -> DriverResult<()> {
        Ok(())
    }

    fn set_tuner_gain(&self, tenth_db: i32) -> DriverResult<()> {
        self.tuner_gain.store(tenth_db, Ordering::Relaxed);
        Ok(())
    }

    fn tuner_gain(&self) -> i32 {
        self.tuner_gain.load(Ordering::Relaxed)
    }

    fn set_agc_mode(&self, enabled: bool) -> DriverResult<()> {
        self.hardware_agc.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    fn set_freq_correction(&self, _ppm: i32) -> DriverResult<()> {
        Ok(())
    }

    fn reset_buffer(&self) -> DriverResult<()> {
        Ok(())
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[u8]), buf_len: u32) -> DriverResult<()> {
        while self.cancel_rx.try_recv().is_ok() {}
        let mut block = vec![0u8; buf_len as usize];
        let period = self.block_duration(block.len());
        let mut next_due = Instant::now();
        // Blocks since the last rewind; a capture shorter than one block never loops.
        let mut delivered = false;

        loop {
            let more = self.source.lock().fill(&mut block).map_err(|e| {
                warn!(error = %e, "capture read failed");
                DriverError::new("rtlsdr_read_async", -3)
            })?;

            if !more {
                // Rewind either way so the next read replays from the start.
                self.source.lock().rewind().map_err(|e| {
                    warn!(error = %e, "capture rewind failed");
                    DriverError::new("rtlsdr_read_async", -3)
                })?;
                if !self.repeat || !delivered {
                    info!(delivered, "end of capture");
                    return Ok(());
                }
                debug!("end of capture, rewinding");
                delivered = false;
                continue;
            }

            callback(&block);
            delivered = true;

            let wait = if self.paced {
                next_due += period;
                next_due.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            match self.cancel_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn cancel_async(&self) -> DriverResult<()> {
        let _ = self.cancel_tx.try_send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dabrx-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            CaptureFormat::from_path(Path::new("x/capture.WAV")),
            CaptureFormat::Wav
        );
        assert_eq!(
            CaptureFormat::from_path(Path::new("capture.raw")),
            CaptureFormat::RawU8
        );
    }

    #[test]
    fn raw_capture_is_replayed_block_by_block() {
        let path = temp_path("replay.raw");
        let payload: Vec<u8> = (0..64u32).map(|i| i as u8).collect();
        File::create(&path)
            .and_then(|mut f| f.write_all(&payload))
            .expect("write capture");

        let lib = FileLibrary::new(&path).paced(false);
        assert_eq!(lib.device_count(), 1);
        let dev = lib.open(0).expect("open capture");

        let mut blocks = Vec::new();
        dev.read_async(&mut |b| blocks.push(b.to_vec()), 16)
            .expect("replay");
        let _ = std::fs::remove_file(&path);

        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[1][0], 16);
        assert!(blocks.iter().all(|b| b.len() == 16));
    }

    #[test]
    fn second_read_replays_from_the_start() {
        let path = temp_path("replay-twice.raw");
        let payload: Vec<u8> = (0..32u32).map(|i| i as u8).collect();
        File::create(&path)
            .and_then(|mut f| f.write_all(&payload))
            .expect("write capture");

        let dev = FileLibrary::new(&path).paced(false).open(0).expect("open");
        let mut first = Vec::new();
        dev.read_async(&mut |b| first.push(b[0]), 16).expect("first read");
        let mut second = Vec::new();
        dev.read_async(&mut |b| second.push(b[0]), 16).expect("second read");
        let _ = std::fs::remove_file(&path);

        assert_eq!(first, vec![0, 16]);
        assert_eq!(second, first);
    }

    #[test]
    fn looping_capture_shorter_than_a_block_ends() {
        let path = temp_path("too-short.raw");
        File::create(&path)
            .and_then(|mut f| f.write_all(&[128u8; 6]))
            .expect("write capture");

        let dev = FileLibrary::new(&path)
            .paced(false)
            .repeat(true)
            .open(0)
            .expect("open");
        let mut calls = 0;
        dev.read_async(&mut |_| calls += 1, 16).expect("read");
        let _ = std::fs::remove_file(&path);

        assert_eq!(calls, 0);
    }

    #[test]
    fn wav_capture_is_requantised_to_unsigned_bytes() {
        let path = temp_path("replay.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: INPUT_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        {
            let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
            for _ in 0..8 {
                writer.write_sample(i16::MIN).expect("write I");
                writer.write_sample(0i16).expect("write Q");
            }
            writer.finalize().expect("finalize wav");
        }

        let dev = FileLibrary::new(&path)
            .paced(false)
            .open(0)
            .expect("open wav capture");
        let mut bytes = Vec::new();
        dev.read_async(&mut |b| bytes.extend_from_slice(b), 16)
            .expect("replay");
        let _ = std::fs::remove_file(&path);

        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 128);
    }

    #[test]
    fn missing_file_reports_no_device() {
        let lib = FileLibrary::new(temp_path("does-not-exist.raw"));
        assert_eq!(lib.device_count(), 0);
    }
}
