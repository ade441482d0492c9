//! Session and demultiplexer configuration (JSON on disk).

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::band;
use crate::buffering::RING_CAPACITY;
use crate::error::Result;

/// Bytes per driver callback: 4096 I/Q pairs.
pub const DEFAULT_BLOCK_LEN: usize = 8192;

/// AGC poll interval.
pub const DEFAULT_AGC_TICK_MS: u64 = 50;

/// Overrides `agc_tick_ms` for every session in the process.
pub const AGC_TICK_ENV: &str = "DABRX_AGC_TICK_MS";

/// Parameters for [`DeviceSession::open`](crate::session::DeviceSession::open).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    /// Centre frequency. Ignored when `channel` resolves.
    pub frequency_hz: u32,
    /// DAB block name such as `"11C"`.
    pub channel: Option<String>,
    pub ppm_correction: i32,
    /// Initial gain as a percentage of the gain table.
    pub gain_percent: u8,
    /// RTL2832 digital AGC. Never touches the tuner gain path.
    pub hardware_agc: bool,
    pub software_agc: bool,
    pub device_index: u32,
    pub device_serial: Option<String>,
    /// Free-form driver option string, applied when the driver supports it.
    pub device_options: Option<String>,
    pub agc_tick_ms: u64,
    pub ring_capacity: usize,
    pub block_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 220_352_000,
            channel: None,
            ppm_correction: 0,
            gain_percent: 50,
            hardware_agc: false,
            software_agc: true,
            device_index: 0,
            device_serial: None,
            device_options: None,
            agc_tick_ms: DEFAULT_AGC_TICK_MS,
            ring_capacity: RING_CAPACITY,
            block_len: DEFAULT_BLOCK_LEN,
        }
    }
}

impl SessionConfig {
    pub fn normalize(&mut self) {
        self.gain_percent = self.gain_percent.min(100);
        self.agc_tick_ms = self.agc_tick_ms.clamp(10, 1_000);
        self.block_len = self.block_len.max(2) & !1;
        self.ring_capacity = self.ring_capacity.max(4 * self.block_len);
        self.channel = trimmed(self.channel.take());
        self.device_serial = trimmed(self.device_serial.take());
        self.device_options = trimmed(self.device_options.take());
    }

    /// `channel` when it names a known block, `frequency_hz` otherwise.
    pub fn resolved_frequency(&self) -> u32 {
        match self.channel.as_deref() {
            Some(name) => band::channel_frequency(name).unwrap_or_else(|e| {
                warn!(error = %e, fallback = self.frequency_hz, "ignoring channel");
                self.frequency_hz
            }),
            None => self.frequency_hz,
        }
    }

    /// Tick interval after applying the environment override.
    pub fn effective_agc_tick_ms(&self) -> u64 {
        agc_tick_override().unwrap_or(self.agc_tick_ms)
    }
}

/// Demultiplexer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct MscConfig {
    /// DAB transmission mode: 1, 2 or 4.
    pub mode: u8,
}

impl Default for MscConfig {
    fn default() -> Self {
        Self { mode: 1 }
    }
}

impl MscConfig {
    pub fn normalize(&mut self) {
        if !matches!(self.mode, 1 | 2 | 4) {
            warn!(mode = self.mode, "unsupported transmission mode, using mode 1");
            self.mode = 1;
        }
    }
}

/// Everything a receiver process persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ReceiverConfig {
    pub session: SessionConfig,
    pub msc: MscConfig,
}

impl ReceiverConfig {
    pub fn normalize(&mut self) {
        self.session.normalize();
        self.msc.normalize();
    }
}

/// Read a config file, falling back to defaults when missing or unreadable.
pub fn load_config(path: &Path) -> ReceiverConfig {
    let mut config = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ReceiverConfig>(&raw).ok())
        .unwrap_or_default();
    config.normalize();
    config
}

/// Write `config` as pretty JSON, creating parent directories.
pub fn save_config(path: &Path, config: &ReceiverConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

fn agc_tick_override() -> Option<u64> {
    static OVERRIDE: OnceLock<Option<u64>> = OnceLock::new();
    *OVERRIDE.get_or_init(|| {
        std::env::var(AGC_TICK_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|ms| ms.clamp(10, 1_000))
    })
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_dongle_geometry() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.block_len, 8192);
        assert_eq!(cfg.ring_capacity, 1024 * 1024);
        assert_eq!(cfg.agc_tick_ms, 50);
        assert!(cfg.software_agc);
        assert!(!cfg.hardware_agc);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut cfg = SessionConfig {
            gain_percent: 180,
            agc_tick_ms: 1,
            block_len: 1001,
            ring_capacity: 16,
            device_serial: Some("   ".into()),
            ..SessionConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.gain_percent, 100);
        assert_eq!(cfg.agc_tick_ms, 10);
        assert_eq!(cfg.block_len, 1000);
        assert_eq!(cfg.ring_capacity, 4000);
        assert_eq!(cfg.device_serial, None);
    }

    #[test]
    fn unsupported_mode_falls_back_to_mode_one() {
        let mut msc = MscConfig { mode: 3 };
        msc.normalize();
        assert_eq!(msc.mode, 1);
    }

    #[test]
    fn channel_takes_precedence_over_frequency() {
        let cfg = SessionConfig {
            frequency_hz: 1,
            channel: Some("12C".into()),
            ..SessionConfig::default()
        };
        assert_eq!(cfg.resolved_frequency(), 227_360_000);

        let bad = SessionConfig {
            frequency_hz: 1,
            channel: Some("nope".into()),
            ..SessionConfig::default()
        };
        assert_eq!(bad.resolved_frequency(), 1);
    }

    #[test]
    fn json_uses_camel_case_and_fills_missing_fields() {
        let cfg: ReceiverConfig =
            serde_json::from_str(r#"{"session":{"gainPercent":75},"msc":{"mode":2}}"#)
                .expect("parse config");
        assert_eq!(cfg.session.gain_percent, 75);
        assert_eq!(cfg.session.block_len, DEFAULT_BLOCK_LEN);
        assert_eq!(cfg.msc.mode, 2);

        let json = serde_json::to_value(&cfg).expect("serialize config");
        assert_eq!(json["session"]["ppmCorrection"], 0);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let mut path = std::env::temp_dir();
        path.push(format!("dabrx-config-{}", std::process::id()));
        path.push("receiver.json");

        let mut cfg = ReceiverConfig::default();
        cfg.session.channel = Some("11C".into());
        cfg.session.ppm_correction = -12;
        save_config(&path, &cfg).expect("save config");

        let loaded = load_config(&path);
        let _ = fs::remove_dir_all(path.parent().expect("parent dir"));
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let loaded = load_config(Path::new("/definitely/not/here.json"));
        assert_eq!(loaded, ReceiverConfig::default());
    }
}
