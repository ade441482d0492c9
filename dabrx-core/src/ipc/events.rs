//! Observer events broadcast by the session and the demultiplexer.
//!
//! | Event | Source | Subscribe with |
//! |-------|--------|----------------|
//! | `SessionStatusEvent` | `DeviceSession` | `subscribe_status()` |
//! | `GainEvent` | `DeviceSession` (control + AGC threads) | `subscribe_gain()` |
//! | `OverloadEvent` | AGC thread | `subscribe_overload()` |
//! | `DispatchEvent` | `MscHandler` | `subscribe_dispatch()` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. the tuned frequency).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Device open, acquisition not started.
    Idle,
    /// Acquisition and AGC threads running.
    Streaming,
    /// Threads joined; streaming may be restarted.
    Stopped,
    /// The acquisition thread ended on a driver error.
    Error,
}

// ---------------------------------------------------------------------------
// Gain changes
// ---------------------------------------------------------------------------

/// Emitted every time a gain value is written to the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Index into the device gain table.
    pub index: usize,
    /// Applied gain in tenths of a dB.
    pub tenth_db: i32,
    pub reason: GainReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GainReason {
    /// `set_gain` / `set_gain_percent` from the control surface.
    Manual,
    AgcUp,
    AgcDown,
    /// Current gain written again (stream restart, AGC switched off).
    AgcReapply,
}

// ---------------------------------------------------------------------------
// Overload
// ---------------------------------------------------------------------------

/// Emitted by the AGC thread when a block touched 0 or 255.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverloadEvent {
    pub min: u8,
    pub max: u8,
    pub gain_index: usize,
    /// `true` when software AGC handled it by stepping down.
    pub corrected: bool,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Emitted once per dispatched CIF.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    /// Rolling CIF counter (mod 4) of the dispatched frame.
    pub cif_count: u8,
    /// Backends whose `process` was called.
    pub delivered: usize,
    pub failures: Vec<DispatchFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    /// CU offset of the failing backend.
    pub start_addr: usize,
    pub message: String,
}
