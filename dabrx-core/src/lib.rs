//! # dabrx-core
//!
//! Intake and demultiplexing core of a DAB receiver.
//!
//! ## Architecture
//!
//! ```text
//! SdrDevice::read_async (acquisition thread)
//!     │  producer callback: push block, record min/max
//!     ▼
//! SPSC RingBuffer ──────────────► DeviceSession::pull_samples ──► (external OFDM demodulator)
//!     │                                                                   │
//! AmplitudeMonitor ◄── AGC thread ──► tuner gain                          │ deinterleaved blocks
//!                                                                         ▼
//!                                                      MscHandler::process_block
//!                                                                         │ CIF complete
//!                                                                         ▼
//!                                                      Backend::process (per sub-channel)
//! ```
//!
//! The producer callback never allocates or blocks. Decoding behind
//! [`Backend`] (FEC, audio, packet reassembly) is the host's concern.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod band;
pub mod buffering;
pub mod config;
pub mod device;
pub mod error;
pub mod ipc;
pub mod msc;
pub mod session;

// Convenience re-exports for downstream crates
pub use config::{load_config, save_config, MscConfig, ReceiverConfig, SessionConfig};
pub use device::{SdrDevice, SdrLibrary};
pub use error::{DabError, Result};
pub use ipc::events::{
    DispatchEvent, GainEvent, GainReason, OverloadEvent, SessionStatus, SessionStatusEvent,
};
pub use msc::backend::{AudioDescriptor, Backend, BackendError, BackendFactory, PacketDescriptor};
pub use msc::{BlockOutcome, MscHandler};
pub use session::DeviceSession;

#[cfg(feature = "rtlsdr")]
pub use device::rtlsdr::RtlSdrLibrary;
