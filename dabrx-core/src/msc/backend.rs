//! Per-service backend contract.
//!
//! A backend owns one sub-channel: a contiguous CU range of every CIF. The
//! demultiplexer hands it exactly that range, once per dispatched CIF.
//! Decoding (de-puncturing, Viterbi, Reed-Solomon, AAC/MP2 or packet
//! reassembly) lives entirely behind [`Backend::process`].
//!
//! `&mut self` on `process` expresses that decoders are stateful; all
//! calls are serialised by the registry mutex.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A backend rejected or failed to process its range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait Backend: Send + 'static {
    /// Consume one CIF's worth of soft bits for this sub-channel.
    ///
    /// `soft_bits.len()` is always `length * 64`. Must not call back into
    /// the `MscHandler` that owns it.
    ///
    /// # Errors
    /// Reported to the dispatcher's observers; later backends still run.
    fn process(&mut self, soft_bits: &[i16]) -> Result<(), BackendError>;

    /// Called exactly once, before the backend is dropped.
    fn stop_running(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Audio,
    Data,
}

/// ASCTy value marking an HE-AAC (DAB+) audio sub-channel.
pub const ASCTY_DAB_PLUS: u8 = 0o77;

/// Audio service component, as announced in the FIC.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDescriptor {
    pub subchannel_id: u8,
    /// First CU of the sub-channel.
    pub start_addr: usize,
    /// Sub-channel size in CUs.
    pub length: usize,
    /// `true` for UEP (short form), `false` for EEP (long form).
    pub short_form: bool,
    pub protection_level: u8,
    /// kbit/s.
    pub bit_rate: u16,
    /// Audio service component type.
    pub ascty: u8,
    pub language: u8,
    pub program_type: u8,
}

impl AudioDescriptor {
    pub fn is_dab_plus(&self) -> bool {
        self.ascty == ASCTY_DAB_PLUS
    }

    pub fn protection_label(&self) -> String {
        protection_label(self.short_form, self.protection_level)
    }
}

/// Packet-mode data service component.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketDescriptor {
    pub subchannel_id: u8,
    pub start_addr: usize,
    pub length: usize,
    pub short_form: bool,
    pub protection_level: u8,
    pub bit_rate: u16,
    /// Data service component type.
    pub dscty: u8,
    /// 0 = none, 1 = Reed-Solomon outer code.
    pub fec_scheme: u8,
    pub packet_address: u16,
    pub app_type: u16,
}

impl PacketDescriptor {
    pub fn protection_label(&self) -> String {
        protection_label(self.short_form, self.protection_level)
    }
}

/// `"UEP n"` for short-form protection, `"EEP n-A"` / `"EEP n-B"` for long form.
///
/// In the long form bit 2 of the level selects profile B and the low two
/// bits encode the level minus one.
pub fn protection_label(short_form: bool, level: u8) -> String {
    if short_form {
        return format!("UEP {level}");
    }
    let n = (level & 0b11) + 1;
    let profile = if level & 0b100 != 0 { 'B' } else { 'A' };
    format!("EEP {n}-{profile}")
}

/// Builds backends from descriptors. Implemented by the host application
/// (real decoders) or by [`super::stub::StubBackendFactory`].
pub trait BackendFactory: Send + Sync {
    /// # Errors
    /// The descriptor is not decodable by this factory.
    fn audio(&self, descriptor: &AudioDescriptor) -> Result<Box<dyn Backend>, BackendError>;

    /// # Errors
    /// The descriptor is not decodable by this factory.
    fn data(&self, descriptor: &PacketDescriptor) -> Result<Box<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_form_labels() {
        assert_eq!(protection_label(false, 0b010), "EEP 3-A");
        assert_eq!(protection_label(false, 0b100), "EEP 1-B");
        assert_eq!(protection_label(false, 0b111), "EEP 4-B");
    }

    #[test]
    fn short_form_label() {
        assert_eq!(protection_label(true, 3), "UEP 3");
    }

    #[test]
    fn dab_plus_detection() {
        let mut audio = AudioDescriptor {
            ascty: ASCTY_DAB_PLUS,
            ..AudioDescriptor::default()
        };
        assert!(audio.is_dab_plus());
        audio.ascty = 0;
        assert!(!audio.is_dab_plus());
    }

    #[test]
    fn descriptor_json_is_camel_case() {
        let packet = PacketDescriptor {
            subchannel_id: 9,
            start_addr: 300,
            length: 24,
            packet_address: 1023,
            ..PacketDescriptor::default()
        };
        let json = serde_json::to_value(&packet).expect("serialize descriptor");
        assert_eq!(json["subchannelId"], 9);
        assert_eq!(json["startAddr"], 300);
        assert_eq!(json["packetAddress"], 1023);
    }
}
