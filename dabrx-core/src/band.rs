//! DAB channel names → centre frequencies.

use crate::error::{DabError, Result};

/// Band III block names with their centre frequency in kHz.
pub const BAND_III: &[(&str, u32)] = &[
    ("5A", 174_928),
    ("5B", 176_640),
    ("5C", 178_352),
    ("5D", 180_064),
    ("6A", 181_936),
    ("6B", 183_648),
    ("6C", 185_360),
    ("6D", 187_072),
    ("7A", 188_928),
    ("7B", 190_640),
    ("7C", 192_352),
    ("7D", 194_064),
    ("8A", 195_936),
    ("8B", 197_648),
    ("8C", 199_360),
    ("8D", 201_072),
    ("9A", 202_928),
    ("9B", 204_640),
    ("9C", 206_352),
    ("9D", 208_064),
    ("10A", 209_936),
    ("10N", 210_096),
    ("10B", 211_648),
    ("10C", 213_360),
    ("10D", 215_072),
    ("11A", 216_928),
    ("11N", 217_088),
    ("11B", 218_640),
    ("11C", 220_352),
    ("11D", 222_064),
    ("12A", 223_936),
    ("12N", 224_096),
    ("12B", 225_648),
    ("12C", 227_360),
    ("12D", 229_072),
    ("13A", 230_784),
    ("13B", 232_496),
    ("13C", 234_208),
    ("13D", 235_776),
    ("13E", 237_488),
    ("13F", 239_200),
];

/// L-Band block names with their centre frequency in kHz.
pub const L_BAND: &[(&str, u32)] = &[
    ("LA", 1_452_960),
    ("LB", 1_454_672),
    ("LC", 1_456_384),
    ("LD", 1_458_096),
    ("LE", 1_459_808),
    ("LF", 1_461_520),
    ("LG", 1_463_232),
    ("LH", 1_464_944),
    ("LI", 1_466_656),
    ("LJ", 1_468_368),
    ("LK", 1_470_080),
    ("LL", 1_471_792),
    ("LM", 1_473_504),
    ("LN", 1_475_216),
    ("LO", 1_476_928),
    ("LP", 1_478_640),
];

/// Centre frequency in Hz for a channel name such as `"11C"` or `"lb"`.
///
/// # Errors
/// `DabError::UnknownChannel` when the name is in neither table.
pub fn channel_frequency(name: &str) -> Result<u32> {
    let wanted = name.trim().to_ascii_uppercase();
    BAND_III
        .iter()
        .chain(L_BAND.iter())
        .find(|(label, _)| *label == wanted)
        .map(|(_, khz)| khz * 1_000)
        .ok_or_else(|| DabError::UnknownChannel(name.to_string()))
}

/// Reverse lookup: the channel whose centre is exactly `hz`.
pub fn channel_for_frequency(hz: u32) -> Option<&'static str> {
    BAND_III
        .iter()
        .chain(L_BAND.iter())
        .find(|(_, khz)| khz * 1_000 == hz)
        .map(|(label, _)| *label)
}
