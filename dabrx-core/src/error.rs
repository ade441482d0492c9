use thiserror::Error;

use crate::device::DriverError;
use crate::msc::backend::BackendError;

/// All errors produced by dabrx-core.
#[derive(Debug, Error)]
pub enum DabError {
    #[error("driver capability not available: {symbol}")]
    Binding { symbol: &'static str },

    #[error("no devices found")]
    NoDeviceFound,

    #[error("opening device {index} failed (status {code})")]
    OpenFailed { index: u32, code: i32 },

    #[error("device rejected sample rate {rate} (status {code})")]
    SampleRateRejected { rate: u32, code: i32 },

    #[error("device reports an empty gain table")]
    EmptyGainTable,

    #[error("gain index {index} out of range (table has {table_len} entries)")]
    GainIndexOutOfRange { index: usize, table_len: usize },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("sub-channel CU range {start}..{end} exceeds the CIF ({cif_cus} CUs)")]
    SubChannelOutOfRange {
        start: usize,
        end: usize,
        cif_cus: usize,
    },

    #[error("sub-channel CU range {start}..{end} overlaps an existing range {other_start}..{other_end}")]
    SubChannelOverlap {
        start: usize,
        end: usize,
        other_start: usize,
        other_end: usize,
    },

    #[error("block carries {actual} soft bits, expected {expected}")]
    BlockLength { expected: usize, actual: usize },

    #[error("unknown DAB channel: {0}")]
    UnknownChannel(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DabError {
    /// True for the construction-time failures that abort session creation.
    ///
    /// Callers should re-check hardware presence before retrying these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DabError::Binding { .. }
                | DabError::NoDeviceFound
                | DabError::OpenFailed { .. }
                | DabError::SampleRateRejected { .. }
                | DabError::EmptyGainTable
        )
    }
}

pub type Result<T> = std::result::Result<T, DabError>;
