//! Tuner gain table and the single writer of gain state.
//!
//! Both the control thread (`set_gain`) and the AGC thread (`agc_step`) go
//! through [`GainControl`]; the current index lives behind one mutex so a
//! manual change and an AGC step can never interleave half-applied.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::agc::{self, AgcAction};
use crate::device::SdrDevice;
use crate::error::{DabError, Result};
use crate::ipc::events::{GainEvent, GainReason};

/// Supported tuner gains in tenths of a dB, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GainTable {
    steps: Vec<i32>,
}

impl GainTable {
    /// # Errors
    /// `DabError::EmptyGainTable` when the device reports no gains.
    pub fn new(mut steps: Vec<i32>) -> Result<Self> {
        if steps.is_empty() {
            return Err(DabError::EmptyGainTable);
        }
        steps.sort_unstable();
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always `false`; construction rejects empty tables.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i32> {
        self.steps.get(index).copied()
    }

    /// Index of the highest gain.
    pub fn top(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn steps(&self) -> &[i32] {
        &self.steps
    }

    /// `percent * N / 100`, clamped to the last index so 100 % stays valid.
    pub fn index_for_percent(&self, percent: u8) -> usize {
        let percent = usize::from(percent.min(100));
        (percent * self.steps.len() / 100).min(self.top())
    }
}

pub(crate) struct GainControl {
    device: Arc<dyn SdrDevice>,
    table: GainTable,
    current: Mutex<usize>,
    software_agc: AtomicBool,
    hardware_agc: AtomicBool,
    events: broadcast::Sender<GainEvent>,
    seq: AtomicU64,
}

impl GainControl {
    pub fn new(
        device: Arc<dyn SdrDevice>,
        table: GainTable,
        initial_index: usize,
        events: broadcast::Sender<GainEvent>,
    ) -> Self {
        let initial_index = initial_index.min(table.top());
        Self {
            device,
            table,
            current: Mutex::new(initial_index),
            software_agc: AtomicBool::new(true),
            hardware_agc: AtomicBool::new(false),
            events,
            seq: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &GainTable {
        &self.table
    }

    pub fn current_index(&self) -> usize {
        *self.current.lock()
    }

    pub fn current_tenth_db(&self) -> i32 {
        let index = *self.current.lock();
        self.table.get(index).unwrap_or_default()
    }

    /// Select and apply a table entry.
    ///
    /// # Errors
    /// `DabError::GainIndexOutOfRange`; the previous gain is kept.
    pub fn set_index(&self, index: usize, reason: GainReason) -> Result<()> {
        if index >= self.table.len() {
            warn!(index, table_len = self.table.len(), "gain index out of range");
            return Err(DabError::GainIndexOutOfRange {
                index,
                table_len: self.table.len(),
            });
        }
        let mut current = self.current.lock();
        *current = index;
        self.apply(index, reason);
        Ok(())
    }

    /// Write the current gain to the device again.
    pub fn reapply(&self) {
        let current = self.current.lock();
        self.apply(*current, GainReason::AgcReapply);
    }

    /// One AGC decision against the latest block statistics.
    pub fn agc_step(&self, min: u8, max: u8) -> (AgcAction, usize) {
        let mut current = self.current.lock();
        let action = agc::decide(&self.table, *current, min, max);
        match action {
            AgcAction::StepDown => {
                *current -= 1;
                self.apply(*current, GainReason::AgcDown);
            }
            AgcAction::StepUp => {
                *current += 1;
                self.apply(*current, GainReason::AgcUp);
            }
            AgcAction::Hold => {}
        }
        (action, *current)
    }

    pub fn software_agc(&self) -> bool {
        self.software_agc.load(Ordering::SeqCst)
    }

    /// Switching software AGC off re-applies the current gain.
    pub fn set_software_agc(&self, enabled: bool) {
        self.software_agc.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.reapply();
        }
    }

    pub fn hardware_agc(&self) -> bool {
        self.hardware_agc.load(Ordering::SeqCst)
    }

    /// Toggle the RTL2832 digital AGC. The tuner stays in manual gain mode.
    pub fn set_hardware_agc(&self, enabled: bool) {
        self.hardware_agc.store(enabled, Ordering::SeqCst);
        if let Err(e) = self.device.set_agc_mode(enabled) {
            warn!(error = %e, enabled, "hardware AGC toggle failed");
        }
    }

    /// Caller holds the `current` lock.
    fn apply(&self, index: usize, reason: GainReason) {
        let Some(tenth_db) = self.table.get(index) else {
            return;
        };
        match self.device.set_tuner_gain(tenth_db) {
            Ok(()) => {
                debug!(index, tenth_db, ?reason, "tuner gain applied");
                let _ = self.events.send(GainEvent {
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    index,
                    tenth_db,
                    reason,
                });
            }
            Err(e) => warn!(error = %e, index, tenth_db, "setting tuner gain failed"),
        }
    }
}
