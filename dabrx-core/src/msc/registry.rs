//! Ordered set of backends, each owning a CU range of the CIF.

use tracing::{debug, warn};

use super::backend::{Backend, BackendKind};
use super::cif::{CifAccumulator, CIF_CUS, CU_BITS};
use crate::error::{DabError, Result};
use crate::ipc::events::{DispatchEvent, DispatchFailure};

pub struct BackendEntry {
    pub start_addr: usize,
    pub length: usize,
    pub kind: BackendKind,
    backend: Box<dyn Backend>,
}

impl BackendEntry {
    pub fn new(
        kind: BackendKind,
        start_addr: usize,
        length: usize,
        backend: Box<dyn Backend>,
    ) -> Self {
        Self {
            start_addr,
            length,
            kind,
            backend,
        }
    }

    fn end(&self) -> usize {
        self.start_addr + self.length
    }
}

/// Not thread-safe by itself; `MscHandler` wraps it in the registry mutex.
#[derive(Default)]
pub(crate) struct BackendRegistry {
    entries: Vec<BackendEntry>,
    /// Transient copy region handed to `process`.
    scratch: Vec<i16>,
}

impl BackendRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// At least one entry owns a non-empty range.
    pub fn has_active(&self) -> bool {
        self.entries.iter().any(|e| e.length > 0)
    }

    /// `(start_addr, length, kind)` per entry, in registration order.
    pub fn ranges(&self) -> Vec<(usize, usize, BackendKind)> {
        self.entries
            .iter()
            .map(|e| (e.start_addr, e.length, e.kind))
            .collect()
    }

    /// Reject ranges outside the CIF or overlapping a registered range.
    /// Zero-length ranges overlap nothing.
    pub fn validate(&self, start_addr: usize, length: usize) -> Result<()> {
        let end = start_addr.saturating_add(length);
        if end > CIF_CUS {
            return Err(DabError::SubChannelOutOfRange {
                start: start_addr,
                end,
                cif_cus: CIF_CUS,
            });
        }
        if length == 0 {
            return Ok(());
        }
        if let Some(other) = self
            .entries
            .iter()
            .find(|e| e.length > 0 && start_addr < e.end() && e.start_addr < end)
        {
            return Err(DabError::SubChannelOverlap {
                start: start_addr,
                end,
                other_start: other.start_addr,
                other_end: other.end(),
            });
        }
        Ok(())
    }

    pub fn push(&mut self, entry: BackendEntry) {
        self.scratch.reserve(entry.length * CU_BITS);
        self.entries.push(entry);
    }

    /// Hand each non-empty range of the completed CIF to its backend, in
    /// order. A failing backend does not stop the ones after it.
    pub fn dispatch(&mut self, acc: &CifAccumulator, cif_count: u8) -> DispatchEvent {
        let mut delivered = 0;
        let mut failures = Vec::new();

        for entry in self.entries.iter_mut().filter(|e| e.length > 0) {
            self.scratch.clear();
            self.scratch
                .extend_from_slice(acc.cu_range(entry.start_addr, entry.length));

            delivered += 1;
            if let Err(e) = entry.backend.process(&self.scratch) {
                warn!(start_addr = entry.start_addr, error = %e, "backend failed on CIF");
                failures.push(DispatchFailure {
                    start_addr: entry.start_addr,
                    message: e.message,
                });
            }
        }

        debug!(cif_count, delivered, failed = failures.len(), "CIF dispatched");
        DispatchEvent {
            cif_count,
            delivered,
            failures,
        }
    }

    /// `stop_running` on every backend, then drop them all.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.entries.len();
        for entry in &mut self.entries {
            entry.backend.stop_running();
        }
        self.entries.clear();
        stopped
    }
}
