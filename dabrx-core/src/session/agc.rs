//! Software AGC.
//!
//! ```text
//! acquisition thread ──record(min, max)──► AmplitudeMonitor ◄──snapshot── AGC thread
//!                                                                            │
//!                                                     GainControl::agc_step ◄┘
//! ```
//!
//! The AGC thread wakes once per tick and acts only when at least one new
//! block arrived since its previous decision, so a stalled stream never
//! ramps the gain up on stale statistics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::acquisition::StreamDiagnostics;
use super::gain::{GainControl, GainTable};
use crate::ipc::events::OverloadEvent;

/// Min/max raw byte of the most recent block.
///
/// Each field is its own atomic; a reader may pair a fresh `min` with the
/// previous block's `max`, which the AGC tolerates.
#[derive(Debug)]
pub struct AmplitudeMonitor {
    min: AtomicU8,
    max: AtomicU8,
    generation: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmplitudeSnapshot {
    pub min: u8,
    pub max: u8,
    /// Number of blocks recorded so far.
    pub generation: u64,
}

impl AmplitudeSnapshot {
    /// The ADC hit either rail.
    pub fn is_overload(&self) -> bool {
        self.min == u8::MIN || self.max == u8::MAX
    }
}

impl Default for AmplitudeMonitor {
    fn default() -> Self {
        Self {
            min: AtomicU8::new(u8::MAX),
            max: AtomicU8::new(u8::MIN),
            generation: AtomicU64::new(0),
        }
    }
}

impl AmplitudeMonitor {
    pub fn record(&self, min: u8, max: u8) {
        self.min.store(min, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> AmplitudeSnapshot {
        let generation = self.generation.load(Ordering::Acquire);
        AmplitudeSnapshot {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            generation,
        }
    }
}

/// Single scan for the extremes of a block.
pub fn block_extremes(block: &[u8]) -> (u8, u8) {
    block
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &b| (lo.min(b), hi.max(b)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgcAction {
    Hold,
    StepUp,
    StepDown,
}

/// One-step, projection-gated gain decision.
///
/// Clipping steps down unless already at index 0. Otherwise the next
/// higher table entry is taken only if the block's extremes, scaled by the
/// linear ratio between the two entries, still fit in `0..=255`.
pub fn decide(table: &GainTable, index: usize, min: u8, max: u8) -> AgcAction {
    if min == u8::MIN || max == u8::MAX {
        return if index > 0 {
            AgcAction::StepDown
        } else {
            AgcAction::Hold
        };
    }

    let (Some(current), Some(next)) = (table.get(index), table.get(index + 1)) else {
        return AgcAction::Hold;
    };
    let delta_db = (next - current) as f32 / 10.0;
    let linear = 10f32.powf(delta_db / 20.0);
    let projected_max = (f32::from(max) * linear) as i32;
    let projected_min = (f32::from(min) / linear) as i32;

    if projected_min >= 0 && projected_max <= i32::from(u8::MAX) {
        AgcAction::StepUp
    } else {
        AgcAction::Hold
    }
}

pub(crate) struct AgcContext {
    pub gain: Arc<GainControl>,
    pub monitor: Arc<AmplitudeMonitor>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<StreamDiagnostics>,
    pub overload_tx: broadcast::Sender<OverloadEvent>,
    pub tick: Duration,
    /// Any message (or a dropped sender) ends the loop before the next tick.
    pub stop_rx: Receiver<()>,
}

/// AGC thread body. Returns within one tick of `running` falling.
pub(crate) fn run(ctx: AgcContext) {
    info!(tick_ms = ctx.tick.as_millis() as u64, "AGC loop started");
    let mut last_generation = ctx.monitor.snapshot().generation;

    loop {
        match ctx.stop_rx.recv_timeout(ctx.tick) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }

        let snapshot = ctx.monitor.snapshot();
        if snapshot.generation == last_generation {
            continue;
        }
        last_generation = snapshot.generation;
        tick(&ctx, snapshot);
    }

    info!("AGC loop stopped");
}

fn tick(ctx: &AgcContext, snapshot: AmplitudeSnapshot) {
    let overload = snapshot.is_overload();

    if ctx.gain.software_agc() {
        let (action, index) = ctx.gain.agc_step(snapshot.min, snapshot.max);
        match action {
            AgcAction::StepDown => {
                ctx.diagnostics.agc_steps_down.fetch_add(1, Ordering::Relaxed);
                debug!(index, min = snapshot.min, max = snapshot.max, "AGC step down");
            }
            AgcAction::StepUp => {
                ctx.diagnostics.agc_steps_up.fetch_add(1, Ordering::Relaxed);
                debug!(index, min = snapshot.min, max = snapshot.max, "AGC step up");
            }
            AgcAction::Hold => {}
        }
        if overload {
            let _ = ctx.overload_tx.send(OverloadEvent {
                min: snapshot.min,
                max: snapshot.max,
                gain_index: index,
                corrected: action == AgcAction::StepDown,
            });
        }
    } else if overload {
        ctx.diagnostics
            .overload_warnings
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            min = snapshot.min,
            max = snapshot.max,
            "ADC overload with software AGC off, gain may be too high"
        );
        let _ = ctx.overload_tx.send(OverloadEvent {
            min: snapshot.min,
            max: snapshot.max,
            gain_index: ctx.gain.current_index(),
            corrected: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::R820T_GAINS;

    fn table() -> GainTable {
        GainTable::new(R820T_GAINS.to_vec()).unwrap()
    }

    #[test]
    fn clipped_low_rail_steps_down() {
        assert_eq!(decide(&table(), 10, 0, 200), AgcAction::StepDown);
    }

    #[test]
    fn clipped_high_rail_steps_down() {
        assert_eq!(decide(&table(), 10, 30, 255), AgcAction::StepDown);
    }

    #[test]
    fn clipping_at_index_zero_holds() {
        assert_eq!(decide(&table(), 0, 0, 255), AgcAction::Hold);
    }

    #[test]
    fn headroom_steps_up() {
        // 254 → 280 tenths is +2.6 dB, ×1.35: 150 → 202.
        assert_eq!(decide(&table(), 14, 100, 150), AgcAction::StepUp);
    }

    #[test]
    fn projected_clip_holds() {
        // 200 × 1.35 = 270 > 255.
        assert_eq!(decide(&table(), 14, 60, 200), AgcAction::Hold);
    }

    #[test]
    fn top_of_table_holds() {
        let table = table();
        assert_eq!(decide(&table, table.top(), 120, 136), AgcAction::Hold);
    }

    #[test]
    fn extremes_scan() {
        assert_eq!(block_extremes(&[9, 3, 250, 17]), (3, 250));
        assert_eq!(block_extremes(&[]), (u8::MAX, u8::MIN));
    }

    #[test]
    fn monitor_generation_advances_per_block() {
        let monitor = AmplitudeMonitor::default();
        assert_eq!(monitor.snapshot().generation, 0);
        monitor.record(10, 240);
        monitor.record(12, 230);
        let snap = monitor.snapshot();
        assert_eq!((snap.min, snap.max, snap.generation), (12, 230, 2));
        assert!(!snap.is_overload());
    }
}
