// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-VF lifecycle state, configuration and time accounting.

use crate::error::GvError;
use crate::guard::VfGuard;
use crate::sched::event::SCHED_BLOCK_NUM;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use log::error;
use spin::mutex::SpinMutex;

/// Index of a function slot. Values `0..num_vf` address VFs, [`PF_IDX`]
/// addresses the PF-as-VF slot.
pub type VfIdx = usize;

/// Number of function slots per adapter.
pub const MAX_VF_SLOT: usize = 32;

/// The slot representing the PF when it participates in scheduling.
pub const PF_IDX: VfIdx = MAX_VF_SLOT - 1;

/// Sentinel accepted at the API edge for "no VF"; never a valid slot.
pub const INVALID_VF: VfIdx = usize::MAX;

/// Returns true if `idx_vf` does not address a real slot.
pub fn is_idx_invalid(idx_vf: VfIdx) -> bool {
    idx_vf >= MAX_VF_SLOT
}

/// Lifecycle state of a function slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VfState {
    /// Slot is not configured.
    Unavail = 0,
    /// Configured but not scheduled.
    Avail = 1,
    /// Participating in world switching.
    Active = 2,
    /// Temporarily removed from the rotation.
    Suspended = 3,
    /// Holder of an exclusive-access window.
    FullAccess = 4,
}

impl VfState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Avail,
            2 => Self::Active,
            3 => Self::Suspended,
            4 => Self::FullAccess,
            _ => Self::Unavail,
        }
    }

    /// Whether `self -> to` is a legal lifecycle edge.
    ///
    /// Legal edges: UNAVAIL->AVAIL; AVAIL->{ACTIVE, SUSPENDED,
    /// FULL_ACCESS}; ACTIVE<->SUSPENDED; {ACTIVE, SUSPENDED,
    /// FULL_ACCESS}->AVAIL; any->UNAVAIL; self-loops.
    fn can_transition_to(self, to: VfState) -> bool {
        use VfState::*;
        if self == to || to == Unavail {
            return true;
        }
        matches!(
            (self, to),
            (Unavail, Avail)
                | (Avail, Active)
                | (Avail, Suspended)
                | (Avail, FullAccess)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Active, Avail)
                | (Suspended, Avail)
                | (FullAccess, Avail)
        )
    }
}

/// Lock-free cell holding a [`VfState`], readable from producers at queue
/// time while the worker owns the rest of the slot.
pub struct VfStateCell(AtomicU8);

impl VfStateCell {
    /// New cell in `Unavail`.
    pub fn new() -> Self {
        Self(AtomicU8::new(VfState::Unavail as u8))
    }

    /// Current state.
    pub fn get(&self) -> VfState {
        VfState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts the transition to `to`, enforcing the lifecycle edges.
    pub fn set(&self, to: VfState) -> Result<(), GvError> {
        let from = self.get();
        if !from.can_transition_to(to) {
            error!("illegal VF state transition {from:?} -> {to:?}");
            return Err(GvError::InvalidParam);
        }
        self.0.store(to as u8, Ordering::Release);
        Ok(())
    }
}

impl Default for VfStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-engine framebuffer and scheduling configuration of one VF.
#[derive(Debug, Clone, Default)]
pub struct VfConfig {
    /// FB window start, MB from PF FB base.
    pub fb_offset_mb: u32,
    /// FB window size in MB as seen by the guest.
    pub fb_size_mb: u32,
    /// FB actually backed, MB (differs when TMR carving is active).
    pub real_fb_size_mb: u32,
    /// TMR override of the visible size, if a trusted region is carved.
    pub fb_size_tmr_mb: Option<u32>,
    /// Per-engine time slice in microseconds.
    pub time_slice_us: [u32; SCHED_BLOCK_NUM],
    /// Multimedia bandwidth admission per engine, in MB/s.
    pub mm_bandwidth: [u32; SCHED_BLOCK_NUM],
    /// Slot has been configured via `allocate_vf`/`set_vf`.
    pub configured: bool,
}

/// Timestamps and counters the host keeps per VF.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeLog {
    /// Total time the VF has been active, in microseconds.
    pub cumulative_running_us: u64,
    /// Timestamp at which the VF last became active.
    pub active_since_us: u64,
    /// Last guest init window, start and end.
    pub init_start_us: u64,
    /// End of the last guest init window.
    pub init_end_us: u64,
    /// Start of the last guest fini window.
    pub fini_start_us: u64,
    /// End of the last guest fini window.
    pub fini_end_us: u64,
    /// Start of the last reset affecting this VF.
    pub reset_start_us: u64,
    /// End of the last reset affecting this VF.
    pub reset_end_us: u64,
    /// Number of resets this VF has seen.
    pub reset_count: u32,
}

impl TimeLog {
    /// Folds the running interval ending at `now` into the cumulative
    /// counter.
    pub fn accumulate_running(&mut self, now: u64) {
        if self.active_since_us != 0 {
            self.cumulative_running_us += now.saturating_sub(self.active_since_us);
            self.active_since_us = 0;
        }
    }
}

/// One function slot.
pub struct VfSlot {
    /// Lifecycle state.
    pub state: VfStateCell,
    /// Abuse guard.
    pub guard: VfGuard,
    /// FB and scheduling configuration.
    pub config: SpinMutex<VfConfig>,
    /// Time accounting.
    pub time_log: SpinMutex<TimeLog>,
    /// Guest acknowledged a pending FLR notification.
    pub ready_to_reset: AtomicBool,
    /// `REQ_GPU_INIT_DATA` completed and no other event intervened.
    pub gpu_init_data_ready: AtomicBool,
    /// FB contents were lost in the last whole-GPU reset.
    pub vram_lost: AtomicBool,
    /// A crash handler owns this VF's shutdown.
    pub unshutdown: AtomicBool,
    /// Skip the RUN step when switching to this VF (orphan handling).
    pub skip_run: AtomicBool,
}

impl VfSlot {
    /// New unconfigured slot; the guard follows the adapter's
    /// `SENSITIVE_EVENT_GUARD` flag.
    pub fn new(guard_enabled: bool) -> Self {
        Self {
            state: VfStateCell::new(),
            guard: VfGuard::new(guard_enabled),
            config: SpinMutex::new(VfConfig::default()),
            time_log: SpinMutex::new(TimeLog::default()),
            ready_to_reset: AtomicBool::new(false),
            gpu_init_data_ready: AtomicBool::new(false),
            vram_lost: AtomicBool::new(false),
            unshutdown: AtomicBool::new(false),
            skip_run: AtomicBool::new(false),
        }
    }

    /// Whether the slot is in the given state.
    pub fn is(&self, state: VfState) -> bool {
        self.state.get() == state
    }
}
