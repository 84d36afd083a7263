// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-VF sliding-window rate limiter for guest-attributable events.
//!
//! Each VF carries one window per [`GuardEventKind`]. An increment first
//! expires stale records, then either records a fresh timestamp or reports
//! overflow. Overflow is sticky until enough records age out of the window
//! or the guard is reset.

use crate::error::GvError;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::mutex::SpinMutex;

/// Guarded event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardEventKind {
    /// Function-level resets.
    Flr,
    /// Exclusive-mode entry requests.
    ExclusiveMod,
    /// Exclusive-mode timeouts.
    ExclusiveTimeout,
    /// All mailbox interrupts.
    AllInt,
    /// RAS error-count telemetry requests.
    RasErrCount,
    /// RAS CPER dump requests.
    RasCperDump,
}

/// Number of guard event classes.
pub const GUARD_EVENT_KIND_NUM: usize = 6;

const GUARD_EVENT_KINDS: [GuardEventKind; GUARD_EVENT_KIND_NUM] = [
    GuardEventKind::Flr,
    GuardEventKind::ExclusiveMod,
    GuardEventKind::ExclusiveTimeout,
    GuardEventKind::AllInt,
    GuardEventKind::RasErrCount,
    GuardEventKind::RasCperDump,
];

impl GuardEventKind {
    /// Default sliding-window width in microseconds.
    pub fn default_interval_us(self) -> u64 {
        match self {
            Self::ExclusiveTimeout => 500 * 1000 * 1000,
            _ => 60 * 1000 * 1000,
        }
    }

    /// Default occurrence threshold.
    pub fn default_threshold(self) -> u32 {
        match self {
            Self::Flr => 3,
            Self::ExclusiveMod => 9,
            Self::ExclusiveTimeout => 2,
            Self::AllInt => 56,
            Self::RasErrCount | Self::RasCperDump => 15,
        }
    }

    /// Largest threshold `set_config` accepts; also sizes the record ring.
    pub fn max_threshold(self) -> u32 {
        match self {
            Self::Flr => 8,
            Self::ExclusiveMod => 16,
            Self::ExclusiveTimeout => 4,
            Self::AllInt => 64,
            Self::RasErrCount | Self::RasCperDump => 32,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Flr => 0,
            Self::ExclusiveMod => 1,
            Self::ExclusiveTimeout => 2,
            Self::AllInt => 3,
            Self::RasErrCount => 4,
            Self::RasCperDump => 5,
        }
    }
}

/// Fill state of one guard window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardEventState {
    /// Below threshold.
    Normal,
    /// Exactly at threshold; the next increment overflows.
    Full,
    /// An increment was rejected; sticky until records expire.
    Overflow,
}

struct GuardWindow {
    interval_us: u64,
    threshold: u32,
    active: u32,
    origin_idx: u32,
    amount: u32,
    state: GuardEventState,
    records: Vec<u64>,
}

impl GuardWindow {
    fn new(kind: GuardEventKind) -> Self {
        Self {
            interval_us: kind.default_interval_us(),
            threshold: kind.default_threshold(),
            active: 0,
            origin_idx: 0,
            amount: 0,
            state: GuardEventState::Normal,
            records: vec![0; kind.max_threshold() as usize],
        }
    }

    /// Advances `origin_idx` past every record older than the window.
    fn expire(&mut self, now: u64) {
        while self.active > 0 {
            let oldest = self.records[self.origin_idx as usize];
            if now.saturating_sub(oldest) < self.interval_us {
                break;
            }
            self.active -= 1;
            self.state = GuardEventState::Normal;
            self.origin_idx = (self.origin_idx + 1) % self.threshold;
        }
    }

    fn add(&mut self, now: u64) -> Result<GuardEventState, GvError> {
        if self.active >= self.threshold {
            self.state = GuardEventState::Overflow;
            return Err(GvError::GuestAbuse);
        }

        let idx = (self.origin_idx + self.active) % self.threshold;
        self.records[idx as usize] = now;
        self.active += 1;
        self.amount += 1;

        if self.active == self.threshold {
            self.state = GuardEventState::Full;
        }
        Ok(self.state)
    }
}

/// Snapshot of one guard window, returned by [`VfGuard::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardEventInfo {
    /// Current fill state.
    pub state: GuardEventState,
    /// Window width in microseconds.
    pub interval_us: u64,
    /// Occurrence threshold.
    pub threshold: u32,
    /// Records currently inside the window.
    pub active: u32,
    /// Lifetime count.
    pub amount: u32,
}

/// Configuration for one guard window, accepted by [`VfGuard::set_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardEventConfig {
    /// Window width in microseconds.
    pub interval_us: u64,
    /// Occurrence threshold; must not exceed the kind's max.
    pub threshold: u32,
}

/// The abuse guard of one VF.
pub struct VfGuard {
    enabled: AtomicBool,
    ov_event: AtomicU32,
    events: [SpinMutex<GuardWindow>; GUARD_EVENT_KIND_NUM],
}

impl VfGuard {
    /// Creates a guard with default windows; `enabled` reflects the
    /// adapter's `SENSITIVE_EVENT_GUARD` flag.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ov_event: AtomicU32::new(0),
            events: GUARD_EVENT_KINDS.map(|kind| SpinMutex::new(GuardWindow::new(kind))),
        }
    }

    /// Enables or disables the guard. Disabled guards admit everything.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the guard is currently enforcing.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Lifetime count of rejected increments.
    pub fn overflow_count(&self) -> u32 {
        self.ov_event.load(Ordering::Relaxed)
    }

    /// Current state of `kind`'s window, without mutating it. Disabled
    /// guards always read `Normal`.
    pub fn event_state(&self, kind: GuardEventKind) -> GuardEventState {
        if !self.enabled() {
            return GuardEventState::Normal;
        }
        self.events[kind.index()].lock().state
    }

    /// Records one occurrence of `kind` at time `now`.
    ///
    /// Expires stale records across all windows first, then applies the
    /// insertion rule. Returns [`GvError::GuestAbuse`] on overflow; a
    /// disabled guard fails with [`GvError::Failure`] so callers treating
    /// the guard as mandatory can tell the difference.
    pub fn add_event(&self, kind: GuardEventKind, now: u64) -> Result<GuardEventState, GvError> {
        if !self.enabled() {
            return Err(GvError::Failure);
        }

        for event in &self.events {
            event.lock().expire(now);
        }

        let ret = self.events[kind.index()].lock().add(now);
        if ret.is_err() {
            self.ov_event.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    /// Forgives one occurrence of `kind`, used when the host decides a
    /// guest follow-up request was legitimate.
    pub fn dec_event(&self, kind: GuardEventKind) {
        if !self.enabled() {
            return;
        }
        let mut event = self.events[kind.index()].lock();
        if event.state == GuardEventState::Normal && event.active > 0 {
            event.active -= 1;
        }
    }

    /// Clears all windows back to empty `Normal` state.
    pub fn reset(&self) {
        for event in &self.events {
            let mut event = event.lock();
            event.active = 0;
            event.origin_idx = 0;
            event.amount = 0;
            event.records.fill(0);
            event.state = GuardEventState::Normal;
        }
        self.ov_event.store(0, Ordering::Relaxed);
    }

    /// Snapshot of `kind`'s window after expiring stale records.
    pub fn info(&self, kind: GuardEventKind, now: u64) -> GuardEventInfo {
        let mut event = self.events[kind.index()].lock();
        event.expire(now);
        GuardEventInfo {
            state: event.state,
            interval_us: event.interval_us,
            threshold: event.threshold,
            active: event.active,
            amount: event.amount,
        }
    }

    /// Reconfigures `kind`'s window. Thresholds above the kind's maximum
    /// are rejected.
    pub fn set_config(&self, kind: GuardEventKind, config: GuardEventConfig) -> Result<(), GvError> {
        if config.threshold > kind.max_threshold() || config.threshold == 0 {
            return Err(GvError::InvalidParam);
        }
        let mut event = self.events[kind.index()].lock();
        event.interval_us = config.interval_us;
        event.threshold = config.threshold;
        event.active = 0;
        event.origin_idx = 0;
        event.state = GuardEventState::Normal;
        Ok(())
    }
}
