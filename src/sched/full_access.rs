// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The full-access (exclusive mode) controller.
//!
//! One VF at a time owns the GPU for init, teardown or a guest-initiated
//! reset; world switching is paused for the duration. The wall-clock
//! deadline on the window is the only timeout that drives state-machine
//! progression without an external interrupt: if the holder does not
//! release in time it is forcibly reset and demoted to `Avail`.

use crate::adapter::Adapter;
use crate::asic::VfAccess;
use crate::config::AdapterFlags;
use crate::error::GvError;
use crate::sched::event::{EventId, EventPayload, SchedBlock, SchedEvent, SchedMode};
use crate::sched::{HandlerCtl, LiveUpdateState, SchedState};
use crate::vf::{INVALID_VF, MAX_VF_SLOT, PF_IDX, VfIdx, VfState};
use core::sync::atomic::Ordering;
use log::{debug, info, warn};

/// Deadline check result for the worker's wait computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FullAccessStatus {
    /// No VF holds full access; wait without timeout.
    NotEntered,
    /// A window is open; wait at most the remaining time.
    OnGoing,
    /// At least one window expired and was forcibly closed.
    TimedOut,
}

/// Per-VF bookkeeping for per-partition mode.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PerVfFullAccess {
    pub in_full_access: bool,
    pub start_time_us: u64,
    pub used_time_us: u64,
    pub event_id: Option<EventId>,
}

/// Exclusive-mode bookkeeping.
pub(crate) struct FullAccessState {
    pub per_partition: bool,
    pub in_full_access: bool,
    pub idx_vf: VfIdx,
    pub event_id: Option<EventId>,
    pub start_time_us: u64,
    pub used_time_us: u64,
    pub allow_time_us: u64,
    /// Set across live-update suspension; the wall clock is recomputed on
    /// resume before checks re-enable.
    pub skip_timeout_check: bool,
    /// World switches locked by a per-partition holder.
    pub logical_sched_fa_mask: u64,
    pub per_vf: [PerVfFullAccess; MAX_VF_SLOT],
}

impl FullAccessState {
    pub(crate) fn new(allow_time_us: u64, per_partition: bool) -> Self {
        Self {
            per_partition,
            in_full_access: false,
            idx_vf: INVALID_VF,
            event_id: None,
            start_time_us: 0,
            used_time_us: 0,
            allow_time_us,
            skip_timeout_check: false,
            logical_sched_fa_mask: 0,
            per_vf: [PerVfFullAccess::default(); MAX_VF_SLOT],
        }
    }

    /// Whether any VF holds full access.
    pub(crate) fn any_full_access(&self) -> bool {
        if self.per_partition {
            self.per_vf.iter().any(|vf| vf.in_full_access)
        } else {
            self.in_full_access
        }
    }

    /// Whether `idx_vf` is the holder.
    pub(crate) fn is_full_access_vf(&self, idx_vf: VfIdx) -> bool {
        if self.per_partition {
            idx_vf < MAX_VF_SLOT && self.per_vf[idx_vf].in_full_access
        } else {
            self.in_full_access && self.idx_vf == idx_vf
        }
    }
}

impl Adapter {
    /// Whether an event for `idx_vf` must take the full-access dispatch
    /// path: some VF sharing an engine with it holds exclusive access.
    pub(crate) fn shares_engine_with_full_access(
        &self,
        state: &SchedState,
        idx_vf: VfIdx,
    ) -> bool {
        if !state.fa.per_partition {
            return state.fa.any_full_access();
        }
        if idx_vf >= MAX_VF_SLOT {
            return state.fa.any_full_access();
        }
        state.fa.logical_sched_fa_mask & self.ws_mask_for_vf(idx_vf) != 0
    }

    /// Whether `event` releases the window that is currently open.
    fn is_event_pair(&self, state: &SchedState, event: &SchedEvent) -> bool {
        let held = if state.fa.per_partition {
            state.fa.per_vf[event.idx_vf].event_id
        } else {
            state.fa.event_id
        };
        match held {
            Some(EventId::ReqGpuInit) | Some(EventId::ReqGpuReset) => {
                event.id == EventId::RelGpuInit
            }
            Some(EventId::ReqGpuFini) => event.id == EventId::RelGpuFini,
            _ => false,
        }
    }

    /// PSP mailbox interrupt toggle, hive-reference-counted when the
    /// adapter is part of an XGMI hive.
    fn sched_psp_set_mb_int(&self, idx_vf: VfIdx, enable: bool) -> Result<(), GvError> {
        if self.xgmi_node_count() > 1 {
            self.hive_set_psp_mb_int(idx_vf, enable)
        } else {
            self.asic.set_psp_mb_int(idx_vf, enable)
        }
    }

    /// A VF that died without its shutdown handshake leaves a stale PSP
    /// ring and possibly a live context. Destroy the ring and, if the VF
    /// is still rotating, pull it out and reset it.
    pub(crate) fn handle_orphan_vf(&self, state: &mut SchedState, idx_vf: VfIdx) -> Result<(), GvError> {
        if self.asic.psp_ring_destroy().is_err() {
            warn!("psp ring destroy failed");
        }

        if !self.array_vf[idx_vf].is(VfState::Active) {
            return Ok(());
        }

        self.sched_remove_vf(state, idx_vf);

        self.array_vf[idx_vf].skip_run.store(true, Ordering::Release);
        if self
            .context_switch_to_vf(state, idx_vf, SchedBlock::All)
            .is_err()
        {
            warn!("switch to fcn {idx_vf} failed");
        }
        self.array_vf[idx_vf].skip_run.store(false, Ordering::Release);

        let _ = self.array_vf[idx_vf].state.set(VfState::Avail);
        self.sched_reset_vf(state, idx_vf, SchedBlock::All)
    }

    fn handle_req_gpu_init(&self, state: &mut SchedState, idx_vf: VfIdx) -> Result<(), GvError> {
        let now = self.now();
        self.array_vf[idx_vf].time_log.lock().init_start_us = now;

        self.context_init(state, idx_vf, SchedBlock::All)?;

        if !self.array_vf[idx_vf]
            .gpu_init_data_ready
            .load(Ordering::Acquire)
        {
            self.stage_init_data(idx_vf);
        }
        self.array_vf[idx_vf]
            .gpu_init_data_ready
            .store(false, Ordering::Release);
        Ok(())
    }

    fn handle_req_gpu_reset(&self, state: &mut SchedState, idx_vf: VfIdx) -> Result<(), GvError> {
        {
            let now = self.now();
            let mut log = self.array_vf[idx_vf].time_log.lock();
            log.accumulate_running(now);
            log.init_start_us = now;
        }

        self.context_init(state, idx_vf, SchedBlock::All)?;

        if idx_vf != PF_IDX {
            self.stage_init_data(idx_vf);
        }
        Ok(())
    }

    fn handle_req_gpu_fini(&self, state: &mut SchedState, idx_vf: VfIdx) -> Result<(), GvError> {
        // A VF already back in `Avail` is mid-reset; notify anyway so the
        // guest does not hang waiting, but grant nothing.
        if self.array_vf[idx_vf].is(VfState::Avail) {
            self.notify_vf_full_access(idx_vf);
            warn!("attempt to request fini for inactive fcn {idx_vf}, skip");
            return Err(GvError::InvalidParam);
        }

        if self.array_vf[idx_vf].is(VfState::Active) {
            self.sched_remove_vf(state, idx_vf);
            let _ = self.array_vf[idx_vf].state.set(VfState::Avail);
        }
        self.array_vf[idx_vf].time_log.lock().fini_start_us = self.now();

        self.context_load(state, idx_vf, SchedBlock::All)
    }

    fn handle_rel_gpu_init(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        skip_save: bool,
    ) -> Result<(), GvError> {
        self.array_vf[idx_vf].time_log.lock().init_end_us = self.now();

        if !skip_save {
            self.context_save(state, idx_vf, SchedBlock::All)?;
        }
        Ok(())
    }

    fn handle_rel_gpu_fini(&self, state: &mut SchedState, idx_vf: VfIdx) -> Result<(), GvError> {
        self.context_save(state, idx_vf, SchedBlock::All)?;

        if !state.lock_world_switch {
            self.sched_shutdown_vf(state, idx_vf)?;
        }

        self.asic.psp_clear_vf_fw(idx_vf);

        let now = self.now();
        let mut log = self.array_vf[idx_vf].time_log.lock();
        log.fini_end_us = now;
        log.accumulate_running(now);
        drop(log);

        Ok(())
    }

    /// Grants `event.idx_vf` exclusive access and runs the event body.
    pub(crate) fn enter_full_access(
        &self,
        state: &mut SchedState,
        event: &SchedEvent,
    ) -> Result<(), GvError> {
        let idx_vf = event.idx_vf;
        info!("start processing full access");

        self.sched_toggle_skip_next_punish(state, idx_vf, true);
        self.sched_stop(state, idx_vf);

        // A PF soft reset needs another reset pass before the window.
        if event.id == EventId::ReqGpuReset && idx_vf == PF_IDX {
            if self
                .context_switch_to_vf(state, PF_IDX, SchedBlock::All)
                .is_ok()
            {
                let _ = self.sched_reset_vf(state, PF_IDX, SchedBlock::All);
            }
        }

        if !self.sched_is_state_ok(state, idx_vf) {
            let abnormal = state.ws.abnormal_world_switch();
            if let Some(ws_id) = abnormal {
                let ws = &state.ws.world_switches[ws_id];
                warn!(
                    "fcn {} hung while stopping world switch on {:?}",
                    ws.curr_idx_vf, ws.sched_block
                );
            }

            // A VF whose own hang blocks its FINI gets rejected, but is
            // notified anyway so the guest does not wait forever.
            let own_fault = abnormal
                .map(|ws_id| state.ws.world_switches[ws_id].curr_idx_vf == idx_vf)
                .unwrap_or(false);
            if event.id == EventId::ReqGpuFini && own_fault {
                let _ = self.sched_reset_vf_auto(state);
                self.notify_vf_full_access(idx_vf);
                return Err(GvError::VfHang);
            }
            let _ = self.sched_reset_vf_auto(state);
        }

        if matches!(event.id, EventId::ReqGpuInit | EventId::ReqGpuReset)
            && self.handle_orphan_vf(state, idx_vf).is_err()
        {
            warn!("failed to reset orphan fcn {idx_vf}");
            let _ = self.sched_reset_vf_auto(state);
            return Err(GvError::ResetFailed);
        }

        // Orphan handling may have burned the FLR budget.
        if self.array_vf[idx_vf]
            .guard
            .event_state(crate::guard::GuardEventKind::Flr)
            == crate::guard::GuardEventState::Overflow
        {
            return Err(GvError::GuestAbuse);
        }

        if self.sched_psp_set_mb_int(idx_vf, true).is_err() {
            warn!("failed to enable PSP mailbox interrupts for fcn {idx_vf}");
        }
        let _ = self.asic.set_vf_access(idx_vf, VfAccess::ALL, true);
        self.asic.rlc_safe_mode(true);

        let ret = match event.id {
            EventId::ReqGpuInit => {
                let mut ret = self.set_mmsch_vfgate(idx_vf, true);
                if ret.is_ok() && self.asic.mmsch_config_vf(idx_vf).is_err() {
                    warn!("failed to config mmsch features, performance may be impacted");
                }
                if ret.is_ok() && self.flags().contains(AdapterFlags::USE_PF) {
                    ret = self.asic.load_dfc_fw();
                }
                ret.and_then(|()| self.handle_req_gpu_init(state, idx_vf))
            }
            EventId::ReqGpuReset => {
                let ret = self.set_mmsch_vfgate(idx_vf, true);
                if ret.is_ok() {
                    if self.flags().contains(AdapterFlags::VF_FB_PROTECTION) {
                        let _ = self.asic.set_vf_access(idx_vf, VfAccess::FB, true);
                    }
                    if idx_vf != PF_IDX && self.asic.mmsch_config_vf(idx_vf).is_err() {
                        warn!("failed to config mmsch features, performance may be impacted");
                    }
                }
                ret.and_then(|()| self.handle_req_gpu_reset(state, idx_vf))
            }
            EventId::ReqGpuFini => self.handle_req_gpu_fini(state, idx_vf),
            _ => Err(GvError::InvalidParam),
        };

        if ret.is_err() || !self.sched_is_state_ok(state, idx_vf) {
            self.asic.rlc_safe_mode(false);
            let _ = self
                .asic
                .set_vf_access(idx_vf, VfAccess::DOORBELL | VfAccess::MMIO_REG_WRITE, false);
            let _ = self.set_mmsch_vfgate(idx_vf, false);
            warn!("fcn {idx_vf} hung while processing {:?}", event.id);

            // A pending fatal-error reset supersedes the local recovery.
            if self.event_pending(state, PF_IDX, EventId::SchedRasFed) {
                info!("RAS FED pending, aborting reset routine and queueing REQ_GPU_RESET");
                let _ = self.queue_event(idx_vf, EventId::ReqGpuReset, SchedBlock::All);
                return Err(GvError::VfHang);
            }

            let reset = self.sched_reset_vf_auto(state);
            if reset.is_ok() && self.sched_psp_set_mb_int(idx_vf, false).is_err() {
                warn!("failed to disable PSP mailbox interrupts for fcn {idx_vf}");
            }
            return Err(GvError::VfHang);
        }

        // The window opens now.
        if self.array_vf[idx_vf].is(VfState::Active) {
            self.sched_remove_vf(state, idx_vf);
            let _ = self.array_vf[idx_vf].state.set(VfState::Avail);
        }
        let _ = self.array_vf[idx_vf].state.set(VfState::FullAccess);

        let now = self.now();
        if state.fa.per_partition {
            state.fa.logical_sched_fa_mask |= self.ws_mask_for_vf(idx_vf);
            let vf = &mut state.fa.per_vf[idx_vf];
            vf.in_full_access = true;
            vf.start_time_us = now;
            vf.event_id = Some(event.id);
        } else {
            state.fa.in_full_access = true;
            state.fa.idx_vf = idx_vf;
            state.fa.start_time_us = now;
            state.fa.event_id = Some(event.id);
        }

        self.asic.toggle_rlcg_interface(idx_vf, true);
        self.notify_vf_full_access(idx_vf);
        info!("fcn {idx_vf} entered full access mode");
        Ok(())
    }

    fn release_full_access(&self, state: &mut SchedState, idx_vf: VfIdx) {
        if state.fa.per_partition {
            state.fa.logical_sched_fa_mask &= !self.ws_mask_for_vf(idx_vf);
            let vf = &mut state.fa.per_vf[idx_vf];
            vf.in_full_access = false;
            vf.start_time_us = 0;
            vf.event_id = None;
        } else {
            state.fa.in_full_access = false;
            state.fa.idx_vf = INVALID_VF;
            state.fa.start_time_us = 0;
            state.fa.event_id = None;
        }
        let _ = self.array_vf[idx_vf].state.set(VfState::Avail);
    }

    fn set_mmsch_vfgate(&self, idx_vf: VfIdx, enable: bool) -> Result<(), GvError> {
        let mut ret = Ok(());
        for (hw_id, desc) in self.asic.hw_scheds().iter().enumerate() {
            if desc.sched_block.is_multimedia()
                && self.asic.set_mmsch_vfgate(idx_vf, hw_id, enable).is_err()
            {
                warn!(
                    "failed to {} mmsch gate for fcn {idx_vf}",
                    if enable { "enable" } else { "disable" }
                );
                ret = Err(GvError::Failure);
            }
        }
        ret
    }

    /// Ordinary full-access exit on `REL_GPU_INIT` / `REL_GPU_FINI`.
    pub(crate) fn exit_full_access(&self, state: &mut SchedState, event: &SchedEvent) {
        let idx_vf = event.idx_vf;
        let one_vf = state.ws.active_vf_num() == 0 || self.num_vf() == 1;
        let mut vf_init = false;

        self.asic.rlc_safe_mode(false);

        let mut ret = Ok(());
        match event.id {
            EventId::RelGpuInit => {
                ret = self.handle_rel_gpu_init(state, idx_vf, one_vf);
                vf_init = true;

                // The guest is only believed initialised if its CP
                // scheduler actually came up; otherwise force a shutdown
                // so the context save is complete.
                if ret.is_ok() && !self.asic.cp_sched_running(idx_vf) {
                    warn!("CP scheduler of fcn {idx_vf} is not initialised");
                    vf_init = false;

                    if one_vf {
                        ret = self.context_save(state, idx_vf, SchedBlock::Gfx);
                    }
                    if ret.is_ok() {
                        ret = self.sched_shutdown_vf(state, idx_vf);
                        if ret.is_err() {
                            self.put_error(idx_vf, GvError::VfHang, idx_vf as u64);
                        }
                    }
                }

                let _ = self.set_mmsch_vfgate(idx_vf, false);
            }
            EventId::RelGpuFini => {
                let _ = self.asic.set_vf_access(idx_vf, VfAccess::DOORBELL, false);
                if self.flags().contains(AdapterFlags::VF_FB_PROTECTION) {
                    let _ = self.asic.set_vf_access(idx_vf, VfAccess::FB, false);
                }

                ret = self.handle_rel_gpu_fini(state, idx_vf);

                if self.flags().contains(AdapterFlags::FB_CLEAN_ON_SHUTDOWN)
                    && self.asic.clear_vf_fb(idx_vf, 0x00).is_err()
                {
                    warn!("clear vf fb failed");
                }
            }
            _ => {}
        }

        self.asic.toggle_rlcg_interface(idx_vf, false);
        let _ = self
            .asic
            .set_vf_access(idx_vf, VfAccess::MMIO_REG_WRITE, false);

        if ret.is_err() || !self.sched_is_state_ok(state, idx_vf) {
            warn!("hang detected, trying to reset vf");
            vf_init = false;
            if self.sched_reset_vf_auto(state).is_err() {
                self.release_full_access(state, idx_vf);
                info!("fcn {idx_vf} exited full access");
                return;
            }
        }

        let mb_status = self.asic.psp_mb_status(idx_vf);
        if mb_status.status != 0 {
            self.put_error(
                idx_vf,
                GvError::FirmwareTimeout,
                (u64::from(mb_status.status) << 32) | u64::from(mb_status.fw_id),
            );
        }

        if self.sched_psp_set_mb_int(idx_vf, false).is_err() {
            warn!("failed to disable PSP mailbox interrupts for fcn {idx_vf}");
        }

        self.release_full_access(state, idx_vf);

        if vf_init && self.sched_add_vf(state, idx_vf).is_err() {
            let _ = self.queue_event(idx_vf, EventId::SchedResetVf, SchedBlock::All);
            info!("fcn {idx_vf} exited full access");
            return;
        }

        if !one_vf
            && !state.lock_world_switch
            && self.sched_one_time_loop(state, idx_vf).is_err()
        {
            warn!("one time loop failed");
        }

        self.sched_toggle_skip_next_punish(state, idx_vf, true);

        for (hw_id, desc) in self.asic.hw_scheds().iter().enumerate() {
            if desc.mode == SchedMode::HybridLiquid {
                self.asic.ctx_empty_intr_control(hw_id, true);
            }
        }

        info!("fcn {idx_vf} exited full access");
    }

    /// Forced exit: the holder blew its deadline (or was removed, or sent
    /// a mismatched release).
    pub(crate) fn exit_full_access_timeout(&self, state: &mut SchedState, vf_idx: VfIdx) {
        let (idx_vf, event_id) = if state.fa.per_partition {
            (vf_idx, state.fa.per_vf[vf_idx].event_id)
        } else {
            (state.fa.idx_vf, state.fa.event_id)
        };
        if idx_vf >= MAX_VF_SLOT {
            return;
        }

        info!("fcn {idx_vf} full access timed out");

        let _ = self.array_vf[idx_vf].state.set(VfState::Avail);
        self.asic.rlc_safe_mode(false);
        let _ = self
            .asic
            .set_vf_access(idx_vf, VfAccess::DOORBELL | VfAccess::MMIO_REG_WRITE, false);

        let start = if state.fa.per_partition {
            state.fa.per_vf[idx_vf].start_time_us
        } else {
            state.fa.start_time_us
        };
        self.put_error_ext(idx_vf, GvError::FullAccessTimeout, start, self.now());

        if self.array_vf[idx_vf]
            .guard
            .add_event(crate::guard::GuardEventKind::ExclusiveTimeout, self.now())
            == Err(GvError::GuestAbuse)
        {
            warn!("exclusive timeout guard overflow for fcn {idx_vf}");
        }

        let mut ret = Ok(());
        if matches!(
            event_id,
            Some(EventId::ReqGpuInit) | Some(EventId::ReqGpuReset)
        ) {
            ret = self.set_mmsch_vfgate(idx_vf, false);
        }

        if ret.is_ok() {
            // Try an orderly save, then the FLR; escalation happens inside
            // sched_reset_vf on failure.
            if !self.flags().contains(AdapterFlags::DISABLE_MMIO_PROTECTION) {
                let _ = self.context_save(state, idx_vf, SchedBlock::All);
            }
            ret = self.sched_reset_vf(state, idx_vf, SchedBlock::All);
        }

        if ret.is_ok() {
            let mb_status = self.asic.psp_mb_status(idx_vf);
            if mb_status.status != 0 {
                self.put_error(
                    idx_vf,
                    GvError::FirmwareTimeout,
                    (u64::from(mb_status.status) << 32) | u64::from(mb_status.fw_id),
                );
            }
            if self.sched_one_time_loop(state, idx_vf).is_err() {
                warn!("one time loop failed");
                ret = Err(GvError::Failure);
            }
        }

        if self.sched_psp_set_mb_int(idx_vf, false).is_err() {
            warn!("failed to disable PSP mailbox interrupts for fcn {idx_vf}");
        }
        self.asic.toggle_rlcg_interface(idx_vf, false);

        self.release_full_access(state, idx_vf);
        self.array_vf[idx_vf]
            .gpu_init_data_ready
            .store(false, Ordering::Release);

        // Restart the rotation even with no VF active; the PF still needs
        // its slices.
        if ret.is_ok() {
            if state.fa.per_partition {
                self.sched_start(state, idx_vf);
            } else {
                self.sched_start_all(state);
            }
        }
    }

    fn full_access_left_time(&self, state: &SchedState, idx_vf: VfIdx) -> (FullAccessStatus, u64) {
        let holder = if state.fa.per_partition {
            state.fa.is_full_access_vf(idx_vf)
        } else {
            state.fa.any_full_access()
        };
        if !holder {
            return (FullAccessStatus::NotEntered, 0);
        }

        if self.in_ecc_recovery.load(Ordering::Acquire) {
            // The VF cannot message the host during a fatal error; close
            // the window early.
            warn!("cancel full access due to fatal error");
            return (FullAccessStatus::TimedOut, 0);
        }

        let start = if state.fa.per_partition {
            state.fa.per_vf[idx_vf].start_time_us
        } else {
            state.fa.start_time_us
        };
        let used = self.now().saturating_sub(start);
        if used > state.fa.allow_time_us {
            return (FullAccessStatus::TimedOut, 0);
        }
        (FullAccessStatus::OnGoing, state.fa.allow_time_us - used)
    }

    /// Deadline police: times out every expired window. Returns the wait
    /// budget for the worker.
    pub(crate) fn full_access_check_and_process(
        &self,
        state: &mut SchedState,
    ) -> (FullAccessStatus, u64) {
        if state.fa.skip_timeout_check {
            return (FullAccessStatus::NotEntered, 0);
        }

        if !state.fa.per_partition {
            let (status, remain) = self.full_access_left_time(state, state.fa.idx_vf);
            if status == FullAccessStatus::TimedOut {
                self.exit_full_access_timeout(state, state.fa.idx_vf);
            }
            return (status, remain);
        }

        let mut min_remain = u64::MAX;
        let mut timed_out = false;
        for idx_vf in 0..self.num_vf() {
            match self.full_access_left_time(state, idx_vf) {
                (FullAccessStatus::OnGoing, remain) => min_remain = min_remain.min(remain),
                (FullAccessStatus::TimedOut, _) => {
                    self.exit_full_access_timeout(state, idx_vf);
                    timed_out = true;
                }
                (FullAccessStatus::NotEntered, _) => {}
            }
        }
        if timed_out {
            (FullAccessStatus::TimedOut, 0)
        } else if min_remain == u64::MAX {
            (FullAccessStatus::NotEntered, 0)
        } else {
            (FullAccessStatus::OnGoing, min_remain)
        }
    }

    /// Simulated full access around live debugging.
    pub(crate) fn toggle_full_access_for_debug(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        enable: bool,
    ) {
        if enable {
            self.notify_gpu_debug(idx_vf, false);
            let _ = self.sched_psp_set_mb_int(idx_vf, true);
            let _ = self.asic.set_vf_access(idx_vf, VfAccess::ALL, true);
            self.asic.rlc_safe_mode(true);
            let _ = self.set_mmsch_vfgate(idx_vf, true);
            self.asic.toggle_rlcg_interface(idx_vf, true);
        } else {
            self.asic.rlc_safe_mode(false);
            let _ = self.set_mmsch_vfgate(idx_vf, false);
            let _ = self.sched_psp_set_mb_int(idx_vf, false);
            self.asic.toggle_rlcg_interface(idx_vf, false);
            let _ = self
                .asic
                .set_vf_access(idx_vf, VfAccess::MMIO_REG_WRITE, false);
            self.notify_gpu_debug(idx_vf, true);
            self.sched_start(state, idx_vf);
        }
    }

    fn event_pending(&self, state: &SchedState, idx_vf: VfIdx, id: EventId) -> bool {
        if state
            .lists
            .iter()
            .any(|list| list.iter().any(|e| e.id == id && e.idx_vf == idx_vf))
        {
            return true;
        }
        self.queued_event_pending(idx_vf, id)
    }

    /// Events the holder's window services versus defers:
    /// everything not explicitly serviceable is pushed back until the
    /// holder releases.
    pub(crate) fn handle_event_in_full_access(
        &self,
        state: &mut SchedState,
        event: &SchedEvent,
    ) -> HandlerCtl {
        use EventId::*;

        // Events for unconfigured slots are dropped outright, except the
        // adapter-scoped ones.
        if self.array_vf[event.idx_vf.min(PF_IDX)].is(VfState::Unavail)
            && event.idx_vf != PF_IDX
            && matches!(
                event.id,
                ReqGpuInit | ReqGpuFini | ReqGpuReset | ReqGpuInitData | RelGpuInit | RelGpuFini
                    | SchedResetVf | SchedForceResetVf | HwSchedResetVf | HandleCrash
                    | CurVfCtxEmpty | SchedStopVf | SchedRemoveVf | SchedSuspendVf
                    | SchedResumeVf | ReqGpuDebug | RelGpuDebug
            )
        {
            return HandlerCtl::Continue;
        }

        if state.lock_world_switch
            && !matches!(event.id, ExitPowerSaving | SchedResumeLive)
            && state.live_update == LiveUpdateState::None
        {
            self.push_back_event(state, event.clone());
            return HandlerCtl::StopAndKeep;
        }

        if self.is_in_powersaving.load(Ordering::Acquire) && event.id != ExitPowerSaving {
            self.push_back_event(state, event.clone());
            return HandlerCtl::StopAndKeep;
        }

        match event.id {
            SchedRasUmc => {
                self.ecc_check_for_errors(event);
                HandlerCtl::Continue
            }
            SchedRasPoisonConsumption => {
                self.sched_handle_poison_consumption(event);
                HandlerCtl::Continue
            }
            SchedRasPoisonCreation => {
                self.handle_ras_poison_creation(event.idx_vf);
                HandlerCtl::Continue
            }
            SchedRasFed => {
                self.handle_ras_fed(event);
                HandlerCtl::Continue
            }

            ReqGpuInitData | ReqGpuInit | ReqGpuFini | ReqGpuReset | SchedGpumon
            | SchedMmschGeneralNotification | SchedUpdateMcaBanks | ReqGpuDebug => {
                // A PF REQ_GPU_RESET while a post-WGR notification is
                // pending is handled by the PF re-init path instead.
                if self.flags().contains(AdapterFlags::USE_PF)
                    && event.idx_vf == PF_IDX
                    && event.id == ReqGpuReset
                    && self.reset_notify_vf_pending.load(Ordering::Acquire)
                {
                    return HandlerCtl::Continue;
                }
                self.push_back_event(state, event.clone());
                HandlerCtl::StopAndKeep
            }

            SchedSuspend | SchedResume => {
                if state.live_update == LiveUpdateState::Save {
                    HandlerCtl::StopAndRelease
                } else if !state.fa.is_full_access_vf(PF_IDX) {
                    self.push_back_event(state, event.clone());
                    HandlerCtl::StopAndKeep
                } else {
                    HandlerCtl::Continue
                }
            }

            SchedSuspendLive => {
                state.lock_world_switch = true;
                let now = self.now();
                if state.fa.per_partition {
                    for idx_vf in 0..self.num_vf() {
                        if state.fa.per_vf[idx_vf].in_full_access {
                            state.fa.per_vf[idx_vf].used_time_us =
                                now - state.fa.per_vf[idx_vf].start_time_us;
                        }
                    }
                } else {
                    state.fa.used_time_us = now - state.fa.start_time_us;
                }

                let mask = self.ws_mask_for_vf(event.idx_vf);
                for ws in &mut state.ws.world_switches {
                    if mask & (1 << ws.id) != 0 {
                        ws.switch_running = false;
                    }
                }

                // Interrupts are off across the handover; the deadline
                // check must not fire on the suspended clock.
                state.fa.skip_timeout_check = true;
                HandlerCtl::StopAndRelease
            }

            SchedResumeLive => {
                state.lock_world_switch = false;
                let now = self.now();
                if state.fa.per_partition {
                    for idx_vf in 0..self.num_vf() {
                        if state.fa.per_vf[idx_vf].in_full_access {
                            state.fa.per_vf[idx_vf].start_time_us =
                                now - state.fa.per_vf[idx_vf].used_time_us;
                            state.fa.per_vf[idx_vf].used_time_us = 0;
                        }
                    }
                } else {
                    state.fa.start_time_us = now - state.fa.used_time_us;
                    state.fa.used_time_us = 0;
                }
                state.fa.skip_timeout_check = false;
                HandlerCtl::StopAndRelease
            }

            RelGpuInit => {
                if state.fa.is_full_access_vf(event.idx_vf) {
                    if !self.is_event_pair(state, event) {
                        info!("received REL_GPU_INIT without a corresponding REQ_GPU_INIT");
                        return HandlerCtl::Continue;
                    }

                    if self.flags().contains(AdapterFlags::USE_PF)
                        && event.idx_vf == PF_IDX
                        && self.reset_program_vf_mc_settings(state).is_err()
                    {
                        warn!("failed to program vf mc settings");
                    }

                    self.exit_full_access(state, event);

                    if self.flags().contains(AdapterFlags::USE_PF) && event.idx_vf == PF_IDX {
                        self.reset_notify_after_pf();
                    }
                    if event.idx_vf != PF_IDX {
                        self.check_vf2pf_data(event.idx_vf);
                    }
                }
                HandlerCtl::Continue
            }

            RelGpuFini => {
                if state.fa.is_full_access_vf(event.idx_vf) {
                    if !self.is_event_pair(state, event) {
                        info!("received REL_GPU_FINI without a corresponding REQ_GPU_FINI");
                        self.exit_full_access_timeout(state, event.idx_vf);
                        return HandlerCtl::Continue;
                    }
                    self.exit_full_access(state, event);
                }
                HandlerCtl::Continue
            }

            SchedForceResetVf => {
                if state.fa.is_full_access_vf(event.idx_vf) {
                    debug!("holder reset is handled by the timeout path, skip force reset");
                    HandlerCtl::Continue
                } else {
                    self.push_back_event(state, event.clone());
                    HandlerCtl::StopAndKeep
                }
            }

            SchedInitVfFb => {
                if state.fa.is_full_access_vf(PF_IDX) {
                    if let EventPayload::VfFb { pattern, .. } = &event.payload
                        && self.init_vf_fb(event.idx_vf, *pattern).is_err()
                    {
                        warn!("failed to init vf fb in full access");
                    }
                    HandlerCtl::Continue
                } else {
                    self.push_back_event(state, event.clone());
                    HandlerCtl::StopAndKeep
                }
            }

            SchedSuspendVf => {
                if state.fa.is_full_access_vf(event.idx_vf) {
                    warn!("cannot suspend fcn {} in full access", event.idx_vf);
                } else if self.array_vf[event.idx_vf].is(VfState::Active) {
                    let _ = self.array_vf[event.idx_vf].state.set(VfState::Suspended);
                    self.sched_remove_vf(state, event.idx_vf);
                }
                HandlerCtl::Continue
            }

            SchedResumeVf => {
                if state.fa.is_full_access_vf(event.idx_vf) {
                    warn!("cannot resume fcn {} in full access", event.idx_vf);
                } else if self.array_vf[event.idx_vf].is(VfState::Suspended)
                    && self.sched_add_vf(state, event.idx_vf).is_ok()
                    && event.idx_vf != PF_IDX
                    && self.update_pf2vf_message(event.idx_vf).is_err()
                {
                    warn!("update pf2vf message failed");
                }
                HandlerCtl::Continue
            }

            SchedRemoveVf => {
                if state.fa.is_full_access_vf(event.idx_vf) {
                    self.exit_full_access_timeout(state, event.idx_vf);
                }
                if self.array_vf[event.idx_vf].is(VfState::Active) {
                    self.sched_remove_vf(state, event.idx_vf);
                }
                let _ = self.array_vf[event.idx_vf].state.set(VfState::Unavail);
                HandlerCtl::Continue
            }

            SchedStopVf => {
                if !state.fa.is_full_access_vf(event.idx_vf)
                    && self.array_vf[event.idx_vf].is(VfState::Active)
                {
                    info!("deferring stop of fcn {} to crash handler", event.idx_vf);
                    self.array_vf[event.idx_vf]
                        .unshutdown
                        .store(true, Ordering::Release);
                    let _ = self.queue_event_ex(
                        event.idx_vf,
                        HandleCrash,
                        SchedBlock::All,
                        event.payload.clone(),
                    );
                }
                HandlerCtl::Continue
            }

            SchedSetVfAccess => {
                // Serviceable only for the holder; other VFs' access
                // changes wait for the release.
                if state.fa.is_full_access_vf(event.idx_vf) {
                    if let EventPayload::VfAccess { select, enable } = &event.payload {
                        let _ = self.asic.set_vf_access(event.idx_vf, *select, *enable);
                    }
                    HandlerCtl::Continue
                } else {
                    self.push_back_event(state, event.clone());
                    HandlerCtl::StopAndKeep
                }
            }

            CollectDiagData => {
                self.collect_diag_data(event);
                HandlerCtl::Continue
            }

            VfReqRasErrorCount => {
                let _ = self.handle_vf_req_ras_error_count(state, event.idx_vf);
                HandlerCtl::Continue
            }
            VfReqRasCperDump => {
                let rptr = match &event.payload {
                    EventPayload::CperDump { rptr } => *rptr,
                    _ => 0,
                };
                let _ = self.handle_vf_req_cper_dump(state, event.idx_vf, rptr);
                HandlerCtl::Continue
            }

            // Everything else waits for the holder to release.
            _ => {
                self.push_back_event(state, event.clone());
                HandlerCtl::StopAndKeep
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{drive_worker, test_adapter};

    /// Happy-path guest init enters and exits full access, activating
    /// the VF.
    #[test]
    fn guest_init_enters_and_releases_full_access() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();

        adapter
            .queue_event(0, EventId::ReqGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        {
            let state = adapter.state.lock();
            assert!(state.fa.in_full_access);
            assert_eq!(state.fa.idx_vf, 0);
        }
        assert!(adapter.array_vf[0].is(VfState::FullAccess));
        assert!(asic.sent_mailbox_id(0, crate::mailbox::TrnMsg::ReadyToAccessGpu as u32));

        asic.set_ack(0, true);
        adapter
            .queue_event(0, EventId::RelGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        {
            let state = adapter.state.lock();
            assert!(!state.fa.in_full_access);
        }
        assert!(adapter.array_vf[0].is(VfState::Active));
    }

    /// A second VF cannot enter while the first holds the window; its
    /// request is deferred, not granted.
    #[test]
    fn full_access_is_a_singleton() {
        let (adapter, _asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();
        adapter.array_vf[1].state.set(VfState::Avail).unwrap();

        adapter
            .queue_event(0, EventId::ReqGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);
        adapter
            .queue_event(1, EventId::ReqGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        let state = adapter.state.lock();
        assert!(state.fa.in_full_access);
        assert_eq!(state.fa.idx_vf, 0);
        assert!(!adapter.array_vf[1].is(VfState::FullAccess));
        // The second request is parked in its list.
        assert_eq!(state.lists[EventId::ReqGpuInit.list()].len(), 1);
    }

    /// An unreleased window is forcibly closed at the deadline,
    /// the VF is FLR'd, demoted to AVAIL, and the timeout guard counts.
    #[test]
    fn deadline_forces_the_holder_out() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[1].state.set(VfState::Avail).unwrap();

        adapter
            .queue_event(1, EventId::ReqGpuReset, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);
        assert!(adapter.array_vf[1].is(VfState::FullAccess));

        // Jump past the deadline and run the deadline police.
        let allow = adapter.state.lock().fa.allow_time_us;
        asic.shim().advance(allow + 1000);
        drive_worker(&adapter);

        assert!(adapter.array_vf[1].is(VfState::Avail));
        assert_eq!(asic.flr_count(1), 1);
        let info = adapter.array_vf[1]
            .guard
            .info(crate::guard::GuardEventKind::ExclusiveTimeout, adapter.now());
        assert_eq!(info.active, 1);
        let state = adapter.state.lock();
        assert!(!state.fa.in_full_access);
    }

    /// A mismatched REL_GPU_FINI (without its REQ) takes the timeout
    /// path.
    #[test]
    fn mismatched_release_fini_forces_timeout_path() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();

        adapter
            .queue_event(0, EventId::ReqGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);
        assert!(adapter.array_vf[0].is(VfState::FullAccess));

        adapter
            .queue_event(0, EventId::RelGpuFini, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        assert!(adapter.array_vf[0].is(VfState::Avail));
        assert_eq!(asic.flr_count(0), 1);
    }

    /// Serviceable-in-window table: RAS events run, a reset for another
    /// VF defers.
    #[test]
    fn deferral_table_in_full_access() {
        let (adapter, _asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();
        adapter.array_vf[1].state.set(VfState::Avail).unwrap();

        adapter
            .queue_event(0, EventId::ReqGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        // An access change for the holder is serviced; the same request
        // for another VF waits for the release.
        adapter
            .queue_event_ex(
                0,
                EventId::SchedSetVfAccess,
                SchedBlock::All,
                EventPayload::VfAccess {
                    select: crate::asic::VfAccess::DOORBELL,
                    enable: false,
                },
            )
            .unwrap();
        adapter
            .queue_event_ex(
                1,
                EventId::SchedSetVfAccess,
                SchedBlock::All,
                EventPayload::VfAccess {
                    select: crate::asic::VfAccess::DOORBELL,
                    enable: false,
                },
            )
            .unwrap();
        drive_worker(&adapter);
        {
            let state = adapter.state.lock();
            assert_eq!(state.lists[EventId::SchedSetVfAccess.list()].len(), 1);
            assert_eq!(state.lists[EventId::SchedSetVfAccess.list()][0].idx_vf, 1);
        }

        // A targeted reset of the non-holder is deferred behind it.
        adapter
            .queue_event(1, EventId::SchedForceResetVf, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);
        {
            let state = adapter.state.lock();
            assert_eq!(state.lists[EventId::SchedForceResetVf.list()].len(), 2);
        }

        // RAS poison creation is serviced immediately.
        adapter
            .queue_event_ex(
                1,
                EventId::SchedRasPoisonCreation,
                SchedBlock::All,
                EventPayload::Poison {
                    block: crate::ras::RasBlock::Gfx,
                },
            )
            .unwrap();
        drive_worker(&adapter);
        let state = adapter.state.lock();
        assert!(state.lists[EventId::SchedRasPoisonCreation.list()].is_empty());
    }

    /// Live-update suspension parks the deadline and resume recomputes
    /// the wall-clock offset before re-enabling checks.
    #[test]
    fn live_suspend_preserves_the_deadline_budget() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();
        // Ack everything immediately so no mailbox wait consumes the
        // fake clock.
        asic.set_ack(0, true);

        adapter
            .queue_event(0, EventId::ReqGpuInit, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        // Burn 100ms of the window, then suspend.
        asic.shim().advance(100_000);
        adapter
            .queue_event(PF_IDX, EventId::SchedSuspendLive, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);
        assert!(adapter.state.lock().fa.skip_timeout_check);

        // A long pause while suspended must not count against the window.
        let allow = adapter.state.lock().fa.allow_time_us;
        asic.shim().advance(allow * 3);
        drive_worker(&adapter);
        assert!(adapter.array_vf[0].is(VfState::FullAccess));

        adapter
            .queue_event(PF_IDX, EventId::SchedResumeLive, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        let state = adapter.state.lock();
        assert!(!state.fa.skip_timeout_check);
        let used = adapter.now() - state.fa.start_time_us;
        // Only the pre-suspend 100ms counts as used.
        assert_eq!(used, 100_000);
    }
}
