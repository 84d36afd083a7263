// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The reset hierarchy: VF FLR, auto VF reset, whole-GPU reset.
//!
//! Escalation is strictly upward: a failing FLR becomes a whole-GPU
//! reset; a failing whole-GPU reset latches `HW_LOST`. An adapter in a
//! terminal RMA state refuses every tier.

use crate::adapter::{Adapter, AdapterStatus};
use crate::asic::VfAccess;
use crate::config::{
    AdapterFlags, SRIOV_RESTORE_SETTLE_US, TIMEOUT_GUEST_IDH_RESP_GPU_RESET_US,
    TIMEOUT_GUEST_IDH_RESP_US,
};
use crate::error::GvError;
use crate::guard::GuardEventKind;
use crate::sched::SchedState;
use crate::sched::event::SchedBlock;
use crate::sched::world_switch::{VfContextState, VfGpuState};
use crate::shim::wait_for;
use crate::vf::{INVALID_VF, MAX_VF_SLOT, PF_IDX, VfIdx, VfState, is_idx_invalid};
use core::sync::atomic::Ordering;
use log::{info, warn};

impl Adapter {
    fn is_active_or_suspended(&self, idx_vf: VfIdx) -> bool {
        let slot = &self.array_vf[idx_vf];
        slot.is(VfState::Active) || slot.is(VfState::Suspended)
    }

    /// Function-level reset of one VF: notify, bounded handshake, hardware
    /// FLR, FB revoke, bad-page replay, completion notify, guard charge.
    pub(crate) fn sched_vf_flr(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        _sched_block: SchedBlock,
        notify_vf: bool,
    ) -> Result<(), GvError> {
        if !self.flags().contains(AdapterFlags::USE_PF) && idx_vf == PF_IDX {
            return Err(GvError::InvalidParam);
        }

        // With hang escalation forced, every FLR is reported as failed so
        // the caller goes straight to the whole-GPU tier.
        if self.flags().contains(AdapterFlags::VF_HANG_GPU_RESET) && !self.opt.skip_hw_init {
            info!("returning flr failure because of force reset flag");
            return Err(GvError::ResetFailed);
        }

        if notify_vf {
            self.reset_notify_vf(idx_vf, false);
            self.array_vf[idx_vf]
                .ready_to_reset
                .store(false, Ordering::Release);
            // Safer to wait for the guest, but the reset proceeds either
            // way.
            let _ = wait_for(&*self.shim, TIMEOUT_GUEST_IDH_RESP_US, || {
                self.array_vf[idx_vf].ready_to_reset.load(Ordering::Acquire)
            });
        }

        self.array_vf[idx_vf].time_log.lock().reset_count += 1;

        self.asic.rlc_safe_mode(true);
        let ret = self.asic.trigger_vf_flr(idx_vf);
        self.asic.rlc_safe_mode(false);

        self.array_vf[idx_vf]
            .gpu_init_data_ready
            .store(false, Ordering::Release);

        if ret.is_err() {
            self.put_error(idx_vf, GvError::ResetFailed, idx_vf as u64);
            return Err(GvError::ResetFailed);
        }

        if self.flags().contains(AdapterFlags::VF_FB_PROTECTION) {
            let _ = self.asic.set_vf_access(idx_vf, VfAccess::FB, false);
        }

        self.context_clear_state(state, idx_vf);

        let _ = self.array_vf[idx_vf]
            .guard
            .add_event(GuardEventKind::Flr, self.now());

        // Pages retired by the reactor are remapped once the FLR settled;
        // a failed replacement escalates.
        let replay = self.replay_pending_bad_pages();

        if notify_vf {
            self.reset_notify_vf(idx_vf, true);
        }

        replay
    }

    /// Tier 1->3 driver: FLR the VF, escalate to whole-GPU reset when it
    /// fails; a failure here is never reported as success.
    pub(crate) fn sched_reset_vf(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        sched_block: SchedBlock,
    ) -> Result<(), GvError> {
        if self.in_ecc_recovery.load(Ordering::Acquire) {
            // The fatal-error interrupt already queued a reset.
            return Err(GvError::Busy);
        }

        if self.flags().contains(AdapterFlags::VF_HANG_GPU_RESET) {
            info!("force reset enabled, triggering whole GPU reset");
            return self.sched_gpu_reset_wrap(state, true);
        }

        self.array_vf[idx_vf].time_log.lock().reset_start_us = self.now();
        info!("start fcn {idx_vf} reset");

        let notify_vf = self.array_vf[idx_vf].is(VfState::Active)
            || self.array_vf[idx_vf].is(VfState::FullAccess);

        if self
            .sched_vf_flr(state, idx_vf, sched_block, notify_vf)
            .is_err()
        {
            info!("failed fcn {idx_vf} FLR, trying whole gpu reset");
            let ret = self.sched_gpu_reset_wrap(state, true);
            self.array_vf[idx_vf].time_log.lock().reset_end_us = self.now();
            return ret;
        }

        self.asic.psp_clear_vf_fw(idx_vf);

        info!("finish fcn {idx_vf} reset");
        self.array_vf[idx_vf].time_log.lock().reset_end_us = self.now();
        Ok(())
    }

    /// Tier 2: find the hung VF behind an `Abnormal` world switch, align
    /// its sibling schedulers and FLR it; escalate on any failure.
    pub(crate) fn sched_reset_vf_auto(&self, state: &mut SchedState) -> Result<(), GvError> {
        if self.flags().contains(AdapterFlags::VF_HANG_GPU_RESET) {
            info!("force reset enabled, triggering whole GPU reset");
            return self.sched_gpu_reset_wrap(state, true);
        }
        if self.in_ecc_recovery.load(Ordering::Acquire) {
            return Err(GvError::Busy);
        }

        let Some(abnormal_ws) = state.ws.abnormal_world_switch() else {
            info!("no engine in abnormal state, skip reset here");
            return Ok(());
        };
        let abnormal_idx_vf = state.ws.world_switches[abnormal_ws].curr_idx_vf;
        let block = state.ws.world_switches[abnormal_ws].sched_block;
        info!("start reset auto on fcn {abnormal_idx_vf} ({block:?} engine hung)");

        let mask = self.ws_mask_for_vf(abnormal_idx_vf.min(PF_IDX));
        for ws in &mut state.ws.world_switches {
            if mask & (1 << ws.id) != 0 {
                ws.switch_running = false;
            }
        }

        if abnormal_idx_vf != INVALID_VF {
            self.array_vf[abnormal_idx_vf.min(PF_IDX)]
                .time_log
                .lock()
                .reset_start_us = self.now();
        }

        let escalate = (!self.flags().contains(AdapterFlags::USE_PF)
            && abnormal_idx_vf == PF_IDX)
            || is_idx_invalid(abnormal_idx_vf);
        if escalate {
            info!("hung engine is owned by the PF or an invalid index");
            return self.whole_gpu_reset_fallback(state, abnormal_idx_vf);
        }

        // The latch blocks every further command on the hung world
        // switch; clear it so the recovery sequence itself can run.
        state.ws.world_switches[abnormal_ws].curr_vf_state = VfContextState::Idle;

        if self
            .sync_abnormal_sched(state, abnormal_idx_vf, abnormal_ws)
            .is_err()
        {
            return self.whole_gpu_reset_fallback(state, abnormal_idx_vf);
        }

        for ws_id in 0..state.ws.world_switches.len() {
            if ws_id == abnormal_ws || mask & (1 << ws_id) == 0 {
                continue;
            }
            if self.ws_switch_to_vf(state, ws_id, abnormal_idx_vf).is_err() {
                return self.whole_gpu_reset_fallback(state, abnormal_idx_vf);
            }
        }

        // The hung VF is told about the FLR in any case; a different VM
        // may be active on every other scheduler.
        if self
            .sched_vf_flr(state, abnormal_idx_vf, SchedBlock::All, true)
            .is_err()
        {
            return self.whole_gpu_reset_fallback(state, abnormal_idx_vf);
        }

        if self.array_vf[abnormal_idx_vf].is(VfState::Active) {
            self.sched_remove_vf(state, abnormal_idx_vf);
        }
        let _ = self.array_vf[abnormal_idx_vf].state.set(VfState::Avail);

        // Park the contexts of whatever is still loaded.
        for ws_id in 0..state.ws.world_switches.len() {
            if mask & (1 << ws_id) != 0
                && state.ws.world_switches[ws_id].curr_vf_state == VfContextState::Loaded
                && self.ws_save(state, ws_id).is_err()
            {
                info!("failed to save vf after FLR");
                return self.whole_gpu_reset_fallback(state, abnormal_idx_vf);
            }
        }

        self.asic.psp_clear_vf_fw(abnormal_idx_vf);

        info!("finish VF reset auto");
        self.array_vf[abnormal_idx_vf].time_log.lock().reset_end_us = self.now();
        Ok(())
    }

    fn whole_gpu_reset_fallback(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        info!("trying whole gpu reset");
        let ret = self.sched_gpu_reset_wrap(state, true);
        if !is_idx_invalid(idx_vf) {
            self.array_vf[idx_vf].time_log.lock().reset_end_us = self.now();
        }
        ret
    }

    /// The device-level reset: SR-IOV config preserved around the ASIC
    /// trigger, interrupts disabled on failure.
    fn reset_gpu(&self, state: &mut SchedState) -> Result<(), GvError> {
        self.reset_num.fetch_add(1, Ordering::Relaxed);
        info!("whole GPU reset number {}", self.reset_num.load(Ordering::Relaxed));

        let sriov = self.asic.save_sriov_config();
        let ret = self.asic.trigger_gpu_reset();
        if ret.is_err() {
            self.set_status(AdapterStatus::HwLost);
            self.asic.iv_ring_enable(false);
            self.asic.mbox_irq_enable(false);
            info!("disabled interrupts");
        } else {
            let _ = self.asic.restore_sriov_config(&sriov);
            // The SR-IOV spec gives components 100 ms to reinitialise
            // after VF enable.
            self.shim.usleep(SRIOV_RESTORE_SETTLE_US);
            if !self.flags().contains(AdapterFlags::USE_PF)
                && self.asic.restore_vf_rebar().is_err()
            {
                warn!("failed to restore VF resizable BAR");
            }
        }

        self.in_xgmi_chain_reset.store(false, Ordering::Release);
        self.ecc.lock().fatal_error = false;

        for hw in &mut state.ws.hw_scheds {
            hw.last_cmd = None;
            hw.last_status = 0;
        }
        for idx_vf in 0..MAX_VF_SLOT {
            self.array_vf[idx_vf]
                .gpu_init_data_ready
                .store(false, Ordering::Release);
            self.array_vf[idx_vf].vram_lost.store(true, Ordering::Release);
        }

        ret
    }

    /// Tier 3: notify every guest, shut all contexts down, reset the
    /// device, and bring the survivors back to `Avail`.
    pub(crate) fn sched_whole_gpu_reset(&self, state: &mut SchedState) -> Result<(), GvError> {
        let in_ecc_recovery = self.in_ecc_recovery.load(Ordering::Acquire);
        if in_ecc_recovery {
            // Harvest the error counts before the state is wiped.
            self.ecc_query_ras_errors();
        }

        if self.flags().contains(AdapterFlags::USE_PF) {
            self.reset_notify_vf(PF_IDX, false);
            self.reset_notify_vf_pending.store(true, Ordering::Release);
        }

        // Every context is invalid after the reset.
        for hw in &mut state.ws.hw_scheds {
            for vf_state in &mut hw.cur_vf_state {
                *vf_state = VfGpuState::Shutdown;
            }
            hw.cur_gpu_state = VfGpuState::Shutdown;
        }

        for idx_vf in 0..self.num_vf() {
            if !self.is_active_or_suspended(idx_vf) || in_ecc_recovery {
                continue;
            }
            self.reset_notify_vf(idx_vf, false);
            self.array_vf[idx_vf]
                .ready_to_reset
                .store(false, Ordering::Release);
        }

        if !in_ecc_recovery {
            // Wait for the acknowledgements, then reset regardless.
            let _ = wait_for(&*self.shim, TIMEOUT_GUEST_IDH_RESP_GPU_RESET_US, || {
                (0..self.num_vf()).all(|idx_vf| {
                    !self.is_active_or_suspended(idx_vf)
                        || self.array_vf[idx_vf].ready_to_reset.load(Ordering::Acquire)
                })
            });
        }

        state.ws.clear_state_for_reset();

        self.reset_gpu(state)?;

        if self.flags().contains(AdapterFlags::VF_FB_PROTECTION) {
            for idx_vf in 0..self.num_vf() {
                let _ = self.asic.set_vf_access(idx_vf, VfAccess::FB, false);
            }
        }

        for idx_vf in 0..self.num_vf() {
            if !self.is_active_or_suspended(idx_vf) {
                continue;
            }
            self.reset_notify_vf(idx_vf, true);
            if self.array_vf[idx_vf].is(VfState::Active) {
                self.sched_remove_vf(state, idx_vf);
            }
            let _ = self.array_vf[idx_vf].state.set(VfState::Avail);
        }

        Ok(())
    }

    /// Tier 3/4 entry point: refuses bad hives and bad GPUs, dispatches to
    /// the XGMI chain when the hive has more than one node.
    pub(crate) fn sched_gpu_reset_wrap(
        &self,
        state: &mut SchedState,
        reset_all: bool,
    ) -> Result<(), GvError> {
        if self.is_hive_bad() || (self.xgmi_node_count() == 1 && self.eeprom_is_gpu_bad()) {
            self.put_error(PF_IDX, GvError::HiveFailure, 0);
            return Err(GvError::HiveFailure);
        }

        self.sched_stop_all(state);

        let ret = if self.xgmi_node_count() > 1 {
            self.sched_gpu_chain_reset(state, reset_all)
        } else {
            let ret = self.sched_whole_gpu_reset(state);
            self.remove_stale_events_after_wgr(state);
            self.in_ecc_recovery.store(false, Ordering::Release);
            ret
        };

        if ret.is_ok() && self.status() == AdapterStatus::HwInit {
            let _ = self.sched_init_pf_state(state);
        }
        ret
    }

    /// Publishes VF memory-controller settings after a PF-coordinated
    /// reset, before the PF leaves its window.
    pub(crate) fn reset_program_vf_mc_settings(
        &self,
        _state: &mut SchedState,
    ) -> Result<(), GvError> {
        if !self.reset_notify_vf_pending.load(Ordering::Acquire) {
            return Ok(());
        }
        for idx_vf in 0..self.num_vf() {
            if self.array_vf[idx_vf].config.lock().configured {
                self.stage_init_data(idx_vf);
            }
        }
        Ok(())
    }

    /// Completion notifications deferred until the PF finished its own
    /// re-init.
    pub(crate) fn reset_notify_after_pf(&self) {
        if !self.reset_notify_vf_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        for idx_vf in 0..self.num_vf() {
            if self.is_active_or_suspended(idx_vf) || self.array_vf[idx_vf].is(VfState::Avail) {
                self.reset_notify_vf(idx_vf, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::{drive_worker, test_adapter};
    use crate::sched::event::EventId;

    fn activate(adapter: &Adapter, idx_vf: VfIdx) {
        adapter.array_vf[idx_vf].state.set(VfState::Avail).unwrap();
        let mut state = adapter.state.lock();
        adapter.sched_add_vf(&mut state, idx_vf).unwrap();
    }

    /// A forced whole-GPU reset notifies both guests, resets, clears
    /// access and leaves them `Avail`.
    #[test]
    fn whole_gpu_reset_with_two_guests() {
        let (adapter, asic) = test_adapter(2);
        activate(&adapter, 0);
        activate(&adapter, 1);

        adapter
            .queue_event(PF_IDX, EventId::SchedForceResetGpu, SchedBlock::All)
            .unwrap();
        drive_worker(&adapter);

        assert_eq!(asic.gpu_reset_count(), 1);
        assert!(adapter.array_vf[0].is(VfState::Avail));
        assert!(adapter.array_vf[1].is(VfState::Avail));
        assert!(asic.sent_mailbox_id(0, crate::mailbox::TrnMsg::FlrNotification as u32));
        assert!(asic.sent_mailbox_id(
            0,
            crate::mailbox::TrnMsg::FlrNotificationCompletion as u32
        ));
        assert!(asic.sent_mailbox_id(
            1,
            crate::mailbox::TrnMsg::FlrNotificationCompletion as u32
        ));
        assert!(adapter.array_vf[0].vram_lost.load(Ordering::Acquire));
    }

    /// Stale reset/RAS events queued before the reset are skipped.
    #[test]
    fn wgr_discards_the_stale_set() {
        let (adapter, _asic) = test_adapter(2);
        activate(&adapter, 0);

        adapter
            .queue_event(PF_IDX, EventId::SchedForceResetGpu, SchedBlock::All)
            .unwrap();
        adapter
            .queue_event_ex(
                0,
                EventId::VfReqRasCperDump,
                SchedBlock::All,
                crate::sched::event::EventPayload::CperDump { rptr: 0 },
            )
            .unwrap();
        drive_worker(&adapter);

        // After the reset both the second reset request and the CPER dump
        // are gone without having run.
        let state = adapter.state.lock();
        assert!(state.lists.iter().all(|l| l.is_empty()));
    }

    /// A failing FLR escalates to a whole-GPU reset.
    #[test]
    fn failed_flr_escalates_to_wgr() {
        let (adapter, asic) = test_adapter(2);
        activate(&adapter, 0);

        asic.fail_vf_flr(0, true);
        let mut state = adapter.state.lock();
        adapter
            .sched_reset_vf(&mut state, 0, SchedBlock::All)
            .unwrap();
        drop(state);

        assert_eq!(asic.gpu_reset_count(), 1);
    }

    /// A failing whole-GPU reset latches HW_LOST and disables interrupts.
    #[test]
    fn failed_wgr_latches_hw_lost() {
        let (adapter, asic) = test_adapter(2);
        activate(&adapter, 0);

        asic.fail_gpu_reset(true);
        let mut state = adapter.state.lock();
        assert!(adapter.sched_gpu_reset_wrap(&mut state, true).is_err());
        drop(state);

        assert_eq!(adapter.status(), AdapterStatus::HwLost);
        assert!(asic.interrupts_disabled());
    }

    /// Auto reset finds the hung VF behind the abnormal world switch.
    #[test]
    fn auto_reset_targets_the_abnormal_vf() {
        let (adapter, asic) = test_adapter(2);
        activate(&adapter, 0);
        activate(&adapter, 1);

        {
            let mut state = adapter.state.lock();
            adapter.ws_load(&mut state, 0, 1).unwrap();
            // Latch world switch 0 abnormal with VF1 loaded.
            asic.fail_next_ws_cmds(1);
            let _ = adapter.ws_save(&mut state, 0);
            assert_eq!(state.ws.abnormal_world_switch(), Some(0));

            adapter.sched_reset_vf_auto(&mut state).unwrap();
        }

        assert_eq!(asic.flr_count(1), 1);
        assert_eq!(asic.gpu_reset_count(), 0);
        assert!(adapter.array_vf[1].is(VfState::Avail));
        assert!(adapter.array_vf[0].is(VfState::Active));
    }

    /// FLR replays pending bad-page replacements.
    #[test]
    fn flr_replays_retired_pages() {
        let (adapter, asic) = test_adapter(2);
        activate(&adapter, 0);

        adapter
            .ecc
            .lock()
            .unhandled_bad_pages
            .push(crate::asic::BadPage { address: 0x1000 });

        let mut state = adapter.state.lock();
        adapter
            .sched_vf_flr(&mut state, 0, SchedBlock::All, false)
            .unwrap();
        drop(state);

        assert_eq!(asic.replaced_pages(), &[0x1000]);
        assert!(adapter.ecc.lock().unhandled_bad_pages.is_empty());
    }
}
