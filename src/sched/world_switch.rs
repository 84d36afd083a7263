// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! World switching: the per-hardware-scheduler VF context state machine.
//!
//! Every firmware command is synchronous with a bounded timeout. A failed
//! or mismatched command latches the owning world switch `Abnormal`; from
//! then on all commands on that world switch are skipped until a reset
//! clears the latch, and the scheduler raises `HW_SCHED_RESET_VF`.

use crate::adapter::Adapter;
use crate::asic::{HwSchedDesc, WsCmd};
use crate::config::AdapterFlags;
use crate::error::GvError;
use crate::sched::SchedState;
use crate::sched::event::{EventId, SchedBlock};
use crate::vf::{MAX_VF_SLOT, PF_IDX, VfIdx, VfState};
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::sync::atomic::Ordering;
use log::{debug, info, warn};

/// Context state of one VF on one hardware scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfGpuState {
    /// No context; the next load must send `INIT_GPU`.
    #[default]
    Shutdown,
    /// Context initialised.
    Init,
    /// Executing.
    Run,
    /// Quiesced.
    Idle,
    /// State saved to memory.
    Save,
    /// State reloaded from memory.
    Load,
}

/// Aggregate context state of a world switch's current VF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfContextState {
    /// Nothing loaded since the last reset.
    #[default]
    Idle,
    /// The current VF is loaded and may be running.
    Loaded,
    /// The current VF's state is saved.
    Saved,
    /// A command failed; the scheduler is stopped and a reset is pending.
    Abnormal,
}

/// One firmware-assisted hardware scheduler.
#[derive(Debug, Clone)]
pub struct HwSched {
    /// Static description.
    pub desc: HwSchedDesc,
    /// State of the VF currently owning the engine.
    pub cur_gpu_state: VfGpuState,
    /// Last known context state per VF.
    pub cur_vf_state: [VfGpuState; MAX_VF_SLOT],
    /// Last command submitted, for diagnostics.
    pub last_cmd: Option<WsCmd>,
    /// Last raw status readback, for diagnostics.
    pub last_status: u32,
}

/// A logical scheduler: one or more hardware schedulers sharing an
/// active-VF list.
#[derive(Debug, Clone)]
pub struct WorldSwitch {
    /// Identifier (index into the set).
    pub id: usize,
    /// Engine class of the member schedulers.
    pub sched_block: SchedBlock,
    /// Bitmask of member `hw_sched_id`s.
    pub hw_sched_mask: u64,
    /// VF currently loaded.
    pub curr_idx_vf: VfIdx,
    /// Aggregate context state.
    pub curr_vf_state: VfContextState,
    /// Whether firmware round-robin is active.
    pub switch_running: bool,
    /// Ring of VFs participating in rotation.
    pub active_vfs: ArrayVec<VfIdx, MAX_VF_SLOT>,
    /// Grace flags suppressing the next punishment per VF.
    pub skip_next_punish: [bool; MAX_VF_SLOT],
}

impl WorldSwitch {
    fn abnormal(&self) -> bool {
        self.curr_vf_state == VfContextState::Abnormal
    }
}

/// All schedulers of one adapter.
pub struct WorldSwitchSet {
    /// Hardware schedulers, indexed by `hw_sched_id`.
    pub hw_scheds: Vec<HwSched>,
    /// Logical schedulers, indexed by world switch id.
    pub world_switches: Vec<WorldSwitch>,
}

impl WorldSwitchSet {
    /// Builds the set from the ASIC's scheduler table.
    pub fn new(descs: &[HwSchedDesc]) -> Self {
        let hw_scheds: Vec<HwSched> = descs
            .iter()
            .map(|&desc| HwSched {
                desc,
                cur_gpu_state: VfGpuState::Shutdown,
                cur_vf_state: [VfGpuState::Shutdown; MAX_VF_SLOT],
                last_cmd: None,
                last_status: 0,
            })
            .collect();

        let num_ws = descs
            .iter()
            .map(|desc| desc.world_switch_id + 1)
            .max()
            .unwrap_or(0);
        let mut world_switches = Vec::with_capacity(num_ws);
        for id in 0..num_ws {
            let mut mask = 0u64;
            let mut block = SchedBlock::Gfx;
            for (hw_id, desc) in descs.iter().enumerate() {
                if desc.world_switch_id == id {
                    mask |= 1 << hw_id;
                    block = desc.sched_block;
                }
            }
            world_switches.push(WorldSwitch {
                id,
                sched_block: block,
                hw_sched_mask: mask,
                curr_idx_vf: PF_IDX,
                curr_vf_state: VfContextState::Idle,
                switch_running: false,
                active_vfs: ArrayVec::new(),
                skip_next_punish: [false; MAX_VF_SLOT],
            });
        }

        Self {
            hw_scheds,
            world_switches,
        }
    }

    /// Ids of hardware schedulers belonging to world switch `ws_id`.
    pub fn hw_ids(&self, ws_id: usize) -> impl Iterator<Item = usize> + '_ {
        let mask = self.world_switches[ws_id].hw_sched_mask;
        (0..self.hw_scheds.len()).filter(move |hw_id| mask & (1 << hw_id) != 0)
    }

    /// The first world switch latched `Abnormal`, if any.
    pub fn abnormal_world_switch(&self) -> Option<usize> {
        self.world_switches
            .iter()
            .find(|ws| ws.abnormal())
            .map(|ws| ws.id)
    }

    /// True when no world switch is latched `Abnormal`.
    pub fn all_states_ok(&self) -> bool {
        self.abnormal_world_switch().is_none()
    }

    /// Number of distinct active VFs across all world switches.
    pub fn active_vf_num(&self) -> usize {
        let mut seen = [false; MAX_VF_SLOT];
        for ws in &self.world_switches {
            for &vf in &ws.active_vfs {
                seen[vf] = true;
            }
        }
        seen.iter().filter(|&&s| s).count()
    }

    /// Clears the `Abnormal` latches and rotation state ahead of a
    /// whole-GPU reset.
    pub fn clear_state_for_reset(&mut self) {
        for ws in &mut self.world_switches {
            ws.curr_vf_state = VfContextState::Idle;
            ws.curr_idx_vf = PF_IDX;
            ws.switch_running = false;
        }
    }
}

impl Adapter {
    /// World switches `idx_vf` participates in, as a bitmask.
    pub(crate) fn ws_mask_for_vf(&self, idx_vf: VfIdx) -> u64 {
        self.asic.world_switch_mask_for_vf(idx_vf)
    }

    fn ws_matches_block(ws: &WorldSwitch, block: SchedBlock) -> bool {
        block == SchedBlock::All || ws.sched_block == block
    }

    /// Submits one firmware command and mirrors the resulting state.
    fn ws_cmd(
        &self,
        state: &mut SchedState,
        ws_id: usize,
        hw_id: usize,
        cmd: WsCmd,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        if state.ws.world_switches[ws_id].abnormal() {
            // Latched; everything is skipped until reset.
            return Err(GvError::VfHang);
        }

        let ret = self.asic.run_ws_cmd(hw_id, cmd, idx_vf);
        let hw = &mut state.ws.hw_scheds[hw_id];
        hw.last_cmd = Some(cmd);

        match ret {
            Ok(()) => {
                let gpu_state = match cmd {
                    WsCmd::InitGpu => VfGpuState::Init,
                    WsCmd::RunGpu => VfGpuState::Run,
                    WsCmd::IdleGpu => VfGpuState::Idle,
                    WsCmd::SaveGpuState => VfGpuState::Save,
                    WsCmd::LoadGpuState => VfGpuState::Load,
                    WsCmd::ShutdownGpu => VfGpuState::Shutdown,
                    WsCmd::EnableAutoSched | WsCmd::DisableAutoSched => {
                        return Ok(());
                    }
                };
                hw.cur_gpu_state = gpu_state;
                hw.cur_vf_state[idx_vf] = gpu_state;
                hw.last_status = 0;
                Ok(())
            }
            Err(e) => {
                hw.last_status = 1;
                let block = state.ws.world_switches[ws_id].sched_block;
                state.ws.world_switches[ws_id].curr_vf_state = VfContextState::Abnormal;
                warn!("{cmd:?} for fcn {idx_vf} failed on {block:?} hw sched {hw_id}: {e:?}");
                Err(e)
            }
        }
    }

    /// Idles and saves the current VF of one world switch. A no-op when
    /// nothing is loaded or the context is already saved.
    pub(crate) fn ws_save(&self, state: &mut SchedState, ws_id: usize) -> Result<(), GvError> {
        let ws = &state.ws.world_switches[ws_id];
        if ws.abnormal() {
            return Err(GvError::VfHang);
        }
        let idx_vf = ws.curr_idx_vf;
        if ws.curr_vf_state != VfContextState::Loaded {
            return Ok(());
        }

        let hw_ids: Vec<usize> = state.ws.hw_ids(ws_id).collect();
        for hw_id in hw_ids {
            // SAVE on a context that was shut down is idempotent.
            if state.ws.hw_scheds[hw_id].cur_vf_state[idx_vf] == VfGpuState::Shutdown {
                continue;
            }
            self.ws_cmd(state, ws_id, hw_id, WsCmd::IdleGpu, idx_vf)?;
            self.ws_cmd(state, ws_id, hw_id, WsCmd::SaveGpuState, idx_vf)?;
        }
        state.ws.world_switches[ws_id].curr_vf_state = VfContextState::Saved;
        Ok(())
    }

    /// Loads `idx_vf` onto one world switch and runs it. A context never
    /// initialised in this lifecycle gets `INIT_GPU` instead of a load.
    pub(crate) fn ws_load(
        &self,
        state: &mut SchedState,
        ws_id: usize,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        if state.ws.world_switches[ws_id].abnormal() {
            return Err(GvError::VfHang);
        }

        let hw_ids: Vec<usize> = state.ws.hw_ids(ws_id).collect();
        let skip_run = self.array_vf[idx_vf].skip_run.load(Ordering::Acquire);
        for hw_id in hw_ids {
            let cmd = if state.ws.hw_scheds[hw_id].cur_vf_state[idx_vf] == VfGpuState::Shutdown {
                WsCmd::InitGpu
            } else {
                WsCmd::LoadGpuState
            };
            self.ws_cmd(state, ws_id, hw_id, cmd, idx_vf)?;
            if !skip_run {
                self.ws_cmd(state, ws_id, hw_id, WsCmd::RunGpu, idx_vf)?;
            }
        }

        let ws = &mut state.ws.world_switches[ws_id];
        ws.curr_idx_vf = idx_vf;
        ws.curr_vf_state = VfContextState::Loaded;
        Ok(())
    }

    /// Saves the current VF and loads `idx_vf`. A no-op when `idx_vf` is
    /// already loaded and running.
    pub(crate) fn ws_switch_to_vf(
        &self,
        state: &mut SchedState,
        ws_id: usize,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        {
            let ws = &state.ws.world_switches[ws_id];
            if ws.abnormal() {
                return Err(GvError::VfHang);
            }
            if ws.curr_idx_vf == idx_vf && ws.curr_vf_state == VfContextState::Loaded {
                return Ok(());
            }
        }
        self.ws_save(state, ws_id)?;
        self.ws_load(state, ws_id, idx_vf)
    }

    /// Stops rotation on one world switch and parks the current VF saved.
    /// A hang here latches `Abnormal`.
    pub(crate) fn ws_stop(&self, state: &mut SchedState, ws_id: usize) -> Result<(), GvError> {
        let (running, idx_vf, abnormal) = {
            let ws = &state.ws.world_switches[ws_id];
            (ws.switch_running, ws.curr_idx_vf, ws.abnormal())
        };
        if abnormal {
            return Err(GvError::VfHang);
        }

        if running {
            let hw_ids: Vec<usize> = state.ws.hw_ids(ws_id).collect();
            for hw_id in hw_ids {
                self.ws_cmd(state, ws_id, hw_id, WsCmd::DisableAutoSched, idx_vf)?;
            }
        }
        state.ws.world_switches[ws_id].switch_running = false;

        self.ws_save(state, ws_id)
    }

    /// Restarts rotation on one world switch.
    pub(crate) fn ws_start(&self, state: &mut SchedState, ws_id: usize) -> Result<(), GvError> {
        if state.ws.world_switches[ws_id].abnormal() {
            return Err(GvError::VfHang);
        }

        let (n_active, curr, curr_state) = {
            let ws = &state.ws.world_switches[ws_id];
            (ws.active_vfs.len(), ws.curr_idx_vf, ws.curr_vf_state)
        };
        let use_pf = self.flags().contains(AdapterFlags::USE_PF);
        if n_active == 0 && !use_pf {
            return Ok(());
        }

        // Make sure something is loaded before firmware takes over.
        if curr_state != VfContextState::Loaded {
            let first = state.ws.world_switches[ws_id]
                .active_vfs
                .first()
                .copied()
                .unwrap_or(curr);
            self.ws_load(state, ws_id, first)?;
        }

        let self_switch = n_active > 1
            || (use_pf && n_active == 1)
            || !self.flags().contains(AdapterFlags::DISABLE_SELF_SWITCH);
        if self_switch && n_active > 0 {
            let idx_vf = state.ws.world_switches[ws_id].curr_idx_vf;
            let hw_ids: Vec<usize> = state.ws.hw_ids(ws_id).collect();
            for hw_id in hw_ids {
                self.ws_cmd(state, ws_id, hw_id, WsCmd::EnableAutoSched, idx_vf)?;
            }
            state.ws.world_switches[ws_id].switch_running = true;
        }
        Ok(())
    }

    /// Tears down `idx_vf`'s context on one world switch.
    pub(crate) fn ws_shutdown_vf(
        &self,
        state: &mut SchedState,
        ws_id: usize,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        let hw_ids: Vec<usize> = state.ws.hw_ids(ws_id).collect();
        for hw_id in hw_ids {
            if state.ws.hw_scheds[hw_id].cur_vf_state[idx_vf] == VfGpuState::Shutdown {
                continue;
            }
            self.ws_cmd(state, ws_id, hw_id, WsCmd::ShutdownGpu, idx_vf)?;
        }
        let ws = &mut state.ws.world_switches[ws_id];
        if ws.curr_idx_vf == idx_vf {
            ws.curr_vf_state = VfContextState::Idle;
        }
        Ok(())
    }

    fn for_each_ws(
        &self,
        state: &SchedState,
        idx_vf: VfIdx,
        block: SchedBlock,
    ) -> Vec<usize> {
        let mask = self.ws_mask_for_vf(idx_vf);
        state
            .ws
            .world_switches
            .iter()
            .filter(|ws| mask & (1 << ws.id) != 0 && Self::ws_matches_block(ws, block))
            .map(|ws| ws.id)
            .collect()
    }

    /// Stops world switching on every scheduler touching `idx_vf`.
    pub(crate) fn sched_stop(&self, state: &mut SchedState, idx_vf: VfIdx) {
        for ws_id in self.for_each_ws(state, idx_vf, SchedBlock::All) {
            let _ = self.ws_stop(state, ws_id);
        }
    }

    /// Stops world switching everywhere.
    pub(crate) fn sched_stop_all(&self, state: &mut SchedState) {
        for ws_id in 0..state.ws.world_switches.len() {
            let _ = self.ws_stop(state, ws_id);
        }
    }

    /// Restarts world switching for `idx_vf`'s schedulers.
    pub(crate) fn sched_start(&self, state: &mut SchedState, idx_vf: VfIdx) {
        for ws_id in self.for_each_ws(state, idx_vf, SchedBlock::All) {
            let _ = self.ws_start(state, ws_id);
        }
    }

    /// Restarts world switching everywhere.
    pub(crate) fn sched_start_all(&self, state: &mut SchedState) {
        for ws_id in 0..state.ws.world_switches.len() {
            let _ = self.ws_start(state, ws_id);
        }
    }

    /// Context-switches every matching scheduler to `idx_vf`.
    pub(crate) fn context_switch_to_vf(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        block: SchedBlock,
    ) -> Result<(), GvError> {
        let mut ret = Ok(());
        for ws_id in self.for_each_ws(state, idx_vf, block) {
            if let Err(e) = self.ws_switch_to_vf(state, ws_id, idx_vf) {
                ret = Err(e);
            }
        }
        ret
    }

    /// Saves `idx_vf`'s context where it is currently loaded.
    pub(crate) fn context_save(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        block: SchedBlock,
    ) -> Result<(), GvError> {
        let mut ret = Ok(());
        for ws_id in self.for_each_ws(state, idx_vf, block) {
            if state.ws.world_switches[ws_id].curr_idx_vf == idx_vf
                && let Err(e) = self.ws_save(state, ws_id)
            {
                ret = Err(e);
            }
        }
        ret
    }

    /// Loads and runs `idx_vf` on every matching scheduler.
    pub(crate) fn context_load(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        block: SchedBlock,
    ) -> Result<(), GvError> {
        for ws_id in self.for_each_ws(state, idx_vf, block) {
            self.ws_save(state, ws_id)?;
            self.ws_load(state, ws_id, idx_vf)?;
        }
        Ok(())
    }

    /// Initialises a fresh context for `idx_vf` and runs it; used on
    /// guest init and reset, where the previous context is discarded.
    pub(crate) fn context_init(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        block: SchedBlock,
    ) -> Result<(), GvError> {
        for ws_id in self.for_each_ws(state, idx_vf, block) {
            self.ws_save(state, ws_id)?;
            let hw_ids: Vec<usize> = state.ws.hw_ids(ws_id).collect();
            for hw_id in hw_ids {
                state.ws.hw_scheds[hw_id].cur_vf_state[idx_vf] = VfGpuState::Shutdown;
            }
            self.ws_load(state, ws_id, idx_vf)?;
        }
        Ok(())
    }

    /// Marks `idx_vf`'s contexts clean after an FLR without touching
    /// hardware.
    pub(crate) fn context_clear_state(&self, state: &mut SchedState, idx_vf: VfIdx) {
        for hw in &mut state.ws.hw_scheds {
            hw.cur_vf_state[idx_vf] = VfGpuState::Shutdown;
        }
        for ws in &mut state.ws.world_switches {
            if ws.curr_idx_vf == idx_vf {
                ws.curr_vf_state = VfContextState::Idle;
            }
        }
    }

    /// Shuts down `idx_vf`'s context everywhere.
    pub(crate) fn sched_shutdown_vf(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        let mut ret = Ok(());
        for ws_id in self.for_each_ws(state, idx_vf, SchedBlock::All) {
            if let Err(e) = self.ws_shutdown_vf(state, ws_id, idx_vf) {
                ret = Err(e);
            }
        }
        ret
    }

    /// Adds `idx_vf` to the rotation of its schedulers. Fails when the
    /// guest did not actually bring its CP scheduler up.
    pub(crate) fn sched_add_vf(&self, state: &mut SchedState, idx_vf: VfIdx) -> Result<(), GvError> {
        if !self.asic.cp_sched_running(idx_vf) {
            return Err(GvError::VfHang);
        }
        for ws_id in self.for_each_ws(state, idx_vf, SchedBlock::All) {
            let ws = &mut state.ws.world_switches[ws_id];
            if !ws.active_vfs.contains(&idx_vf) {
                ws.active_vfs.push(idx_vf);
            }
        }
        self.array_vf[idx_vf].state.set(VfState::Active)?;
        let now = self.now();
        self.array_vf[idx_vf].time_log.lock().active_since_us = now;
        Ok(())
    }

    /// Removes `idx_vf` from the rotation of its schedulers.
    pub(crate) fn sched_remove_vf(&self, state: &mut SchedState, idx_vf: VfIdx) {
        for ws in &mut state.ws.world_switches {
            ws.active_vfs.retain(|vf| *vf != idx_vf);
        }
        let now = self.now();
        self.array_vf[idx_vf].time_log.lock().accumulate_running(now);
    }

    /// True when no scheduler of `idx_vf` is latched `Abnormal`.
    pub(crate) fn sched_is_state_ok(&self, state: &SchedState, idx_vf: VfIdx) -> bool {
        let mask = self.ws_mask_for_vf(idx_vf);
        state
            .ws
            .world_switches
            .iter()
            .filter(|ws| mask & (1 << ws.id) != 0)
            .all(|ws| !ws.abnormal())
    }

    /// Gives every other active VF one slice so a long exclusive window
    /// does not starve them.
    pub(crate) fn sched_one_time_loop(
        &self,
        state: &mut SchedState,
        exclude_vf: VfIdx,
    ) -> Result<(), GvError> {
        for ws_id in 0..state.ws.world_switches.len() {
            let vfs: Vec<VfIdx> = state.ws.world_switches[ws_id]
                .active_vfs
                .iter()
                .copied()
                .filter(|&vf| vf != exclude_vf)
                .collect();
            for vf in vfs {
                self.ws_switch_to_vf(state, ws_id, vf)?;
            }
        }
        Ok(())
    }

    /// Marks or clears the one-shot punishment grace for `idx_vf`.
    pub(crate) fn sched_toggle_skip_next_punish(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        on: bool,
    ) {
        for ws in &mut state.ws.world_switches {
            ws.skip_next_punish[idx_vf] = on;
        }
    }

    /// Brings the PF context up; called once at driver init and again
    /// after every whole-GPU reset.
    pub(crate) fn sched_init_pf_state(&self, state: &mut SchedState) -> Result<(), GvError> {
        if !self.flags().contains(AdapterFlags::USE_PF) {
            debug!("PF not scheduled, leaving PF contexts shut down");
            return Ok(());
        }
        for ws_id in 0..state.ws.world_switches.len() {
            self.ws_load(state, ws_id, PF_IDX)?;
        }
        Ok(())
    }

    /// Aligns the sibling hardware schedulers of an abnormal world switch
    /// onto the hung VF so the following FLR covers all of them.
    pub(crate) fn sync_abnormal_sched(
        &self,
        state: &mut SchedState,
        idx_vf: VfIdx,
        abnormal_ws: usize,
    ) -> Result<(), GvError> {
        let mask = self.ws_mask_for_vf(idx_vf);
        for ws_id in 0..state.ws.world_switches.len() {
            if ws_id == abnormal_ws || mask & (1 << ws_id) == 0 {
                continue;
            }
            if let Err(e) = self.ws_switch_to_vf(state, ws_id, idx_vf) {
                let block = state.ws.world_switches[ws_id].sched_block;
                info!("unable to context switch fcn {idx_vf} on {block:?}");
                return Err(e);
            }
        }
        Ok(())
    }

    /// `CUR_VF_CTX_EMPTY` body: in hybrid-liquid mode an empty context
    /// lets rotation advance early.
    pub(crate) fn sched_signal_vf_idle(&self, state: &mut SchedState) {
        for ws_id in 0..state.ws.world_switches.len() {
            let ws = &state.ws.world_switches[ws_id];
            if !ws.switch_running || ws.active_vfs.len() < 2 {
                continue;
            }
            let curr = ws.curr_idx_vf;
            let next = {
                let pos = ws.active_vfs.iter().position(|&vf| vf == curr);
                match pos {
                    Some(pos) => ws.active_vfs[(pos + 1) % ws.active_vfs.len()],
                    None => continue,
                }
            };
            if self.ws_switch_to_vf(state, ws_id, next).is_err() {
                let _ = self.queue_event(curr, EventId::HwSchedResetVf, SchedBlock::All);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;
    use crate::asic::test::TestAsic;

    #[test]
    fn set_builds_topology_from_descs() {
        let set = WorldSwitchSet::new(TestAsic::DESCS);
        assert_eq!(set.world_switches.len(), 3);
        assert_eq!(set.world_switches[0].hw_sched_mask, 0b11);
        assert_eq!(set.world_switches[1].hw_sched_mask, 0b100);
        assert_eq!(set.world_switches[2].hw_sched_mask, 0b1000);
        assert!(set.all_states_ok());
    }

    #[test]
    fn switch_runs_idle_save_then_init_or_load_run() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        // First switch on the SDMA scheduler: fresh context, so INIT
        // then RUN.
        adapter.ws_load(&mut state, 1, 0).unwrap();
        assert!(asic.took_cmds(&[WsCmd::InitGpu, WsCmd::RunGpu]));

        // Switching to another fresh VF saves VF0 first.
        adapter.ws_switch_to_vf(&mut state, 1, 1).unwrap();
        assert!(asic.took_cmds(&[
            WsCmd::IdleGpu,
            WsCmd::SaveGpuState,
            WsCmd::InitGpu,
            WsCmd::RunGpu
        ]));

        // Back to VF0: its context exists now, so LOAD.
        adapter.ws_switch_to_vf(&mut state, 1, 0).unwrap();
        assert!(asic.took_cmds(&[
            WsCmd::IdleGpu,
            WsCmd::SaveGpuState,
            WsCmd::LoadGpuState,
            WsCmd::RunGpu
        ]));
    }

    #[test]
    fn multi_hw_sched_world_switch_drives_every_member() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        // World switch 0 has two member schedulers; each gets the
        // sequence.
        adapter.ws_load(&mut state, 0, 0).unwrap();
        assert!(asic.took_cmds(&[
            WsCmd::InitGpu,
            WsCmd::RunGpu,
            WsCmd::InitGpu,
            WsCmd::RunGpu
        ]));
    }

    #[test]
    fn switch_to_loaded_vf_is_a_noop() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        adapter.ws_load(&mut state, 1, 0).unwrap();
        asic.clear_cmds();
        adapter.ws_switch_to_vf(&mut state, 1, 0).unwrap();
        assert!(asic.took_cmds(&[]));
    }

    #[test]
    fn save_on_shutdown_context_is_idempotent() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        // Nothing loaded; save is a no-op.
        adapter.ws_save(&mut state, 0).unwrap();
        assert!(asic.took_cmds(&[]));
    }

    #[test]
    fn failed_command_latches_abnormal_and_skips_the_rest() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        asic.fail_next_ws_cmds(1);
        assert!(adapter.ws_load(&mut state, 0, 0).is_err());
        assert_eq!(
            state.ws.world_switches[0].curr_vf_state,
            VfContextState::Abnormal
        );
        assert_eq!(state.ws.abnormal_world_switch(), Some(0));

        // Subsequent commands are skipped without reaching the ASIC.
        asic.clear_cmds();
        assert_eq!(adapter.ws_load(&mut state, 0, 1), Err(GvError::VfHang));
        assert!(asic.took_cmds(&[]));

        // Other world switches are unaffected.
        adapter.ws_load(&mut state, 1, 0).unwrap();
    }

    #[test]
    fn clear_state_for_reset_clears_the_latch() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        asic.fail_next_ws_cmds(1);
        let _ = adapter.ws_load(&mut state, 0, 0);
        assert!(!state.ws.all_states_ok());

        state.ws.clear_state_for_reset();
        assert!(state.ws.all_states_ok());
        assert_eq!(state.ws.world_switches[0].curr_idx_vf, PF_IDX);
    }

    #[test]
    fn context_init_discards_a_previous_context() {
        let (adapter, asic) = test_adapter(2);
        let mut state = adapter.state.lock();

        adapter.ws_load(&mut state, 0, 0).unwrap();
        adapter.ws_save(&mut state, 0).unwrap();
        asic.clear_cmds();

        // A reinit must INIT even though a saved context exists.
        adapter
            .context_init(&mut state, 0, SchedBlock::Gfx)
            .unwrap();
        assert!(asic.cmd_log_contains(WsCmd::InitGpu));
    }
}
