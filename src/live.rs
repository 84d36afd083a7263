// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Live-update serialization of scheduler state.
//!
//! The host driver can be replaced without tearing guests down: the
//! scheduler is suspended (`SCHED_SUSPEND_LIVE`), its volatile state and
//! the unprocessed event backlog exported, and both imported by the new
//! driver instance before `SCHED_RESUME_LIVE`.

use crate::api::Device;
use crate::error::GvError;
use crate::sched::LiveUpdateState;
use crate::sched::event::{EventId, SchedBlock};
use crate::vf::{INVALID_VF, VfIdx};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::info;

/// One event carried across a live update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnprocessedEvent {
    /// Target function.
    pub idx_vf: VfIdx,
    /// Event id.
    pub id: EventId,
    /// Engine scope.
    pub sched_block: SchedBlock,
}

/// Volatile scheduler state carried across a live update.
#[derive(Debug, Clone, Copy)]
pub struct SchedLiveInfo {
    /// A VF holds full access across the handover.
    pub in_full_access: bool,
    /// The holder.
    pub idx_vf_full_access: VfIdx,
    /// Window time consumed before suspension, microseconds.
    pub used_time_full_access_us: u64,
    /// The request that opened the window.
    pub event_id_full_access: Option<EventId>,
    /// The scheduler was locked at suspension.
    pub lock_world_switch: bool,
}

impl Device {
    /// Current live-update phase.
    pub fn get_live_update_state(&self) -> LiveUpdateState {
        self.adapter().state.lock().live_update
    }

    /// Moves the adapter between live-update phases.
    pub fn set_live_update_state(&self, phase: LiveUpdateState) {
        self.adapter().state.lock().live_update = phase;
    }

    /// Upper bound on the exported event count, for sizing the transfer
    /// buffer.
    pub fn export_live_info_size(&self) -> usize {
        crate::sched::EVENT_QUEUE_ENTRY_NUM
    }

    /// Drains every unprocessed event for export. Waiters are completed
    /// (the old driver instance is going away); monitor queries are not
    /// exported, their callers re-issue them.
    pub fn export_unprocessed_events(&self) -> Vec<UnprocessedEvent> {
        let adapter = self.adapter();
        let mut state = adapter.state.lock();

        adapter.drain_ring_into_lists(&mut state);

        let mut out = Vec::new();
        while let Some(event) = state
            .lists
            .iter_mut()
            .find(|list| !list.is_empty())
            .and_then(VecDeque::pop_front)
        {
            info!(
                "saving {:?} request from fcn {} for {:?}",
                event.id, event.idx_vf, event.sched_block
            );
            if let Some(signal) = &event.signal {
                signal.complete();
            }
            if event.id != EventId::SchedGpumon && out.len() < self.export_live_info_size() {
                out.push(UnprocessedEvent {
                    idx_vf: event.idx_vf,
                    id: event.id,
                    sched_block: event.sched_block,
                });
            }
        }
        out
    }

    /// Re-queues events exported by the previous driver instance.
    pub fn import_unprocessed_events(&self, events: &[UnprocessedEvent]) {
        for event in events {
            if self
                .adapter()
                .queue_event(event.idx_vf, event.id, event.sched_block)
                .is_err()
            {
                log::warn!("failed to queue unprocessed event {:?}", event.id);
            }
        }
    }

    /// Exports the volatile scheduler state.
    pub fn export_sched_live_info(&self) -> SchedLiveInfo {
        let adapter = self.adapter();
        let state = adapter.state.lock();
        let now = adapter.shim.timestamp_us();

        let used = if state.fa.in_full_access {
            if state.fa.used_time_us != 0 {
                state.fa.used_time_us
            } else {
                now.saturating_sub(state.fa.start_time_us)
            }
        } else {
            0
        };
        SchedLiveInfo {
            in_full_access: state.fa.in_full_access,
            idx_vf_full_access: state.fa.idx_vf,
            used_time_full_access_us: used,
            event_id_full_access: state.fa.event_id,
            lock_world_switch: state.lock_world_switch,
        }
    }

    /// Imports the volatile scheduler state. The wall-clock offset is
    /// recomputed from the imported budget, so the deadline resumes where
    /// it left off.
    pub fn import_sched_live_info(&self, live_info: &SchedLiveInfo) -> Result<(), GvError> {
        if live_info.in_full_access && live_info.idx_vf_full_access == INVALID_VF {
            return Err(GvError::InvalidParam);
        }

        let adapter = self.adapter();
        let mut state = adapter.state.lock();
        let now = adapter.shim.timestamp_us();

        state.fa.in_full_access = live_info.in_full_access;
        state.fa.idx_vf = live_info.idx_vf_full_access;
        state.fa.event_id = live_info.event_id_full_access;
        state.fa.used_time_us = 0;
        state.fa.start_time_us = if live_info.in_full_access {
            now.saturating_sub(live_info.used_time_full_access_us)
        } else {
            0
        };
        state.lock_world_switch = live_info.lock_world_switch;
        Ok(())
    }
}

/// Everything carried across a live update in one blob.
#[derive(Debug, Clone)]
pub struct AllLiveInfo {
    /// Volatile scheduler state.
    pub sched: SchedLiveInfo,
    /// The unprocessed event backlog.
    pub events: Vec<UnprocessedEvent>,
}

impl Device {
    /// Exports scheduler state and event backlog together.
    pub fn export_all_live_info(&self) -> AllLiveInfo {
        AllLiveInfo {
            sched: self.export_sched_live_info(),
            events: self.export_unprocessed_events(),
        }
    }

    /// Imports everything exported by [`Device::export_all_live_info`].
    pub fn import_all_live_info(&self, live_info: &AllLiveInfo) -> Result<(), GvError> {
        self.import_sched_live_info(&live_info.sched)?;
        self.import_unprocessed_events(&live_info.events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;
    use crate::api::Device;
    use crate::vf::PF_IDX;

    fn device(num_vf: usize) -> Device {
        let (adapter, _asic) = test_adapter(num_vf);
        Device::from_adapter_for_test(adapter)
    }

    #[test]
    fn unprocessed_events_survive_the_roundtrip() {
        let device = device(2);
        let adapter = device.adapter();

        adapter
            .queue_event(0, EventId::SchedSuspendVf, SchedBlock::All)
            .unwrap();
        adapter
            .queue_event(PF_IDX, EventId::SchedUpdateTopology, SchedBlock::All)
            .unwrap();
        // Monitor queries are not exported.
        adapter
            .queue_event(PF_IDX, EventId::SchedGpumon, SchedBlock::All)
            .unwrap();

        let exported = device.export_unprocessed_events();
        assert_eq!(exported.len(), 2);
        assert!(exported.iter().all(|e| e.id != EventId::SchedGpumon));

        device.import_unprocessed_events(&exported);
        let ids = adapter.queued_event_ids_for_test();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&EventId::SchedSuspendVf));
        assert!(ids.contains(&EventId::SchedUpdateTopology));
    }

    #[test]
    fn sched_live_info_preserves_the_deadline_budget() {
        let dev = device(2);
        let adapter = dev.adapter();

        {
            let mut state = adapter.state.lock();
            state.fa.in_full_access = true;
            state.fa.idx_vf = 1;
            state.fa.event_id = Some(EventId::ReqGpuInit);
            state.fa.start_time_us = adapter.shim.timestamp_us() - 250_000;
        }

        let exported = dev.export_sched_live_info();
        assert_eq!(exported.used_time_full_access_us, 250_000);

        // The new instance imports on a different wall clock.
        let device2 = device(2);
        device2.import_sched_live_info(&exported).unwrap();

        let state = device2.adapter().state.lock();
        assert!(state.fa.in_full_access);
        assert_eq!(state.fa.idx_vf, 1);
        let used = device2.adapter().shim.timestamp_us() - state.fa.start_time_us;
        assert_eq!(used, 250_000);
    }
}
