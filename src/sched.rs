// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The event pipeline: a fixed-size producer ring, six priority lists and
//! the single worker that owns all scheduling state.
//!
//! Producers (public API, mailbox bottom halves, the reset path) push
//! into the ring under a spinlock and wake the worker. The worker drains
//! the ring into the priority lists, deduplicates, and dispatches one
//! event at a time. Everything that mutates world-switch or VF state runs
//! on the worker.

pub mod event;
pub mod full_access;
pub mod reset;
pub mod world_switch;

use crate::adapter::{Adapter, AdapterStatus};
use crate::error::GvError;
use crate::guard::{GuardEventKind, GuardEventState};
use crate::shim::{OsEvent, WaitState};
use crate::vf::{PF_IDX, VfIdx, VfState};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use self::event::{
    EVENT_LIST_NUM, EventId, EventPayload, EventStatus, SchedBlock, SchedEvent,
};
use self::full_access::{FullAccessState, FullAccessStatus};
use log::{debug, error, info, warn};
use self::world_switch::WorldSwitchSet;

/// Capacity of the producer ring.
pub const EVENT_QUEUE_ENTRY_NUM: usize = 256;

/// Completion object a caller blocks on in `queue_event_and_wait_ex`.
pub struct EventSignal {
    event: Box<dyn OsEvent>,
    skipped: AtomicBool,
}

impl EventSignal {
    pub(crate) fn new(event: Box<dyn OsEvent>) -> Self {
        Self {
            event,
            skipped: AtomicBool::new(false),
        }
    }

    /// Completes the waiter successfully.
    pub(crate) fn complete(&self) {
        self.event.signal();
    }

    /// Completes the waiter with the skipped flag: the event was
    /// logically discarded (stale after reset, driver unload).
    pub(crate) fn complete_skipped(&self) {
        self.skipped.store(true, Ordering::Release);
        self.event.signal();
    }

    /// Blocks until completion. A skipped event reports failure.
    pub(crate) fn wait(&self) -> Result<(), GvError> {
        loop {
            match self.event.wait(0) {
                WaitState::Interrupted => continue,
                WaitState::WakeUp => break,
                WaitState::Timeout => return Err(GvError::Failure),
            }
        }
        if self.skipped.load(Ordering::Acquire) {
            Err(GvError::Failure)
        } else {
            Ok(())
        }
    }
}

/// The producer ring.
pub(crate) struct EventRing {
    slots: Vec<Option<SchedEvent>>,
    wptr: u8,
    rptr: u8,
    len: usize,
}

impl EventRing {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(EVENT_QUEUE_ENTRY_NUM);
        slots.resize_with(EVENT_QUEUE_ENTRY_NUM, || None);
        Self {
            slots,
            wptr: 0,
            rptr: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: SchedEvent) -> Result<(), GvError> {
        if self.len == EVENT_QUEUE_ENTRY_NUM {
            return Err(GvError::QueueFull);
        }
        self.slots[self.wptr as usize] = Some(event);
        self.wptr = self.wptr.wrapping_add(1);
        self.len += 1;
        Ok(())
    }

    fn pop_all(&mut self) -> Vec<SchedEvent> {
        let mut out = Vec::with_capacity(self.len);
        while self.len > 0 {
            if let Some(event) = self.slots[self.rptr as usize].take() {
                out.push(event);
            }
            self.rptr = self.rptr.wrapping_add(1);
            self.len -= 1;
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn contains(&self, idx_vf: VfIdx, id: EventId) -> bool {
        let mut idx = self.rptr;
        for _ in 0..self.len {
            if let Some(event) = &self.slots[idx as usize]
                && event.id == id
                && event.idx_vf == idx_vf
            {
                return true;
            }
            idx = idx.wrapping_add(1);
        }
        false
    }

    /// Marks matching queued events `Finished` in place.
    fn mark_finished(&mut self, id: EventId) {
        let mut idx = self.rptr;
        for _ in 0..self.len {
            if let Some(event) = &mut self.slots[idx as usize]
                && event.id == id
            {
                event.status = EventStatus::Finished;
            }
            idx = idx.wrapping_add(1);
        }
    }
}

/// Live-update phase, gating which events may run while suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveUpdateState {
    /// Normal operation.
    #[default]
    None,
    /// Exporting state for handover.
    Save,
    /// Importing state after handover.
    Restore,
}

/// Everything owned by the event worker.
pub struct SchedState {
    pub(crate) lists: [VecDeque<SchedEvent>; EVENT_LIST_NUM],
    pub(crate) ws: WorldSwitchSet,
    /// Defers all but a whitelist of events (suspend / power saving).
    pub(crate) lock_world_switch: bool,
    pub(crate) in_live_debugging: bool,
    pub(crate) live_update: LiveUpdateState,
    pub(crate) fa: FullAccessState,
}

impl SchedState {
    pub(crate) fn new(ws: WorldSwitchSet, allow_time_full_access_us: u64, per_partition: bool) -> Self {
        Self {
            lists: Default::default(),
            ws,
            lock_world_switch: false,
            in_live_debugging: false,
            live_update: LiveUpdateState::None,
            fa: FullAccessState::new(allow_time_full_access_us, per_partition),
        }
    }
}

/// What a handler tells the worker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerCtl {
    /// Free the event and keep draining.
    Continue,
    /// Free the event and stop draining, then look for fresh events.
    StopAndRelease,
    /// The event was pushed back; stop draining without freeing it.
    StopAndKeep,
}

impl Adapter {
    /// Queues a fire-and-forget event.
    pub fn queue_event(
        &self,
        idx_vf: VfIdx,
        id: EventId,
        sched_block: SchedBlock,
    ) -> Result<(), GvError> {
        self.queue_event_ex(idx_vf, id, sched_block, EventPayload::None)
    }

    /// Queues an event with a payload.
    pub fn queue_event_ex(
        &self,
        idx_vf: VfIdx,
        id: EventId,
        sched_block: SchedBlock,
        payload: EventPayload,
    ) -> Result<(), GvError> {
        self.sanitize_queue_event(idx_vf, id, &payload)?;
        self.queue_event_push(idx_vf, id, sched_block, payload, None)
    }

    /// Queues an event and blocks until the worker completed it.
    ///
    /// Must not be called from the worker thread itself; that would
    /// deadlock, so it fails immediately instead.
    pub fn queue_event_and_wait_ex(
        &self,
        idx_vf: VfIdx,
        id: EventId,
        sched_block: SchedBlock,
        payload: EventPayload,
    ) -> Result<(), GvError> {
        self.sanitize_queue_event(idx_vf, id, &payload)?;

        if self.is_worker_thread() {
            error!("recursive queue_event_and_wait on the event worker");
            return Err(GvError::Failure);
        }

        let signal = Arc::new(EventSignal::new(self.shim.create_event()));
        self.queue_event_push(idx_vf, id, sched_block, payload, Some(signal.clone()))?;
        signal.wait()
    }

    fn queue_event_push(
        &self,
        idx_vf: VfIdx,
        id: EventId,
        sched_block: SchedBlock,
        payload: EventPayload,
        signal: Option<Arc<EventSignal>>,
    ) -> Result<(), GvError> {
        if id.log_at_info() {
            debug!("queue {id:?} request from fcn {idx_vf} for {sched_block:?}");
        }
        if id.pf_only() && idx_vf != PF_IDX {
            error!("{id:?} queued with a non-PF function index {idx_vf}");
        }

        if self.is_in_powersaving.load(Ordering::Acquire) && id != EventId::ExitPowerSaving {
            info!("queue {id:?} request from fcn {idx_vf} denied in power saving");
            return Err(GvError::Failure);
        }

        let event = SchedEvent {
            idx_vf,
            id,
            sched_block,
            timestamp: self.now(),
            signal,
            payload,
            status: EventStatus::Normal,
        };

        {
            let mut ring = self.queue.lock();
            if let Err(e) = ring.push(event) {
                self.put_error(PF_IDX, GvError::QueueFull, id as u64);
                return Err(e);
            }
        }

        self.event.signal();
        Ok(())
    }

    fn allow_queue_in_unrecov_err(&self, id: EventId, payload: &EventPayload) -> bool {
        // Chain resets from peer adapters must get through, and a small
        // set of monitor queries stays usable on a bad GPU.
        const GPUMON_UNRECOV_WHITELIST: [u32; 3] = [1, 2, 7];

        match (id, payload) {
            (EventId::SchedForceResetGpuInternal, _) => true,
            (EventId::SchedGpumon, EventPayload::Gpumon { query }) => {
                GPUMON_UNRECOV_WHITELIST.contains(query)
            }
            _ => false,
        }
    }

    /// Queue-time sanitation: adapter status, then the guard ladder.
    fn sanitize_queue_event(
        &self,
        idx_vf: VfIdx,
        id: EventId,
        payload: &EventPayload,
    ) -> Result<(), GvError> {
        if self.is_unrecov_err() && !self.allow_queue_in_unrecov_err(id, payload) {
            return Err(GvError::BadGpu);
        }

        if !id.is_guest_request() {
            return Ok(());
        }
        let guard = &self.array_vf[idx_vf].guard;
        let now = self.now();

        match id {
            EventId::ReqGpuInit | EventId::ReqGpuReset | EventId::ReqGpuDebug => {
                if guard.add_event(GuardEventKind::ExclusiveMod, now)
                    == Err(GvError::GuestAbuse)
                {
                    self.put_error(idx_vf, GvError::GuestAbuse, id as u64);
                    return Err(GvError::GuestAbuse);
                }
            }
            EventId::ReqGpuFini => {
                let ret = guard.add_event(GuardEventKind::ExclusiveMod, now);
                if !self.array_vf[idx_vf].is(VfState::Active) && ret == Err(GvError::GuestAbuse) {
                    self.put_error(idx_vf, GvError::GuestAbuse, id as u64);
                    return Err(GvError::GuestAbuse);
                }
            }
            _ => {}
        }

        if guard.event_state(GuardEventKind::ExclusiveTimeout) != GuardEventState::Normal {
            self.put_error(idx_vf, GvError::GuestAbuse, id as u64);
            return Err(GvError::GuestAbuse);
        }

        if matches!(id, EventId::ReqGpuInit | EventId::ReqGpuReset)
            && guard.event_state(GuardEventKind::Flr) == GuardEventState::Overflow
        {
            self.put_error(idx_vf, GvError::GuestAbuse, id as u64);
            return Err(GvError::GuestAbuse);
        }

        Ok(())
    }

    fn is_worker_thread(&self) -> bool {
        self.worker_thread_id.load(Ordering::Acquire) == self.shim.thread_id()
    }

    /// Distributes freshly drained events into the priority lists,
    /// dropping older duplicates per the dedup rule.
    fn arrange_event_list(&self, state: &mut SchedState, drained: Vec<SchedEvent>) {
        for event in drained {
            let list_idx = event.id.list();
            if event.id.dedup() {
                state.lists[list_idx].retain(|old| {
                    if old.idx_vf == event.idx_vf {
                        if let Some(signal) = &old.signal {
                            signal.complete_skipped();
                        }
                        false
                    } else {
                        true
                    }
                });
            }
            state.lists[list_idx].push_back(event);
        }
    }

    /// Pops the next event in priority order, arranging fresh ring
    /// entries first.
    fn pick_up_next_event(&self, state: &mut SchedState) -> Option<SchedEvent> {
        let drained = {
            let mut ring = self.queue.lock();
            if ring.is_empty() {
                Vec::new()
            } else {
                ring.pop_all()
            }
        };
        if !drained.is_empty() {
            self.arrange_event_list(state, drained);
        }

        state
            .lists
            .iter_mut()
            .find(|list| !list.is_empty())
            .and_then(VecDeque::pop_front)
    }

    /// Returns a deferred event to the head of its home list; it will be
    /// re-picked once the worker resumes.
    pub(crate) fn push_back_event(&self, state: &mut SchedState, event: SchedEvent) {
        if event.id.log_at_info() {
            info!("defer {:?} from fcn {}", event.id, event.idx_vf);
        }
        state.lists[event.id.list()].push_front(event);
    }

    /// Marks the post-reset stale set `Finished` in the lists and the
    /// ring so waiters observe "skipped" instead of acting on a dead GPU
    /// state.
    pub(crate) fn remove_stale_events_after_wgr(&self, state: &mut SchedState) {
        let mut ring = self.queue.lock();
        for list in &mut state.lists {
            for event in list.iter_mut() {
                if event.id.stale_after_wgr() {
                    event.status = EventStatus::Finished;
                }
            }
        }
        for id in [
            EventId::SchedForceResetGpu,
            EventId::SchedForceResetGpuInternal,
            EventId::SchedRasPoisonConsumption,
            EventId::SchedRasPoisonCreation,
            EventId::VfReqRasErrorCount,
            EventId::VfReqRasCperDump,
        ] {
            ring.mark_finished(id);
        }
    }

    fn release_event(&self, event: SchedEvent) {
        if let Some(signal) = &event.signal {
            signal.complete();
        }
    }

    fn skip_event(&self, event: SchedEvent) {
        if let Some(signal) = &event.signal {
            signal.complete_skipped();
        }
    }

    /// Drains and dispatches events until a handler stops the loop or
    /// the lists run dry.
    pub(crate) fn process_event(&self, state: &mut SchedState) {
        loop {
            while let Some(event) = self.pick_up_next_event(state) {
                if event.status == EventStatus::Finished {
                    debug!("skip stale event {:?}", event.id);
                    self.skip_event(event);
                    continue;
                }

                // Events queued before an unrecoverable error still sit in
                // the lists; drop everything not owned by the PF.
                if self.is_unrecov_err() && event.idx_vf != PF_IDX {
                    warn!(
                        "unrecoverable error before handling {:?} from fcn {}, dropping",
                        event.id, event.idx_vf
                    );
                    self.skip_event(event);
                    continue;
                }

                if event.id.log_at_info() {
                    info!(
                        "process {:?} request from fcn {} for {:?}",
                        event.id, event.idx_vf, event.sched_block
                    );
                }

                // REQ_GPU_INIT_DATA then REQ_GPU_INIT is the expected
                // sequence; any other event for the VF breaks it.
                let slot = &self.array_vf[event.idx_vf.min(PF_IDX)];
                if slot.gpu_init_data_ready.load(Ordering::Acquire)
                    && event.id != EventId::ReqGpuInit
                {
                    slot.gpu_init_data_ready.store(false, Ordering::Release);
                }

                let ctl = if self.shares_engine_with_full_access(state, event.idx_vf) {
                    self.handle_event_in_full_access(state, &event)
                } else {
                    self.handle_event_in_non_full_access(state, &event)
                };

                match ctl {
                    HandlerCtl::StopAndRelease => {
                        self.release_event(event);
                        break;
                    }
                    HandlerCtl::StopAndKeep => break,
                    HandlerCtl::Continue => self.release_event(event),
                }
            }

            if state.lock_world_switch || self.queue.lock().is_empty() {
                break;
            }
        }

        // Re-activate world switching unless the scheduler is locked or an
        // exclusive window is open.
        if self.status() == AdapterStatus::HwInit
            && !state.lock_world_switch
            && !state.fa.any_full_access()
        {
            if state.fa.per_partition {
                for idx_vf in 0..self.num_vf() {
                    if !self.shares_engine_with_full_access(state, idx_vf) {
                        self.sched_start(state, idx_vf);
                    }
                }
            } else {
                self.sched_start_all(state);
            }
        }
    }

    /// One worker iteration: drain events, then police the full-access
    /// deadline. Returns how long the worker may sleep.
    pub fn process_pending(&self) -> Option<u64> {
        let mut state = self.state.lock();
        self.process_event(&mut state);

        match self.full_access_check_and_process(&mut state) {
            (FullAccessStatus::TimedOut, _) => Some(0),
            (FullAccessStatus::OnGoing, remain) => Some(remain),
            (FullAccessStatus::NotEntered, _) => None,
        }
    }

    /// Parks the calling thread as this adapter's event worker until
    /// `stop_event_worker` is called.
    pub fn run_event_worker(&self) {
        self.worker_thread_id
            .store(self.shim.thread_id(), Ordering::Release);
        info!("event worker running");

        while !self.worker_stop.load(Ordering::Acquire) {
            let timeout = self.process_pending();
            match timeout {
                Some(0) => continue,
                Some(us) => {
                    self.event.wait(us);
                }
                None => {
                    self.event.wait(0);
                }
            }
        }

        info!("event worker exiting");
        self.worker_thread_id.store(0, Ordering::Release);
    }

    /// Stops the event worker and completes all outstanding events with
    /// the skipped flag.
    pub fn stop_event_worker(&self) {
        self.worker_stop.store(true, Ordering::Release);
        self.event.signal_forever();

        let mut state = self.state.lock();
        let drained = self.queue.lock().pop_all();
        self.arrange_event_list(&mut state, drained);
        while let Some(event) = state
            .lists
            .iter_mut()
            .find(|list| !list.is_empty())
            .and_then(VecDeque::pop_front)
        {
            info!(
                "skipped {:?} request from fcn {} due to driver unload",
                event.id, event.idx_vf
            );
            self.skip_event(event);
        }
    }

    /// Whether an event for `idx_vf` is still sitting in the producer
    /// ring.
    pub(crate) fn queued_event_pending(&self, idx_vf: VfIdx, id: EventId) -> bool {
        self.queue.lock().contains(idx_vf, id)
    }

    /// Moves everything from the producer ring into the priority lists
    /// without dispatching; used by live-update export.
    pub(crate) fn drain_ring_into_lists(&self, state: &mut SchedState) {
        let drained = self.queue.lock().pop_all();
        self.arrange_event_list(state, drained);
    }

    fn sched_enter_power_saving(&self, state: &mut SchedState) -> Result<(), GvError> {
        for idx_vf in 0..self.num_vf() {
            if self.array_vf[idx_vf].is(VfState::Active) {
                return Err(GvError::Busy);
            }
        }

        self.sched_stop_all(state);
        state.lock_world_switch = true;

        // The PF context is invalid after BACO; mark it shut down.
        for ws_id in 0..state.ws.world_switches.len() {
            let curr = state.ws.world_switches[ws_id].curr_idx_vf;
            if curr != PF_IDX {
                let _ = self.ws_switch_to_vf(state, ws_id, PF_IDX);
            }
        }
        for hw in &mut state.ws.hw_scheds {
            hw.cur_vf_state[PF_IDX] = world_switch::VfGpuState::Shutdown;
            hw.cur_gpu_state = world_switch::VfGpuState::Shutdown;
        }
        state.ws.clear_state_for_reset();

        let ret = self.asic.enter_power_saving();
        match ret {
            Ok(()) => {
                self.is_in_powersaving.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                if !self.is_unrecov_err() {
                    state.lock_world_switch = false;
                }
                Err(e)
            }
        }
    }

    fn sched_exit_power_saving(&self, state: &mut SchedState) -> Result<(), GvError> {
        let ret = self.asic.exit_power_saving();
        if ret.is_ok() {
            self.is_in_powersaving.store(false, Ordering::Release);
            state.lock_world_switch = false;
        }
        ret
    }

    /// Dispatch table outside exclusive mode.
    pub(crate) fn handle_event_in_non_full_access(
        &self,
        state: &mut SchedState,
        event: &SchedEvent,
    ) -> HandlerCtl {
        use event::EventId::*;

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
            && !matches!(event.id, SchedResume | ExitPowerSaving | SchedResumeLive)
            && !(state.in_live_debugging && event.id == RelGpuDebug)
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
            ReqGpuInitData => {
                if self.flags().contains(crate::config::AdapterFlags::VF_FB_PROTECTION) {
                    let _ = self
                        .asic
                        .set_vf_access(event.idx_vf, crate::asic::VfAccess::FB, true);
                }
                self.stage_init_data(event.idx_vf);
                self.array_vf[event.idx_vf]
                    .gpu_init_data_ready
                    .store(true, Ordering::Release);
                self.notify_vf_init_data_ready(event.idx_vf);
                self.asic.clean_scratch_registers(event.idx_vf);
                HandlerCtl::Continue
            }

            ReqGpuFini => {
                // Only an active VF can tear itself down.
                if !self.array_vf[event.idx_vf].is(VfState::Active) {
                    warn!(
                        "REQ_GPU_FINI is not valid for non-active fcn {}",
                        event.idx_vf
                    );
                    return HandlerCtl::Continue;
                }
                if self.enter_full_access(state, event).is_ok() {
                    HandlerCtl::StopAndRelease
                } else {
                    HandlerCtl::Continue
                }
            }

            ReqGpuInit => {
                if self.array_vf[event.idx_vf].is(VfState::Unavail) {
                    debug!(
                        "REQ_GPU_INIT is not valid for unavailable fcn {}",
                        event.idx_vf
                    );
                    return HandlerCtl::Continue;
                }
                if self.enter_full_access(state, event).is_ok() {
                    HandlerCtl::StopAndRelease
                } else {
                    HandlerCtl::Continue
                }
            }

            ReqGpuReset => {
                let slot = &self.array_vf[event.idx_vf];
                if !slot.is(VfState::Avail) && !slot.is(VfState::Active) {
                    debug!(
                        "fcn {} must be active or available for REQ_GPU_RESET",
                        event.idx_vf
                    );
                    return HandlerCtl::Continue;
                }
                if self.enter_full_access(state, event).is_ok() {
                    HandlerCtl::StopAndRelease
                } else {
                    HandlerCtl::Continue
                }
            }

            RelGpuInit | RelGpuFini => HandlerCtl::Continue,

            SchedSuspend => {
                if state.lock_world_switch {
                    return HandlerCtl::StopAndRelease;
                }
                self.sched_stop_all(state);
                if !state.ws.all_states_ok() {
                    let _ = self.sched_reset_vf_auto(state);
                }
                state.lock_world_switch = true;
                HandlerCtl::StopAndRelease
            }

            SchedSuspendLive => {
                self.sched_stop_all(state);
                if !state.ws.all_states_ok() {
                    let _ = self.sched_reset_vf_auto(state);
                }
                state.lock_world_switch = true;
                HandlerCtl::StopAndRelease
            }

            SchedResumeLive | SchedResume => {
                if event.id == SchedResumeLive {
                    for ws in &mut state.ws.world_switches {
                        ws.switch_running = true;
                    }
                }
                state.lock_world_switch = false;
                HandlerCtl::StopAndRelease
            }

            SchedInitVfFb => {
                self.sched_stop(state, event.idx_vf);
                if !self.sched_is_state_ok(state, event.idx_vf) {
                    let _ = self.sched_reset_vf_auto(state);
                }
                if self
                    .context_switch_to_vf(state, PF_IDX, SchedBlock::Gfx)
                    .is_err()
                {
                    let _ = self.sched_reset_vf_auto(state);
                }
                if let event::EventPayload::VfFb { pattern, .. } = &event.payload
                    && self.init_vf_fb(event.idx_vf, *pattern).is_err()
                {
                    warn!("failed to init vf fb");
                }
                if self
                    .context_save(state, event.idx_vf, SchedBlock::Gfx)
                    .is_err()
                {
                    let _ = self.sched_reset_vf_auto(state);
                }
                HandlerCtl::Continue
            }

            SchedForceResetVf => {
                if !self.array_vf[event.idx_vf].is(VfState::Active) {
                    debug!("ignore FORCE_RESET_VF for non-active fcn {}", event.idx_vf);
                    return HandlerCtl::Continue;
                }
                self.sched_stop(state, event.idx_vf);
                if !self.sched_is_state_ok(state, event.idx_vf) {
                    let _ = self.sched_reset_vf_auto(state);
                }
                if self.array_vf[event.idx_vf].is(VfState::Active) {
                    if self
                        .context_switch_to_vf(state, event.idx_vf, SchedBlock::All)
                        .is_err()
                    {
                        let _ = self.sched_reset_vf_auto(state);
                    }
                    let _ = self.sched_reset_vf(state, event.idx_vf, SchedBlock::All);
                    self.sched_remove_vf(state, event.idx_vf);
                }
                let _ = self.array_vf[event.idx_vf].state.set(VfState::Avail);
                HandlerCtl::Continue
            }

            SchedResetVf => {
                // Sent by the scheduler itself; a VF already back in
                // `Avail` was reset on another path meanwhile.
                if self.array_vf[event.idx_vf].is(VfState::Avail) {
                    return HandlerCtl::Continue;
                }
                self.sched_stop(state, event.idx_vf);
                if !self.sched_is_state_ok(state, event.idx_vf) {
                    let _ = self.sched_reset_vf_auto(state);
                }
                HandlerCtl::Continue
            }

            HwSchedResetVf => {
                let use_pf = self.flags().contains(crate::config::AdapterFlags::USE_PF);
                if !(use_pf && event.idx_vf == PF_IDX)
                    && !self.array_vf[event.idx_vf].is(VfState::Active)
                {
                    debug!(
                        "ignore HW_SCHED_RESET_VF for non-active fcn {}",
                        event.idx_vf
                    );
                    return HandlerCtl::Continue;
                }

                // The reporting engine is already hung; latch it so the
                // stop pass does not time out again.
                let mask = self.ws_mask_for_vf(event.idx_vf);
                for ws in &mut state.ws.world_switches {
                    if mask & (1 << ws.id) != 0
                        && ws.switch_running
                        && ws.sched_block == event.sched_block
                    {
                        ws.curr_vf_state = world_switch::VfContextState::Abnormal;
                    }
                }

                self.sched_stop(state, event.idx_vf);
                let _ = self.sched_reset_vf_auto(state);
                HandlerCtl::Continue
            }

            SchedSuspendVf => {
                if self.array_vf[event.idx_vf].is(VfState::Active) {
                    let _ = self.array_vf[event.idx_vf].state.set(VfState::Suspended);
                    self.sched_stop(state, event.idx_vf);
                    self.sched_remove_vf(state, event.idx_vf);
                } else {
                    warn!("cannot suspend non-active fcn {}", event.idx_vf);
                }
                HandlerCtl::Continue
            }

            SchedResumeVf => {
                if self.array_vf[event.idx_vf].is(VfState::Suspended) {
                    self.sched_stop(state, event.idx_vf);
                    if self.sched_add_vf(state, event.idx_vf).is_ok()
                        && event.idx_vf != PF_IDX
                        && self.update_pf2vf_message(event.idx_vf).is_err()
                    {
                        warn!("update pf2vf message failed");
                    }
                } else {
                    warn!("resuming non-suspended fcn {}", event.idx_vf);
                }
                HandlerCtl::Continue
            }

            SchedRemoveVf => {
                if self.array_vf[event.idx_vf].is(VfState::Active) {
                    self.sched_remove_vf(state, event.idx_vf);
                }
                let _ = self.array_vf[event.idx_vf].state.set(VfState::Unavail);
                HandlerCtl::Continue
            }

            SchedForceResetGpu | SchedForceResetGpuInternal => {
                self.sched_stop_all(state);
                let reset_all = event.id == SchedForceResetGpu;
                if self.sched_gpu_reset_wrap(state, reset_all).is_ok() {
                    info!("finish whole gpu reset requested by fcn {}", event.idx_vf);
                }
                if self.xgmi_node_count() == 1 {
                    self.in_ecc_recovery.store(false, Ordering::Release);
                }
                HandlerCtl::Continue
            }

            SchedStopVf => {
                if self.array_vf[event.idx_vf].is(VfState::Active) {
                    self.sched_stop(state, event.idx_vf);
                    if !self.sched_is_state_ok(state, event.idx_vf) {
                        debug!("hang detected while stopping fcn {}", event.idx_vf);
                        let _ = self.sched_reset_vf_auto(state);
                    }
                    self.sched_remove_vf(state, event.idx_vf);
                    let _ = self.sched_shutdown_vf(state, event.idx_vf);
                } else if self.array_vf[event.idx_vf].is(VfState::Suspended) {
                    let _ = self.sched_shutdown_vf(state, event.idx_vf);
                }
                self.array_vf[event.idx_vf]
                    .unshutdown
                    .store(false, Ordering::Release);
                let _ = self.array_vf[event.idx_vf].state.set(VfState::Avail);
                HandlerCtl::Continue
            }

            HandleCrash => {
                self.sched_stop(state, event.idx_vf);
                if !self.sched_is_state_ok(state, event.idx_vf) {
                    debug!("hang detected while stopping fcn {}", event.idx_vf);
                    let _ = self.sched_reset_vf_auto(state);
                }
                if self.handle_orphan_vf(state, event.idx_vf).is_err() {
                    warn!("failed to reset orphan fcn {}", event.idx_vf);
                    let _ = self.sched_reset_vf_auto(state);
                }
                self.array_vf[event.idx_vf]
                    .unshutdown
                    .store(false, Ordering::Release);
                HandlerCtl::Continue
            }

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

            SchedFwLiveUpdateDfc => {
                if self.asic.live_update_fw().is_err() {
                    warn!("DFC firmware live update failed");
                }
                HandlerCtl::Continue
            }

            SchedGpumon => {
                if self.in_xgmi_chain_reset.load(Ordering::Acquire) {
                    self.push_back_event(state, event.clone());
                    HandlerCtl::StopAndKeep
                } else {
                    debug!("gpumon query from fcn {}", event.idx_vf);
                    HandlerCtl::Continue
                }
            }

            SchedSetVfAccess => {
                if let event::EventPayload::VfAccess { select, enable } = &event.payload {
                    let _ = self.asic.set_vf_access(event.idx_vf, *select, *enable);
                }
                HandlerCtl::Continue
            }

            SchedPspVfGate => {
                self.sched_stop_all(state);
                if let event::EventPayload::PspVfGate { vf_select, enable } = &event.payload {
                    for idx_vf in 0..self.num_vf() {
                        if *vf_select & (1 << idx_vf) != 0
                            && self.asic.set_psp_mb_int(idx_vf, !*enable).is_err()
                        {
                            warn!("failed to gate PSP mailbox of fcn {idx_vf}");
                        }
                    }
                }
                HandlerCtl::Continue
            }

            SchedMmschGeneralNotification => {
                let _ = self.asic.mmsch_read_output(event.idx_vf, event.sched_block);
                HandlerCtl::Continue
            }

            SchedPspVfCmdRelay => {
                if self.asic.psp_vf_cmd_relay(event.idx_vf).is_err() {
                    warn!("psp command relay failed for fcn {}", event.idx_vf);
                }
                HandlerCtl::Continue
            }

            CollectDiagData => {
                self.collect_diag_data(event);
                HandlerCtl::Continue
            }

            ExitPowerSaving => {
                if self.sched_exit_power_saving(state).is_err() {
                    error!("failed to exit power saving");
                }
                HandlerCtl::Continue
            }

            EnterPowerSaving => match self.sched_enter_power_saving(state) {
                Ok(()) => HandlerCtl::StopAndRelease,
                Err(_) => {
                    error!("failed to enter power saving");
                    HandlerCtl::Continue
                }
            },

            SchedUpdateTopology => {
                let _ = self.asic.update_topology();
                HandlerCtl::Continue
            }
            SchedGetTopology => {
                let _ = self.asic.get_topology();
                HandlerCtl::Continue
            }

            CurVfCtxEmpty => {
                self.sched_signal_vf_idle(state);
                HandlerCtl::Continue
            }

            SchedUpdateMcaBanks => {
                if let event::EventPayload::McaBank { kind } = &event.payload {
                    self.mca_get_new_banks(*kind);
                }
                HandlerCtl::Continue
            }

            SchedRma => {
                self.handle_rma_event(state);
                HandlerCtl::Continue
            }

            VfReqRasErrorCount => {
                let _ = self.handle_vf_req_ras_error_count(state, event.idx_vf);
                HandlerCtl::Continue
            }
            VfReqRasCperDump => {
                let rptr = match &event.payload {
                    event::EventPayload::CperDump { rptr } => *rptr,
                    _ => 0,
                };
                let _ = self.handle_vf_req_cper_dump(state, event.idx_vf, rptr);
                HandlerCtl::Continue
            }

            ReqGpuDebug => {
                if state.in_live_debugging {
                    warn!("already have one vf in live debug mode");
                    return HandlerCtl::Continue;
                }
                self.sched_stop_all(state);
                if self
                    .context_switch_to_vf(state, event.idx_vf, SchedBlock::All)
                    .is_ok()
                {
                    self.toggle_full_access_for_debug(state, event.idx_vf, true);
                    state.in_live_debugging = true;
                    state.lock_world_switch = true;
                }
                HandlerCtl::Continue
            }

            RelGpuDebug => {
                if !state.in_live_debugging {
                    warn!("vf is not in live debug mode");
                    return HandlerCtl::Continue;
                }
                self.toggle_full_access_for_debug(state, event.idx_vf, false);
                state.in_live_debugging = false;
                state.lock_world_switch = false;
                HandlerCtl::Continue
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_events_for_test(&self) -> Vec<SchedEvent> {
        let mut ring = self.queue.lock();
        let events = ring.pop_all();
        for event in &events {
            ring.push(event.clone()).unwrap();
        }
        events
    }

    #[cfg(test)]
    pub(crate) fn queued_event_ids_for_test(&self) -> Vec<EventId> {
        self.queued_events_for_test()
            .iter()
            .map(|event| event.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;

    /// The ring holds exactly `EVENT_QUEUE_ENTRY_NUM` events.
    #[test]
    fn queue_bound_is_enforced() {
        let (adapter, _asic) = test_adapter(2);

        for _ in 0..EVENT_QUEUE_ENTRY_NUM {
            adapter
                .queue_event(PF_IDX, EventId::SchedGpumon, SchedBlock::All)
                .unwrap();
        }
        assert_eq!(
            adapter.queue_event(PF_IDX, EventId::SchedGpumon, SchedBlock::All),
            Err(GvError::QueueFull)
        );
    }

    /// The exclusive-mode guard rejects the 10th entry request inside
    /// one window, at queue time, with no event queued.
    #[test]
    fn guard_rejects_the_tenth_exclusive_request() {
        let (adapter, _asic) = test_adapter(3);
        adapter.array_vf[2].state.set(VfState::Avail).unwrap();

        for _ in 0..9 {
            adapter
                .queue_event(2, EventId::ReqGpuInit, SchedBlock::All)
                .unwrap();
        }
        assert_eq!(
            adapter.queue_event(2, EventId::ReqGpuInit, SchedBlock::All),
            Err(GvError::GuestAbuse)
        );
        assert_eq!(adapter.queued_event_ids_for_test().len(), 9);
    }

    #[test]
    fn dedup_drops_the_older_event_for_the_same_vf() {
        let (adapter, _asic) = test_adapter(2);
        adapter
            .queue_event(PF_IDX, EventId::SchedGpumon, SchedBlock::All)
            .unwrap();
        adapter
            .queue_event(PF_IDX, EventId::SchedGpumon, SchedBlock::All)
            .unwrap();
        adapter
            .queue_event(0, EventId::SchedGpumon, SchedBlock::All)
            .unwrap();

        let mut state = adapter.state.lock();
        let drained = adapter.queue.lock().pop_all();
        adapter.arrange_event_list(&mut state, drained);
        // One PF entry survived, plus the VF0 entry.
        assert_eq!(state.lists[EventId::SchedGpumon.list()].len(), 2);
    }

    #[test]
    fn events_drain_in_priority_order() {
        let (adapter, _asic) = test_adapter(2);
        adapter
            .queue_event(0, EventId::SchedGpumon, SchedBlock::All)
            .unwrap();
        adapter
            .queue_event(0, EventId::SchedSuspendVf, SchedBlock::All)
            .unwrap();
        adapter
            .queue_event(PF_IDX, EventId::SchedForceResetGpu, SchedBlock::All)
            .unwrap();

        let mut state = adapter.state.lock();
        let first = adapter.pick_up_next_event(&mut state).unwrap();
        assert_eq!(first.id, EventId::SchedForceResetGpu);
        let second = adapter.pick_up_next_event(&mut state).unwrap();
        assert_eq!(second.id, EventId::SchedSuspendVf);
        let third = adapter.pick_up_next_event(&mut state).unwrap();
        assert_eq!(third.id, EventId::SchedGpumon);
    }

    #[test]
    fn stale_marking_covers_lists_and_ring() {
        let (adapter, _asic) = test_adapter(2);

        // One already distributed, one still in the ring.
        adapter
            .queue_event_ex(
                0,
                EventId::VfReqRasCperDump,
                SchedBlock::All,
                EventPayload::CperDump { rptr: 0 },
            )
            .unwrap();
        {
            let mut state = adapter.state.lock();
            let drained = adapter.queue.lock().pop_all();
            adapter.arrange_event_list(&mut state, drained);
        }
        adapter
            .queue_event(PF_IDX, EventId::SchedForceResetGpu, SchedBlock::All)
            .unwrap();

        let mut state = adapter.state.lock();
        adapter.remove_stale_events_after_wgr(&mut state);

        let listed = &state.lists[EventId::VfReqRasCperDump.list()][0];
        assert_eq!(listed.status, EventStatus::Finished);
        drop(state);

        let ring_events = adapter.queued_events_for_test();
        assert_eq!(ring_events[0].status, EventStatus::Finished);
    }

    #[test]
    fn unrecoverable_error_rejects_all_but_the_whitelist() {
        let (adapter, _asic) = test_adapter(2);
        adapter.set_status(AdapterStatus::HwRma);

        assert_eq!(
            adapter.queue_event(0, EventId::SchedResetVf, SchedBlock::All),
            Err(GvError::BadGpu)
        );
        assert!(
            adapter
                .queue_event(
                    PF_IDX,
                    EventId::SchedForceResetGpuInternal,
                    SchedBlock::All
                )
                .is_ok()
        );
    }
}
