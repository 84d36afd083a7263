// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The VF<->PF mailbox: a 4-DWORD register buffer per VF with a
//! VALID/ACK handshake.
//!
//! Incoming messages are decoded in interrupt context into scheduler
//! events; every one of them charges the sender's `ALL_INT` guard.
//! Outgoing notifications optionally raise VALID and wait for the guest's
//! acknowledgement with a bounded timeout.

use crate::adapter::Adapter;
use crate::config::TIMEOUT_MAILBOX_ACK_US;
use crate::error::GvError;
use crate::guard::GuardEventKind;
use crate::ras::RasBlock;
use crate::sched::event::{EventId, EventPayload, SchedBlock};
use crate::shim::wait_for;
use crate::vf::{MAX_VF_SLOT, VfIdx, VfState, is_idx_invalid};
use core::sync::atomic::Ordering;
use log::{debug, info, warn};
use num_enum::TryFromPrimitive;
use spin::mutex::SpinMutex;

/// Mailbox message length in DWORDs.
pub const MAILBOX_DATA_LEN: usize = 4;

/// Message ids a guest may send to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum RcvMsg {
    /// Request exclusive access for first init.
    ReqGpuInitAccess = 1,
    /// Release exclusive access after init.
    RelGpuInitAccess = 2,
    /// Request exclusive access for a guest-initiated reset.
    ReqGpuResetAccess = 3,
    /// Request exclusive access for teardown.
    ReqGpuFiniAccess = 4,
    /// Release exclusive access after teardown.
    RelGpuFiniAccess = 5,
    /// Ask the host to stage init data into the VF's FB.
    ReqGpuInitData = 6,
    /// Acknowledge a pending FLR notification.
    ReadyToReset = 7,
    /// Free-form guest log line.
    TextMessage = 8,
    /// Guest-reported error for the host error ring.
    LogVfError = 9,
    /// Poison consumption report; DW1 carries the block.
    RasPoison = 10,
    /// Request RAS error counters.
    ReqRasErrorCount = 11,
    /// Request a CPER dump; DW1/DW2 carry the guest read pointer.
    ReqRasCperDump = 12,
    /// Request exclusive access for live debugging.
    ReqGpuDebug = 13,
    /// Release live-debug exclusive access.
    RelGpuDebug = 14,
}

/// Message ids the host sends to a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrnMsg {
    /// Exclusive access granted.
    ReadyToAccessGpu = 1,
    /// An FLR is about to happen.
    FlrNotification = 2,
    /// The FLR finished.
    FlrNotificationCompletion = 3,
    /// Generic failure notification.
    Fail = 4,
    /// Init data staged in FB.
    GpuInitDataReady = 5,
    /// Poison report handled.
    RasPoisonReady = 6,
    /// Error counters staged in FB.
    RasErrorCountReady = 7,
    /// CPER records staged in FB.
    CperDumpReady = 8,
    /// The GPU is terminally bad.
    GpuRma = 9,
    /// Soft PF FLR announcement.
    PfSoftFlrNotification = 10,
    /// Another VF entered live debugging; stop submitting.
    GpuDebugNotification = 11,
    /// Live debugging ended.
    GpuDebugComplete = 12,
}

#[derive(Debug, Clone, Copy, Default)]
struct MailboxVfState {
    last_rcv: [u32; MAILBOX_DATA_LEN],
    last_trn: [u32; MAILBOX_DATA_LEN],
    rcv_count: u32,
}

/// Host-side mailbox state for every VF.
pub struct Mailbox {
    state: SpinMutex<[MailboxVfState; MAX_VF_SLOT]>,
}

impl Mailbox {
    /// Empty mailbox state.
    pub fn new() -> Self {
        Self {
            state: SpinMutex::new([MailboxVfState::default(); MAX_VF_SLOT]),
        }
    }

    /// Last messages exchanged with `idx_vf`, `(received, transmitted)`,
    /// for diagnostics.
    pub fn last_msgs(&self, idx_vf: VfIdx) -> ([u32; MAILBOX_DATA_LEN], [u32; MAILBOX_DATA_LEN]) {
        let state = self.state.lock();
        (state[idx_vf].last_rcv, state[idx_vf].last_trn)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter {
    /// Writes `data` into `idx_vf`'s transmit buffer, optionally raising
    /// VALID to interrupt the guest.
    pub(crate) fn mailbox_send_msg(&self, idx_vf: VfIdx, data: &[u32], need_valid: bool) {
        debug_assert!(data.len() <= MAILBOX_DATA_LEN);

        let mut state = self.mailbox.state.lock();
        let mut padded = [0u32; MAILBOX_DATA_LEN];
        padded[..data.len()].copy_from_slice(data);
        state[idx_vf].last_trn = padded;
        drop(state);

        for (offset, &dw) in padded.iter().enumerate() {
            self.asic.mailbox_trn_msg(idx_vf, offset, dw);
        }
        if need_valid {
            self.asic.mailbox_set_valid(idx_vf, true);
        }
    }

    /// Waits for the guest to acknowledge the transmitted message, then
    /// drops VALID. Times out per [`TIMEOUT_MAILBOX_ACK_US`].
    pub(crate) fn mailbox_wait_ack(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        let ret = wait_for(&*self.shim, TIMEOUT_MAILBOX_ACK_US, || {
            self.asic.mailbox_peek_ack(idx_vf)
        });
        self.asic.mailbox_set_valid(idx_vf, false);
        if ret.is_err() {
            self.put_error(idx_vf, GvError::FirmwareTimeout, TrnMsg::ReadyToAccessGpu as u64);
        }
        ret
    }

    fn send_msg_and_wait_ack(&self, idx_vf: VfIdx, data: &[u32]) {
        self.mailbox_send_msg(idx_vf, data, true);
        let _ = self.mailbox_wait_ack(idx_vf);
    }

    /// Notifies `idx_vf` that it holds exclusive access.
    pub(crate) fn notify_vf_full_access(&self, idx_vf: VfIdx) {
        self.send_msg_and_wait_ack(idx_vf, &[TrnMsg::ReadyToAccessGpu as u32, 0, 0]);
    }

    /// Notifies `idx_vf` that its init data is staged.
    pub(crate) fn notify_vf_init_data_ready(&self, idx_vf: VfIdx) {
        self.send_msg_and_wait_ack(idx_vf, &[TrnMsg::GpuInitDataReady as u32, 1]);
    }

    /// Notifies `idx_vf` that its poison report was handled.
    pub(crate) fn notify_vf_ras_poison_ready(&self, idx_vf: VfIdx) {
        self.send_msg_and_wait_ack(idx_vf, &[TrnMsg::RasPoisonReady as u32, 0]);
    }

    /// Notifies `idx_vf` that the requested error counters are staged.
    pub(crate) fn notify_vf_ras_error_count_ready(&self, idx_vf: VfIdx) {
        self.send_msg_and_wait_ack(idx_vf, &[TrnMsg::RasErrorCountReady as u32, 0, 0]);
    }

    /// Notifies `idx_vf` that the requested CPER records are staged.
    pub(crate) fn notify_vf_cper_dump_ready(&self, idx_vf: VfIdx) {
        self.send_msg_and_wait_ack(idx_vf, &[TrnMsg::CperDumpReady as u32, 0, 0]);
    }

    /// Notifies `idx_vf` that its request failed.
    pub(crate) fn notify_vf_fail(&self, idx_vf: VfIdx) {
        self.send_msg_and_wait_ack(idx_vf, &[TrnMsg::Fail as u32, 0, 0]);
    }

    /// Tells other VFs that live debugging started or ended.
    pub(crate) fn notify_gpu_debug(&self, debug_vf: VfIdx, completion: bool) {
        let id = if completion {
            TrnMsg::GpuDebugComplete
        } else {
            TrnMsg::GpuDebugNotification
        };
        for idx_vf in 0..self.num_vf() {
            if idx_vf != debug_vf && self.array_vf[idx_vf].is(VfState::Active) {
                self.mailbox_send_msg(idx_vf, &[id as u32], true);
            }
        }
    }

    /// FLR start/completion notification. During a guest's very first
    /// init no interrupt is raised, the guest polls instead.
    pub(crate) fn reset_notify_vf(&self, idx_vf: VfIdx, completion: bool) {
        let (id, need_valid) = if completion {
            (TrnMsg::FlrNotificationCompletion, false)
        } else {
            let polling = self.array_vf[idx_vf].is(VfState::FullAccess);
            (TrnMsg::FlrNotification, !polling)
        };
        self.mailbox_send_msg(idx_vf, &[id as u32, 0], need_valid);
    }

    /// Terminal RMA announcement.
    pub(crate) fn notify_gpu_rma(&self, idx_vf: VfIdx) {
        self.mailbox_send_msg(idx_vf, &[TrnMsg::GpuRma as u32], false);
    }

    /// Mailbox interrupt entry point, called from the embedder's bottom
    /// half when VF `idx_vf` raised its message-valid bit.
    ///
    /// Decodes the request into a scheduler event. Anything from a slot in
    /// `Unavail`, anything rate-limited, and anything undecodable is
    /// dropped here.
    pub fn handle_mailbox_irq(&self, idx_vf: VfIdx) {
        if is_idx_invalid(idx_vf) {
            return;
        }

        let mut msg = [0u32; MAILBOX_DATA_LEN];
        for (offset, dw) in msg.iter_mut().enumerate() {
            *dw = self.asic.mailbox_rcv_msg(idx_vf, offset);
        }
        self.asic.mailbox_ack_msg(idx_vf);

        {
            let mut state = self.mailbox.state.lock();
            state[idx_vf].last_rcv = msg;
            state[idx_vf].rcv_count = state[idx_vf].rcv_count.wrapping_add(1);
        }

        let slot = &self.array_vf[idx_vf];
        if slot.is(VfState::Unavail) {
            debug!("dropping mailbox message {:#x} from unavailable fcn {idx_vf}", msg[0]);
            return;
        }

        if slot.guard.add_event(GuardEventKind::AllInt, self.now()) == Err(GvError::GuestAbuse) {
            warn!("interrupt storm from fcn {idx_vf}, dropping message {:#x}", msg[0]);
            return;
        }

        let Ok(rcv) = RcvMsg::try_from(msg[0]) else {
            self.put_error(idx_vf, GvError::ProtocolError, u64::from(msg[0]));
            return;
        };

        let ret = match rcv {
            RcvMsg::ReqGpuInitAccess => {
                self.queue_event(idx_vf, EventId::ReqGpuInit, SchedBlock::All)
            }
            RcvMsg::RelGpuInitAccess => {
                self.queue_event(idx_vf, EventId::RelGpuInit, SchedBlock::All)
            }
            RcvMsg::ReqGpuResetAccess => {
                self.queue_event(idx_vf, EventId::ReqGpuReset, SchedBlock::All)
            }
            RcvMsg::ReqGpuFiniAccess => {
                self.queue_event(idx_vf, EventId::ReqGpuFini, SchedBlock::All)
            }
            RcvMsg::RelGpuFiniAccess => {
                self.queue_event(idx_vf, EventId::RelGpuFini, SchedBlock::All)
            }
            RcvMsg::ReqGpuInitData => {
                self.queue_event(idx_vf, EventId::ReqGpuInitData, SchedBlock::All)
            }
            RcvMsg::ReadyToReset => {
                slot.ready_to_reset.store(true, Ordering::Release);
                Ok(())
            }
            RcvMsg::TextMessage => {
                info!("fcn {idx_vf} says: {:#x} {:#x} {:#x}", msg[1], msg[2], msg[3]);
                Ok(())
            }
            RcvMsg::LogVfError => {
                self.put_error(idx_vf, GvError::ProtocolError, u64::from(msg[1]));
                Ok(())
            }
            RcvMsg::RasPoison => {
                let block = decode_ras_block(msg[1]);
                self.queue_event_ex(
                    idx_vf,
                    EventId::SchedRasPoisonConsumption,
                    SchedBlock::All,
                    EventPayload::Poison { block },
                )
            }
            RcvMsg::ReqRasErrorCount => {
                self.queue_event(idx_vf, EventId::VfReqRasErrorCount, SchedBlock::All)
            }
            RcvMsg::ReqRasCperDump => {
                let rptr = u64::from(msg[1]) | (u64::from(msg[2]) << 32);
                self.queue_event_ex(
                    idx_vf,
                    EventId::VfReqRasCperDump,
                    SchedBlock::All,
                    EventPayload::CperDump { rptr },
                )
            }
            RcvMsg::ReqGpuDebug => self.queue_event(idx_vf, EventId::ReqGpuDebug, SchedBlock::All),
            RcvMsg::RelGpuDebug => self.queue_event(idx_vf, EventId::RelGpuDebug, SchedBlock::All),
        };

        if let Err(e) = ret {
            debug!("mailbox request {rcv:?} from fcn {idx_vf} rejected: {e:?}");
        }
    }
}

fn decode_ras_block(raw: u32) -> RasBlock {
    match raw {
        0 => RasBlock::Umc,
        1 => RasBlock::Sdma,
        2 => RasBlock::Gfx,
        3 => RasBlock::Mmhub,
        15 => RasBlock::Vcn,
        16 => RasBlock::Jpeg,
        _ => RasBlock::Umc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;
    use crate::vf::PF_IDX;

    #[test]
    fn incoming_request_becomes_an_event() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();

        asic.inject_rcv_msg(0, [RcvMsg::ReqGpuInitAccess as u32, 0, 0, 0]);
        adapter.handle_mailbox_irq(0);

        let ids = adapter.queued_event_ids_for_test();
        assert_eq!(ids, &[EventId::ReqGpuInit]);
    }

    #[test]
    fn unavailable_vf_messages_are_dropped() {
        let (adapter, asic) = test_adapter(2);

        asic.inject_rcv_msg(1, [RcvMsg::ReqGpuInitAccess as u32, 0, 0, 0]);
        adapter.handle_mailbox_irq(1);

        assert!(adapter.queued_event_ids_for_test().is_empty());
    }

    #[test]
    fn ready_to_reset_sets_the_flag_without_an_event() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();

        asic.inject_rcv_msg(0, [RcvMsg::ReadyToReset as u32, 0, 0, 0]);
        adapter.handle_mailbox_irq(0);

        assert!(adapter.array_vf[0].ready_to_reset.load(Ordering::Acquire));
        assert!(adapter.queued_event_ids_for_test().is_empty());
    }

    #[test]
    fn cper_dump_request_carries_the_guest_rptr() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();
        adapter.array_vf[0].state.set(VfState::Active).unwrap();

        asic.inject_rcv_msg(0, [RcvMsg::ReqRasCperDump as u32, 0x44, 0x1, 0]);
        adapter.handle_mailbox_irq(0);

        let events = adapter.queued_events_for_test();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::CperDump { rptr } => assert_eq!(*rptr, 0x1_0000_0044),
            other => panic!("wrong payload {other:?}"),
        }
    }

    #[test]
    fn unknown_message_id_hits_the_error_ring() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();

        asic.inject_rcv_msg(0, [0xdead, 0, 0, 0]);
        adapter.handle_mailbox_irq(0);

        assert!(adapter.queued_event_ids_for_test().is_empty());
        assert_eq!(adapter.errors.len(), 1);
    }

    #[test]
    fn send_with_ack_clears_valid() {
        let (adapter, asic) = test_adapter(2);
        asic.set_ack(PF_IDX, true);

        adapter.notify_vf_full_access(PF_IDX);
        assert!(!asic.valid_raised(PF_IDX));
        let (_, trn) = adapter.mailbox.last_msgs(PF_IDX);
        assert_eq!(trn[0], TrnMsg::ReadyToAccessGpu as u32);
    }
}
