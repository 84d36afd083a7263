// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Fake ASIC and OS shim for unit tests.
//!
//! The fake clock only advances through `usleep`/`advance`, which makes
//! every timeout in the core deterministic. The command surface records
//! what the scheduler submitted and can be scripted to fail.

use super::{Asic, BadPage, EccCounts, HwSchedDesc, PspMbStatus, VfAccess, WsCmd};
use crate::error::GvError;
use crate::ras::RasBlock;
use crate::ras::mca::{McaBank, McaErrorKind};
use crate::sched::event::{SchedBlock, SchedMode};
use crate::shim::{OsEvent, Shim, WaitState};
use crate::vf::{MAX_VF_SLOT, VfIdx};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::array;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::sync::{Condvar, Mutex};

/// Fake monotonic clock shared by a test's shim and assertions.
pub struct TestShim {
    clock_us: AtomicU64,
}

impl TestShim {
    /// Clock starting at a non-zero epoch.
    pub fn new() -> Self {
        Self {
            clock_us: AtomicU64::new(1_000_000),
        }
    }

    /// Advances the fake clock.
    pub fn advance(&self, us: u64) {
        self.clock_us.fetch_add(us, Ordering::AcqRel);
    }
}

impl Default for TestShim {
    fn default() -> Self {
        Self::new()
    }
}

impl Shim for TestShim {
    fn timestamp_us(&self) -> u64 {
        self.clock_us.load(Ordering::Acquire)
    }

    fn utc_timestamp_s(&self) -> u64 {
        // 2024-02-29 12:34:56 UTC plus the fake uptime.
        1_709_210_096 + self.timestamp_us() / 1_000_000
    }

    fn usleep(&self, us: u64) {
        self.advance(us);
        std::thread::yield_now();
    }

    fn create_event(&self) -> Box<dyn OsEvent> {
        Box::new(TestEvent::default())
    }

    fn thread_id(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() | 1
    }
}

/// Event backed by a condvar; `signal_forever` latches it open.
#[derive(Default)]
struct TestEvent {
    signalled: Mutex<(bool, bool)>,
    condvar: Condvar,
}

impl OsEvent for TestEvent {
    fn wait(&self, timeout_us: u64) -> WaitState {
        let mut guard = self.signalled.lock().unwrap();
        loop {
            let (signalled, forever) = *guard;
            if signalled || forever {
                guard.0 = false;
                return WaitState::WakeUp;
            }
            if timeout_us == 0 {
                guard = self.condvar.wait(guard).unwrap();
            } else {
                let (g, timeout) = self
                    .condvar
                    .wait_timeout(guard, core::time::Duration::from_micros(timeout_us))
                    .unwrap();
                guard = g;
                if timeout.timed_out() {
                    return WaitState::Timeout;
                }
            }
        }
    }

    fn signal(&self) {
        self.signalled.lock().unwrap().0 = true;
        self.condvar.notify_all();
    }

    fn signal_forever(&self) {
        self.signalled.lock().unwrap().1 = true;
        self.condvar.notify_all();
    }
}

const FB_SIZE: usize = 0x6_0000;

#[derive(Default)]
struct VfMailbox {
    rcv: [u32; 4],
    trn: [u32; 4],
    trn_log: Vec<[u32; 4]>,
    valid: bool,
    ack: bool,
}

/// The fake ASIC.
pub struct TestAsic {
    shim: Arc<TestShim>,
    cmd_log: Mutex<Vec<WsCmd>>,
    fail_ws_cmds: AtomicUsize,
    flr_count: [AtomicU32; MAX_VF_SLOT],
    fail_vf_flr: [AtomicBool; MAX_VF_SLOT],
    gpu_reset_count: AtomicU32,
    fail_gpu_reset: AtomicBool,
    access: [AtomicU32; MAX_VF_SLOT],
    iv_ring_on: AtomicBool,
    mbox_irq_on: AtomicBool,
    mailbox: Mutex<[VfMailbox; MAX_VF_SLOT]>,
    bad_page_count: AtomicU32,
    replaced_pages: Mutex<Vec<u64>>,
    mca_banks: Mutex<VecDeque<Vec<McaBank>>>,
    ecc_counts: Mutex<EccCounts>,
    cp_running: [AtomicBool; MAX_VF_SLOT],
    fb: Mutex<Vec<Vec<u8>>>,
}

impl TestAsic {
    /// Two GFX schedulers on one world switch, SDMA and VCN on their own.
    pub const DESCS: &'static [HwSchedDesc] = &[
        HwSchedDesc {
            sched_block: SchedBlock::Gfx,
            mode: SchedMode::Solid,
            world_switch_id: 0,
        },
        HwSchedDesc {
            sched_block: SchedBlock::Compute,
            mode: SchedMode::Solid,
            world_switch_id: 0,
        },
        HwSchedDesc {
            sched_block: SchedBlock::Sdma,
            mode: SchedMode::Solid,
            world_switch_id: 1,
        },
        HwSchedDesc {
            sched_block: SchedBlock::Vcn,
            mode: SchedMode::HybridLiquid,
            world_switch_id: 2,
        },
    ];

    /// Fresh fake with everything healthy.
    pub fn new() -> Self {
        Self {
            shim: Arc::new(TestShim::new()),
            cmd_log: Mutex::new(Vec::new()),
            fail_ws_cmds: AtomicUsize::new(0),
            flr_count: array::from_fn(|_| AtomicU32::new(0)),
            fail_vf_flr: array::from_fn(|_| AtomicBool::new(false)),
            gpu_reset_count: AtomicU32::new(0),
            fail_gpu_reset: AtomicBool::new(false),
            access: array::from_fn(|_| AtomicU32::new(0)),
            iv_ring_on: AtomicBool::new(false),
            mbox_irq_on: AtomicBool::new(false),
            mailbox: Mutex::new(array::from_fn(|_| VfMailbox::default())),
            bad_page_count: AtomicU32::new(0),
            replaced_pages: Mutex::new(Vec::new()),
            mca_banks: Mutex::new(VecDeque::new()),
            ecc_counts: Mutex::new(EccCounts::default()),
            cp_running: array::from_fn(|_| AtomicBool::new(true)),
            fb: Mutex::new((0..MAX_VF_SLOT).map(|_| alloc::vec![0u8; FB_SIZE]).collect()),
        }
    }

    /// The shim sharing this fake's clock.
    pub fn shim(&self) -> Arc<TestShim> {
        self.shim.clone()
    }

    /// Asserts the exact command sequence since the last check, and
    /// clears the log.
    pub fn took_cmds(&self, expect: &[WsCmd]) -> bool {
        let mut log = self.cmd_log.lock().unwrap();
        let matches = log.as_slice() == expect;
        if !matches {
            eprintln!("command log {log:?}, expected {expect:?}");
        }
        log.clear();
        matches
    }

    /// Whether `cmd` was submitted since the last clear.
    pub fn cmd_log_contains(&self, cmd: WsCmd) -> bool {
        self.cmd_log.lock().unwrap().contains(&cmd)
    }

    /// Drops the recorded command log.
    pub fn clear_cmds(&self) {
        self.cmd_log.lock().unwrap().clear();
    }

    /// The next `n` world-switch commands fail with a timeout.
    pub fn fail_next_ws_cmds(&self, n: usize) {
        self.fail_ws_cmds.store(n, Ordering::Release);
    }

    /// Scripts a VF FLR to fail.
    pub fn fail_vf_flr(&self, idx_vf: VfIdx, fail: bool) {
        self.fail_vf_flr[idx_vf].store(fail, Ordering::Release);
    }

    /// Scripts the whole-GPU reset to fail.
    pub fn fail_gpu_reset(&self, fail: bool) {
        self.fail_gpu_reset.store(fail, Ordering::Release);
    }

    /// FLRs taken by `idx_vf`.
    pub fn flr_count(&self, idx_vf: VfIdx) -> u32 {
        self.flr_count[idx_vf].load(Ordering::Acquire)
    }

    /// Whole-GPU resets taken.
    pub fn gpu_reset_count(&self) -> u32 {
        self.gpu_reset_count.load(Ordering::Acquire)
    }

    /// Whether both interrupt paths are off.
    pub fn interrupts_disabled(&self) -> bool {
        !self.iv_ring_on.load(Ordering::Acquire) && !self.mbox_irq_on.load(Ordering::Acquire)
    }

    /// Whether no access class remains granted to `idx_vf`.
    pub fn access_revoked(&self, idx_vf: VfIdx) -> bool {
        self.access[idx_vf].load(Ordering::Acquire) == 0
    }

    /// Places an incoming message in `idx_vf`'s receive buffer.
    pub fn inject_rcv_msg(&self, idx_vf: VfIdx, msg: [u32; 4]) {
        self.mailbox.lock().unwrap()[idx_vf].rcv = msg;
    }

    /// Scripts the guest's ACK response.
    pub fn set_ack(&self, idx_vf: VfIdx, ack: bool) {
        self.mailbox.lock().unwrap()[idx_vf].ack = ack;
    }

    /// Whether the VALID bit is currently raised towards `idx_vf`.
    pub fn valid_raised(&self, idx_vf: VfIdx) -> bool {
        self.mailbox.lock().unwrap()[idx_vf].valid
    }

    /// Whether a message with leading dword `id` was sent to `idx_vf`.
    pub fn sent_mailbox_id(&self, idx_vf: VfIdx, id: u32) -> bool {
        self.mailbox.lock().unwrap()[idx_vf]
            .trn_log
            .iter()
            .any(|msg| msg[0] == id)
    }

    /// Scripts the EEPROM retired-page count.
    pub fn set_bad_page_count(&self, count: u32) {
        self.bad_page_count.store(count, Ordering::Release);
    }

    /// Pages handed to `replace_bad_page`.
    pub fn replaced_pages(&self) -> Vec<u64> {
        self.replaced_pages.lock().unwrap().clone()
    }

    /// Queues one batch of banks for the next MCA poll.
    pub fn push_mca_banks(&self, banks: Vec<McaBank>) {
        self.mca_banks.lock().unwrap().push_back(banks);
    }

    /// Scripts the counters returned by `query_ecc_counts`.
    pub fn set_ecc_counts(&self, counts: EccCounts) {
        *self.ecc_counts.lock().unwrap() = counts;
    }

    /// Scripts whether the guest CP scheduler came up.
    pub fn set_cp_running(&self, idx_vf: VfIdx, running: bool) {
        self.cp_running[idx_vf].store(running, Ordering::Release);
    }

    /// Test-side FB readback.
    pub fn read_fb_for_test(&self, idx_vf: VfIdx, offset: u64, buf: &mut [u8]) {
        let fb = self.fb.lock().unwrap();
        let offset = offset as usize;
        buf.copy_from_slice(&fb[idx_vf][offset..offset + buf.len()]);
    }

    /// Test-side FB write.
    pub fn write_fb_for_test(&self, idx_vf: VfIdx, offset: u64, data: &[u8]) {
        let mut fb = self.fb.lock().unwrap();
        let offset = offset as usize;
        fb[idx_vf][offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Default for TestAsic {
    fn default() -> Self {
        Self::new()
    }
}

impl Asic for TestAsic {
    fn hw_scheds(&self) -> &[HwSchedDesc] {
        Self::DESCS
    }

    fn run_ws_cmd(&self, _hw_sched_id: usize, cmd: WsCmd, _idx_vf: VfIdx) -> Result<(), GvError> {
        let pending = self.fail_ws_cmds.load(Ordering::Acquire);
        if pending > 0 {
            self.fail_ws_cmds.store(pending - 1, Ordering::Release);
            return Err(GvError::FirmwareTimeout);
        }
        if !matches!(cmd, WsCmd::EnableAutoSched | WsCmd::DisableAutoSched) {
            self.cmd_log.lock().unwrap().push(cmd);
        }
        Ok(())
    }

    fn trigger_vf_flr(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        if self.fail_vf_flr[idx_vf].load(Ordering::Acquire) {
            return Err(GvError::ResetFailed);
        }
        self.flr_count[idx_vf].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn trigger_gpu_reset(&self) -> Result<(), GvError> {
        self.gpu_reset_count.fetch_add(1, Ordering::AcqRel);
        if self.fail_gpu_reset.load(Ordering::Acquire) {
            return Err(GvError::ResetFailed);
        }
        Ok(())
    }

    fn set_vf_access(
        &self,
        idx_vf: VfIdx,
        select: VfAccess,
        enable: bool,
    ) -> Result<(), GvError> {
        let bits = &self.access[idx_vf];
        if enable {
            bits.fetch_or(select.bits(), Ordering::AcqRel);
        } else {
            bits.fetch_and(!select.bits(), Ordering::AcqRel);
        }
        Ok(())
    }

    fn set_psp_mb_int(&self, _idx_vf: VfIdx, _enable: bool) -> Result<(), GvError> {
        Ok(())
    }

    fn psp_mb_status(&self, _idx_vf: VfIdx) -> PspMbStatus {
        PspMbStatus::default()
    }

    fn cp_sched_running(&self, idx_vf: VfIdx) -> bool {
        self.cp_running[idx_vf].load(Ordering::Acquire)
    }

    fn mailbox_rcv_msg(&self, idx_vf: VfIdx, offset: usize) -> u32 {
        self.mailbox.lock().unwrap()[idx_vf].rcv[offset]
    }

    fn mailbox_trn_msg(&self, idx_vf: VfIdx, offset: usize, dw: u32) {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox[idx_vf].trn[offset] = dw;
        if offset == 3 {
            let msg = mailbox[idx_vf].trn;
            mailbox[idx_vf].trn_log.push(msg);
        }
    }

    fn mailbox_set_valid(&self, idx_vf: VfIdx, valid: bool) {
        self.mailbox.lock().unwrap()[idx_vf].valid = valid;
    }

    fn mailbox_ack_msg(&self, idx_vf: VfIdx) {
        self.mailbox.lock().unwrap()[idx_vf].rcv = [0; 4];
    }

    fn mailbox_peek_ack(&self, idx_vf: VfIdx) -> bool {
        self.mailbox.lock().unwrap()[idx_vf].ack
    }

    fn eeprom_bad_page_count(&self) -> u32 {
        self.bad_page_count.load(Ordering::Acquire)
    }

    fn eeprom_append_bad_pages(&self, pages: &[BadPage]) -> Result<(), GvError> {
        self.bad_page_count
            .fetch_add(pages.len() as u32, Ordering::AcqRel);
        Ok(())
    }

    fn poll_new_mca_banks(&self, _kind: McaErrorKind) -> Vec<McaBank> {
        self.mca_banks.lock().unwrap().pop_front().unwrap_or_default()
    }

    fn retire_bad_page(&self, bank: &McaBank) -> Result<BadPage, GvError> {
        Ok(BadPage { address: bank.addr })
    }

    fn replace_bad_page(&self, page: &BadPage) -> Result<(), GvError> {
        self.replaced_pages.lock().unwrap().push(page.address);
        Ok(())
    }

    fn poison_mode_supported(&self) -> bool {
        true
    }

    fn query_ecc_counts(&self, _block: RasBlock) -> EccCounts {
        *self.ecc_counts.lock().unwrap()
    }

    fn write_vf_fb(&self, idx_vf: VfIdx, offset: u64, data: &[u8]) -> Result<(), GvError> {
        let mut fb = self.fb.lock().unwrap();
        let offset = offset as usize;
        if offset + data.len() > FB_SIZE {
            return Err(GvError::InvalidParam);
        }
        fb[idx_vf][offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_vf_fb(&self, idx_vf: VfIdx, offset: u64, buf: &mut [u8]) -> Result<(), GvError> {
        let fb = self.fb.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > FB_SIZE {
            return Err(GvError::InvalidParam);
        }
        buf.copy_from_slice(&fb[idx_vf][offset..offset + buf.len()]);
        Ok(())
    }

    fn iv_ring_enable(&self, enable: bool) {
        self.iv_ring_on.store(enable, Ordering::Release);
    }

    fn mbox_irq_enable(&self, enable: bool) {
        self.mbox_irq_on.store(enable, Ordering::Release);
    }
}
