// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RAS / ECC reaction path.
//!
//! Three inbound sources feed the reactor: mailbox poison consumption
//! reports from guests, DF/NBIO fatal interrupts, and poison creation
//! telemetry. The reactor classifies MCA banks, emits CPER records, and
//! escalates per the recovery policy: retired-page threshold first, then
//! whole-GPU reset or a targeted VF reset.

pub mod cper;
pub mod mca;

use crate::adapter::{Adapter, AdapterStatus};
use crate::asic::BadPage;
use crate::config::BadPageDetectionMode;
use crate::error::GvError;
use crate::sched::SchedState;
use crate::sched::event::{EventId, SchedBlock, SchedEvent};
use crate::vf::{PF_IDX, VfIdx};
use alloc::vec::Vec;
use bitflags::bitflags;
use self::cper::{CperSeverity, CperType};
use log::{info, warn};
use self::mca::{McaErrorKind, McaSeverity};

/// Hardware blocks that can report RAS errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasBlock {
    /// Unified memory controller.
    Umc,
    /// System DMA.
    Sdma,
    /// Graphics.
    Gfx,
    /// Memory hub.
    Mmhub,
    /// Address translation hub.
    Athub,
    /// PCIe interface.
    PcieBif,
    /// Host data path.
    Hdp,
    /// XGMI/WAFL links.
    XgmiWafl,
    /// Data fabric.
    Df,
    /// System management network.
    Smn,
    /// Semaphore block.
    Sem,
    /// MP0 (PSP).
    Mp0,
    /// MP1 (SMU).
    Mp1,
    /// Fuses.
    Fuse,
    /// MCA itself.
    Mca,
    /// Video core.
    Vcn,
    /// JPEG decode.
    Jpeg,
    /// Interrupt handler.
    Ih,
    /// MPIO.
    Mpio,
}

bitflags! {
    /// Mask of RAS-capable blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RasBlockMask: u32 {
        /// UMC.
        const UMC = 1 << 0;
        /// SDMA.
        const SDMA = 1 << 1;
        /// GFX.
        const GFX = 1 << 2;
        /// MMHUB.
        const MMHUB = 1 << 3;
        /// XGMI/WAFL.
        const XGMI_WAFL = 1 << 4;
    }
}

impl RasBlock {
    /// Capability bit for the enabled mask, if the block is maskable.
    pub fn mask_bit(self) -> Option<RasBlockMask> {
        match self {
            Self::Umc => Some(RasBlockMask::UMC),
            Self::Sdma => Some(RasBlockMask::SDMA),
            Self::Gfx => Some(RasBlockMask::GFX),
            Self::Mmhub => Some(RasBlockMask::MMHUB),
            Self::XgmiWafl => Some(RasBlockMask::XGMI_WAFL),
            _ => None,
        }
    }
}

/// Deferred-error poll retries on poison consumption.
pub const MAX_DE_QUERY_RETRY: u32 = 10;

/// Accumulated ECC accounting and the reactor's scratch state.
pub struct EccState {
    /// Blocks with RAS reporting enabled.
    pub enabled_blocks: RasBlockMask,
    /// Hardware poisons bad data instead of halting.
    pub poison_supported: bool,
    /// Correctable error total (UMC).
    pub correctable_count: u32,
    /// Uncorrectable error total (UMC).
    pub uncorrectable_count: u32,
    /// Deferred error total (UMC).
    pub deferred_count: u32,
    /// Deferred errors seen but not yet consumed by recovery.
    pub pending_de_count: u32,
    /// A fatal interrupt is being handled.
    pub fatal_error: bool,
    /// Bad-page detection policy.
    pub bad_page_detection_mode: BadPageDetectionMode,
    /// Pages retired but not yet replaced in VF windows (replayed after
    /// the next FLR).
    pub unhandled_bad_pages: Vec<BadPage>,
}

impl EccState {
    /// Initial state per the adapter options.
    pub fn new(mode: BadPageDetectionMode, poison_supported: bool) -> Self {
        Self {
            enabled_blocks: RasBlockMask::UMC | RasBlockMask::GFX | RasBlockMask::SDMA,
            poison_supported,
            correctable_count: 0,
            uncorrectable_count: 0,
            deferred_count: 0,
            pending_de_count: 0,
            fatal_error: false,
            bad_page_detection_mode: mode,
            unhandled_bad_pages: Vec::new(),
        }
    }

    /// Whether `block` has RAS reporting enabled.
    pub fn is_support(&self, block: RasBlock) -> bool {
        block
            .mask_bit()
            .is_some_and(|bit| self.enabled_blocks.contains(bit))
    }
}

impl Adapter {
    /// Whether the retired-page count crossed the RMA threshold. Modes
    /// that ignore RMA always report a good GPU.
    pub(crate) fn eeprom_is_gpu_bad(&self) -> bool {
        if self.ecc.lock().bad_page_detection_mode.ignore_rma() {
            return false;
        }
        self.asic.eeprom_bad_page_count() >= self.opt.bad_page_record_threshold
    }

    /// Polls MCA banks of `kind`, folds them into the counters and emits
    /// one runtime CPER per batch. Returns the number of new banks.
    pub(crate) fn mca_get_new_banks(&self, kind: McaErrorKind) -> usize {
        let banks = self.asic.poll_new_mca_banks(kind);
        if banks.is_empty() {
            return 0;
        }

        let mut ecc = self.ecc.lock();
        let mut worst = CperSeverity::Corrected;
        for bank in &banks {
            match bank.severity() {
                McaSeverity::Correctable => ecc.correctable_count += 1,
                McaSeverity::Deferred => {
                    ecc.deferred_count += 1;
                    ecc.pending_de_count += 1;
                    if worst == CperSeverity::Corrected {
                        worst = CperSeverity::Recoverable;
                    }
                }
                McaSeverity::Uncorrectable => {
                    ecc.uncorrectable_count += 1;
                    worst = CperSeverity::Fatal;
                }
            }
        }
        drop(ecc);

        let kind = if worst == CperSeverity::Fatal {
            CperType::Fatal
        } else {
            CperType::Runtime
        };
        let ident = self.cper_ident;
        let ret = self.cper.lock().build(
            &ident,
            &*self.shim,
            kind,
            worst,
            |entry| {
                for (idx, bank) in banks.iter().enumerate() {
                    match kind {
                        CperType::Fatal => entry.fill_fatal_section(
                            &ident,
                            idx,
                            cper::CrashDumpRegs {
                                status: bank.status,
                                addr: bank.addr,
                                ipid: bank.ipid,
                                misc: bank.misc,
                                synd: bank.synd,
                            },
                        ),
                        _ => entry.fill_runtime_section(
                            &ident,
                            idx,
                            bank.severity_cper(),
                            &bank.to_aca_dump(),
                        ),
                    }
                }
            },
            banks.len() as u16,
        );
        if ret.is_err() {
            warn!("failed to commit CPER for {} MCA banks", banks.len());
        }

        banks.len()
    }

    /// Retries the MCA poll until a new deferred error shows up, then runs
    /// page retirement when the report was a consumption.
    fn ecc_find_poison(&self, _idx_vf: VfIdx, is_consumption: bool) {
        if !self.ecc.lock().is_support(RasBlock::Umc) {
            return;
        }

        let start_count = self.ecc.lock().pending_de_count;
        for _ in 0..MAX_DE_QUERY_RETRY {
            self.mca_get_new_banks(McaErrorKind::Ce);
            if self.ecc.lock().pending_de_count != start_count {
                break;
            }
            self.shim.usleep(1000);
        }

        if !is_consumption {
            return;
        }
        if self.ecc.lock().bad_page_detection_mode.skip_retirement() {
            return;
        }

        // Retire every pending deferred bank and queue the pages for FFBM
        // replacement after the next FLR.
        let banks = self.asic.poll_new_mca_banks(McaErrorKind::Ce);
        let mut retired = Vec::new();
        for bank in banks.iter().filter(|b| b.severity() == McaSeverity::Deferred) {
            match self.asic.retire_bad_page(bank) {
                Ok(page) => retired.push(page),
                Err(GvError::NotSupported) => break,
                Err(_) => warn!("page retirement failed for bank {:#x}", bank.status),
            }
        }
        if retired.is_empty() {
            return;
        }
        if self.asic.eeprom_append_bad_pages(&retired).is_err() {
            warn!("failed to persist {} retired pages", retired.len());
        }
        self.ecc.lock().unhandled_bad_pages.extend_from_slice(&retired);
    }

    /// Recovery decision table: anything that poison mode cannot contain
    /// to one VF escalates to a whole-GPU reset.
    fn is_poison_consumption_wgr(&self, idx_vf: VfIdx, block: RasBlock) -> bool {
        if !self.ecc.lock().poison_supported {
            return true;
        }
        if self.flags().contains(crate::config::AdapterFlags::VF_HANG_GPU_RESET) {
            return true;
        }
        if idx_vf == PF_IDX {
            return true;
        }
        !matches!(block, RasBlock::Gfx | RasBlock::Sdma)
    }

    fn start_poison_consumption_recovery(&self, idx_vf: VfIdx, block: RasBlock) {
        if self.eeprom_is_gpu_bad() {
            self.handle_bad_gpu();
            return;
        }
        if self.is_poison_consumption_wgr(idx_vf, block) {
            let target = self.xgmi_master().unwrap_or_else(|| self.arc());
            if target
                .queue_event(PF_IDX, EventId::SchedForceResetGpu, SchedBlock::All)
                .is_err()
            {
                warn!("failed to queue whole GPU reset for poison consumption");
            }
        } else if self
            .queue_event(idx_vf, EventId::SchedForceResetVf, SchedBlock::All)
            .is_err()
        {
            warn!("failed to queue VF reset for poison consumption");
        }
    }

    /// `SCHED_RAS_POISON_CONSUMPTION` body.
    pub(crate) fn handle_ras_poison_consumption(&self, idx_vf: VfIdx, block: RasBlock) {
        self.ecc_find_poison(idx_vf, true);
        self.start_poison_consumption_recovery(idx_vf, block);
        self.ecc.lock().pending_de_count = 0;
    }

    /// `SCHED_RAS_POISON_CREATION` body: telemetry only, never a reset.
    pub(crate) fn handle_ras_poison_creation(&self, idx_vf: VfIdx) {
        self.ecc_find_poison(idx_vf, false);
    }

    /// `SCHED_RAS_FED` body: a fatal error interrupt was latched; poll the
    /// banks so a crashdump CPER exists, then let the queued reset run.
    pub(crate) fn handle_ras_fed(&self, _event: &SchedEvent) {
        self.mca_get_new_banks(McaErrorKind::Ue);
        self.ecc.lock().fatal_error = true;
    }

    /// `SCHED_RAS_UMC` body: query counters, report, and latch RMA when
    /// the retired-page threshold is exceeded.
    pub(crate) fn ecc_check_for_errors(&self, event: &SchedEvent) {
        if self.ecc.lock().is_support(RasBlock::Umc) {
            let counts = self.asic.query_ecc_counts(RasBlock::Umc);
            let mut ecc = self.ecc.lock();
            ecc.correctable_count += counts.correctable;
            ecc.uncorrectable_count += counts.uncorrectable;
            ecc.deferred_count += counts.deferred;
            let (ce, ue) = (ecc.correctable_count, ecc.uncorrectable_count);
            drop(ecc);

            if counts.correctable > 0 {
                self.put_error(PF_IDX, GvError::FatalEcc, u64::from(ce));
                info!("ECC correctable errors detected, total {ce}");
            }
            if counts.uncorrectable > 0 {
                self.put_error(PF_IDX, GvError::FatalEcc, u64::from(ue));
                warn!("ECC uncorrectable errors detected, total {ue}");
            }
        } else {
            warn!("counting ECC errors is not supported for this ASIC");
        }

        if event.id == EventId::SchedRasUmc && self.eeprom_is_gpu_bad() {
            self.set_status(AdapterStatus::HwRma);
        }
    }

    /// Queries every enabled block once; used while a fatal-error WGR is
    /// in flight so the counts reach the CPER ring before reset.
    pub(crate) fn ecc_query_ras_errors(&self) {
        self.mca_get_new_banks(McaErrorKind::Ce);
        self.mca_get_new_banks(McaErrorKind::Ue);
    }

    /// Replays page replacements queued by the reactor; called at the tail
    /// of a VF FLR. A replay failure reports whether the GPU is now bad.
    pub(crate) fn replay_pending_bad_pages(&self) -> Result<(), GvError> {
        loop {
            let page = match self.ecc.lock().unhandled_bad_pages.pop() {
                Some(page) => page,
                None => return Ok(()),
            };
            match self.asic.replace_bad_page(&page) {
                Ok(()) => {}
                Err(GvError::NotSupported) => return Ok(()),
                Err(_) => {
                    warn!("failed to replace bad page {:#x}", page.address);
                    if self.eeprom_is_gpu_bad() {
                        self.set_status(AdapterStatus::HwRma);
                    }
                    return Err(GvError::ResetFailed);
                }
            }
        }
    }

    /// Emits the terminal bad-page-threshold CPER.
    pub(crate) fn generate_rma_cper(&self) {
        let ident = self.cper_ident;
        let ret = self.cper.lock().build(
            &ident,
            &*self.shim,
            CperType::BadPageThreshold,
            CperSeverity::Fatal,
            |entry| entry.fill_bad_page_thr_section(&ident, 0),
            1,
        );
        if ret.is_err() {
            warn!("failed to commit terminal RMA CPER");
        }
    }

    /// RAS telemetry requests are only honoured for VFs that are active or
    /// hold full access, and are themselves rate limited.
    pub(crate) fn sanitize_vf_ras_req(
        &self,
        idx_vf: VfIdx,
        guard: crate::guard::GuardEventKind,
    ) -> Result<(), GvError> {
        use crate::guard::GuardEventState;
        use crate::vf::VfState;

        let slot = &self.array_vf[idx_vf];
        if !slot.is(VfState::Active) && !slot.is(VfState::FullAccess) {
            return Err(GvError::InvalidParam);
        }
        if slot.guard.event_state(guard) == GuardEventState::Overflow {
            return Err(GvError::GuestAbuse);
        }
        if slot.guard.add_event(guard, self.now()) == Err(GvError::GuestAbuse) {
            self.put_error(idx_vf, GvError::GuestAbuse, guard as u64);
            return Err(GvError::GuestAbuse);
        }
        Ok(())
    }

    /// `VF_REQ_RAS_ERROR_COUNT` body.
    pub(crate) fn handle_vf_req_ras_error_count(
        &self,
        _state: &mut SchedState,
        idx_vf: VfIdx,
    ) -> Result<(), GvError> {
        self.sanitize_vf_ras_req(idx_vf, crate::guard::GuardEventKind::RasErrCount)?;

        self.mca_get_new_banks(McaErrorKind::Ce);

        match self.vfmgr_dump_ras_error_counts(idx_vf) {
            Ok(()) => self.notify_vf_ras_error_count_ready(idx_vf),
            Err(_) => self.notify_vf_fail(idx_vf),
        }
        Ok(())
    }

    /// `VF_REQ_RAS_CPER_DUMP` body.
    pub(crate) fn handle_vf_req_cper_dump(
        &self,
        _state: &mut SchedState,
        idx_vf: VfIdx,
        rptr: u64,
    ) -> Result<(), GvError> {
        self.sanitize_vf_ras_req(idx_vf, crate::guard::GuardEventKind::RasCperDump)?;

        self.mca_get_new_banks(McaErrorKind::Ce);

        match self.vfmgr_dump_cpers(idx_vf, rptr) {
            Ok(allow_again) => {
                if allow_again {
                    // Guest is legitimately polling for the rest; do not
                    // penalize the follow-up messages.
                    let guard = &self.array_vf[idx_vf].guard;
                    guard.dec_event(crate::guard::GuardEventKind::AllInt);
                    guard.dec_event(crate::guard::GuardEventKind::RasCperDump);
                }
                self.notify_vf_cper_dump_ready(idx_vf);
                Ok(())
            }
            Err(e) => {
                self.notify_vf_fail(idx_vf);
                Err(e)
            }
        }
    }
}

impl mca::McaBank {
    /// CPER severity for a runtime section generated from this bank.
    pub fn severity_cper(&self) -> CperSeverity {
        match self.severity() {
            McaSeverity::Correctable => CperSeverity::Corrected,
            McaSeverity::Deferred => CperSeverity::Recoverable,
            McaSeverity::Uncorrectable => CperSeverity::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;
    use crate::guard::GuardEventKind;
    use crate::mailbox::RcvMsg;
    use crate::vf::VfState;
    use mca::McaBank;

    fn ce_bank(block: RasBlock) -> McaBank {
        McaBank {
            status: 1 << 63,
            addr: 0x4000,
            ipid: 0x96,
            misc: 0,
            synd: 0,
            block,
        }
    }

    fn deferred_bank(block: RasBlock) -> McaBank {
        McaBank {
            status: (1 << 63) | (1 << 44),
            addr: 0x8000,
            ipid: 0x96,
            misc: 0,
            synd: 0,
            block,
        }
    }

    #[test]
    fn new_banks_update_counters_and_commit_a_cper() {
        let (adapter, asic) = test_adapter(2);

        asic.push_mca_banks(alloc::vec![ce_bank(RasBlock::Umc), deferred_bank(RasBlock::Umc)]);
        let n = adapter.mca_get_new_banks(McaErrorKind::Ce);
        assert_eq!(n, 2);

        let ecc = adapter.ecc.lock();
        assert_eq!(ecc.correctable_count, 1);
        assert_eq!(ecc.deferred_count, 1);
        assert_eq!(ecc.pending_de_count, 1);
        drop(ecc);

        let (wptr, avail, size) = adapter.cper.lock().get_count(0);
        assert_eq!(wptr, 1);
        assert_eq!(avail, 1);
        assert!(size > 0);
    }

    /// Poison consumed by a GFX workload of a VF resets only that VF.
    #[test]
    fn poison_consumption_on_gfx_targets_the_vf() {
        let (adapter, _asic) = test_adapter(2);
        adapter.array_vf[1].state.set(VfState::Avail).unwrap();
        adapter.array_vf[1].state.set(VfState::Active).unwrap();

        adapter.handle_ras_poison_consumption(1, RasBlock::Gfx);

        let ids = adapter.queued_event_ids_for_test();
        assert_eq!(ids, &[EventId::SchedForceResetVf]);
        assert_eq!(adapter.ecc.lock().pending_de_count, 0);
    }

    /// Poison outside GFX/SDMA, or consumed by the PF, escalates to a
    /// whole-GPU reset.
    #[test]
    fn poison_consumption_escalation_cases() {
        let (adapter, _asic) = test_adapter(2);
        adapter.handle_ras_poison_consumption(1, RasBlock::Mmhub);
        assert_eq!(
            adapter.queued_event_ids_for_test(),
            &[EventId::SchedForceResetGpu]
        );

        let (adapter, _asic) = test_adapter(2);
        adapter.handle_ras_poison_consumption(PF_IDX, RasBlock::Gfx);
        assert_eq!(
            adapter.queued_event_ids_for_test(),
            &[EventId::SchedForceResetGpu]
        );
    }

    /// Crossing the retired-page threshold wins over any reset.
    #[test]
    fn poison_consumption_over_threshold_goes_to_rma() {
        let (adapter, asic) = test_adapter(2);
        asic.set_bad_page_count(adapter.opt.bad_page_record_threshold);

        adapter.handle_ras_poison_consumption(0, RasBlock::Gfx);
        assert_eq!(adapter.queued_event_ids_for_test(), &[EventId::SchedRma]);
    }

    /// Poison creation is telemetry only.
    #[test]
    fn poison_creation_never_resets() {
        let (adapter, asic) = test_adapter(2);
        asic.push_mca_banks(alloc::vec![deferred_bank(RasBlock::Umc)]);

        adapter.handle_ras_poison_creation(0);
        assert!(adapter.queued_event_ids_for_test().is_empty());
        assert_eq!(adapter.ecc.lock().pending_de_count, 1);
    }

    /// RAS telemetry requests from inactive VFs are dropped.
    #[test]
    fn telemetry_from_inactive_vf_is_rejected() {
        let (adapter, _asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();

        assert!(
            adapter
                .sanitize_vf_ras_req(0, GuardEventKind::RasErrCount)
                .is_err()
        );

        adapter.array_vf[0].state.set(VfState::Active).unwrap();
        assert!(
            adapter
                .sanitize_vf_ras_req(0, GuardEventKind::RasErrCount)
                .is_ok()
        );
    }

    /// End to end: the guest asks for a CPER dump over the mailbox, the
    /// worker stages the records and notifies readiness.
    #[test]
    fn guest_cper_dump_roundtrip() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();
        adapter.array_vf[0].state.set(VfState::Active).unwrap();
        asic.set_ack(0, true);

        asic.push_mca_banks(alloc::vec![ce_bank(RasBlock::Umc)]);
        adapter.mca_get_new_banks(McaErrorKind::Ce);

        asic.inject_rcv_msg(0, [RcvMsg::ReqRasCperDump as u32, 0, 0, 0]);
        adapter.handle_mailbox_irq(0);
        adapter.process_pending();

        assert!(asic.sent_mailbox_id(0, crate::mailbox::TrnMsg::CperDumpReady as u32));

        let mut raw = [0u8; size_of::<crate::vfmgr::RasTelemetryHeader>()];
        asic.read_fb_for_test(0, crate::vfmgr::FB_RAS_TELEMETRY_OFFSET, &mut raw);
        let hdr =
            <crate::vfmgr::RasTelemetryHeader as zerocopy::FromBytes>::read_from_bytes(&raw)
                .unwrap();
        assert_eq!({ hdr.record_count }, 1);
    }
}
