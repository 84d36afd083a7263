// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The adapter: process-wide root object per physical GPU.
//!
//! The adapter owns every sub-state (VF slots, scheduler state, RAS
//! accounting, the CPER ring, the mailbox) and carries the device status
//! machine. `HW_RMA` and `HIVE_RMA` are terminal for the lifetime of the
//! handle.

use crate::asic::{Asic, VfAccess};
use crate::config::{
    AdapterFlags, EXCLUSIVE_TIMEOUT_MS_1VF, EXCLUSIVE_TIMEOUT_MS_COMMON, EXCLUSIVE_TIMEOUT_MS_MAX,
    InitOptions,
};
use crate::error::{ErrorRing, GvError};
use crate::guard::VfGuard;
use crate::mailbox::Mailbox;
use crate::ras::EccState;
use crate::ras::cper::{CperIdent, CperRing};
use crate::sched::event::{EventId, EventPayload, SchedBlock, SchedEvent};
use crate::sched::world_switch::WorldSwitchSet;
use crate::sched::{EventRing, SchedState};
use crate::shim::{OsEvent, Shim};
use crate::vf::{MAX_VF_SLOT, PF_IDX, VfIdx, VfSlot, VfState};
use crate::xgmi::XgmiInfo;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::array;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use log::{info, warn};
use spin::mutex::SpinMutex;

/// Adapter-wide status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdapterStatus {
    /// Software initialised, hardware not yet up.
    SwInit = 0,
    /// Normal operation.
    HwInit = 1,
    /// The hardware stopped responding; terminal for this power cycle.
    HwLost = 2,
    /// Too many retired pages; the GPU is physically unusable.
    HwRma = 3,
    /// A hive peer is RMA'd without local damage.
    HiveRma = 4,
}

impl AdapterStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::HwInit,
            2 => Self::HwLost,
            3 => Self::HwRma,
            4 => Self::HiveRma,
            _ => Self::SwInit,
        }
    }

    /// Terminal states are never left.
    pub fn terminal(self) -> bool {
        matches!(self, Self::HwLost | Self::HwRma | Self::HiveRma)
    }
}

/// Everything needed to bring one adapter up.
pub struct DeviceInit {
    /// OS services.
    pub shim: Arc<dyn Shim>,
    /// ASIC driver.
    pub asic: Arc<dyn Asic>,
    /// Configuration blob.
    pub opt: InitOptions,
    /// XGMI identity; `phy_nodes_num <= 1` means no hive.
    pub xgmi: XgmiInfo,
    /// Identification stamped into CPER records.
    pub ident: CperIdent,
    /// PCI bus/device/function, for diagnostics.
    pub bdf: u32,
}

/// Root object per physical GPU.
pub struct Adapter {
    pub(crate) shim: Arc<dyn Shim>,
    pub(crate) asic: Arc<dyn Asic>,
    pub(crate) opt: InitOptions,
    flags: SpinMutex<AdapterFlags>,
    status: AtomicU8,
    /// Function slots; `PF_IDX` is the PF-as-VF slot.
    pub(crate) array_vf: [VfSlot; MAX_VF_SLOT],
    num_vf: AtomicUsize,
    pub(crate) api_lock: SpinMutex<()>,
    pub(crate) queue: SpinMutex<EventRing>,
    pub(crate) event: Box<dyn OsEvent>,
    pub(crate) state: SpinMutex<SchedState>,
    pub(crate) ecc: SpinMutex<EccState>,
    pub(crate) cper: SpinMutex<CperRing>,
    pub(crate) cper_ident: CperIdent,
    pub(crate) errors: ErrorRing,
    pub(crate) mailbox: Mailbox,
    pub(crate) xgmi: SpinMutex<XgmiInfo>,
    pub(crate) in_ecc_recovery: AtomicBool,
    pub(crate) is_in_powersaving: AtomicBool,
    pub(crate) in_xgmi_chain_reset: AtomicBool,
    pub(crate) reset_notify_vf_pending: AtomicBool,
    pub(crate) reset_num: AtomicU32,
    pub(crate) worker_thread_id: AtomicU64,
    pub(crate) worker_stop: AtomicBool,
    pub(crate) ffbm: crate::vfmgr::FfbmTable,
    pub(crate) bdf: u32,
    me: Weak<Adapter>,
}

impl Adapter {
    /// Creates the adapter in `SW_INIT`. The returned handle must be kept
    /// in the `Arc`; hive bookkeeping relies on it.
    pub fn new(init: DeviceInit) -> Result<Arc<Self>, GvError> {
        if init.opt.num_vf == 0 || init.opt.num_vf >= MAX_VF_SLOT {
            return Err(GvError::InvalidParam);
        }
        if init.opt.bad_page_record_threshold == 0 || init.opt.bad_page_record_threshold > 256 {
            return Err(GvError::InvalidParam);
        }

        let allow_ms = match init.opt.allow_time_full_access_ms {
            0 if init.opt.num_vf == 1 => EXCLUSIVE_TIMEOUT_MS_1VF,
            0 => EXCLUSIVE_TIMEOUT_MS_COMMON,
            ms => ms.min(EXCLUSIVE_TIMEOUT_MS_MAX),
        };
        info!("allowed time for full access is {allow_ms}ms");

        let guard_enabled = init.opt.flags.contains(AdapterFlags::SENSITIVE_EVENT_GUARD);
        let ws = WorldSwitchSet::new(init.asic.hw_scheds());
        let event = init.shim.create_event();

        let adapter = Arc::new_cyclic(|me| Self {
            state: SpinMutex::new(SchedState::new(
                ws,
                allow_ms * 1000,
                init.opt.per_partition_full_access,
            )),
            ecc: SpinMutex::new(EccState::new(
                init.opt.bad_page_detection_mode,
                init.asic.poison_mode_supported(),
            )),
            cper: SpinMutex::new(CperRing::new(init.opt.max_cper_count)),
            cper_ident: init.ident,
            errors: ErrorRing::new(),
            mailbox: Mailbox::new(),
            array_vf: array::from_fn(|_| VfSlot::new(guard_enabled)),
            num_vf: AtomicUsize::new(init.opt.num_vf),
            flags: SpinMutex::new(init.opt.flags),
            status: AtomicU8::new(AdapterStatus::SwInit as u8),
            api_lock: SpinMutex::new(()),
            queue: SpinMutex::new(EventRing::new()),
            event,
            xgmi: SpinMutex::new(init.xgmi),
            in_ecc_recovery: AtomicBool::new(false),
            is_in_powersaving: AtomicBool::new(false),
            in_xgmi_chain_reset: AtomicBool::new(false),
            reset_notify_vf_pending: AtomicBool::new(false),
            reset_num: AtomicU32::new(0),
            worker_thread_id: AtomicU64::new(0),
            worker_stop: AtomicBool::new(false),
            ffbm: crate::vfmgr::FfbmTable::default(),
            bdf: init.bdf,
            me: me.clone(),
            shim: init.shim,
            asic: init.asic,
            opt: init.opt,
        });

        if adapter.xgmi_node_count() > 1 {
            adapter.xgmi_join_hive()?;
        }
        Ok(adapter)
    }

    /// Brings the hardware side up: PF scheduling context, interrupt
    /// delivery, status `HW_INIT`.
    pub fn hw_init(&self) -> Result<(), GvError> {
        if self.status() != AdapterStatus::SwInit {
            return Err(GvError::InvalidParam);
        }

        if !self.opt.skip_hw_init {
            let mut state = self.state.lock();
            self.sched_init_pf_state(&mut state)?;
        }

        self.asic.iv_ring_enable(true);
        self.asic.mbox_irq_enable(true);
        self.set_status(AdapterStatus::HwInit);
        info!("adapter {:#x} hw init complete", self.bdf);
        Ok(())
    }

    /// Tears the adapter down: worker stopped, hive membership dropped,
    /// interrupts off.
    pub fn fini(&self) {
        self.stop_event_worker();
        self.asic.iv_ring_enable(false);
        self.asic.mbox_irq_enable(false);
        if self.xgmi_node_count() > 1 {
            self.xgmi_leave_hive();
        }
    }

    /// A strong handle to self.
    pub(crate) fn arc(&self) -> Arc<Adapter> {
        self.me.upgrade().expect("adapter outlives its Arc")
    }

    /// Monotonic microseconds.
    pub(crate) fn now(&self) -> u64 {
        self.shim.timestamp_us()
    }

    /// Current status.
    pub fn status(&self) -> AdapterStatus {
        AdapterStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Latches a status change; terminal states are one-way.
    pub(crate) fn set_status(&self, to: AdapterStatus) {
        let from = self.status();
        if from.terminal() {
            warn!("ignoring status change {from:?} -> {to:?} on a terminal adapter");
            return;
        }
        info!("adapter status {from:?} -> {to:?}");
        self.status.store(to as u8, Ordering::Release);
    }

    /// Whether API calls must be rejected.
    pub(crate) fn is_unrecov_err(&self) -> bool {
        self.status().terminal()
    }

    /// Number of configured VF slots (excluding the PF slot).
    pub(crate) fn num_vf(&self) -> usize {
        self.num_vf.load(Ordering::Acquire)
    }

    pub(crate) fn set_num_vf(&self, num_vf: usize) {
        self.num_vf.store(num_vf, Ordering::Release);
    }

    /// Current adapter flags.
    pub(crate) fn flags(&self) -> AdapterFlags {
        *self.flags.lock()
    }

    pub(crate) fn modify_flags(&self, set: AdapterFlags, clear: AdapterFlags) {
        let mut flags = self.flags.lock();
        flags.insert(set);
        flags.remove(clear);
    }

    /// Records an error against `idx_vf`.
    pub(crate) fn put_error(&self, idx_vf: VfIdx, error: GvError, data: u64) {
        self.errors
            .put(idx_vf.min(PF_IDX), error, data, self.now());
    }

    /// Records an error with an interval payload (start/end timestamps
    /// packed into the data word as seconds).
    pub(crate) fn put_error_ext(&self, idx_vf: VfIdx, error: GvError, start_us: u64, end_us: u64) {
        let data = ((start_us / 1_000_000) << 32) | (end_us / 1_000_000);
        self.put_error(idx_vf, error, data);
    }

    /// Per-VF guard accessor for the API layer.
    pub(crate) fn guard_of(&self, idx_vf: VfIdx) -> Option<&VfGuard> {
        self.array_vf.get(idx_vf).map(|slot| &slot.guard)
    }

    /// Escalation entry for a GPU that crossed the retired-page
    /// threshold; the terminal work runs on the worker.
    pub(crate) fn handle_bad_gpu(&self) {
        if self
            .queue_event(PF_IDX, EventId::SchedRma, SchedBlock::All)
            .is_err()
        {
            warn!("failed to queue RMA event");
        }
    }

    /// `SCHED_RMA` body: permanently stops guest service.
    ///
    /// This is destructive by design; runtime RMA recovery would need
    /// this rewritten.
    pub(crate) fn handle_rma_event(&self, state: &mut SchedState) {
        if self.ecc.lock().bad_page_detection_mode.ignore_rma() {
            return;
        }

        self.sched_stop_all(state);

        for idx_vf in 0..self.num_vf() {
            let _ = self.asic.set_vf_access(idx_vf, VfAccess::ALL, false);
            self.asic.toggle_rlcg_interface(idx_vf, false);

            if !self.array_vf[idx_vf].is(VfState::Active) {
                continue;
            }
            self.sched_remove_vf(state, idx_vf);
            let _ = self.sched_shutdown_vf(state, idx_vf);
            let _ = self.array_vf[idx_vf].state.set(VfState::Unavail);
        }

        if self.eeprom_is_gpu_bad() {
            self.generate_rma_cper();
            self.asic.report_rma_to_fw();
            self.set_status(AdapterStatus::HwRma);
        } else {
            self.set_status(AdapterStatus::HiveRma);
        }
        self.notify_gpu_rma(PF_IDX);
    }

    /// `COLLECT_DIAG_DATA` body: read-only snapshot into the caller's
    /// buffer.
    pub(crate) fn collect_diag_data(&self, event: &SchedEvent) {
        if let EventPayload::DiagData { buf, max_size } = &event.payload {
            let data = self.asic.collect_diag_data(event.idx_vf, *max_size);
            *buf.lock() = data;
        }
    }

    /// Wraps the poison-consumption reactor with the guest-visible
    /// follow-ups: a fresh PF2VF blob and the ready notification.
    pub(crate) fn sched_handle_poison_consumption(&self, event: &SchedEvent) {
        let block = match &event.payload {
            EventPayload::Poison { block } => *block,
            _ => crate::ras::RasBlock::Umc,
        };
        self.handle_ras_poison_consumption(event.idx_vf, block);

        if event.idx_vf != PF_IDX && self.update_pf2vf_message(event.idx_vf).is_err() {
            warn!("update pf2vf message failed");
        }
        self.notify_vf_ras_poison_ready(event.idx_vf);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::asic::test::TestAsic;

    /// Builds an adapter on the fake ASIC/shim pair, already in
    /// `HW_INIT` with `num_vf` slots and no PF scheduling.
    pub(crate) fn test_adapter(num_vf: usize) -> (Arc<Adapter>, Arc<TestAsic>) {
        test_adapter_with(num_vf, XgmiInfo::default())
    }

    /// Same, but as node `node_idx` of an XGMI hive.
    pub(crate) fn test_adapter_in_hive(
        nodes: usize,
        hive_id: u64,
        node_idx: u64,
    ) -> (Arc<Adapter>, Arc<TestAsic>) {
        test_adapter_with(
            2,
            XgmiInfo {
                node_id: node_idx,
                hive_id,
                phy_nodes_num: nodes,
                socket_id: node_idx as u32,
                is_master: false,
            },
        )
    }

    fn test_adapter_with(num_vf: usize, xgmi: XgmiInfo) -> (Arc<Adapter>, Arc<TestAsic>) {
        let asic = Arc::new(TestAsic::new());
        let init = DeviceInit {
            shim: asic.shim(),
            asic: asic.clone(),
            opt: InitOptions {
                num_vf,
                ..InitOptions::default()
            },
            xgmi,
            ident: CperIdent {
                socket_id: xgmi.socket_id,
                vendor_id: 0x1002,
                device_id: 0x74a1,
                smu_fw_version: 0x55_0400,
                product_serial: 0xdead_beef,
            },
            bdf: 0x100,
        };
        let adapter = Adapter::new(init).unwrap();
        adapter.hw_init().unwrap();
        (adapter, asic)
    }

    /// Runs the worker pump until the pipeline is quiescent.
    pub(crate) fn drive_worker(adapter: &Adapter) {
        for _ in 0..4 {
            adapter.process_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::{drive_worker, test_adapter};

    #[test]
    fn status_machine_is_one_way_terminal() {
        let (adapter, _asic) = test_adapter(2);
        assert_eq!(adapter.status(), AdapterStatus::HwInit);

        adapter.set_status(AdapterStatus::HwRma);
        assert_eq!(adapter.status(), AdapterStatus::HwRma);

        // No way back.
        adapter.set_status(AdapterStatus::HwInit);
        assert_eq!(adapter.status(), AdapterStatus::HwRma);
        assert!(adapter.is_unrecov_err());
    }

    /// Crossing the retired-page threshold drives the terminal RMA
    /// sequence.
    #[test]
    fn rma_shuts_everything_down() {
        let (adapter, asic) = test_adapter(2);
        adapter.array_vf[0].state.set(VfState::Avail).unwrap();
        {
            let mut state = adapter.state.lock();
            adapter.sched_add_vf(&mut state, 0).unwrap();
        }

        asic.set_bad_page_count(adapter.opt.bad_page_record_threshold);
        adapter.handle_bad_gpu();
        drive_worker(&adapter);

        assert_eq!(adapter.status(), AdapterStatus::HwRma);
        assert!(adapter.array_vf[0].is(VfState::Unavail));
        assert!(asic.access_revoked(0));
        // The terminal CPER is committed.
        let (wptr, avail, _) = adapter.cper.lock().get_count(0);
        assert_eq!(wptr, 1);
        assert_eq!(avail, 1);

        // Subsequent API-level events are refused.
        assert_eq!(
            adapter.queue_event(0, EventId::SchedResetVf, SchedBlock::All),
            Err(GvError::BadGpu)
        );
    }

    #[test]
    fn bad_page_mode1_ignores_rma() {
        let asic = Arc::new(crate::asic::test::TestAsic::new());
        let adapter = Adapter::new(DeviceInit {
            shim: asic.shim(),
            asic: asic.clone(),
            opt: InitOptions {
                num_vf: 2,
                bad_page_detection_mode: crate::config::BadPageDetectionMode::Mode1,
                ..InitOptions::default()
            },
            xgmi: XgmiInfo::default(),
            ident: CperIdent::default(),
            bdf: 0,
        })
        .unwrap();
        adapter.hw_init().unwrap();

        asic.set_bad_page_count(256);
        assert!(!adapter.eeprom_is_gpu_bad());

        adapter.handle_bad_gpu();
        drive_worker(&adapter);
        assert_eq!(adapter.status(), AdapterStatus::HwInit);
    }

    #[test]
    fn invalid_num_vf_is_rejected() {
        let asic = Arc::new(crate::asic::test::TestAsic::new());
        let ret = Adapter::new(DeviceInit {
            shim: asic.shim(),
            asic: asic.clone(),
            opt: InitOptions {
                num_vf: MAX_VF_SLOT,
                ..InitOptions::default()
            },
            xgmi: XgmiInfo::default(),
            ident: CperIdent::default(),
            bdf: 0,
        });
        assert!(matches!(ret, Err(GvError::InvalidParam)));
    }
}
