// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Event identifiers, payloads and the priority-list mapping.

use crate::ras::RasBlock;
use crate::ras::mca::McaErrorKind;
use crate::sched::EventSignal;
use crate::vf::VfIdx;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::mutex::SpinMutex;

/// Engine scope of an event or a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedBlock {
    /// Graphics.
    Gfx,
    /// Compute rings.
    Compute,
    /// System DMA.
    Sdma,
    /// Video core.
    Vcn,
    /// JPEG decode.
    Jpeg,
    /// Every engine the VF participates in.
    #[default]
    All,
}

/// Number of concrete engine blocks (excluding `All`).
pub const SCHED_BLOCK_NUM: usize = 5;

impl SchedBlock {
    /// Index for per-engine tables; `All` aliases GFX, matching how the
    /// hardware treats adapter-wide commands.
    pub fn index(self) -> usize {
        match self {
            Self::Gfx | Self::All => 0,
            Self::Compute => 1,
            Self::Sdma => 2,
            Self::Vcn => 3,
            Self::Jpeg => 4,
        }
    }

    /// Whether this is a multimedia block driven by MMSCH.
    pub fn is_multimedia(self) -> bool {
        matches!(self, Self::Vcn | Self::Jpeg)
    }
}

/// Dispatch policy of a hardware scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedMode {
    /// Fixed time slices, host-driven switching.
    #[default]
    Solid,
    /// Firmware-driven switching.
    Liquid,
    /// Firmware switching with early advance on empty context.
    HybridLiquid,
    /// Fairness-weighted firmware switching.
    Fairness,
    /// Strict round robin.
    RoundRobin,
}

/// Everything the pipeline can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // Names mirror the guest/host protocol verbatim.
pub enum EventId {
    ReqGpuInit,
    ReqGpuFini,
    ReqGpuReset,
    ReqGpuInitData,
    RelGpuInit,
    RelGpuFini,
    ReqGpuDebug,
    RelGpuDebug,
    VfReqRasErrorCount,
    VfReqRasCperDump,
    CurVfCtxEmpty,
    SchedSuspendVf,
    SchedResumeVf,
    SchedRemoveVf,
    SchedStopVf,
    SchedSuspend,
    SchedResume,
    SchedSuspendLive,
    SchedResumeLive,
    SchedResetVf,
    SchedForceResetVf,
    HwSchedResetVf,
    SchedForceResetGpu,
    SchedForceResetGpuInternal,
    SchedInitVfFb,
    SchedFwLiveUpdateDfc,
    SchedSetVfAccess,
    SchedMmschGeneralNotification,
    SchedPspVfGate,
    SchedPspVfCmdRelay,
    HandleCrash,
    SchedRma,
    SchedRasUmc,
    SchedRasFed,
    SchedRasPoisonConsumption,
    SchedRasPoisonCreation,
    SchedUpdateTopology,
    SchedGetTopology,
    SchedGpumon,
    SchedUpdateMcaBanks,
    CollectDiagData,
    EnterPowerSaving,
    ExitPowerSaving,
}

/// Number of priority lists the worker drains.
pub const EVENT_LIST_NUM: usize = 6;

impl EventId {
    /// Priority list the event is drained from (0 is highest).
    pub fn list(self) -> usize {
        use EventId::*;
        match self {
            SchedForceResetGpu | SchedForceResetGpuInternal | SchedRasUmc | EnterPowerSaving
            | ExitPowerSaving | SchedRasPoisonConsumption | SchedRasPoisonCreation
            | SchedRasFed => 0,
            SchedSuspendVf | SchedResumeVf | SchedRemoveVf | SchedStopVf | SchedSuspend
            | SchedResume | SchedSuspendLive | SchedResumeLive | CurVfCtxEmpty
            | CollectDiagData => 1,
            RelGpuInit | RelGpuFini | SchedUpdateTopology | RelGpuDebug => 2,
            SchedResetVf | SchedForceResetVf | HwSchedResetVf | SchedInitVfFb
            | SchedFwLiveUpdateDfc | SchedSetVfAccess | SchedMmschGeneralNotification
            | SchedPspVfGate | SchedPspVfCmdRelay | HandleCrash | SchedRma => 3,
            ReqGpuInit | ReqGpuFini | ReqGpuReset | ReqGpuInitData | VfReqRasErrorCount
            | VfReqRasCperDump | ReqGpuDebug => 4,
            SchedGpumon | SchedUpdateMcaBanks | SchedGetTopology => 5,
        }
    }

    /// Whether an older queued event for the same VF in the same list is
    /// dropped when this one is distributed.
    pub fn dedup(self) -> bool {
        use EventId::*;
        matches!(
            self,
            ReqGpuInit
                | ReqGpuFini
                | ReqGpuReset
                | ReqGpuInitData
                | ReqGpuDebug
                | RelGpuInit
                | RelGpuFini
                | RelGpuDebug
                | SchedForceResetGpu
                | SchedForceResetGpuInternal
                | SchedRasUmc
                | ExitPowerSaving
                | EnterPowerSaving
                | SchedRasPoisonConsumption
                | SchedRasPoisonCreation
                | SchedRasFed
                | SchedUpdateTopology
                | SchedRma
                | SchedGpumon
                | SchedUpdateMcaBanks
                | SchedGetTopology
        )
    }

    /// Whether the event belongs to the stale set logically discarded by a
    /// whole-GPU reset.
    pub fn stale_after_wgr(self) -> bool {
        use EventId::*;
        matches!(
            self,
            SchedForceResetGpu
                | SchedForceResetGpuInternal
                | SchedRasPoisonConsumption
                | SchedRasPoisonCreation
                | VfReqRasErrorCount
                | VfReqRasCperDump
        )
    }

    /// Guest-originated mailbox requests subject to queue-time guard
    /// checks.
    pub fn is_guest_request(self) -> bool {
        use EventId::*;
        matches!(
            self,
            ReqGpuInit
                | ReqGpuFini
                | ReqGpuReset
                | ReqGpuInitData
                | RelGpuInit
                | RelGpuFini
                | ReqGpuDebug
                | RelGpuDebug
        )
    }

    /// Events that must always be queued against `PF_IDX`.
    pub fn pf_only(self) -> bool {
        use EventId::*;
        matches!(
            self,
            SchedForceResetGpu | SchedForceResetGpuInternal | SchedRasFed
        )
    }

    /// Periodic runtime events log at debug level instead of info.
    pub fn log_at_info(self) -> bool {
        use EventId::*;
        !matches!(self, SchedGpumon | SchedUpdateMcaBanks | CurVfCtxEmpty)
    }
}

/// Shared buffer a `COLLECT_DIAG_DATA` event writes its result into.
pub type DiagBuffer = Arc<SpinMutex<Vec<u8>>>;

/// Event-specific payload; the worker matches on the variant.
#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    /// No payload.
    #[default]
    None,
    /// `SCHED_INIT_VF_FB`: fill pattern and completion flag.
    VfFb {
        /// Byte pattern to fill with.
        pattern: u8,
        /// Also clear the protected region.
        flag: bool,
    },
    /// `SCHED_SET_VF_ACCESS`.
    VfAccess {
        /// Access classes to change.
        select: crate::asic::VfAccess,
        /// Grant or revoke.
        enable: bool,
    },
    /// `SCHED_PSP_VF_GATE`.
    PspVfGate {
        /// Bitmask of targeted VFs.
        vf_select: u32,
        /// Gate or ungate.
        enable: bool,
    },
    /// RAS poison consumption/creation: the reporting block.
    Poison {
        /// Block the poison was observed in.
        block: RasBlock,
    },
    /// `VF_REQ_RAS_CPER_DUMP`: the guest's read pointer.
    CperDump {
        /// Guest read pointer into the CPER ring.
        rptr: u64,
    },
    /// `SCHED_UPDATE_MCA_BANKS`.
    McaBank {
        /// Bank class to poll.
        kind: McaErrorKind,
    },
    /// `SCHED_GPUMON`: opaque query type used for the RMA whitelist.
    Gpumon {
        /// Query id.
        query: u32,
    },
    /// `COLLECT_DIAG_DATA`: destination buffer and size cap.
    DiagData {
        /// Output buffer shared with the caller.
        buf: DiagBuffer,
        /// Maximum bytes to produce.
        max_size: usize,
    },
}

/// Completion marker used to skip stale events after a whole-GPU reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventStatus {
    /// Live event.
    #[default]
    Normal,
    /// Logically discarded; the worker signals the waiter with "skipped".
    Finished,
}

/// One unit of work in the pipeline.
#[derive(Clone)]
pub struct SchedEvent {
    /// VF the event applies to, or `PF_IDX`.
    pub idx_vf: VfIdx,
    /// What to do.
    pub id: EventId,
    /// Engine scope.
    pub sched_block: SchedBlock,
    /// Microseconds since boot at enqueue.
    pub timestamp: u64,
    /// Present when a caller blocks on completion.
    pub signal: Option<Arc<EventSignal>>,
    /// Event-specific payload.
    pub payload: EventPayload,
    /// Stale marker.
    pub status: EventStatus,
}

impl SchedEvent {
    /// Event with an empty payload and no waiter.
    pub fn new(idx_vf: VfIdx, id: EventId, sched_block: SchedBlock, timestamp: u64) -> Self {
        Self {
            idx_vf,
            id,
            sched_block,
            timestamp,
            signal: None,
            payload: EventPayload::None,
            status: EventStatus::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_mapping_matches_the_priority_table() {
        assert_eq!(EventId::SchedForceResetGpu.list(), 0);
        assert_eq!(EventId::SchedRasFed.list(), 0);
        assert_eq!(EventId::SchedSuspendVf.list(), 1);
        assert_eq!(EventId::CollectDiagData.list(), 1);
        assert_eq!(EventId::RelGpuInit.list(), 2);
        assert_eq!(EventId::SchedRma.list(), 3);
        assert_eq!(EventId::HandleCrash.list(), 3);
        assert_eq!(EventId::ReqGpuInit.list(), 4);
        assert_eq!(EventId::VfReqRasCperDump.list(), 4);
        assert_eq!(EventId::SchedGpumon.list(), 5);
    }

    #[test]
    fn stale_set_is_exactly_the_wgr_discard_set() {
        use EventId::*;
        for id in [
            SchedForceResetGpu,
            SchedForceResetGpuInternal,
            SchedRasPoisonConsumption,
            SchedRasPoisonCreation,
            VfReqRasErrorCount,
            VfReqRasCperDump,
        ] {
            assert!(id.stale_after_wgr(), "{id:?}");
        }
        assert!(!SchedRasUmc.stale_after_wgr());
        assert!(!ReqGpuInit.stale_after_wgr());
    }

    #[test]
    fn pf_only_events() {
        assert!(EventId::SchedForceResetGpu.pf_only());
        assert!(EventId::SchedRasFed.pf_only());
        assert!(!EventId::SchedResetVf.pf_only());
    }
}
