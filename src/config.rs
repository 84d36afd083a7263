// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Init-time and runtime configuration of an adapter.

use bitflags::bitflags;

/// Default per-VF time slice when multiple VFs share a GFX scheduler, in
/// microseconds.
pub const DEFAULT_TIME_SLICE_US: u32 = 6_000;
/// Per-VF time slice when a single VF owns the GFX scheduler, in
/// microseconds.
pub const DEFAULT_TIME_SLICE_1VF_US: u32 = 500_000;

/// Default exclusive-access window with a single VF, in milliseconds.
pub const EXCLUSIVE_TIMEOUT_MS_1VF: u64 = 3000;
/// Default exclusive-access window with multiple VFs, in milliseconds.
pub const EXCLUSIVE_TIMEOUT_MS_COMMON: u64 = 600;
/// Hard upper bound on the configurable exclusive-access window, in
/// milliseconds.
pub const EXCLUSIVE_TIMEOUT_MS_MAX: u64 = 500_000;

/// How long a single VF is given to acknowledge a reset notification, in
/// microseconds.
pub const TIMEOUT_GUEST_IDH_RESP_US: u64 = 100_000;
/// How long all VFs together are given to acknowledge a whole-GPU reset
/// notification, in microseconds.
pub const TIMEOUT_GUEST_IDH_RESP_GPU_RESET_US: u64 = 1_000_000;
/// Deadline for a mailbox transmit acknowledgement, in microseconds.
pub const TIMEOUT_MAILBOX_ACK_US: u64 = 50_000;

/// SR-IOV spec mandated settle delay after re-enabling VFs, in
/// microseconds.
pub const SRIOV_RESTORE_SETTLE_US: u64 = 100_000;

bitflags! {
    /// Adapter-wide feature flags carried on the init-data blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdapterFlags: u32 {
        /// The PF itself participates in world switching.
        const USE_PF = 1 << 0;
        /// Revoke FB access of inactive VFs.
        const VF_FB_PROTECTION = 1 << 1;
        /// Enable the abuse guard for guest-visible events.
        const SENSITIVE_EVENT_GUARD = 1 << 2;
        /// Disable automatic self-switching on single-VF schedulers.
        const DISABLE_SELF_SWITCH = 1 << 3;
        /// Do not protect MMIO register writes outside full access.
        const DISABLE_MMIO_PROTECTION = 1 << 4;
        /// Live update of the host driver is supported.
        const GPUV_LIVE_UPDATE = 1 << 5;
        /// Record world-switch activity for debugging.
        const WS_RECORD = 1 << 6;
        /// Reserve a debug-dump region in FB.
        const DEBUG_DUMP_ENABLE = 1 << 7;
        /// Log per-event processing times.
        const PERF_LOG_ENABLE = 1 << 8;
        /// Never retire bad pages (test configurations).
        const SKIP_BAD_PAGE_RETIREMENT = 1 << 9;
        /// Idle power-saving support.
        const IPS_POWER_SAVING = 1 << 10;
        /// Escalate every VF hang straight to whole-GPU reset.
        const VF_HANG_GPU_RESET = 1 << 11;
        /// Clear VF framebuffers on guest shutdown.
        const FB_CLEAN_ON_SHUTDOWN = 1 << 12;
    }
}

/// Bad-page detection behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BadPageDetectionMode {
    /// Retire pages and honour the RMA threshold.
    #[default]
    Default,
    /// Skip page retirement and ignore the RMA threshold.
    Mode1,
    /// Retire pages but ignore the RMA threshold.
    Mode2,
}

impl BadPageDetectionMode {
    /// Whether the RMA threshold should be ignored.
    pub fn ignore_rma(self) -> bool {
        !matches!(self, Self::Default)
    }

    /// Whether page retirement should be skipped.
    pub fn skip_retirement(self) -> bool {
        matches!(self, Self::Mode1)
    }
}

/// Options supplied once at `device_init`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Initial number of VFs to configure (1..=31).
    pub num_vf: usize,
    /// Feature flags.
    pub flags: AdapterFlags,
    /// Exclusive-access window in milliseconds; 0 selects the default for
    /// the VF count.
    pub allow_time_full_access_ms: u64,
    /// Bad-page detection behaviour.
    pub bad_page_detection_mode: BadPageDetectionMode,
    /// Retired-page count at which the GPU is declared bad (1..=256).
    pub bad_page_record_threshold: u32,
    /// Skip HW init on the recovered live-update path.
    pub skip_hw_init: bool,
    /// Megabytes reserved in FB for debug dumps.
    pub debug_dump_reserve_mb: u32,
    /// Number of CPER records retained; 0 selects the maximum.
    pub max_cper_count: u32,
    /// Grant one exclusive window per scheduler partition instead of one
    /// per adapter.
    pub per_partition_full_access: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            num_vf: 1,
            flags: AdapterFlags::SENSITIVE_EVENT_GUARD,
            allow_time_full_access_ms: 0,
            bad_page_detection_mode: BadPageDetectionMode::Default,
            bad_page_record_threshold: 256,
            skip_hw_init: false,
            debug_dump_reserve_mb: 0,
            max_cper_count: 0,
            per_partition_full_access: false,
        }
    }
}

/// Runtime-settable device configuration options (`set_dev_conf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfOption {
    /// log::LevelFilter as usize.
    LogLevel(usize),
    /// Enable or disable the abuse guard adapter-wide.
    GuardEnable(bool),
    /// 0 = off, 1 = BACO, 2 = MODE1.
    ForceResetMode(u32),
    /// Disable automatic self-switch.
    DisableSelfSwitch(bool),
    /// Clear a VF's FB on shutdown.
    ClearVfFb(bool),
    /// Treat every VF hang as a whole-GPU reset.
    HangDebug(bool),
    /// Per-command firmware timeout in microseconds.
    CmdTimeoutUs(u64),
    /// Exclusive-access window in milliseconds.
    FullAccessTimeoutMs(u64),
    /// Force the scheduler onto the given VF once.
    ForceSwitchVf(usize),
    /// Toggle MMIO write protection.
    MmioProtection(bool),
    /// Toggle the PSP VF gate.
    PspVfGate(bool),
    /// Minimum hybrid-liquid time slice in microseconds.
    HybridLiquidMinTimeSliceUs(u32),
    /// Hang-detection threshold in microseconds.
    HangDetectionThresholdUs(u64),
    /// Hang-detection sample duration in microseconds.
    HangDetectionDurationUs(u64),
    /// Asymmetric time slice for one VF.
    TimeSlice {
        /// Target VF.
        idx_vf: usize,
        /// Slice in microseconds.
        us: u32,
    },
    /// Asymmetric FB size for one VF.
    FbSize {
        /// Target VF.
        idx_vf: usize,
        /// Size in megabytes.
        mb: u32,
        /// Defragment existing allocations to make room.
        defragment: bool,
    },
    /// Bad-page detection behaviour.
    BadPageDetection(BadPageDetectionMode),
    /// Skip page retirement entirely.
    SkipPageRetirement(bool),
}
