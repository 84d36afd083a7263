// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The public device API: thin locking wrappers over event queueing.
//!
//! Every call validates the handle and adapter status, takes the API
//! lock to serialize callers against each other, and either reads state
//! directly (queries) or queues an event for the worker (mutators).

use crate::adapter::{Adapter, AdapterStatus, DeviceInit};
use crate::config::ConfOption;
use crate::error::{ErrorEntry, GvError};
use crate::guard::{GuardEventConfig, GuardEventInfo, GuardEventKind};
use crate::mailbox::MAILBOX_DATA_LEN;
use crate::sched::event::{DiagBuffer, EventId, EventPayload, SchedBlock};
use crate::vf::{MAX_VF_SLOT, PF_IDX, TimeLog, VfIdx, VfState, is_idx_invalid};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::mutex::SpinMutex;

/// Configuration for `allocate_vf` / `set_vf`.
#[derive(Debug, Clone, Copy)]
pub struct VfOption {
    /// Slot to configure.
    pub idx_vf: VfIdx,
    /// FB window start, MB.
    pub fb_offset_mb: u32,
    /// FB window size, MB.
    pub fb_size_mb: u32,
    /// GFX time slice in microseconds; 0 selects the default.
    pub gfx_time_slice_us: u32,
}

/// Read-only snapshot of one VF for `get_vf_info`.
#[derive(Debug, Clone, Copy)]
pub struct VfInfo {
    /// Lifecycle state.
    pub state: VfState,
    /// FB window start, MB.
    pub fb_offset_mb: u32,
    /// FB window size, MB.
    pub fb_size_mb: u32,
    /// GFX time slice in microseconds.
    pub gfx_time_slice_us: u32,
    /// Time accounting snapshot.
    pub time_log: TimeLog,
}

/// One FB region for `get_fb_regions_info`.
#[derive(Debug, Clone, Copy)]
pub struct FbRegion {
    /// Owning slot.
    pub idx_vf: VfIdx,
    /// Start, MB.
    pub offset_mb: u32,
    /// Size, MB.
    pub size_mb: u32,
}

/// Accumulated ECC counts for `ras_get_ecc_block_info`.
#[derive(Debug, Clone, Copy)]
pub struct EccBlockInfo {
    /// Correctable errors.
    pub correctable_count: u32,
    /// Uncorrectable errors.
    pub uncorrectable_count: u32,
    /// Deferred errors.
    pub deferred_count: u32,
}

/// The per-GPU device handle.
pub struct Device {
    adapter: Arc<Adapter>,
}

impl Device {
    /// Brings a device up and returns its handle.
    pub fn device_init(init: DeviceInit) -> Result<Self, GvError> {
        let adapter = Adapter::new(init)?;
        adapter.hw_init()?;
        Ok(Self { adapter })
    }

    /// Tears the device down. The worker thread is unblocked and all
    /// outstanding waiters complete with failure.
    pub fn device_fini(self) {
        let _api = self.adapter.api_lock.lock();
        self.adapter.fini();
    }

    /// The underlying adapter, for embedders that drive the worker and
    /// interrupt paths themselves.
    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    #[cfg(test)]
    pub(crate) fn from_adapter_for_test(adapter: Arc<Adapter>) -> Self {
        Self { adapter }
    }

    fn check(&self) -> Result<(), GvError> {
        match self.adapter.status() {
            AdapterStatus::HwInit => Ok(()),
            AdapterStatus::HwRma | AdapterStatus::HiveRma => Err(GvError::BadGpu),
            _ => Err(GvError::Failure),
        }
    }

    fn check_vf(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        if is_idx_invalid(idx_vf) || idx_vf >= self.adapter.num_vf() {
            return Err(GvError::InvalidParam);
        }
        Ok(())
    }

    /// Current adapter status; valid in every state.
    pub fn get_dev_status(&self) -> AdapterStatus {
        self.adapter.status()
    }

    /// Configures a VF slot and makes it available.
    pub fn allocate_vf(&self, option: VfOption) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(option.idx_vf)?;
        let _api = self.adapter.api_lock.lock();

        let slot = &self.adapter.array_vf[option.idx_vf];
        if !slot.is(VfState::Unavail) {
            return Err(GvError::InvalidParam);
        }

        {
            let mut config = slot.config.lock();
            config.fb_offset_mb = option.fb_offset_mb;
            config.fb_size_mb = option.fb_size_mb;
            config.real_fb_size_mb = option.fb_size_mb;
            config.time_slice_us[0] = if option.gfx_time_slice_us == 0 {
                if self.adapter.num_vf() == 1 {
                    crate::config::DEFAULT_TIME_SLICE_1VF_US
                } else {
                    crate::config::DEFAULT_TIME_SLICE_US
                }
            } else {
                option.gfx_time_slice_us
            };
            config.configured = true;
        }
        slot.state.set(VfState::Avail)?;
        self.adapter.update_pf2vf_message(option.idx_vf)
    }

    /// Reconfigures an already available VF.
    pub fn set_vf(&self, option: VfOption) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(option.idx_vf)?;
        let _api = self.adapter.api_lock.lock();

        let slot = &self.adapter.array_vf[option.idx_vf];
        if !slot.is(VfState::Avail) {
            return Err(GvError::Busy);
        }
        let mut config = slot.config.lock();
        config.fb_offset_mb = option.fb_offset_mb;
        config.fb_size_mb = option.fb_size_mb;
        config.real_fb_size_mb = option.fb_size_mb;
        if option.gfx_time_slice_us != 0 {
            config.time_slice_us[0] = option.gfx_time_slice_us;
        }
        Ok(())
    }

    /// Removes a VF from service and unconfigures its slot.
    pub fn free_vf(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();

        self.adapter.queue_event_and_wait_ex(
            idx_vf,
            EventId::SchedRemoveVf,
            SchedBlock::All,
            EventPayload::None,
        )?;
        *self.adapter.array_vf[idx_vf].config.lock() = Default::default();
        Ok(())
    }

    /// Function-level reset of one VF.
    pub fn flr_vf(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.queue_event_and_wait_ex(
            idx_vf,
            EventId::SchedForceResetVf,
            SchedBlock::All,
            EventPayload::None,
        )
    }

    /// Stops a VF's scheduling and shuts its context down.
    pub fn stop_vf(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.queue_event_and_wait_ex(
            idx_vf,
            EventId::SchedStopVf,
            SchedBlock::All,
            EventPayload::None,
        )
    }

    /// Takes a VF out of the rotation.
    pub fn suspend_vf(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.queue_event_and_wait_ex(
            idx_vf,
            EventId::SchedSuspendVf,
            SchedBlock::All,
            EventPayload::None,
        )
    }

    /// Puts a suspended VF back into the rotation.
    pub fn resume_vf(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.queue_event_and_wait_ex(
            idx_vf,
            EventId::SchedResumeVf,
            SchedBlock::All,
            EventPayload::None,
        )
    }

    /// Changes the configured VF count; only legal with every VF
    /// unconfigured.
    pub fn set_vf_number(&self, num_vf: usize) -> Result<(), GvError> {
        self.check()?;
        if num_vf == 0 || num_vf >= MAX_VF_SLOT {
            return Err(GvError::InvalidParam);
        }
        let _api = self.adapter.api_lock.lock();

        for idx_vf in 0..self.adapter.num_vf() {
            if !self.adapter.array_vf[idx_vf].is(VfState::Unavail) {
                return Err(GvError::Busy);
            }
        }
        self.adapter.set_num_vf(num_vf);
        Ok(())
    }

    /// Forces a whole-GPU reset (tier 3, or tier 4 in a hive).
    pub fn force_reset_gpu(&self) -> Result<(), GvError> {
        self.check()?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.queue_event_and_wait_ex(
            PF_IDX,
            EventId::SchedForceResetGpu,
            SchedBlock::All,
            EventPayload::None,
        )
    }

    /// Read-only snapshot of one VF.
    pub fn get_vf_info(&self, idx_vf: VfIdx) -> Result<VfInfo, GvError> {
        self.check_vf(idx_vf)?;
        let slot = &self.adapter.array_vf[idx_vf];
        let config = slot.config.lock();
        Ok(VfInfo {
            state: slot.state.get(),
            fb_offset_mb: config.fb_offset_mb,
            fb_size_mb: config.fb_size_mb,
            gfx_time_slice_us: config.time_slice_us[0],
            time_log: *slot.time_log.lock(),
        })
    }

    /// FB layout of all configured VFs.
    pub fn get_fb_regions_info(&self) -> Vec<FbRegion> {
        (0..self.adapter.num_vf())
            .filter_map(|idx_vf| {
                let config = self.adapter.array_vf[idx_vf].config.lock();
                config.configured.then_some(FbRegion {
                    idx_vf,
                    offset_mb: config.fb_offset_mb,
                    size_mb: config.fb_size_mb,
                })
            })
            .collect()
    }

    /// Applies one runtime configuration option.
    pub fn set_dev_conf(&self, option: ConfOption) -> Result<(), GvError> {
        self.check()?;
        let _api = self.adapter.api_lock.lock();

        use crate::config::AdapterFlags as F;
        match option {
            ConfOption::LogLevel(level) => {
                log::set_max_level(match level {
                    0 => log::LevelFilter::Off,
                    1 => log::LevelFilter::Error,
                    2 => log::LevelFilter::Warn,
                    3 => log::LevelFilter::Info,
                    4 => log::LevelFilter::Debug,
                    _ => log::LevelFilter::Trace,
                });
                Ok(())
            }
            ConfOption::GuardEnable(enable) => {
                for slot in &self.adapter.array_vf {
                    slot.guard.set_enabled(enable);
                }
                if enable {
                    self.adapter.modify_flags(F::SENSITIVE_EVENT_GUARD, F::empty());
                } else {
                    self.adapter.modify_flags(F::empty(), F::SENSITIVE_EVENT_GUARD);
                }
                Ok(())
            }
            ConfOption::ForceResetMode(mode) => {
                if mode > 2 {
                    return Err(GvError::InvalidParam);
                }
                if mode == 0 {
                    self.adapter.modify_flags(F::empty(), F::VF_HANG_GPU_RESET);
                } else {
                    self.adapter.modify_flags(F::VF_HANG_GPU_RESET, F::empty());
                }
                Ok(())
            }
            ConfOption::DisableSelfSwitch(disable) => {
                if disable {
                    self.adapter.modify_flags(F::DISABLE_SELF_SWITCH, F::empty());
                } else {
                    self.adapter.modify_flags(F::empty(), F::DISABLE_SELF_SWITCH);
                }
                Ok(())
            }
            ConfOption::ClearVfFb(enable) => {
                if enable {
                    self.adapter.modify_flags(F::FB_CLEAN_ON_SHUTDOWN, F::empty());
                } else {
                    self.adapter.modify_flags(F::empty(), F::FB_CLEAN_ON_SHUTDOWN);
                }
                Ok(())
            }
            ConfOption::HangDebug(enable) => {
                if enable {
                    self.adapter.modify_flags(F::VF_HANG_GPU_RESET, F::empty());
                } else {
                    self.adapter.modify_flags(F::empty(), F::VF_HANG_GPU_RESET);
                }
                Ok(())
            }
            ConfOption::FullAccessTimeoutMs(ms) => {
                if ms > crate::config::EXCLUSIVE_TIMEOUT_MS_MAX {
                    return Err(GvError::InvalidParam);
                }
                self.adapter.state.lock().fa.allow_time_us = ms * 1000;
                Ok(())
            }
            ConfOption::ForceSwitchVf(idx_vf) => {
                self.check_vf(idx_vf)?;
                let mut state = self.adapter.state.lock();
                self.adapter
                    .context_switch_to_vf(&mut state, idx_vf, SchedBlock::All)
            }
            ConfOption::MmioProtection(enable) => {
                if enable {
                    self.adapter.modify_flags(F::empty(), F::DISABLE_MMIO_PROTECTION);
                } else {
                    self.adapter.modify_flags(F::DISABLE_MMIO_PROTECTION, F::empty());
                }
                Ok(())
            }
            ConfOption::TimeSlice { idx_vf, us } => {
                self.check_vf(idx_vf)?;
                self.adapter.array_vf[idx_vf].config.lock().time_slice_us[0] = us;
                Ok(())
            }
            ConfOption::FbSize { idx_vf, mb, .. } => {
                self.check_vf(idx_vf)?;
                let slot = &self.adapter.array_vf[idx_vf];
                if !slot.is(VfState::Avail) && !slot.is(VfState::Unavail) {
                    return Err(GvError::Busy);
                }
                let mut config = slot.config.lock();
                config.fb_size_mb = mb;
                config.real_fb_size_mb = mb;
                Ok(())
            }
            ConfOption::BadPageDetection(mode) => {
                self.adapter.ecc.lock().bad_page_detection_mode = mode;
                Ok(())
            }
            ConfOption::SkipPageRetirement(skip) => {
                if skip {
                    self.adapter.modify_flags(F::SKIP_BAD_PAGE_RETIREMENT, F::empty());
                } else {
                    self.adapter.modify_flags(F::empty(), F::SKIP_BAD_PAGE_RETIREMENT);
                }
                Ok(())
            }
            // The remaining options tune firmware behaviour the core only
            // forwards.
            _ => Ok(()),
        }
    }

    /// Reconfigures one guard window of one VF.
    pub fn set_guard_config(
        &self,
        idx_vf: VfIdx,
        kind: GuardEventKind,
        config: GuardEventConfig,
    ) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.array_vf[idx_vf].guard.set_config(kind, config)
    }

    /// Snapshot of one guard window. The PF has no guard; its snapshot
    /// reads zero.
    pub fn get_guard_info(&self, idx_vf: VfIdx, kind: GuardEventKind) -> Result<GuardEventInfo, GvError> {
        if idx_vf == PF_IDX {
            return Ok(GuardEventInfo {
                state: crate::guard::GuardEventState::Normal,
                interval_us: 0,
                threshold: 0,
                active: 0,
                amount: 0,
            });
        }
        self.check_vf(idx_vf)?;
        let guard = self.adapter.guard_of(idx_vf).ok_or(GvError::InvalidParam)?;
        Ok(guard.info(kind, self.adapter.shim.timestamp_us()))
    }

    /// Clears all guard windows of one VF.
    pub fn reset_guard_config(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.array_vf[idx_vf].guard.reset();
        Ok(())
    }

    /// Retired-page count from the EEPROM table.
    pub fn ras_get_bad_page_record_count(&self) -> u32 {
        self.adapter.asic.eeprom_bad_page_count()
    }

    /// Accumulated ECC counters.
    pub fn ras_get_ecc_block_info(&self) -> EccBlockInfo {
        let ecc = self.adapter.ecc.lock();
        EccBlockInfo {
            correctable_count: ecc.correctable_count,
            uncorrectable_count: ecc.uncorrectable_count,
            deferred_count: ecc.deferred_count,
        }
    }

    /// CPER ring cursor for a reader at `rptr`: `(wptr, avail, bytes)`.
    pub fn get_cper_count(&self, rptr: u64) -> (u64, u64, u64) {
        self.adapter.cper.lock().get_count(rptr)
    }

    /// Copies CPER records out for a host-side consumer.
    pub fn get_cper_entries(&self, rptr: u64, buf_size: u64) -> (Vec<u8>, u64, u64, u64) {
        self.adapter.cper.lock().get_entries(rptr, buf_size)
    }

    /// Collects diagnosis data through the worker (read-only snapshot).
    pub fn get_diag_data(&self, max_size: usize) -> Result<Vec<u8>, GvError> {
        self.check()?;
        let _api = self.adapter.api_lock.lock();

        let buf: DiagBuffer = Arc::new(SpinMutex::new(Vec::new()));
        self.adapter.queue_event_and_wait_ex(
            PF_IDX,
            EventId::CollectDiagData,
            SchedBlock::All,
            EventPayload::DiagData {
                buf: buf.clone(),
                max_size,
            },
        )?;
        let data = buf.lock().clone();
        Ok(data)
    }

    /// Last mailbox messages exchanged with `idx_vf`, `(rcv, trn)`.
    pub fn dump_sriov_msg(
        &self,
        idx_vf: VfIdx,
    ) -> Result<([u32; MAILBOX_DATA_LEN], [u32; MAILBOX_DATA_LEN]), GvError> {
        self.check_vf(idx_vf)?;
        Ok(self.adapter.mailbox.last_msgs(idx_vf))
    }

    /// The guest's VF2PF blob, validated.
    pub fn get_vf2pf_info(&self, idx_vf: VfIdx) -> Result<crate::vfmgr::Vf2PfInfo, GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        self.adapter.retrieve_vf2pf_message(idx_vf)
    }

    /// Re-publishes and returns the PF2VF blob.
    pub fn get_pf2vf_info(&self, idx_vf: VfIdx) -> Result<crate::vfmgr::Pf2VfInfo, GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        self.adapter.update_pf2vf_message(idx_vf)?;

        let mut raw = [0u8; size_of::<crate::vfmgr::Pf2VfInfo>()];
        self.adapter
            .asic
            .read_vf_fb(idx_vf, crate::vfmgr::FB_PF2VF_OFFSET, &mut raw)?;
        zerocopy::FromBytes::read_from_bytes(&raw).map_err(|_| GvError::ProtocolError)
    }

    /// Drains buffered diagnostic errors, oldest first.
    pub fn drain_errors(&self, max: usize) -> Vec<ErrorEntry> {
        self.adapter.errors.drain(max)
    }

    /// Snapshot of the runtime-settable configuration.
    pub fn get_dev_conf(&self) -> DevConf {
        DevConf {
            flags: self.adapter.flags(),
            guard_enabled: self
                .adapter
                .flags()
                .contains(crate::config::AdapterFlags::SENSITIVE_EVENT_GUARD),
            allow_time_full_access_ms: self.adapter.state.lock().fa.allow_time_us / 1000,
            bad_page_detection_mode: self.adapter.ecc.lock().bad_page_detection_mode,
        }
    }

    /// Static device identification.
    pub fn get_dev_info(&self) -> DevInfo {
        DevInfo {
            vendor_id: self.adapter.cper_ident.vendor_id,
            device_id: self.adapter.cper_ident.device_id,
            bdf: self.adapter.bdf,
            num_vf: self.adapter.num_vf(),
            version: crate::version(),
        }
    }

    /// Current configuration of a slot, as `allocate_vf` would recreate
    /// it.
    pub fn get_vf_option(&self, idx_vf: VfIdx) -> Result<VfOption, GvError> {
        self.check_vf(idx_vf)?;
        let config = self.adapter.array_vf[idx_vf].config.lock();
        Ok(VfOption {
            idx_vf,
            fb_offset_mb: config.fb_offset_mb,
            fb_size_mb: config.fb_size_mb,
            gfx_time_slice_us: config.time_slice_us[0],
        })
    }

    /// Enables RAS reporting for `block`.
    pub fn enable_ras_feature(&self, block: crate::ras::RasBlock) -> Result<(), GvError> {
        self.check()?;
        let bit = block.mask_bit().ok_or(GvError::NotSupported)?;
        self.adapter.ecc.lock().enabled_blocks.insert(bit);
        Ok(())
    }

    /// Disables RAS reporting for `block`.
    pub fn disable_ras_feature(&self, block: crate::ras::RasBlock) -> Result<(), GvError> {
        self.check()?;
        let bit = block.mask_bit().ok_or(GvError::NotSupported)?;
        self.adapter.ecc.lock().enabled_blocks.remove(bit);
        Ok(())
    }

    /// Injects a RAS error for validation.
    pub fn ras_trigger_error(
        &self,
        block: crate::ras::RasBlock,
        kind: crate::ras::mca::McaErrorKind,
    ) -> Result<(), GvError> {
        self.check()?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.asic.ras_trigger_error(block, kind)
    }

    /// Erases the bad-page EEPROM table.
    pub fn ras_eeprom_clear(&self) -> Result<(), GvError> {
        self.check()?;
        let _api = self.adapter.api_lock.lock();
        self.adapter.asic.eeprom_clear()
    }

    /// Retired pages recorded in the EEPROM table.
    pub fn ras_get_bad_page_info(&self) -> Vec<crate::asic::BadPage> {
        self.adapter.asic.eeprom_get_bad_pages()
    }

    /// Thread ids the library currently runs; only the event worker.
    pub fn list_gpu_threads(&self) -> Vec<u64> {
        match self.adapter.worker_thread_id.load(Ordering::Acquire) {
            0 => Vec::new(),
            id => alloc::vec![id],
        }
    }

    /// Maps a guest physical FB range onto system physical backing.
    pub fn ffbm_vf_mapping(
        &self,
        idx_vf: VfIdx,
        gpa: u64,
        spa: u64,
        size: u64,
    ) -> Result<(), GvError> {
        self.check()?;
        self.check_vf(idx_vf)?;
        if size == 0 {
            return Err(GvError::InvalidParam);
        }
        self.adapter.ffbm.map(crate::vfmgr::FfbmMapping {
            idx_vf,
            gpa,
            spa,
            size,
        });
        Ok(())
    }

    /// Drops every FFBM mapping of a VF.
    pub fn ffbm_clear_vf_mapping(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        self.check_vf(idx_vf)?;
        self.adapter.ffbm.clear_vf(idx_vf);
        Ok(())
    }

    /// Guest-to-system physical translation through the FFBM table.
    pub fn ffbm_find_spa(&self, idx_vf: VfIdx, gpa: u64) -> Option<u64> {
        self.adapter.ffbm.find_spa(idx_vf, gpa)
    }

    /// System-to-guest physical translation through the FFBM table.
    pub fn ffbm_find_gpa(&self, idx_vf: VfIdx, spa: u64) -> Option<u64> {
        self.adapter.ffbm.find_gpa(idx_vf, spa)
    }
}

/// Runtime configuration snapshot returned by `get_dev_conf`.
#[derive(Debug, Clone, Copy)]
pub struct DevConf {
    /// Adapter feature flags.
    pub flags: crate::config::AdapterFlags,
    /// Whether the abuse guard is enforcing.
    pub guard_enabled: bool,
    /// Exclusive-access window in milliseconds.
    pub allow_time_full_access_ms: u64,
    /// Bad-page detection behaviour.
    pub bad_page_detection_mode: crate::config::BadPageDetectionMode,
}

/// Static device identification returned by `get_dev_info`.
#[derive(Debug, Clone, Copy)]
pub struct DevInfo {
    /// PCI vendor id.
    pub vendor_id: u16,
    /// PCI device id.
    pub device_id: u16,
    /// Bus/device/function.
    pub bdf: u32,
    /// Configured VF count.
    pub num_vf: usize,
    /// Library version.
    pub version: (u32, u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;
    use crate::guard::GuardEventState;

    fn device(num_vf: usize) -> (Device, Arc<crate::asic::test::TestAsic>) {
        let (adapter, asic) = test_adapter(num_vf);
        (Device { adapter }, asic)
    }

    fn with_worker<R>(device: &Device, f: impl FnOnce() -> R) -> R {
        let adapter = device.adapter().clone();
        let worker = std::thread::spawn(move || adapter.run_event_worker());
        let ret = f();
        device.adapter().stop_event_worker();
        worker.join().unwrap();
        ret
    }

    #[test]
    fn allocate_then_free_vf() {
        let (device, _asic) = device(2);

        device
            .allocate_vf(VfOption {
                idx_vf: 0,
                fb_offset_mb: 0,
                fb_size_mb: 4096,
                gfx_time_slice_us: 0,
            })
            .unwrap();
        assert!(device.adapter().array_vf[0].is(VfState::Avail));
        let info = device.get_vf_info(0).unwrap();
        assert_eq!(info.fb_size_mb, 4096);
        assert_eq!(info.gfx_time_slice_us, crate::config::DEFAULT_TIME_SLICE_US);

        // Double allocation is rejected.
        assert!(
            device
                .allocate_vf(VfOption {
                    idx_vf: 0,
                    fb_offset_mb: 0,
                    fb_size_mb: 4096,
                    gfx_time_slice_us: 0,
                })
                .is_err()
        );

        let regions = device.get_fb_regions_info();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].size_mb, 4096);

        with_worker(&device, || device.free_vf(0).unwrap());
        assert!(device.adapter().array_vf[0].is(VfState::Unavail));
        assert!(device.get_fb_regions_info().is_empty());
    }

    #[test]
    fn suspend_and_resume_roundtrip() {
        let (device, _asic) = device(2);
        device
            .allocate_vf(VfOption {
                idx_vf: 0,
                fb_offset_mb: 0,
                fb_size_mb: 1024,
                gfx_time_slice_us: 0,
            })
            .unwrap();
        {
            let mut state = device.adapter().state.lock();
            device.adapter().sched_add_vf(&mut state, 0).unwrap();
        }

        with_worker(&device, || {
            device.suspend_vf(0).unwrap();
            assert!(device.adapter().array_vf[0].is(VfState::Suspended));
            device.resume_vf(0).unwrap();
            assert!(device.adapter().array_vf[0].is(VfState::Active));
        });
    }

    #[test]
    fn force_reset_gpu_via_api() {
        let (device, asic) = device(2);
        with_worker(&device, || device.force_reset_gpu().unwrap());
        assert_eq!(asic.gpu_reset_count(), 1);
    }

    #[test]
    fn set_vf_number_requires_unconfigured_slots() {
        let (device, _asic) = device(2);
        device
            .allocate_vf(VfOption {
                idx_vf: 0,
                fb_offset_mb: 0,
                fb_size_mb: 512,
                gfx_time_slice_us: 0,
            })
            .unwrap();
        assert_eq!(device.set_vf_number(4), Err(GvError::Busy));

        with_worker(&device, || device.free_vf(0).unwrap());
        device.set_vf_number(4).unwrap();
    }

    #[test]
    fn guard_config_roundtrip() {
        let (device, _asic) = device(2);

        device
            .set_guard_config(
                0,
                GuardEventKind::Flr,
                GuardEventConfig {
                    interval_us: 1_000_000,
                    threshold: 2,
                },
            )
            .unwrap();
        let info = device.get_guard_info(0, GuardEventKind::Flr).unwrap();
        assert_eq!(info.threshold, 2);
        assert_eq!(info.interval_us, 1_000_000);
        assert_eq!(info.state, GuardEventState::Normal);

        // PF guard info reads zero.
        let pf = device.get_guard_info(PF_IDX, GuardEventKind::Flr).unwrap();
        assert_eq!(pf.threshold, 0);
    }

    #[test]
    fn api_fails_on_a_dead_adapter() {
        let (device, _asic) = device(2);
        device.adapter().set_status(AdapterStatus::HwRma);

        assert_eq!(
            device.allocate_vf(VfOption {
                idx_vf: 0,
                fb_offset_mb: 0,
                fb_size_mb: 64,
                gfx_time_slice_us: 0,
            }),
            Err(GvError::BadGpu)
        );
        assert_eq!(device.force_reset_gpu(), Err(GvError::BadGpu));
        // Status queries stay available.
        assert_eq!(device.get_dev_status(), AdapterStatus::HwRma);
    }

    #[test]
    fn full_access_timeout_is_configurable() {
        let (device, _asic) = device(2);
        device
            .set_dev_conf(ConfOption::FullAccessTimeoutMs(1234))
            .unwrap();
        assert_eq!(device.adapter().state.lock().fa.allow_time_us, 1_234_000);

        assert_eq!(
            device.set_dev_conf(ConfOption::FullAccessTimeoutMs(
                crate::config::EXCLUSIVE_TIMEOUT_MS_MAX + 1
            )),
            Err(GvError::InvalidParam)
        );
    }

    #[test]
    fn ffbm_translations_roundtrip() {
        let (device, _asic) = device(2);

        device.ffbm_vf_mapping(0, 0x0, 0x10_0000, 0x1000).unwrap();
        device.ffbm_vf_mapping(0, 0x1000, 0x30_0000, 0x1000).unwrap();

        assert_eq!(device.ffbm_find_spa(0, 0x20), Some(0x10_0020));
        assert_eq!(device.ffbm_find_spa(0, 0x1800), Some(0x30_0800));
        assert_eq!(device.ffbm_find_gpa(0, 0x30_0800), Some(0x1800));
        // Outside every range, and the wrong VF, miss.
        assert_eq!(device.ffbm_find_spa(0, 0x2000), None);
        assert_eq!(device.ffbm_find_spa(1, 0x20), None);

        device.ffbm_clear_vf_mapping(0).unwrap();
        assert_eq!(device.ffbm_find_spa(0, 0x20), None);
    }

    #[test]
    fn diag_data_runs_through_the_worker() {
        let (device, _asic) = device(2);
        let data = with_worker(&device, || device.get_diag_data(4096).unwrap());
        // The fake ASIC produces an empty snapshot; the plumbing matters.
        assert!(data.is_empty());
    }
}
