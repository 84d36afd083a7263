// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The per-ASIC capability interface.
//!
//! An ASIC driver implements [`Asic`] and hands it to `device_init`; the
//! scheduler core is ASIC-agnostic and reaches hardware only through this
//! trait. Mandatory methods cover world switching, resets, access gates
//! and the mailbox registers; everything else has a conservative default
//! so simple ASICs implement only what they have.

#[cfg(test)]
pub mod test;

use crate::error::GvError;
use crate::ras::RasBlock;
use crate::ras::mca::{McaBank, McaErrorKind};
use crate::sched::event::{SchedBlock, SchedMode};
use crate::vf::VfIdx;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Firmware command driving one hardware scheduler's VF context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsCmd {
    /// Quiesce the running VF.
    IdleGpu,
    /// Save the idled VF's state.
    SaveGpuState,
    /// Start executing the loaded VF.
    RunGpu,
    /// Load a previously saved VF.
    LoadGpuState,
    /// First-time context initialisation for a VF.
    InitGpu,
    /// Tear the VF's context down.
    ShutdownGpu,
    /// Hand rotation over to the firmware scheduler.
    EnableAutoSched,
    /// Take rotation back from the firmware scheduler.
    DisableAutoSched,
}

bitflags! {
    /// Access classes that can be granted to or revoked from a VF.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VfAccess: u32 {
        /// Framebuffer window.
        const FB = 1 << 0;
        /// Doorbell range.
        const DOORBELL = 1 << 1;
        /// MMIO register writes.
        const MMIO_REG_WRITE = 1 << 2;
        /// Everything.
        const ALL = Self::FB.bits() | Self::DOORBELL.bits() | Self::MMIO_REG_WRITE.bits();
    }
}

/// Static description of one hardware scheduler.
#[derive(Debug, Clone, Copy)]
pub struct HwSchedDesc {
    /// Engine the scheduler drives.
    pub sched_block: SchedBlock,
    /// Dispatch policy.
    pub mode: SchedMode,
    /// Logical world switch this scheduler shares an active list with.
    pub world_switch_id: usize,
}

/// PSP mailbox status read on full-access exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PspMbStatus {
    /// 0 means OK; anything else is logged to the mailbox-failure record.
    pub status: u32,
    /// Firmware id the failure is attributed to.
    pub fw_id: u32,
}

/// Counts returned by an ECC query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EccCounts {
    /// Correctable errors.
    pub correctable: u32,
    /// Uncorrectable errors.
    pub uncorrectable: u32,
    /// Deferred (poison) errors.
    pub deferred: u32,
}

/// A retired framebuffer page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadPage {
    /// Physical page address.
    pub address: u64,
}

/// Saved SR-IOV extended capability, restored after whole-GPU reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SriovConfig {
    /// Raw dwords of the capability block.
    pub dwords: [u32; 16],
}

/// The ASIC driver's side of the contract.
pub trait Asic: Send + Sync {
    /// Hardware scheduler table; index is the `hw_sched_id`.
    fn hw_scheds(&self) -> &[HwSchedDesc];

    /// World switches a VF participates in, as a bitmask of world switch
    /// ids. The default puts every VF on every world switch.
    fn world_switch_mask_for_vf(&self, _idx_vf: VfIdx) -> u64 {
        let n = self
            .hw_scheds()
            .iter()
            .map(|desc| desc.world_switch_id + 1)
            .max()
            .unwrap_or(0);
        (1u64 << n) - 1
    }

    /// Runs one world-switch command to completion, bounded by the
    /// per-command firmware timeout.
    fn run_ws_cmd(&self, hw_sched_id: usize, cmd: WsCmd, idx_vf: VfIdx) -> Result<(), GvError>;

    /// Triggers a hardware FLR of one VF.
    fn trigger_vf_flr(&self, idx_vf: VfIdx) -> Result<(), GvError>;

    /// Triggers a whole-GPU reset (BACO or mode 1, per configuration).
    fn trigger_gpu_reset(&self) -> Result<(), GvError>;

    /// Grants or revokes an access class for a VF.
    fn set_vf_access(&self, idx_vf: VfIdx, select: VfAccess, enable: bool)
    -> Result<(), GvError>;

    /// Asserts or deasserts RLC safe mode around exclusive windows.
    fn rlc_safe_mode(&self, _enable: bool) {}

    /// Enables or disables PSP mailbox interrupts for a VF.
    fn set_psp_mb_int(&self, idx_vf: VfIdx, enable: bool) -> Result<(), GvError>;

    /// Reads the PSP mailbox status for a VF.
    fn psp_mb_status(&self, _idx_vf: VfIdx) -> PspMbStatus {
        PspMbStatus::default()
    }

    /// Destroys the PSP ring while recovering an orphaned VF.
    fn psp_ring_destroy(&self) -> Result<(), GvError> {
        Ok(())
    }

    /// Clears per-VF firmware state after a reset.
    fn psp_clear_vf_fw(&self, _idx_vf: VfIdx) {}

    /// Relays a queued PSP command on behalf of a VF.
    fn psp_vf_cmd_relay(&self, _idx_vf: VfIdx) -> Result<(), GvError> {
        Ok(())
    }

    /// Gates or ungates the MMSCH doorbell of a multimedia scheduler.
    fn set_mmsch_vfgate(
        &self,
        _idx_vf: VfIdx,
        _hw_sched_id: usize,
        _enable: bool,
    ) -> Result<(), GvError> {
        Ok(())
    }

    /// Programs MMSCH features for a VF entering init/reset.
    fn mmsch_config_vf(&self, _idx_vf: VfIdx) -> Result<(), GvError> {
        Ok(())
    }

    /// Drains pending MMSCH notifications.
    fn mmsch_read_output(&self, _idx_vf: VfIdx, _block: SchedBlock) -> Result<(), GvError> {
        Ok(())
    }

    /// Toggles the RLCG register interface for a VF.
    fn toggle_rlcg_interface(&self, _idx_vf: VfIdx, _enable: bool) {}

    /// Whether the CP scheduler is initialised and running on the VF.
    fn cp_sched_running(&self, _idx_vf: VfIdx) -> bool {
        true
    }

    /// Enables the context-empty interrupt used by hybrid-liquid mode.
    fn ctx_empty_intr_control(&self, _hw_sched_id: usize, _enable: bool) {}

    /// Reads one dword of an incoming mailbox message.
    fn mailbox_rcv_msg(&self, idx_vf: VfIdx, offset: usize) -> u32;

    /// Writes one dword of an outgoing mailbox message.
    fn mailbox_trn_msg(&self, idx_vf: VfIdx, offset: usize, dw: u32);

    /// Raises or clears the VALID bit of the outgoing message.
    fn mailbox_set_valid(&self, idx_vf: VfIdx, valid: bool);

    /// Acknowledges the incoming message.
    fn mailbox_ack_msg(&self, idx_vf: VfIdx);

    /// Whether the guest acknowledged the outgoing message.
    fn mailbox_peek_ack(&self, idx_vf: VfIdx) -> bool;

    /// Number of pages the bad-page EEPROM currently records.
    fn eeprom_bad_page_count(&self) -> u32 {
        0
    }

    /// Reads the retired pages recorded in the EEPROM table.
    fn eeprom_get_bad_pages(&self) -> Vec<BadPage> {
        Vec::new()
    }

    /// Erases the bad-page EEPROM table.
    fn eeprom_clear(&self) -> Result<(), GvError> {
        Err(GvError::NotSupported)
    }

    /// Injects a RAS error for validation purposes.
    fn ras_trigger_error(&self, _block: RasBlock, _kind: McaErrorKind) -> Result<(), GvError> {
        Err(GvError::NotSupported)
    }

    /// Appends retired pages to the EEPROM table.
    fn eeprom_append_bad_pages(&self, _pages: &[BadPage]) -> Result<(), GvError> {
        Ok(())
    }

    /// Polls MCA banks and returns banks not reported before.
    fn poll_new_mca_banks(&self, _kind: McaErrorKind) -> Vec<McaBank> {
        Vec::new()
    }

    /// Runs UMC page retirement for a deferred-error bank.
    fn retire_bad_page(&self, _bank: &McaBank) -> Result<BadPage, GvError> {
        Err(GvError::NotSupported)
    }

    /// Remaps a retired page out of a VF's framebuffer window.
    fn replace_bad_page(&self, _page: &BadPage) -> Result<(), GvError> {
        Err(GvError::NotSupported)
    }

    /// Whether the hardware reports poison instead of halting on UE.
    fn poison_mode_supported(&self) -> bool {
        false
    }

    /// Queries accumulated ECC error counts for one RAS block.
    fn query_ecc_counts(&self, _block: RasBlock) -> EccCounts {
        EccCounts::default()
    }

    /// Writes into a VF's framebuffer at `offset` bytes from its FB base.
    fn write_vf_fb(&self, idx_vf: VfIdx, offset: u64, data: &[u8]) -> Result<(), GvError>;

    /// Reads from a VF's framebuffer.
    fn read_vf_fb(&self, idx_vf: VfIdx, offset: u64, buf: &mut [u8]) -> Result<(), GvError>;

    /// Copies the VBIOS image into a VF's framebuffer.
    fn copy_vbios_to_vf(&self, _idx_vf: VfIdx) -> Result<(), GvError> {
        Ok(())
    }

    /// Copies the IP-discovery blob into a VF's framebuffer.
    fn copy_ip_discovery_to_vf(&self, _idx_vf: VfIdx) -> Result<(), GvError> {
        Ok(())
    }

    /// Fills a VF's framebuffer with `pattern`.
    fn clear_vf_fb(&self, _idx_vf: VfIdx, _pattern: u8) -> Result<(), GvError> {
        Ok(())
    }

    /// Saves the SR-IOV extended capability before a whole-GPU reset.
    fn save_sriov_config(&self) -> SriovConfig {
        SriovConfig::default()
    }

    /// Restores the SR-IOV extended capability and re-enables VFs.
    fn restore_sriov_config(&self, _config: &SriovConfig) -> Result<(), GvError> {
        Ok(())
    }

    /// Restores VF resizable BAR sizing after SR-IOV re-enable.
    fn restore_vf_rebar(&self) -> Result<(), GvError> {
        Ok(())
    }

    /// Enables or disables the IV ring (interrupt vectors).
    fn iv_ring_enable(&self, _enable: bool) {}

    /// Enables or disables mailbox interrupt delivery.
    fn mbox_irq_enable(&self, _enable: bool) {}

    /// Enters the idle power-saving state.
    fn enter_power_saving(&self) -> Result<(), GvError> {
        Err(GvError::NotSupported)
    }

    /// Leaves the idle power-saving state.
    fn exit_power_saving(&self) -> Result<(), GvError> {
        Err(GvError::NotSupported)
    }

    /// Refreshes the XGMI topology in firmware.
    fn update_topology(&self) -> Result<(), GvError> {
        Ok(())
    }

    /// Reads the XGMI topology from firmware.
    fn get_topology(&self) -> Result<(), GvError> {
        Ok(())
    }

    /// Loads the DFC firmware when the PF is scheduled.
    fn load_dfc_fw(&self) -> Result<(), GvError> {
        Ok(())
    }

    /// Applies a staged live firmware update.
    fn live_update_fw(&self) -> Result<(), GvError> {
        Ok(())
    }

    /// Clears scratch registers handed to a fresh guest.
    fn clean_scratch_registers(&self, _idx_vf: VfIdx) {}

    /// Collects ASIC-specific diagnosis data, at most `max_size` bytes.
    fn collect_diag_data(&self, _idx_vf: VfIdx, _max_size: usize) -> Vec<u8> {
        Vec::new()
    }

    /// Reports the terminal RMA condition to firmware.
    fn report_rma_to_fw(&self) {}
}
