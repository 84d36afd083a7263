// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-VF framebuffer management: the PF2VF/VF2PF message blobs at fixed
//! FB offsets, RAS telemetry staging, and FB initialisation.
//!
//! Blob layouts are wire formats shared with guest drivers and must stay
//! bit-stable. The checksum is a trivial 32-bit byte sum that skips the
//! checksum field itself; rewriting a blob and re-checksumming is a fixed
//! point.

use crate::adapter::Adapter;
use crate::error::GvError;
use crate::ras::cper;
use crate::vf::VfIdx;
use core::mem::offset_of;
use core::sync::atomic::Ordering;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// FB offset of the PF-to-VF blob, bytes from the VF FB base.
pub const FB_PF2VF_OFFSET: u64 = 0x1_0000;
/// FB offset of the VF-to-PF blob.
pub const FB_VF2PF_OFFSET: u64 = 0x1_1000;
/// FB offset of the RAS telemetry staging region.
pub const FB_RAS_TELEMETRY_OFFSET: u64 = 0x1_2000;
/// Byte budget of the RAS telemetry staging region.
pub const FB_RAS_TELEMETRY_SIZE: u64 = 0x4_0000;

const PF2VF_VERSION: u32 = 2;
const VF2PF_VERSION: u32 = 2;

/// Common header of the FB message blobs.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default, PartialEq)]
#[repr(C, packed)]
pub struct MsgHeader {
    /// Total blob size in bytes.
    pub size: u32,
    /// Layout version.
    pub version: u32,
    /// 32-bit byte sum of the blob, skipping this field.
    pub checksum: u32,
    /// Reserved.
    pub reserved: u32,
}

/// Host-to-guest message blob.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct Pf2VfInfo {
    /// Header.
    pub header: MsgHeader,
    /// Adapter feature bits mirrored to the guest.
    pub feature_flags: u32,
    /// Usable FB size in MB.
    pub fb_usable_size_mb: u32,
    /// The VF's GFX time slice in microseconds.
    pub time_slice_us: u32,
    /// Incremented whenever VRAM content was lost in a reset.
    pub vram_lost_count: u32,
    /// Pages currently retired out of this VF's window.
    pub bad_pages_count: u32,
    /// CPER ring write pointer at publish time.
    pub cper_wptr: u64,
    /// Reserved.
    pub reserved: [u32; 6],
}

/// Guest-to-host message blob.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default, PartialEq)]
#[repr(C, packed)]
pub struct Vf2PfInfo {
    /// Header.
    pub header: MsgHeader,
    /// Guest driver version string, NUL padded.
    pub driver_version: [u8; 32],
    /// Guest-reported FB usage in MB.
    pub fb_usage_mb: u32,
    /// Guest uptime in seconds.
    pub uptime_s: u32,
    /// Reserved.
    pub reserved: [u32; 6],
}

/// Header of the RAS telemetry staging region.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct RasTelemetryHeader {
    /// Header.
    pub header: MsgHeader,
    /// Correctable error total.
    pub correctable_count: u32,
    /// Uncorrectable error total.
    pub uncorrectable_count: u32,
    /// Deferred error total.
    pub deferred_count: u32,
    /// CPER records staged after this header.
    pub record_count: u32,
    /// Host write pointer after the staged records.
    pub wptr: u64,
    /// Records the reader lost to ring overwrite.
    pub overflow_count: u64,
    /// Bytes of staged records.
    pub payload_bytes: u32,
    /// More records remain; the guest should ask again.
    pub more: u32,
}

/// One flexible-framebuffer-mapping entry: a guest physical range mapped
/// onto system physical backing. Used to steer guest windows around
/// retired pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfbmMapping {
    /// Owning function.
    pub idx_vf: VfIdx,
    /// Guest physical start address.
    pub gpa: u64,
    /// System physical start address.
    pub spa: u64,
    /// Range size in bytes.
    pub size: u64,
}

/// The per-adapter FFBM table.
#[derive(Default)]
pub struct FfbmTable {
    mappings: spin::mutex::SpinMutex<alloc::vec::Vec<FfbmMapping>>,
}

impl FfbmTable {
    /// Adds or replaces the mapping starting at `gpa` for `idx_vf`.
    pub fn map(&self, mapping: FfbmMapping) {
        let mut mappings = self.mappings.lock();
        mappings.retain(|m| !(m.idx_vf == mapping.idx_vf && m.gpa == mapping.gpa));
        mappings.push(mapping);
    }

    /// Drops every mapping of `idx_vf`.
    pub fn clear_vf(&self, idx_vf: VfIdx) {
        self.mappings.lock().retain(|m| m.idx_vf != idx_vf);
    }

    /// Translates a guest physical address to its system physical
    /// address.
    pub fn find_spa(&self, idx_vf: VfIdx, gpa: u64) -> Option<u64> {
        self.mappings
            .lock()
            .iter()
            .find(|m| m.idx_vf == idx_vf && (m.gpa..m.gpa + m.size).contains(&gpa))
            .map(|m| m.spa + (gpa - m.gpa))
    }

    /// Reverse translation from a system physical address.
    pub fn find_gpa(&self, idx_vf: VfIdx, spa: u64) -> Option<u64> {
        self.mappings
            .lock()
            .iter()
            .find(|m| m.idx_vf == idx_vf && (m.spa..m.spa + m.size).contains(&spa))
            .map(|m| m.gpa + (spa - m.spa))
    }
}

/// Computes the blob checksum: the 32-bit sum of every byte outside the
/// checksum field itself.
pub fn blob_checksum(bytes: &[u8], checksum_offset: usize) -> u32 {
    let mut sum = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        if (checksum_offset..checksum_offset + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(u32::from(b));
    }
    sum
}

const HEADER_CHECKSUM_OFFSET: usize = offset_of!(MsgHeader, checksum);

impl Adapter {
    /// Publishes the PF2VF blob into `idx_vf`'s framebuffer.
    pub(crate) fn update_pf2vf_message(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        let slot = &self.array_vf[idx_vf];
        let config = slot.config.lock();
        let mut info = Pf2VfInfo {
            header: MsgHeader {
                size: size_of::<Pf2VfInfo>() as u32,
                version: PF2VF_VERSION,
                checksum: 0,
                reserved: 0,
            },
            feature_flags: self.flags().bits(),
            fb_usable_size_mb: config.fb_size_tmr_mb.unwrap_or(config.fb_size_mb),
            time_slice_us: config.time_slice_us[0],
            vram_lost_count: u32::from(slot.vram_lost.load(Ordering::Acquire)),
            bad_pages_count: self.asic.eeprom_bad_page_count(),
            cper_wptr: self.cper.lock().wptr(),
            reserved: [0; 6],
        };
        drop(config);

        info.header.checksum = blob_checksum(info.as_bytes(), HEADER_CHECKSUM_OFFSET);
        self.asic.write_vf_fb(idx_vf, FB_PF2VF_OFFSET, info.as_bytes())
    }

    /// Reads and validates the guest's VF2PF blob.
    pub(crate) fn retrieve_vf2pf_message(&self, idx_vf: VfIdx) -> Result<Vf2PfInfo, GvError> {
        let mut raw = [0u8; size_of::<Vf2PfInfo>()];
        self.asic.read_vf_fb(idx_vf, FB_VF2PF_OFFSET, &mut raw)?;

        let info = Vf2PfInfo::read_from_bytes(&raw).map_err(|_| GvError::ProtocolError)?;
        let expect = blob_checksum(&raw, HEADER_CHECKSUM_OFFSET);
        if { info.header.checksum } != expect || { info.header.version } != VF2PF_VERSION {
            self.put_error(idx_vf, GvError::ProtocolError, u64::from({ info.header.checksum }));
            return Err(GvError::ProtocolError);
        }
        Ok(info)
    }

    /// Reads the guest's VF2PF blob after init and reacts to its content.
    pub(crate) fn check_vf2pf_data(&self, idx_vf: VfIdx) {
        match self.retrieve_vf2pf_message(idx_vf) {
            Ok(info) => {
                let version = info.driver_version;
                let end = version.iter().position(|&b| b == 0).unwrap_or(version.len());
                debug!(
                    "fcn {idx_vf} guest driver: {}",
                    core::str::from_utf8(&version[..end]).unwrap_or("<invalid>")
                );
            }
            Err(_) => warn!("retrieve vf2pf message failed for fcn {idx_vf}"),
        }
    }

    /// Stages the RAS error counters for `idx_vf`.
    pub(crate) fn vfmgr_dump_ras_error_counts(&self, idx_vf: VfIdx) -> Result<(), GvError> {
        let ecc = self.ecc.lock();
        let mut hdr = RasTelemetryHeader {
            header: MsgHeader {
                size: size_of::<RasTelemetryHeader>() as u32,
                version: VF2PF_VERSION,
                checksum: 0,
                reserved: 0,
            },
            correctable_count: ecc.correctable_count,
            uncorrectable_count: ecc.uncorrectable_count,
            deferred_count: ecc.deferred_count,
            record_count: 0,
            wptr: 0,
            overflow_count: 0,
            payload_bytes: 0,
            more: 0,
        };
        drop(ecc);

        hdr.header.checksum = blob_checksum(hdr.as_bytes(), HEADER_CHECKSUM_OFFSET);
        self.asic
            .write_vf_fb(idx_vf, FB_RAS_TELEMETRY_OFFSET, hdr.as_bytes())
    }

    /// Stages CPER records from `guest_rptr` onward into `idx_vf`'s
    /// telemetry region. Returns whether the guest should poll again for
    /// the rest.
    pub(crate) fn vfmgr_dump_cpers(&self, idx_vf: VfIdx, guest_rptr: u64) -> Result<bool, GvError> {
        let budget = FB_RAS_TELEMETRY_SIZE - size_of::<RasTelemetryHeader>() as u64;
        let cper = self.cper.lock();
        let (bytes, write_count, overflow_count, left_size) = cper.get_entries(guest_rptr, budget);
        let wptr = cper.wptr();
        drop(cper);

        // Every record is patched for guest consumption: FRU suppressed
        // and offsets rebuilt for a contiguous stream.
        let mut checksum = 0u32;
        let mut staged = alloc::vec::Vec::with_capacity(bytes.len());
        let mut cursor = 0usize;
        for _ in 0..write_count {
            let hdr = cper::CperHdr::read_from_bytes(&bytes[cursor..cursor + cper::HDR_LEN])
                .map_err(|_| GvError::ProtocolError)?;
            let len = { hdr.record_length } as usize;
            let allowed = alloc::vec![true; { hdr.sec_cnt } as usize];
            let patched =
                cper::patch_record_for_vf(&bytes[cursor..cursor + len], &allowed, &mut checksum)?;
            staged.extend_from_slice(&patched);
            cursor += len;
        }

        let mut hdr = RasTelemetryHeader {
            header: MsgHeader {
                size: (size_of::<RasTelemetryHeader>() + staged.len()) as u32,
                version: VF2PF_VERSION,
                checksum,
                reserved: 0,
            },
            correctable_count: 0,
            uncorrectable_count: 0,
            deferred_count: 0,
            record_count: write_count as u32,
            wptr,
            overflow_count,
            payload_bytes: staged.len() as u32,
            more: u32::from(left_size > 0),
        };
        hdr.header.checksum = blob_checksum(hdr.as_bytes(), HEADER_CHECKSUM_OFFSET)
            .wrapping_add({ hdr.header.checksum });

        self.asic
            .write_vf_fb(idx_vf, FB_RAS_TELEMETRY_OFFSET, hdr.as_bytes())?;
        self.asic.write_vf_fb(
            idx_vf,
            FB_RAS_TELEMETRY_OFFSET + size_of::<RasTelemetryHeader>() as u64,
            &staged,
        )?;

        Ok(left_size > 0)
    }

    /// Clears and re-publishes `idx_vf`'s framebuffer.
    pub(crate) fn init_vf_fb(&self, idx_vf: VfIdx, pattern: u8) -> Result<(), GvError> {
        self.asic.clear_vf_fb(idx_vf, pattern)?;
        self.update_pf2vf_message(idx_vf)
    }

    /// Stages VBIOS, IP-discovery data and the PF2VF blob for a guest
    /// about to initialise.
    pub(crate) fn stage_init_data(&self, idx_vf: VfIdx) {
        if self.asic.copy_ip_discovery_to_vf(idx_vf).is_err() {
            warn!("upload IP discovery data to fcn {idx_vf} failed");
        }
        if self.asic.copy_vbios_to_vf(idx_vf).is_err() {
            warn!("upload vbios image to fcn {idx_vf} failed");
        }
        if self.update_pf2vf_message(idx_vf).is_err() {
            warn!("update pf2vf message failed for fcn {idx_vf}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::test_adapter;

    /// PF->VF message `update -> checksum -> read -> checksum` is a fixed
    /// point.
    #[test]
    fn pf2vf_checksum_is_a_fixed_point() {
        let (adapter, asic) = test_adapter(2);
        adapter.update_pf2vf_message(0).unwrap();

        let mut raw = [0u8; size_of::<Pf2VfInfo>()];
        asic.read_fb_for_test(0, FB_PF2VF_OFFSET, &mut raw);
        let info = Pf2VfInfo::read_from_bytes(&raw).unwrap();

        let sum = blob_checksum(&raw, HEADER_CHECKSUM_OFFSET);
        assert_eq!({ info.header.checksum }, sum);

        // Rewriting the same content yields the same checksum.
        adapter.update_pf2vf_message(0).unwrap();
        let mut raw2 = [0u8; size_of::<Pf2VfInfo>()];
        asic.read_fb_for_test(0, FB_PF2VF_OFFSET, &mut raw2);
        assert_eq!(raw, raw2);
    }

    #[test]
    fn vf2pf_checksum_mismatch_is_a_protocol_error() {
        let (adapter, asic) = test_adapter(2);

        let mut info = Vf2PfInfo {
            header: MsgHeader {
                size: size_of::<Vf2PfInfo>() as u32,
                version: VF2PF_VERSION,
                checksum: 0,
                reserved: 0,
            },
            driver_version: [0; 32],
            fb_usage_mb: 16,
            uptime_s: 3,
            reserved: [0; 6],
        };
        info.header.checksum = blob_checksum(info.as_bytes(), HEADER_CHECKSUM_OFFSET);
        asic.write_fb_for_test(0, FB_VF2PF_OFFSET, info.as_bytes());
        assert!(adapter.retrieve_vf2pf_message(0).is_ok());

        // Corrupt one byte; the checksum no longer matches.
        info.fb_usage_mb = 17;
        asic.write_fb_for_test(0, FB_VF2PF_OFFSET, info.as_bytes());
        assert_eq!(
            adapter.retrieve_vf2pf_message(0),
            Err(GvError::ProtocolError)
        );
    }

    #[test]
    fn cper_dump_stages_patched_records() {
        let (adapter, asic) = test_adapter(2);

        // Two records in the ring.
        for _ in 0..2 {
            let ident = adapter.cper_ident;
            adapter
                .cper
                .lock()
                .build(
                    &ident,
                    &*adapter.shim,
                    crate::ras::cper::CperType::Runtime,
                    crate::ras::cper::CperSeverity::Corrected,
                    |entry| {
                        entry.fill_runtime_section(
                            &ident,
                            0,
                            crate::ras::cper::CperSeverity::Corrected,
                            &[0xab],
                        )
                    },
                    1,
                )
                .unwrap();
        }

        let again = adapter.vfmgr_dump_cpers(0, 0).unwrap();
        assert!(!again);

        let mut raw = [0u8; size_of::<RasTelemetryHeader>()];
        asic.read_fb_for_test(0, FB_RAS_TELEMETRY_OFFSET, &mut raw);
        let hdr = RasTelemetryHeader::read_from_bytes(&raw).unwrap();
        assert_eq!({ hdr.record_count }, 2);
        assert_eq!({ hdr.wptr }, 2);
        assert_eq!({ hdr.more }, 0);
        let expected_len =
            2 * (cper::HDR_LEN + cper::SEC_DESC_LEN + cper::NONSTD_SEC_LEN) as u32;
        assert_eq!({ hdr.payload_bytes }, expected_len);
    }
}
