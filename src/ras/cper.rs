// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! UEFI Common Platform Error Record generation and the per-adapter
//! record ring.
//!
//! Byte layouts follow CPER 1.x and must stay bit-stable: consumers parse
//! the ring contents directly out of shared buffers. Records are built
//! into owned byte buffers through [`CperEntry`] and committed into a
//! fixed-capacity overwrite-on-full ring.

use crate::error::GvError;
use crate::shim::Shim;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Hard cap on ring capacity.
pub const CPER_MAX_ALLOWED_COUNT: u64 = 32;
/// Maximum 64-bit OAM messages in a boot section.
pub const CPER_MAX_OAM_COUNT: usize = 32;
/// Dwords in an ACA register dump.
pub const CPER_ACA_REG_COUNT: usize = 16;

/// ACA dump index: CTL low dword.
pub const ACA_REG_CTL_LO: usize = 0;
/// ACA dump index: CTL high dword.
pub const ACA_REG_CTL_HI: usize = 1;
/// ACA dump index: STATUS low dword.
pub const ACA_REG_STATUS_LO: usize = 2;
/// ACA dump index: STATUS high dword.
pub const ACA_REG_STATUS_HI: usize = 3;
/// ACA dump index: ADDR low dword.
pub const ACA_REG_ADDR_LO: usize = 4;
/// ACA dump index: ADDR high dword.
pub const ACA_REG_ADDR_HI: usize = 5;
/// ACA dump index: MISC0 low dword.
pub const ACA_REG_MISC0_LO: usize = 6;
/// ACA dump index: MISC0 high dword.
pub const ACA_REG_MISC0_HI: usize = 7;
/// ACA dump index: CONFIG low dword.
pub const ACA_REG_CONFIG_LO: usize = 8;
/// ACA dump index: CONFIG high dword.
pub const ACA_REG_CONFIG_HI: usize = 9;
/// ACA dump index: IPID low dword.
pub const ACA_REG_IPID_LO: usize = 10;
/// ACA dump index: IPID high dword.
pub const ACA_REG_IPID_HI: usize = 11;
/// ACA dump index: SYND low dword.
pub const ACA_REG_SYND_LO: usize = 12;
/// ACA dump index: SYND high dword.
pub const ACA_REG_SYND_HI: usize = 13;

/// Notify type: machine check exception.
pub const NOTIFY_MCE: Uuid = Uuid::from_bytes([
    0xe8, 0xf5, 0x6f, 0xfe, 0x91, 0x9c, 0x4c, 0xc5, 0xba, 0x88, 0x65, 0xab, 0xe1, 0x49, 0x13,
    0xbb,
]);
/// Notify type: corrected machine check.
pub const NOTIFY_CMC: Uuid = Uuid::from_bytes([
    0x2d, 0xce, 0x8b, 0xb1, 0xbd, 0xe7, 0x4e, 0x15, 0x9d, 0x9e, 0xb6, 0x55, 0x4b, 0x23, 0xe4,
    0x56,
]);
/// Notify type: boot error record.
pub const NOTIFY_BOOT: Uuid = Uuid::from_bytes([
    0x3d, 0x61, 0xa4, 0x66, 0xab, 0x40, 0x40, 0x9a, 0xa6, 0x98, 0xf3, 0x62, 0xd4, 0x64, 0xb3,
    0x8f,
]);
/// Section type: vendor crashdump.
pub const SECTION_CRASHDUMP: Uuid = Uuid::from_bytes([
    0x32, 0xac, 0x0c, 0x78, 0x26, 0x23, 0x48, 0xa1, 0xbc, 0x98, 0xa7, 0xdf, 0x2a, 0xd1, 0x93,
    0xfe,
]);
/// Section type: vendor non-standard runtime error.
pub const SECTION_NONSTD_ERR: Uuid = Uuid::from_bytes([
    0x81, 0x21, 0x2a, 0x96, 0x09, 0xed, 0x49, 0x96, 0x94, 0x71, 0x8d, 0x72, 0x9c, 0x8e, 0x69,
    0xed,
]);

/// Error severity carried in headers and section descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CperSeverity {
    /// Recoverable (uncorrected, non fatal).
    Recoverable = 0,
    /// Fatal.
    Fatal = 1,
    /// Corrected.
    Corrected = 2,
    /// Informational.
    Informational = 3,
}

/// Record kinds the reactor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CperType {
    /// Runtime non-standard error (ACA dump per section).
    Runtime,
    /// Fatal crashdump (MCA register block per section).
    Fatal,
    /// Boot status (OAM message block).
    Boot,
    /// Bad-page threshold exceeded (hardcoded ACA pattern).
    BadPageThreshold,
}

const HDR_REVISION: u16 = 0x100;
const SEC_REVISION_MINOR: u8 = 1;
const SEC_REVISION_MAJOR: u8 = 22;

const VALID_PLATFORM_ID: u32 = 1 << 0;
const VALID_TIMESTAMP: u32 = 1 << 1;
const SEC_VALID_FRU_ID: u8 = 1 << 0;
const SEC_VALID_FRU_TEXT: u8 = 1 << 1;
const SEC_FLAG_PRIMARY: u32 = 1 << 0;
const SEC_FLAG_EXCEED_ERR_THRESHOLD: u32 = 1 << 3;
const SEC_FLAG_LATENT_ERR: u32 = 1 << 5;

const CTX_TYPE_CRASH: u32 = 1;
const CTX_TYPE_BOOT: u32 = 2;

const NONSTD_VALID_ERR_INFO_CNT: u64 = 1 << 0;
const NONSTD_VALID_ERR_CONTEXT_CNT: u64 = 1 << 1;
const NONSTD_CHK_ERR_TYPE_VALID: u64 = 1 << 0;

/// CPER timestamp, 1970-epoch decomposed per the UEFI layout.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct CperTimestamp {
    /// Seconds.
    pub seconds: u8,
    /// Minutes.
    pub minutes: u8,
    /// Hours.
    pub hours: u8,
    /// Precision flag.
    pub flag: u8,
    /// Day of month, 1-based.
    pub day: u8,
    /// Month, 1-based.
    pub month: u8,
    /// Year within the century.
    pub year: u8,
    /// Century, 1-based.
    pub century: u8,
}

fn is_leap_year(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

impl CperTimestamp {
    /// Decomposes seconds-since-1970.
    pub fn from_utc(utc_s: u64) -> Self {
        const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
        let mut days = utc_s / SECONDS_PER_DAY;
        let remaining = utc_s % SECONDS_PER_DAY;

        let mut year: u64 = 1970;
        while days >= 365 {
            let this_year = if is_leap_year(year) { 366 } else { 365 };
            if days < this_year {
                break;
            }
            days -= this_year;
            year += 1;
        }

        let mut days_in_month = [31u64, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        if is_leap_year(year) {
            days_in_month[1] += 1;
        }
        let mut month = 0;
        while days >= days_in_month[month] {
            days -= days_in_month[month];
            month += 1;
        }

        Self {
            seconds: (remaining % 60) as u8,
            minutes: ((remaining % 3600) / 60) as u8,
            hours: (remaining / 3600) as u8,
            flag: 0,
            day: (days + 1) as u8,
            month: (month + 1) as u8,
            year: (year % 100) as u8,
            century: (year / 100 + 1) as u8,
        }
    }
}

/// CPER record header, 128 bytes.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct CperHdr {
    /// "CPER".
    pub signature: [u8; 4],
    /// Header revision.
    pub revision: u16,
    /// 0xFFFF_FFFF.
    pub signature_end: u32,
    /// Number of sections.
    pub sec_cnt: u16,
    /// Record severity.
    pub error_severity: u32,
    /// Validation bits.
    pub valid_bits: u32,
    /// Total record length including sections.
    pub record_length: u32,
    /// Creation timestamp.
    pub timestamp: CperTimestamp,
    /// Vendor/device identification.
    pub platform_id: [u8; 16],
    /// Unused.
    pub partition_id: [u8; 16],
    /// Creator tag and firmware version.
    pub creator_id: [u8; 16],
    /// Notify-type GUID (boot / MCE / CMC).
    pub notify_type: [u8; 16],
    /// Socket and monotonically increasing uid.
    pub record_id: [u8; 8],
    /// Record flags.
    pub flags: u32,
    /// Persistence info.
    pub persistence_info: u64,
    /// Reserved.
    pub reserved: [u8; 12],
}

/// Length of [`CperHdr`].
pub const HDR_LEN: usize = size_of::<CperHdr>();

/// Section descriptor, 72 bytes.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct CperSecDesc {
    /// Byte offset of the section body from the record start.
    pub sec_offset: u32,
    /// Section body length.
    pub sec_length: u32,
    /// Minor revision.
    pub revision_minor: u8,
    /// Major revision.
    pub revision_major: u8,
    /// Validation bits.
    pub valid_bits: u8,
    /// Reserved.
    pub reserved: u8,
    /// Section flags.
    pub flags: u32,
    /// Section-type GUID.
    pub sec_type: [u8; 16],
    /// FRU id (board serial; suppressed when patched into a VF).
    pub fru_id: [u8; 16],
    /// Section severity.
    pub severity: u32,
    /// FRU text ("OAM<n>").
    pub fru_text: [u8; 20],
}

/// Length of [`CperSecDesc`].
pub const SEC_DESC_LEN: usize = size_of::<CperSecDesc>();

/// Register block carried by a fatal crashdump section.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct CrashDumpRegs {
    /// MCA STATUS.
    pub status: u64,
    /// MCA ADDR.
    pub addr: u64,
    /// MCA IPID.
    pub ipid: u64,
    /// MCA MISC.
    pub misc: u64,
    /// MCA SYND.
    pub synd: u64,
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C, packed)]
struct FatalSection {
    reg_ctx_type: u32,
    reg_arr_size: u32,
    data: CrashDumpRegs,
}

/// Length of a fatal crashdump section body.
pub const FATAL_SEC_LEN: usize = size_of::<FatalSection>();

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C, packed)]
struct BootSection {
    reg_ctx_type: u32,
    reg_arr_size: u32,
    msg: [u64; CPER_MAX_OAM_COUNT],
}

/// Length of a boot section body.
pub const BOOT_SEC_LEN: usize = size_of::<BootSection>();

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C, packed)]
struct NonStdErrSection {
    valid_bits: u64,
    error_type: [u8; 16],
    ms_chk_bits: u64,
    reg_ctx_type: u32,
    reg_arr_size: u32,
    reg_dump: [u32; CPER_ACA_REG_COUNT],
}

/// Length of a runtime non-standard error section body.
pub const NONSTD_SEC_LEN: usize = size_of::<NonStdErrSection>();

impl CperType {
    fn section_len(self) -> usize {
        match self {
            Self::Runtime | Self::BadPageThreshold => NONSTD_SEC_LEN,
            Self::Fatal => FATAL_SEC_LEN,
            Self::Boot => BOOT_SEC_LEN,
        }
    }
}

/// Identification strings stamped into record headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CperIdent {
    /// XGMI socket the adapter sits on.
    pub socket_id: u32,
    /// PCI vendor id.
    pub vendor_id: u16,
    /// PCI device id.
    pub device_id: u16,
    /// SMU firmware version, stamped into the creator id.
    pub smu_fw_version: u32,
    /// Board serial for the FRU id field.
    pub product_serial: u64,
}

struct FixedWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.pos);
        self.buf[self.pos..self.pos + n].copy_from_slice(&s.as_bytes()[..n]);
        self.pos += n;
        Ok(())
    }
}

fn write_fixed(buf: &mut [u8], args: fmt::Arguments) {
    buf.fill(0);
    let mut writer = FixedWriter { buf, pos: 0 };
    let _ = writer.write_fmt(args);
}

/// A record under construction: header, descriptors and section bodies in
/// one contiguous buffer.
pub struct CperEntry {
    buf: Vec<u8>,
    kind: CperType,
    sec_cnt: u16,
}

impl CperEntry {
    fn sec_desc_offset(&self, idx: usize) -> usize {
        HDR_LEN + SEC_DESC_LEN * idx
    }

    fn sec_body_offset(&self, idx: usize) -> usize {
        HDR_LEN + SEC_DESC_LEN * self.sec_cnt as usize + self.kind.section_len() * idx
    }

    fn hdr_mut(&mut self) -> &mut CperHdr {
        CperHdr::mut_from_bytes(&mut self.buf[..HDR_LEN]).unwrap()
    }

    fn grow_record_length(&mut self, len: usize) {
        let hdr = self.hdr_mut();
        hdr.record_length += len as u32;
    }

    /// Fills the record header.
    pub fn fill_hdr(&mut self, ident: &CperIdent, sev: CperSeverity, uid: u32, utc_s: u64) {
        let kind = self.kind;
        let notify = match kind {
            CperType::Boot => NOTIFY_BOOT,
            CperType::Fatal | CperType::BadPageThreshold => NOTIFY_MCE,
            CperType::Runtime => {
                if sev == CperSeverity::Corrected {
                    NOTIFY_CMC
                } else {
                    NOTIFY_MCE
                }
            }
        };

        let socket = ident.socket_id;
        let mut record_id = [0u8; 8];
        write_fixed(&mut record_id, format_args!("{socket}:{uid:X}"));
        let mut creator_id = [0u8; 16];
        write_fixed(
            &mut creator_id,
            format_args!("gpuv:{:08X}", ident.smu_fw_version),
        );
        let mut platform_id = [0u8; 16];
        write_fixed(
            &mut platform_id,
            format_args!("{:#06X}:{:#06X}", ident.vendor_id, ident.device_id),
        );

        let hdr = self.hdr_mut();
        hdr.signature = *b"CPER";
        hdr.revision = HDR_REVISION;
        hdr.signature_end = 0xffff_ffff;
        hdr.error_severity = sev as u32;
        hdr.valid_bits = VALID_PLATFORM_ID | VALID_TIMESTAMP;
        hdr.timestamp = CperTimestamp::from_utc(utc_s);
        hdr.record_id = record_id;
        hdr.creator_id = creator_id;
        hdr.platform_id = platform_id;
        hdr.notify_type = *notify.as_bytes();
        self.grow_record_length(HDR_LEN);
    }

    fn fill_section_desc(
        &mut self,
        idx: usize,
        sev: CperSeverity,
        sec_type: Uuid,
        bp_threshold: bool,
        poison: bool,
        ident: &CperIdent,
    ) {
        let offset = self.sec_desc_offset(idx);
        let body_offset = self.sec_body_offset(idx) as u32;
        let body_len = self.kind.section_len() as u32;

        let mut fru_text = [0u8; 20];
        write_fixed(&mut fru_text, format_args!("OAM{}", ident.socket_id));
        let mut fru_id = [0u8; 16];
        write_fixed(&mut fru_id, format_args!("{:016X}", ident.product_serial));

        let desc =
            CperSecDesc::mut_from_bytes(&mut self.buf[offset..offset + SEC_DESC_LEN]).unwrap();
        desc.sec_offset = body_offset;
        desc.sec_length = body_len;
        desc.revision_minor = SEC_REVISION_MINOR;
        desc.revision_major = SEC_REVISION_MAJOR;
        desc.valid_bits = SEC_VALID_FRU_ID | SEC_VALID_FRU_TEXT;
        desc.flags = SEC_FLAG_PRIMARY;
        if bp_threshold {
            desc.flags |= SEC_FLAG_EXCEED_ERR_THRESHOLD;
        }
        if poison {
            desc.flags |= SEC_FLAG_LATENT_ERR;
        }
        desc.severity = sev as u32;
        desc.sec_type = *sec_type.as_bytes();
        desc.fru_id = fru_id;
        desc.fru_text = fru_text;
    }

    /// Fills section `idx` with a fatal crashdump register block.
    pub fn fill_fatal_section(&mut self, ident: &CperIdent, idx: usize, regs: CrashDumpRegs) {
        self.fill_section_desc(idx, CperSeverity::Fatal, SECTION_CRASHDUMP, false, false, ident);

        let offset = self.sec_body_offset(idx);
        let section =
            FatalSection::mut_from_bytes(&mut self.buf[offset..offset + FATAL_SEC_LEN]).unwrap();
        section.reg_ctx_type = CTX_TYPE_CRASH;
        section.reg_arr_size = size_of::<CrashDumpRegs>() as u32;
        section.data = regs;

        self.grow_record_length(SEC_DESC_LEN + FATAL_SEC_LEN);
    }

    /// Fills section `idx` with boot-time OAM messages.
    pub fn fill_boot_section(&mut self, ident: &CperIdent, idx: usize, msgs: &[u64]) {
        self.fill_section_desc(idx, CperSeverity::Fatal, SECTION_CRASHDUMP, false, false, ident);

        let offset = self.sec_body_offset(idx);
        let section =
            BootSection::mut_from_bytes(&mut self.buf[offset..offset + BOOT_SEC_LEN]).unwrap();
        section.reg_ctx_type = CTX_TYPE_BOOT;
        section.reg_arr_size = size_of::<[u64; CPER_MAX_OAM_COUNT]>() as u32;
        let n = msgs.len().min(CPER_MAX_OAM_COUNT);
        let mut msg = [0u64; CPER_MAX_OAM_COUNT];
        msg[..n].copy_from_slice(&msgs[..n]);
        section.msg = msg;

        self.grow_record_length(SEC_DESC_LEN + BOOT_SEC_LEN);
    }

    /// Fills section `idx` with a runtime ACA register dump.
    pub fn fill_runtime_section(
        &mut self,
        ident: &CperIdent,
        idx: usize,
        sev: CperSeverity,
        reg_dump: &[u32],
    ) {
        let poison = sev != CperSeverity::Corrected;
        self.fill_section_desc(idx, sev, SECTION_NONSTD_ERR, false, poison, ident);
        self.fill_nonstd_body(idx, reg_dump);
        self.grow_record_length(SEC_DESC_LEN + NONSTD_SEC_LEN);
    }

    /// Fills section `idx` with the hardcoded bad-page-threshold pattern.
    pub fn fill_bad_page_thr_section(&mut self, ident: &CperIdent, idx: usize) {
        self.fill_section_desc(idx, CperSeverity::Fatal, SECTION_NONSTD_ERR, true, false, ident);

        let mut dump = [0u32; CPER_ACA_REG_COUNT];
        dump[ACA_REG_CTL_LO] = 0x1;
        dump[ACA_REG_STATUS_LO] = 0x137;
        dump[ACA_REG_STATUS_HI] = 0xb000_0000;
        dump[ACA_REG_CONFIG_LO] = 0x2;
        dump[ACA_REG_CONFIG_HI] = 0x1ff;
        dump[ACA_REG_IPID_HI] = 0x96;

        self.fill_nonstd_body(idx, &dump);
        self.grow_record_length(SEC_DESC_LEN + NONSTD_SEC_LEN);
    }

    fn fill_nonstd_body(&mut self, idx: usize, reg_dump: &[u32]) {
        let offset = self.sec_body_offset(idx);
        let section =
            NonStdErrSection::mut_from_bytes(&mut self.buf[offset..offset + NONSTD_SEC_LEN])
                .unwrap();
        section.valid_bits = NONSTD_VALID_ERR_INFO_CNT | NONSTD_VALID_ERR_CONTEXT_CNT;
        section.error_type = *SECTION_NONSTD_ERR.as_bytes();
        section.ms_chk_bits = NONSTD_CHK_ERR_TYPE_VALID;
        section.reg_ctx_type = CTX_TYPE_CRASH;
        section.reg_arr_size = size_of::<[u32; CPER_ACA_REG_COUNT]>() as u32;
        let n = reg_dump.len().min(CPER_ACA_REG_COUNT);
        let mut reg_dump_buf = [0u32; CPER_ACA_REG_COUNT];
        reg_dump_buf[..n].copy_from_slice(&reg_dump[..n]);
        section.reg_dump = reg_dump_buf;
    }

    /// Finished record bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// The per-adapter CPER ring.
pub struct CperRing {
    enabled: bool,
    max_count: u64,
    /// Lifetime records generated.
    count: u64,
    wptr: u64,
    next_uid: u32,
    ring: Vec<Option<Vec<u8>>>,
}

impl CperRing {
    /// Creates a ring retaining up to `max_count` records (0 selects the
    /// maximum, larger values are clamped).
    pub fn new(max_count: u32) -> Self {
        let max_count = match u64::from(max_count) {
            0 => CPER_MAX_ALLOWED_COUNT,
            n => n.min(CPER_MAX_ALLOWED_COUNT),
        };
        Self {
            enabled: true,
            max_count,
            count: 0,
            wptr: 0,
            next_uid: 0,
            ring: vec![None; CPER_MAX_ALLOWED_COUNT as usize],
        }
    }

    /// Allocates a zeroed record of `section_count` sections.
    pub fn alloc_entry(&self, kind: CperType, section_count: u16) -> Option<CperEntry> {
        if !self.enabled {
            return None;
        }
        let size =
            HDR_LEN + SEC_DESC_LEN * section_count as usize + kind.section_len() * section_count as usize;
        Some(CperEntry {
            buf: vec![0; size],
            kind,
            sec_cnt: section_count,
        })
    }

    /// Builds and commits a record in one step.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        ident: &CperIdent,
        shim: &dyn Shim,
        kind: CperType,
        sev: CperSeverity,
        fill: impl FnOnce(&mut CperEntry),
        section_count: u16,
    ) -> Result<(), GvError> {
        let mut entry = self.alloc_entry(kind, section_count).ok_or(GvError::NotSupported)?;
        let uid = self.next_uid;
        self.next_uid = self.next_uid.wrapping_add(1);
        entry.fill_hdr(ident, sev, uid, shim.utc_timestamp_s());
        entry.hdr_mut().sec_cnt = section_count;
        fill(&mut entry);
        self.commit_entry(entry)
    }

    /// Commits a finished record, overwriting the oldest slot when full.
    pub fn commit_entry(&mut self, entry: CperEntry) -> Result<(), GvError> {
        if !self.enabled {
            return Err(GvError::NotSupported);
        }
        let wr_idx = (self.wptr % self.max_count) as usize;
        self.ring[wr_idx] = Some(entry.buf);
        self.count += 1;
        self.wptr += 1;
        Ok(())
    }

    fn first_valid(&self, rptr: u64) -> u64 {
        if self.wptr.saturating_sub(rptr) > self.max_count {
            self.wptr - self.max_count
        } else {
            rptr
        }
    }

    /// Reports `(wptr, avail_count, total_bytes)` for a reader at `rptr`.
    pub fn get_count(&self, rptr: u64) -> (u64, u64, u64) {
        let first = self.first_valid(rptr);
        let mut size = 0u64;
        for i in first..self.wptr {
            if let Some(rec) = &self.ring[(i % self.max_count) as usize] {
                size += rec.len() as u64;
            }
        }
        (self.wptr, self.wptr - first, size)
    }

    /// Copies records starting at `rptr` until `buf_size` would be
    /// exceeded. Returns `(bytes, write_count, overflow_count, left_size)`;
    /// `overflow_count` is how many records the reader lost to overwrite.
    pub fn get_entries(&self, rptr: u64, buf_size: u64) -> (Vec<u8>, u64, u64, u64) {
        let first = self.first_valid(rptr);
        let overflow_count = first - rptr;
        let mut out = Vec::new();
        let mut write_count = 0u64;
        let mut left_size = 0u64;
        let mut copying = true;

        for i in first..self.wptr {
            let Some(rec) = &self.ring[(i % self.max_count) as usize] else {
                continue;
            };
            if copying && (out.len() + rec.len()) as u64 <= buf_size {
                out.extend_from_slice(rec);
                write_count += 1;
            } else {
                copying = false;
                left_size += rec.len() as u64;
            }
        }

        (out, write_count, overflow_count, left_size)
    }

    /// Borrow of the record at absolute position `rptr`, if still valid.
    pub fn ring_entry(&self, rptr: u64) -> Option<&[u8]> {
        if rptr < self.first_valid(rptr) || rptr >= self.wptr {
            return None;
        }
        self.ring[(rptr % self.max_count) as usize].as_deref()
    }

    /// Current write pointer.
    pub fn wptr(&self) -> u64 {
        self.wptr
    }

    /// Lifetime records generated.
    pub fn lifetime_count(&self) -> u64 {
        self.count
    }
}

/// Rewrites `record` for placement in a VF's framebuffer: the FRU id is
/// suppressed, section offsets are recomputed for the filtered section
/// set, and `sec_cnt`/`record_length` are rewritten. Returns the patched
/// bytes and updates the running 32-bit checksum.
pub fn patch_record_for_vf(
    record: &[u8],
    allowed_sections: &[bool],
    checksum: &mut u32,
) -> Result<Vec<u8>, GvError> {
    let hdr = CperHdr::read_from_bytes(&record[..HDR_LEN]).map_err(|_| GvError::ProtocolError)?;
    let sec_cnt = hdr.sec_cnt as usize;
    if allowed_sections.len() < sec_cnt {
        return Err(GvError::InvalidParam);
    }

    let allowed: Vec<usize> = (0..sec_cnt).filter(|&i| allowed_sections[i]).collect();

    let mut out = Vec::with_capacity(record.len());
    out.extend_from_slice(&record[..HDR_LEN]);

    // Descriptor table for the surviving sections.
    let mut body_cursor = HDR_LEN + SEC_DESC_LEN * allowed.len();
    let mut bodies: Vec<&[u8]> = Vec::with_capacity(allowed.len());
    for &i in &allowed {
        let desc_off = HDR_LEN + SEC_DESC_LEN * i;
        let desc = CperSecDesc::read_from_bytes(&record[desc_off..desc_off + SEC_DESC_LEN])
            .map_err(|_| GvError::ProtocolError)?;
        let body_off = desc.sec_offset as usize;
        let body_len = desc.sec_length as usize;
        if body_off + body_len > record.len() {
            return Err(GvError::ProtocolError);
        }

        let mut patched = desc;
        patched.fru_id = [0; 16];
        patched.valid_bits &= !SEC_VALID_FRU_ID;
        patched.sec_offset = body_cursor as u32;
        out.extend_from_slice(patched.as_bytes());

        bodies.push(&record[body_off..body_off + body_len]);
        body_cursor += body_len;
    }
    for body in bodies {
        out.extend_from_slice(body);
    }

    {
        let hdr = CperHdr::mut_from_bytes(&mut out[..HDR_LEN]).unwrap();
        hdr.sec_cnt = allowed.len() as u16;
        hdr.record_length = body_cursor as u32;
    }

    for &b in &out {
        *checksum = checksum.wrapping_add(u32::from(b));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::test::TestShim;

    fn ident() -> CperIdent {
        CperIdent {
            socket_id: 2,
            vendor_id: 0x1002,
            device_id: 0x74a1,
            smu_fw_version: 0x55_0400,
            product_serial: 0xdead_beef,
        }
    }

    #[test]
    fn layout_sizes_are_wire_stable() {
        assert_eq!(HDR_LEN, 128);
        assert_eq!(SEC_DESC_LEN, 72);
        assert_eq!(FATAL_SEC_LEN, 48);
        assert_eq!(BOOT_SEC_LEN, 8 + 8 * CPER_MAX_OAM_COUNT);
        assert_eq!(NONSTD_SEC_LEN, 104);
    }

    #[test]
    fn timestamp_decomposition() {
        // 2024-02-29 12:34:56 UTC, a leap day.
        let ts = CperTimestamp::from_utc(1_709_210_096);
        assert_eq!(ts.century, 21);
        assert_eq!(ts.year, 24);
        assert_eq!(ts.month, 2);
        assert_eq!(ts.day, 29);
        assert_eq!(ts.hours, 12);
        assert_eq!(ts.minutes, 34);
        assert_eq!(ts.seconds, 56);
    }

    #[test]
    fn epoch_is_day_one() {
        let ts = CperTimestamp::from_utc(0);
        assert_eq!(ts.century, 20);
        assert_eq!(ts.year, 70);
        assert_eq!(ts.month, 1);
        assert_eq!(ts.day, 1);
        assert_eq!(ts.hours, 0);
    }

    /// Round trip: alloc -> fill -> commit -> get_entries reads back
    /// byte-identical contents.
    #[test]
    fn commit_then_read_back_is_identical() {
        let shim = TestShim::new();
        let mut ring = CperRing::new(4);

        let regs = CrashDumpRegs {
            status: 0xb000_0000_0000_0137,
            addr: 0x1000,
            ipid: 0x96,
            misc: 0,
            synd: 0,
        };
        let mut entry = ring.alloc_entry(CperType::Fatal, 2).unwrap();
        entry.fill_hdr(&ident(), CperSeverity::Fatal, 0, shim.utc_timestamp_s());
        entry.hdr_mut().sec_cnt = 2;
        entry.fill_fatal_section(&ident(), 0, regs);
        entry.fill_fatal_section(&ident(), 1, regs);
        let expect = entry.bytes().to_vec();
        assert_eq!(expect.len(), HDR_LEN + 2 * SEC_DESC_LEN + 2 * FATAL_SEC_LEN);

        ring.commit_entry(entry).unwrap();

        let (bytes, write_count, overflow, left) = ring.get_entries(0, 1 << 20);
        assert_eq!(write_count, 1);
        assert_eq!(overflow, 0);
        assert_eq!(left, 0);
        assert_eq!(bytes, expect);

        let hdr = CperHdr::read_from_bytes(&bytes[..HDR_LEN]).unwrap();
        assert_eq!({ hdr.record_length } as usize, expect.len());
        let signature = hdr.signature;
        assert_eq!(&signature, b"CPER");
    }

    /// A reader that fell out of the valid window sees overflow_count.
    #[test]
    fn overwrite_on_full_reports_overflow() {
        let shim = TestShim::new();
        let mut ring = CperRing::new(2);

        for _ in 0..5 {
            ring.build(
                &ident(),
                &shim,
                CperType::Runtime,
                CperSeverity::Corrected,
                |entry| entry.fill_runtime_section(&ident(), 0, CperSeverity::Corrected, &[1, 2]),
                1,
            )
            .unwrap();
        }

        let (wptr, avail, _size) = ring.get_count(0);
        assert_eq!(wptr, 5);
        assert_eq!(avail, 2);

        let (_bytes, write_count, overflow, _left) = ring.get_entries(0, 1 << 20);
        assert_eq!(write_count, 2);
        assert_eq!(overflow, 3);
    }

    #[test]
    fn small_buffer_leaves_remainder() {
        let shim = TestShim::new();
        let mut ring = CperRing::new(8);
        for _ in 0..3 {
            ring.build(
                &ident(),
                &shim,
                CperType::Runtime,
                CperSeverity::Corrected,
                |entry| entry.fill_runtime_section(&ident(), 0, CperSeverity::Corrected, &[7]),
                1,
            )
            .unwrap();
        }
        let one = (HDR_LEN + SEC_DESC_LEN + NONSTD_SEC_LEN) as u64;

        let (bytes, write_count, _overflow, left) = ring.get_entries(0, one + 1);
        assert_eq!(write_count, 1);
        assert_eq!(bytes.len() as u64, one);
        assert_eq!(left, 2 * one);
    }

    #[test]
    fn patch_to_vf_filters_and_rewrites() {
        let shim = TestShim::new();
        let mut ring = CperRing::new(4);
        let regs = CrashDumpRegs::default();
        let mut entry = ring.alloc_entry(CperType::Fatal, 2).unwrap();
        entry.fill_hdr(&ident(), CperSeverity::Fatal, 3, shim.utc_timestamp_s());
        entry.hdr_mut().sec_cnt = 2;
        entry.fill_fatal_section(&ident(), 0, regs);
        entry.fill_fatal_section(&ident(), 1, regs);

        let mut checksum = 0u32;
        let patched = patch_record_for_vf(entry.bytes(), &[true, false], &mut checksum).unwrap();

        let hdr = CperHdr::read_from_bytes(&patched[..HDR_LEN]).unwrap();
        assert_eq!({ hdr.sec_cnt }, 1);
        assert_eq!(
            { hdr.record_length } as usize,
            HDR_LEN + SEC_DESC_LEN + FATAL_SEC_LEN
        );

        let desc =
            CperSecDesc::read_from_bytes(&patched[HDR_LEN..HDR_LEN + SEC_DESC_LEN]).unwrap();
        let fru_id = desc.fru_id;
        assert_eq!(fru_id, [0; 16]);
        assert_eq!({ desc.sec_offset } as usize, HDR_LEN + SEC_DESC_LEN);

        let expect_sum: u32 = patched.iter().fold(0u32, |a, &b| a.wrapping_add(b.into()));
        assert_eq!(checksum, expect_sum);
    }
}
