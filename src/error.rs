// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Error taxonomy and the per-adapter diagnostic error ring.

use alloc::collections::VecDeque;
use log::warn;
use spin::mutex::SpinMutex;

/// Maximum number of entries retained in an adapter's error ring. Older
/// entries are dropped once the ring is full.
pub const ERROR_RING_ENTRY_NUM: usize = 256;

/// Errors produced by the scheduler core.
///
/// Every public API call folds into one of these kinds; the worker never
/// panics and instead latches unrecoverable conditions into the adapter
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvError {
    /// A guard window overflowed; the offending event was dropped without
    /// side effects.
    GuestAbuse,
    /// A firmware command (PSP, mailbox or world switch) missed its
    /// deadline.
    FirmwareTimeout,
    /// A world-switch state machine cannot make progress for a VF.
    VfHang,
    /// Allocation, timer or thread resources were unavailable on the host.
    HostResourceFailure,
    /// A fatal RAS interrupt fired; drives whole-GPU reset or RMA.
    FatalEcc,
    /// A peer GPU in the XGMI hive failed its chain reset.
    HiveFailure,
    /// Unpaired mailbox message, unknown event id or checksum mismatch.
    ProtocolError,
    /// The fixed-size event ring is full.
    QueueFull,
    /// A parameter failed validation.
    InvalidParam,
    /// The operation is not implemented for this ASIC.
    NotSupported,
    /// The adapter is in a terminal RMA state.
    BadGpu,
    /// A reset attempt (FLR, auto or whole-GPU) failed.
    ResetFailed,
    /// An exclusive-access window expired before the holder released it.
    FullAccessTimeout,
    /// The target is busy (e.g. an active VF blocks power saving).
    Busy,
    /// Generic failure with no more precise classification.
    Failure,
}

/// One record in the diagnostic error ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    /// VF the error is attributed to (`PF_IDX` for adapter-wide errors).
    pub idx_vf: usize,
    /// Error kind.
    pub error: GvError,
    /// Kind-specific payload (counts, event ids, timestamps packed by the
    /// producer).
    pub data: u64,
    /// Microsecond timestamp at which the error was recorded.
    pub timestamp: u64,
}

/// Bounded ring of recent errors, readable by diagnostic consumers.
pub struct ErrorRing {
    entries: SpinMutex<VecDeque<ErrorEntry>>,
}

impl ErrorRing {
    /// Creates an empty ring.
    pub fn new() -> Self {
        Self {
            entries: SpinMutex::new(VecDeque::with_capacity(ERROR_RING_ENTRY_NUM)),
        }
    }

    /// Records an error, dropping the oldest entry if the ring is full.
    pub fn put(&self, idx_vf: usize, error: GvError, data: u64, timestamp: u64) {
        warn!("error {error:?} on fcn {idx_vf} (data {data:#x})");

        let mut entries = self.entries.lock();
        if entries.len() == ERROR_RING_ENTRY_NUM {
            entries.pop_front();
        }
        entries.push_back(ErrorEntry {
            idx_vf,
            error,
            data,
            timestamp,
        });
    }

    /// Drains up to `max` entries, oldest first.
    pub fn drain(&self, max: usize) -> alloc::vec::Vec<ErrorEntry> {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Number of entries currently buffered.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no errors are buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ErrorRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_on_overflow() {
        let ring = ErrorRing::new();
        for i in 0..(ERROR_RING_ENTRY_NUM + 3) {
            ring.put(0, GvError::Failure, i as u64, 0);
        }
        assert_eq!(ring.len(), ERROR_RING_ENTRY_NUM);

        let drained = ring.drain(1);
        assert_eq!(drained[0].data, 3);
    }

    #[test]
    fn drain_removes_entries() {
        let ring = ErrorRing::new();
        ring.put(2, GvError::GuestAbuse, 7, 100);
        ring.put(3, GvError::QueueFull, 8, 101);

        let drained = ring.drain(16);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].idx_vf, 2);
        assert_eq!(drained[1].error, GvError::QueueFull);
        assert!(ring.is_empty());
    }
}
