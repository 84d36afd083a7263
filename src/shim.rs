// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! OS abstraction consumed by the core.
//!
//! The embedding driver provides time, sleep and event primitives through
//! these traits; the core never touches the OS directly. Locks are not part
//! of the shim — the core carries its own spin locks.

use crate::error::GvError;
use alloc::boxed::Box;

/// Result of blocking on an [`OsEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// The event was signalled.
    WakeUp,
    /// The timeout expired before a signal arrived.
    Timeout,
    /// The wait was interrupted; callers retry.
    Interrupted,
}

/// A binary event the worker and API callers can block on.
///
/// Implementations must be usable from multiple threads; `signal` may be
/// called from interrupt bottom-halves.
pub trait OsEvent: Send + Sync {
    /// Blocks until signalled or until `timeout_us` microseconds elapse.
    /// A timeout of 0 waits forever.
    fn wait(&self, timeout_us: u64) -> WaitState;

    /// Wakes one waiter (or the next to arrive).
    fn signal(&self);

    /// Latches the event so that every future wait returns immediately.
    /// Used during teardown to unblock the worker without racing it.
    fn signal_forever(&self);
}

/// Host services required by the core.
pub trait Shim: Send + Sync {
    /// Monotonic microsecond timestamp.
    fn timestamp_us(&self) -> u64;

    /// Seconds since the Unix epoch, for CPER timestamps.
    fn utc_timestamp_s(&self) -> u64;

    /// Sleeps the calling thread for at least `us` microseconds.
    fn usleep(&self, us: u64);

    /// Creates a new event object.
    fn create_event(&self) -> Box<dyn OsEvent>;

    /// Identifier of the calling thread, used only to detect recursive
    /// waits from the event worker.
    fn thread_id(&self) -> u64;

    /// Fills `buf` with random bytes. Optional; defaults to zeroes.
    fn random_bytes(&self, buf: &mut [u8]) {
        buf.fill(0);
    }
}

/// Polling interval for [`wait_for`].
const WAIT_POLL_US: u64 = 100;

/// Polls `done` until it returns true or `timeout_us` elapses.
///
/// This is the bounded-wait primitive behind every guest handshake: the
/// deadline is always passed explicitly and a violation surfaces as
/// [`GvError::FirmwareTimeout`].
pub fn wait_for(
    shim: &dyn Shim,
    timeout_us: u64,
    mut done: impl FnMut() -> bool,
) -> Result<(), GvError> {
    let deadline = shim.timestamp_us() + timeout_us;

    loop {
        if done() {
            return Ok(());
        }
        if shim.timestamp_us() >= deadline {
            return Err(GvError::FirmwareTimeout);
        }
        shim.usleep(WAIT_POLL_US);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::test::TestShim;
    use alloc::sync::Arc;

    #[test]
    fn wait_for_completes_before_deadline() {
        let shim = Arc::new(TestShim::new());
        let mut polls = 0;
        let ret = wait_for(&*shim, 10_000, || {
            polls += 1;
            polls == 3
        });
        assert_eq!(ret, Ok(()));
    }

    #[test]
    fn wait_for_times_out() {
        let shim = Arc::new(TestShim::new());
        let ret = wait_for(&*shim, 1000, || false);
        assert_eq!(ret, Err(GvError::FirmwareTimeout));
        // The fake clock advanced past the deadline.
        assert!(shim.timestamp_us() >= 1000);
    }
}
