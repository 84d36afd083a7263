// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! GPUV: a host-side SR-IOV GPU virtualization scheduler core.
//!
//! The crate time-slices one physical GPU among up to 31 virtual
//! functions plus the physical function. A single event worker per
//! adapter owns all scheduling state and drives the VF world-switch
//! state machines, the exclusive-access window, the reset hierarchy and
//! the RAS reaction path. The embedding driver supplies OS services
//! through [`shim::Shim`] and hardware access through [`asic::Asic`],
//! dedicates one thread to [`Adapter::run_event_worker`], and forwards
//! mailbox interrupts to [`Adapter::handle_mailbox_irq`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod adapter;
pub mod api;
pub mod asic;
pub mod config;
pub mod error;
pub mod guard;
pub mod live;
pub mod mailbox;
pub mod ras;
pub mod sched;
pub mod shim;
pub mod vf;
pub mod vfmgr;
pub mod xgmi;

pub use adapter::{Adapter, AdapterStatus, DeviceInit};
pub use api::{Device, VfOption};
pub use config::{AdapterFlags, InitOptions};
pub use error::GvError;
pub use sched::event::{EventId, SchedBlock};
pub use vf::{INVALID_VF, MAX_VF_SLOT, PF_IDX, VfIdx, VfState};

/// Library major version.
pub const VERSION_MAJOR: u32 = 1;
/// Library minor version.
pub const VERSION_MINOR: u32 = 4;

/// Library version as `(major, minor)`.
pub fn version() -> (u32, u32) {
    (VERSION_MAJOR, VERSION_MINOR)
}
