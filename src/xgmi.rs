// Copyright The GPUV Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! XGMI hive glue: the process-wide hive registry, the chain-reset task
//! barrier, and hive-wide PSP mailbox reference counting.
//!
//! Adapter/hive back-references are broken by keeping only weak handles
//! in the registry; an adapter that goes away simply stops being
//! enumerable.

use crate::adapter::Adapter;
use crate::error::GvError;
use crate::sched::SchedState;
use crate::sched::event::{EventId, SchedBlock};
use crate::shim::Shim;
use crate::vf::{PF_IDX, VfIdx};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use log::{info, warn};
use spin::Lazy;
use spin::mutex::SpinMutex;

/// Maximum hives tracked process-wide.
pub const MAX_XGMI_HIVE: usize = 8;

/// Reusable two-phase rendezvous for chain resets.
pub struct TaskBarrier {
    count: AtomicUsize,
    generation: AtomicUsize,
}

impl TaskBarrier {
    /// New, empty barrier.
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    /// Blocks until `n` parties arrived.
    pub fn wait(&self, n: usize, shim: &dyn Shim) {
        let generation = self.generation.load(Ordering::Acquire);
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == n {
            self.count.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
        } else {
            while self.generation.load(Ordering::Acquire) == generation {
                shim.usleep(100);
            }
        }
    }
}

impl Default for TaskBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// One interconnect domain.
pub struct Hive {
    /// Firmware-assigned hive identifier.
    pub hive_id: u64,
    adapters: SpinMutex<Vec<Weak<Adapter>>>,
    in_chain_reset: SpinMutex<bool>,
    bad_hive: AtomicBool,
    tb_chain_reset: TaskBarrier,
    mb_int_refcount: SpinMutex<u32>,
}

impl Hive {
    fn new(hive_id: u64) -> Self {
        Self {
            hive_id,
            adapters: SpinMutex::new(Vec::new()),
            in_chain_reset: SpinMutex::new(false),
            bad_hive: AtomicBool::new(false),
            tb_chain_reset: TaskBarrier::new(),
            mb_int_refcount: SpinMutex::new(0),
        }
    }

    /// Live members of the hive.
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of registered members, live or not.
    pub fn member_count(&self) -> usize {
        self.adapters.lock().len()
    }

    /// Whether a chain reset on this hive already failed.
    pub fn is_bad(&self) -> bool {
        self.bad_hive.load(Ordering::Acquire)
    }
}

static HIVES: Lazy<SpinMutex<Vec<Arc<Hive>>>> = Lazy::new(|| SpinMutex::new(Vec::new()));

fn find_or_create_hive(hive_id: u64) -> Result<Arc<Hive>, GvError> {
    let mut hives = HIVES.lock();
    if let Some(hive) = hives.iter().find(|hive| hive.hive_id == hive_id) {
        return Ok(hive.clone());
    }
    if hives.len() == MAX_XGMI_HIVE {
        return Err(GvError::HostResourceFailure);
    }
    let hive = Arc::new(Hive::new(hive_id));
    hives.push(hive.clone());
    Ok(hive)
}

impl Adapter {
    /// Registers the adapter in its hive; the first member becomes the
    /// hive master coordinating chain resets.
    pub(crate) fn xgmi_join_hive(self: &Arc<Self>) -> Result<(), GvError> {
        let hive_id = self.xgmi.lock().hive_id;
        let hive = find_or_create_hive(hive_id)?;

        let mut adapters = hive.adapters.lock();
        adapters.retain(|weak| weak.upgrade().is_some());
        let is_master = adapters.is_empty();
        adapters.push(Arc::downgrade(self));
        drop(adapters);

        let mut xgmi = self.xgmi.lock();
        xgmi.is_master = is_master;
        info!(
            "node {:#x} joined hive {:#x}{}",
            xgmi.node_id,
            hive_id,
            if is_master { " as master" } else { "" }
        );
        Ok(())
    }

    /// Removes the adapter from its hive on teardown.
    pub(crate) fn xgmi_leave_hive(&self) {
        let hive_id = self.xgmi.lock().hive_id;
        let mut hives = HIVES.lock();
        if let Some(hive) = hives.iter().find(|hive| hive.hive_id == hive_id) {
            hive.adapters
                .lock()
                .retain(|weak| weak.upgrade().is_some_and(|a| !core::ptr::eq(&*a, self)));
        }
        hives.retain(|hive| !hive.adapters.lock().is_empty());
    }

    pub(crate) fn get_hive(&self) -> Option<Arc<Hive>> {
        let hive_id = self.xgmi.lock().hive_id;
        HIVES.lock().iter().find(|hive| hive.hive_id == hive_id).cloned()
    }

    /// Physical nodes in this adapter's interconnect domain.
    pub(crate) fn xgmi_node_count(&self) -> usize {
        self.xgmi.lock().phy_nodes_num.max(1)
    }

    /// The hive master, when this adapter is a non-master hive member.
    pub(crate) fn xgmi_master(&self) -> Option<Arc<Adapter>> {
        if self.xgmi_node_count() <= 1 || self.xgmi.lock().is_master {
            return None;
        }
        self.get_hive()?
            .adapters()
            .into_iter()
            .find(|adapter| adapter.xgmi.lock().is_master)
    }

    /// Whether further resets must be refused because a peer failed.
    pub(crate) fn is_hive_bad(&self) -> bool {
        if self.xgmi_node_count() <= 1 {
            return false;
        }
        self.get_hive().is_some_and(|hive| hive.is_bad())
    }

    fn mark_hive_bad(&self) {
        if let Some(hive) = self.get_hive() {
            warn!("marking hive {:#x} bad", hive.hive_id);
            hive.bad_hive.store(true, Ordering::Release);
        }
    }

    /// Reference-counted PSP mailbox interrupt toggle across the hive: the
    /// interrupt stays enabled while any member needs it.
    pub(crate) fn hive_set_psp_mb_int(&self, idx_vf: VfIdx, enable: bool) -> Result<(), GvError> {
        let Some(hive) = self.get_hive() else {
            return self.asic.set_psp_mb_int(idx_vf, enable);
        };

        let mut refcount = hive.mb_int_refcount.lock();
        let apply = if enable {
            *refcount += 1;
            *refcount == 1
        } else {
            *refcount = refcount.saturating_sub(1);
            *refcount == 0
        };
        drop(refcount);

        if !apply {
            return Ok(());
        }
        let mut ret = Ok(());
        for adapter in hive.adapters() {
            if let Err(e) = adapter.asic.set_psp_mb_int(idx_vf, enable) {
                ret = Err(e);
            }
        }
        ret
    }

    /// Tier 4: the XGMI chain reset.
    ///
    /// Four cases fall out of `(reset_all, in_chain_reset)`: a fresh
    /// request broadcasts and resets; a broadcast target just resets; a
    /// second requester while a chain is running folds into it; and a
    /// leftover internal request after the chain completed is dropped as
    /// an orphan.
    pub(crate) fn sched_gpu_chain_reset(
        &self,
        state: &mut SchedState,
        reset_all: bool,
    ) -> Result<(), GvError> {
        let Some(hive) = self.get_hive() else {
            let xgmi = self.xgmi.lock();
            warn!(
                "node {:#x} cannot match hive {:#x} in the hive list",
                xgmi.node_id, xgmi.hive_id
            );
            return Err(GvError::HiveFailure);
        };

        if reset_all {
            let mut in_chain_reset = hive.in_chain_reset.lock();
            if !*in_chain_reset {
                *in_chain_reset = true;
                drop(in_chain_reset);

                for peer in hive.adapters() {
                    if core::ptr::eq(&*peer, self) {
                        continue;
                    }
                    info!(
                        "notify chain reset on node {:#x}",
                        peer.xgmi.lock().node_id
                    );
                    peer.in_xgmi_chain_reset.store(true, Ordering::Release);
                    if peer
                        .queue_event(PF_IDX, EventId::SchedForceResetGpuInternal, SchedBlock::All)
                        .is_err()
                    {
                        warn!(
                            "notify chain reset on node {:#x} failed",
                            peer.xgmi.lock().node_id
                        );
                    }
                }
            }
        }

        if !*hive.in_chain_reset.lock() {
            info!("drop orphan reset request");
            return Ok(());
        }

        self.in_xgmi_chain_reset.store(true, Ordering::Release);
        let ret = self.sched_whole_gpu_reset(state);

        // Any node failing its local reset poisons the hive; further
        // resets are refused everywhere.
        if ret.is_err() {
            self.mark_hive_bad();
        }

        let members = hive.member_count();
        hive.tb_chain_reset.wait(members, &*self.shim);

        self.remove_stale_events_after_wgr(state);

        if self.xgmi.lock().is_master {
            *hive.in_chain_reset.lock() = false;
        }
        self.in_ecc_recovery.store(false, Ordering::Release);

        hive.tb_chain_reset.wait(members, &*self.shim);

        ret
    }
}

/// Per-adapter XGMI identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct XgmiInfo {
    /// Firmware node id.
    pub node_id: u64,
    /// Hive this node belongs to.
    pub hive_id: u64,
    /// Physical nodes in the hive (1 = no hive).
    pub phy_nodes_num: usize,
    /// Socket index used in CPER records.
    pub socket_id: u32,
    /// Whether this node coordinates chain resets.
    pub is_master: bool,
}
