// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-LV runtime state: the activation state machine, the deferred-I/O
//! queue, and the end-of-I/O hook that keeps the pending-I/O counter
//! honest across suspend/resume.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::trace;

use crate::error::Error;
use crate::mapping_table::MappingTable;
use crate::request::{Completion, Direction, IoRequest};
use crate::types::Device;

pub const MAX_NAME_LEN: usize = 128;

/// `EMPTY -> LOADED -> ACTIVE <-> SUSPENDED -> EMPTY`. `Suspended`
/// carries nothing extra: a resume always returns to `Active`, an
/// unload from `Suspended` always goes through tearing down the loaded
/// table first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmState {
    Empty,
    Loaded,
    Active,
    Suspended,
}

pub(crate) struct DeferredIo {
    pub request: IoRequest,
    pub direction: Direction,
    pub completion: Completion,
}

/// The pending-I/O counter and suspend wait queue. Split out from the
/// record the DR lock guards because the counter must be updatable
/// (and the waiter wakeable) without holding that lock: a hook
/// finalizing on a completion thread must never block on the
/// management lock.
pub(crate) struct MdShared {
    pub pending: AtomicI64,
    pub waiter: (Mutex<()>, Condvar),
}

impl MdShared {
    pub fn new() -> Arc<MdShared> {
        Arc::new(MdShared {
            pending: AtomicI64::new(0),
            waiter: (Mutex::new(()), Condvar::new()),
        })
    }

    pub fn wake_if_quiesced(&self) {
        if self.pending.load(Ordering::SeqCst) == 0 {
            let _guard = self.waiter.0.lock().expect("waiter mutex poisoned");
            self.waiter.1.notify_all();
        }
    }
}

pub(crate) struct MdRecord {
    pub name: String,
    pub minor: u32,
    pub state: DmState,
    pub mt: Option<MappingTable>,
    pub opened_devices: Vec<Device>,
    pub use_count: u32,
    pub deferred: Vec<DeferredIo>,
    pub block_size_kb: u64,
    pub hardsect_size: u64,
    pub shared: Arc<MdShared>,
}

impl MdRecord {
    pub fn new(name: String, minor: u32) -> MdRecord {
        MdRecord {
            name,
            minor,
            state: DmState::Empty,
            mt: None,
            opened_devices: Vec::new(),
            use_count: 0,
            deferred: Vec::new(),
            block_size_kb: 0,
            hardsect_size: crate::config::SECTOR_SIZE,
            shared: MdShared::new(),
        }
    }
}

/// Captures the original completion callback across a remapped
/// request's lifetime. Installed as the request's completion when a
/// target returns `Remapped`; ownership transfers to whatever drives
/// the underlying I/O to completion, which must call `finalize` exactly
/// once regardless of success or failure.
pub struct IoHook {
    shared: Arc<MdShared>,
    minor: u32,
    original: Completion,
}

impl IoHook {
    /// `MD.pending` must already have been incremented by the caller
    /// before constructing a hook; see `DeviceRegistry::submit`, which
    /// increments once per admitted request regardless of the eventual
    /// `MapOutcome` and only wraps a hook around the `Remapped` case.
    pub(crate) fn new(shared: Arc<MdShared>, minor: u32, original: Completion) -> IoHook {
        IoHook {
            shared,
            minor,
            original,
        }
    }

    /// Run the original completion, then restore quiescence bookkeeping.
    /// Tolerates arriving out of order relative to other hooks on the
    /// same MD: only this hook's own counter decrement matters.
    pub fn finalize(self, result: Result<(), Error>) {
        trace!("minor {}: hook finalize result={:?}", self.minor, result.is_ok());
        let remaining = self.shared.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let _guard = self.shared.waiter.0.lock().expect("waiter mutex poisoned");
            self.shared.waiter.1.notify_all();
        }
        (self.original)(result);
    }
}
