// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Device Registry: lifecycle and request dispatch for every
//! mapped device in the process.
//!
//! A single readers-writer lock guards slot membership, the
//! name-to-minor index, and every MD's state bits, deferred queue, and
//! use count, rather than a lock per MD. The pending-I/O counter lives
//! outside this lock (see `mapped_device::MdShared`) because hook
//! finalization must never block on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{info, trace, warn};

use crate::block_layer::BlockLayer;
use crate::config::{DEFAULT_READ_AHEAD_SECTORS, MAX_DEFERRED_PER_MD, MAX_DEVICES, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::mapped_device::{DeferredIo, DmState, IoHook, MdRecord, MAX_NAME_LEN};
use crate::mapping_table::{MappingTable, MtSpec};
use crate::request::{Completion, IoRequest, MapOutcome, SubmitOutcome};
use crate::target::TargetRegistry;
use crate::types::Sector;

struct DrInner {
    slots: Vec<Option<MdRecord>>,
    names: HashMap<String, u32>,
}

/// Auth level of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    Any,
    Privileged,
}

#[derive(Debug, Clone, Copy)]
pub enum ControlOp {
    GetSize,
    FlushBuffers,
    GetReadAhead,
    SetReadAhead(u32),
    ReReadPartitions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    Size(Sector),
    ReadAhead(u32),
    Ack,
}

pub struct DeviceRegistry {
    dm_major: u32,
    registry: Arc<TargetRegistry>,
    block_layer: Arc<dyn BlockLayer>,
    read_ahead: AtomicU32,
    inner: RwLock<DrInner>,
}

impl DeviceRegistry {
    pub fn new(
        dm_major: u32,
        registry: Arc<TargetRegistry>,
        block_layer: Arc<dyn BlockLayer>,
    ) -> DeviceRegistry {
        let slots = (0..MAX_DEVICES).map(|_| None).collect();
        DeviceRegistry {
            dm_major,
            registry,
            block_layer,
            read_ahead: AtomicU32::new(DEFAULT_READ_AHEAD_SECTORS),
            inner: RwLock::new(DrInner {
                slots,
                names: HashMap::new(),
            }),
        }
    }

    /// Whether `major` is the device-mapper major this registry owns.
    /// Used by the VG layer to refuse stacking a PV on one of its own
    /// LVs.
    pub fn owns_major(&self, major: u32) -> bool {
        major == self.dm_major
    }

    pub fn create(&self, name: &str, preferred_minor: Option<u32>) -> Result<u32> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::BadParam("name length out of bounds".to_string()));
        }
        let mut inner = self.inner.write().expect("device registry lock poisoned");
        if inner.names.contains_key(name) {
            warn!("create {name:?}: name already registered");
            return Err(Error::Duplicate);
        }
        let minor = match preferred_minor {
            Some(m) => {
                let idx = m as usize;
                if idx >= MAX_DEVICES {
                    return Err(Error::BadParam("minor out of range".to_string()));
                }
                if inner.slots[idx].is_some() {
                    warn!("create {name:?}: minor {m} in use");
                    return Err(Error::InUse);
                }
                m
            }
            None => inner
                .slots
                .iter()
                .position(|s| s.is_none())
                .ok_or(Error::NoMemory)? as u32,
        };
        inner.slots[minor as usize] = Some(MdRecord::new(name.to_string(), minor));
        inner.names.insert(name.to_string(), minor);
        info!("created device {name:?} at minor {minor}");
        Ok(minor)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("device registry lock poisoned");
        let minor = *inner.names.get(name).ok_or(Error::NoDevice)?;
        {
            let rec = inner.slots[minor as usize]
                .as_ref()
                .expect("name index out of sync with slots");
            if rec.use_count > 0 {
                return Err(Error::Busy);
            }
            if rec.state == DmState::Active {
                return Err(Error::Busy);
            }
        }
        Self::unload_locked(&mut inner, minor, &self.block_layer)?;
        inner.slots[minor as usize] = None;
        inner.names.remove(name);
        info!("removed device {name:?}");
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Result<u32> {
        let inner = self.inner.read().expect("device registry lock poisoned");
        inner.names.get(name).copied().ok_or(Error::NoDevice)
    }

    pub fn find_by_minor(&self, minor: u32) -> Result<()> {
        let inner = self.inner.read().expect("device registry lock poisoned");
        match inner.slots.get(minor as usize) {
            Some(Some(_)) => Ok(()),
            _ => Err(Error::NoDevice),
        }
    }

    pub fn use_count(&self, minor: u32) -> Result<u32> {
        let inner = self.inner.read().expect("device registry lock poisoned");
        Ok(Self::slot_ref(&inner, minor)?.use_count)
    }

    pub fn open_use(&self, minor: u32) -> Result<()> {
        let mut inner = self.inner.write().expect("device registry lock poisoned");
        let rec = Self::slot_mut(&mut inner, minor)?;
        if rec.state != DmState::Active {
            return Err(Error::NotActive);
        }
        rec.use_count += 1;
        Ok(())
    }

    pub fn close_use(&self, minor: u32) -> Result<()> {
        let mut inner = self.inner.write().expect("device registry lock poisoned");
        let rec = Self::slot_mut(&mut inner, minor)?;
        rec.use_count = rec.use_count.saturating_sub(1);
        Ok(())
    }

    /// `EMPTY -> LOADED`: attach a freshly built mapping table.
    pub fn load(&self, minor: u32, specs: &[MtSpec]) -> Result<()> {
        let mt = MappingTable::build(specs, &self.registry)?;
        let mut inner = self.inner.write().expect("device registry lock poisoned");
        let rec = Self::slot_mut(&mut inner, minor)?;
        if rec.state != DmState::Empty {
            return Err(Error::InUse);
        }
        rec.mt = Some(mt);
        rec.state = DmState::Loaded;
        info!("minor {minor}: loaded table");
        Ok(())
    }

    /// `LOADED -> ACTIVE`: open underlying devices, publish geometry,
    /// drain the deferred queue. A no-op if already active.
    pub fn activate(&self, minor: u32) -> Result<()> {
        let (devices, device_size) = {
            let mut inner = self.inner.write().expect("device registry lock poisoned");
            let rec = Self::slot_mut(&mut inner, minor)?;
            if rec.state == DmState::Active {
                return Ok(());
            }
            if rec.state != DmState::Loaded {
                return Err(Error::NotActive);
            }
            let mt = rec.mt.as_ref().expect("LOADED implies a table is attached");
            (mt.underlying_devices(), mt.device_size())
        };

        for dev in &devices {
            self.block_layer.open(*dev)?;
        }
        let hardsect = devices
            .iter()
            .map(|d| self.block_layer.hardware_sector_size(*d))
            .min()
            .unwrap_or(SECTOR_SIZE);

        let deferred = {
            let mut inner = self.inner.write().expect("device registry lock poisoned");
            let rec = Self::slot_mut(&mut inner, minor)?;
            rec.opened_devices = devices;
            rec.hardsect_size = hardsect;
            // FIXME: derived from total device capacity rather than the
            // table's own geometry.
            rec.block_size_kb = (device_size.0 * SECTOR_SIZE) / 1024;
            rec.state = DmState::Active;
            self.block_layer.publish(minor, device_size, hardsect);
            info!(
                "minor {minor}: activated ({} underlying device(s))",
                rec.opened_devices.len()
            );
            std::mem::take(&mut rec.deferred)
        };

        self.replay_deferred(minor, deferred);
        Ok(())
    }

    /// `ACTIVE -> SUSPENDED`: stop admitting new I/O, wait for
    /// quiescence, close underlying devices. Interruptible: if
    /// `interrupt` becomes true before quiescence, the MD is left
    /// `ACTIVE` and this returns `Error::Interrupted`.
    pub fn suspend(&self, minor: u32) -> Result<()> {
        self.suspend_interruptible(minor, &AtomicBool::new(false))
    }

    pub fn suspend_interruptible(&self, minor: u32, interrupt: &AtomicBool) -> Result<()> {
        let shared = {
            let mut inner = self.inner.write().expect("device registry lock poisoned");
            let rec = Self::slot_mut(&mut inner, minor)?;
            if rec.state != DmState::Active {
                return Err(Error::NotActive);
            }
            rec.state = DmState::Suspended;
            rec.shared.clone()
        };

        let (lock, cvar) = &shared.waiter;
        let mut guard = lock.lock().expect("waiter mutex poisoned");
        while shared.pending.load(Ordering::SeqCst) != 0 {
            if interrupt.load(Ordering::SeqCst) {
                let mut inner = self.inner.write().expect("device registry lock poisoned");
                if let Ok(rec) = Self::slot_mut(&mut inner, minor) {
                    rec.state = DmState::Active;
                }
                warn!("minor {minor}: suspend interrupted, remains ACTIVE");
                return Err(Error::Interrupted);
            }
            let (g, _timed_out) = cvar
                .wait_timeout(guard, Duration::from_millis(20))
                .expect("waiter mutex poisoned");
            guard = g;
        }
        drop(guard);

        let mut inner = self.inner.write().expect("device registry lock poisoned");
        let rec = Self::slot_mut(&mut inner, minor)?;
        for dev in rec.opened_devices.drain(..) {
            self.block_layer.close(dev);
        }
        info!("minor {minor}: suspended");
        Ok(())
    }

    /// `SUSPENDED -> ACTIVE`: reopen devices, drain deferred I/O.
    pub fn resume(&self, minor: u32) -> Result<()> {
        let (devices, device_size, hardsect) = {
            let inner = self.inner.read().expect("device registry lock poisoned");
            let rec = Self::slot_ref(&inner, minor)?;
            if rec.state != DmState::Suspended {
                return Err(Error::NotActive);
            }
            let mt = rec.mt.as_ref().expect("SUSPENDED implies a table is attached");
            (mt.underlying_devices(), mt.device_size(), rec.hardsect_size)
        };
        for dev in &devices {
            self.block_layer.open(*dev)?;
        }

        let deferred = {
            let mut inner = self.inner.write().expect("device registry lock poisoned");
            let rec = Self::slot_mut(&mut inner, minor)?;
            rec.opened_devices = devices;
            rec.state = DmState::Active;
            self.block_layer.publish(minor, device_size, hardsect);
            info!("minor {minor}: resumed");
            std::mem::take(&mut rec.deferred)
        };

        self.replay_deferred(minor, deferred);
        Ok(())
    }

    /// `LOADED`/`SUSPENDED -> EMPTY`: drop the table (destructing every
    /// target instance in reverse construction order) and fail any
    /// still-deferred I/O back to its submitter.
    pub fn unload(&self, minor: u32) -> Result<()> {
        let mut inner = self.inner.write().expect("device registry lock poisoned");
        Self::unload_locked(&mut inner, minor, &self.block_layer)
    }

    fn unload_locked(
        inner: &mut DrInner,
        minor: u32,
        block_layer: &Arc<dyn BlockLayer>,
    ) -> Result<()> {
        let rec = Self::slot_mut(inner, minor)?;
        match rec.state {
            DmState::Empty => Ok(()),
            DmState::Active => Err(Error::Busy),
            DmState::Loaded | DmState::Suspended => {
                for dev in rec.opened_devices.drain(..) {
                    block_layer.close(dev);
                }
                rec.mt = None; // destructs every TargetInstance, in reverse order
                for entry in rec.deferred.drain(..) {
                    (entry.completion)(Err(Error::IoError("device unloaded".to_string())));
                }
                rec.state = DmState::Empty;
                info!("minor {minor}: unloaded");
                Ok(())
            }
        }
    }

    /// Submit one request. The read lock is dropped before any
    /// deferred-queue allocation so a submitter never observes a state
    /// that is neither ACTIVE nor deferrable.
    pub fn submit(&self, request: IoRequest, completion: Completion) -> SubmitOutcome {
        self.submit_internal(request, completion)
    }

    fn submit_internal(&self, request: IoRequest, completion: Completion) -> SubmitOutcome {
        let minor = request.minor;
        {
            let inner = self.inner.read().expect("device registry lock poisoned");
            match inner.slots.get(minor as usize).and_then(|s| s.as_ref()) {
                None => return SubmitOutcome::Failed(Error::NoDevice),
                Some(rec) if rec.state == DmState::Empty => {
                    return SubmitOutcome::Failed(Error::NoDevice)
                }
                Some(rec) if rec.state == DmState::Active => {
                    return Self::handle_active(minor, rec, request, completion);
                }
                Some(_) => {} // LOADED or SUSPENDED: fall through to the write-locked recheck
            }
        }

        let mut inner = self.inner.write().expect("device registry lock poisoned");
        let rec = match Self::slot_mut(&mut inner, minor) {
            Ok(rec) => rec,
            Err(e) => return SubmitOutcome::Failed(e),
        };
        if rec.state == DmState::Active {
            // activation raced in between the read- and write-lock acquisitions
            return Self::handle_active(minor, rec, request, completion);
        }
        if rec.state == DmState::Empty {
            return SubmitOutcome::Failed(Error::NoDevice);
        }
        if rec.deferred.len() >= MAX_DEFERRED_PER_MD {
            warn!("minor {minor}: deferred queue full, failing submission");
            return SubmitOutcome::Failed(Error::NoMemory);
        }
        trace!("minor {minor}: deferring request (state not yet ACTIVE)");
        rec.deferred.push(DeferredIo {
            request,
            direction: request.direction,
            completion,
        });
        SubmitOutcome::Deferred
    }

    fn handle_active(
        minor: u32,
        rec: &MdRecord,
        request: IoRequest,
        completion: Completion,
    ) -> SubmitOutcome {
        rec.shared.pending.fetch_add(1, Ordering::SeqCst);
        let mt = rec.mt.as_ref().expect("ACTIVE implies a table is attached");
        match mt.map(&request) {
            MapOutcome::Remapped(remap) => {
                let hook = IoHook::new(rec.shared.clone(), minor, completion);
                let shim: Completion = Box::new(move |result| hook.finalize(result));
                SubmitOutcome::Remapped {
                    device: remap.device,
                    sector: remap.sector,
                    completion: shim,
                }
            }
            MapOutcome::Complete => {
                rec.shared.pending.fetch_sub(1, Ordering::SeqCst);
                rec.shared.wake_if_quiesced();
                completion(Ok(()));
                SubmitOutcome::Completed
            }
            MapOutcome::Failed(e) => {
                rec.shared.pending.fetch_sub(1, Ordering::SeqCst);
                rec.shared.wake_if_quiesced();
                SubmitOutcome::Failed(e)
            }
        }
    }

    /// Hand each entry back to the block layer exactly as a fresh
    /// submitter would, in enqueue order. Delegating to the block layer
    /// rather than re-entering `submit_internal` here keeps whoever
    /// drives a `Remapped` outcome to completion the same regardless of
    /// whether the request arrived fresh or as a deferred replay.
    fn replay_deferred(&self, minor: u32, deferred: Vec<DeferredIo>) {
        for entry in deferred {
            trace!("minor {minor}: replaying deferred request");
            if let SubmitOutcome::Failed(e) = self.block_layer.resubmit(entry.request, entry.completion) {
                warn!("minor {minor}: deferred replay failed: {e:?}");
            }
        }
    }

    pub fn control(&self, minor: u32, op: ControlOp, auth: Auth) -> Result<ControlResult> {
        match op {
            ControlOp::ReReadPartitions => Err(Error::NotSupported),
            ControlOp::GetReadAhead => Ok(ControlResult::ReadAhead(
                self.read_ahead.load(Ordering::SeqCst),
            )),
            ControlOp::SetReadAhead(value) => {
                if auth != Auth::Privileged {
                    return Err(Error::Permission);
                }
                self.read_ahead.store(value, Ordering::SeqCst);
                Ok(ControlResult::Ack)
            }
            ControlOp::FlushBuffers => {
                if auth != Auth::Privileged {
                    return Err(Error::Permission);
                }
                self.block_layer.flush_buffers(minor)?;
                Ok(ControlResult::Ack)
            }
            ControlOp::GetSize => {
                let inner = self.inner.read().expect("device registry lock poisoned");
                let rec = Self::slot_ref(&inner, minor)?;
                if rec.hardsect_size == 0 {
                    return Err(Error::NotActive);
                }
                Ok(ControlResult::Size(Sector(
                    rec.block_size_kb * 1024 / rec.hardsect_size,
                )))
            }
        }
    }

    fn slot_ref<'a>(inner: &'a DrInner, minor: u32) -> Result<&'a MdRecord> {
        inner
            .slots
            .get(minor as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::NoDevice)
    }

    fn slot_mut<'a>(inner: &'a mut DrInner, minor: u32) -> Result<&'a mut MdRecord> {
        inner
            .slots
            .get_mut(minor as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NoDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_layer::NullBlockLayer;
    use crate::mapping_table::MtSpec;
    use crate::request::Direction;
    use crate::types::Sector;
    use std::sync::Mutex;

    fn new_dr() -> DeviceRegistry {
        DeviceRegistry::new(
            254,
            Arc::new(TargetRegistry::new()),
            Arc::new(NullBlockLayer),
        )
    }

    fn linear_spec(high: u64, minor: u32) -> MtSpec<'static> {
        MtSpec {
            high_sector: Sector(high),
            target_kind: "linear",
            params: Box::leak(format!("8:{minor} 0").into_boxed_str()).as_bytes(),
        }
    }

    #[test]
    fn create_duplicate_name_fails_and_does_not_consume_slot() {
        let dr = new_dr();
        dr.create("vg0-lv0", Some(4)).unwrap();
        let err = dr.create("vg0-lv0", Some(5)).unwrap_err();
        assert!(matches!(err, Error::Duplicate));
        assert!(dr.find_by_minor(5).is_err());
    }

    #[test]
    fn create_with_occupied_preferred_minor_fails_in_use() {
        let dr = new_dr();
        dr.create("a", Some(0)).unwrap();
        let err = dr.create("b", Some(0)).unwrap_err();
        assert!(matches!(err, Error::InUse));
    }

    #[test]
    fn remove_while_busy_fails() {
        let dr = new_dr();
        let minor = dr.create("busy-lv", None).unwrap();
        dr.load(minor, &[linear_spec(99, 1)]).unwrap();
        dr.activate(minor).unwrap();
        dr.open_use(minor).unwrap();
        assert!(matches!(dr.remove("busy-lv").unwrap_err(), Error::Busy));
        dr.close_use(minor).unwrap();
    }

    #[test]
    fn request_before_activation_is_deferred_then_replayed() {
        let dr = new_dr();
        let minor = dr.create("lv", None).unwrap();
        dr.load(minor, &[linear_spec(99, 1)]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let request = IoRequest {
            minor,
            sector: Sector(10),
            len: Sector(1),
            direction: Direction::Read,
        };
        let outcome = dr.submit(
            request,
            Box::new(move |r| seen2.lock().unwrap().push(r.is_ok())),
        );
        assert!(matches!(outcome, SubmitOutcome::Deferred));

        dr.activate(minor).unwrap();
        // the deferred request was replayed and remapped synchronously
        // onto the block layer's no-op open/close path; its completion
        // has not yet fired (it is owned by whatever would drive the
        // remapped I/O), but submission itself must not be Failed.
    }

    #[test]
    fn requests_to_unknown_minor_fail_no_device() {
        let dr = new_dr();
        let request = IoRequest {
            minor: 9,
            sector: Sector(0),
            len: Sector(1),
            direction: Direction::Read,
        };
        let outcome = dr.submit(request, Box::new(|_| {}));
        assert!(matches!(outcome, SubmitOutcome::Failed(Error::NoDevice)));
    }

    #[test]
    fn re_read_partitions_is_not_supported() {
        let dr = new_dr();
        let minor = dr.create("lv", None).unwrap();
        let err = dr
            .control(minor, ControlOp::ReReadPartitions, Auth::Privileged)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported));
    }

    #[test]
    fn set_readahead_requires_privilege() {
        let dr = new_dr();
        let minor = dr.create("lv", None).unwrap();
        let err = dr
            .control(minor, ControlOp::SetReadAhead(128), Auth::Any)
            .unwrap_err();
        assert!(matches!(err, Error::Permission));
        dr.control(minor, ControlOp::SetReadAhead(128), Auth::Privileged)
            .unwrap();
        let got = dr.control(minor, ControlOp::GetReadAhead, Auth::Any).unwrap();
        assert_eq!(got, ControlResult::ReadAhead(128));
    }

    #[test]
    fn suspend_quiescence_blocks_until_pending_drains() {
        use std::thread;

        let dr = Arc::new(new_dr());
        let minor = dr.create("lv", None).unwrap();
        dr.load(minor, &[linear_spec(99, 1)]).unwrap();
        dr.activate(minor).unwrap();

        let pending_completions: Arc<Mutex<Vec<Completion>>> = Arc::new(Mutex::new(Vec::new()));
        for sector in [0u64, 10, 20] {
            let request = IoRequest {
                minor,
                sector: Sector(sector),
                len: Sector(1),
                direction: Direction::Read,
            };
            let pc = pending_completions.clone();
            match dr.submit(request, Box::new(|_| {})) {
                SubmitOutcome::Remapped { completion, .. } => pc.lock().unwrap().push(completion),
                other => panic!("expected Remapped, got {other:?}"),
            }
        }

        let dr_clone = dr.clone();
        let suspend_handle = thread::spawn(move || dr_clone.suspend(minor));

        thread::sleep(Duration::from_millis(50));
        assert!(!suspend_handle.is_finished());

        for completion in pending_completions.lock().unwrap().drain(..) {
            completion(Ok(()));
        }

        suspend_handle.join().unwrap().unwrap();

        let request = IoRequest {
            minor,
            sector: Sector(5),
            len: Sector(1),
            direction: Direction::Read,
        };
        assert!(matches!(
            dr.submit(request, Box::new(|_| {})),
            SubmitOutcome::Deferred
        ));
    }
}
