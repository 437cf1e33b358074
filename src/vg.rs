// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Volume Groups: the PV/LV store the allocator operates against.
//!
//! On-disk persistence of VG metadata is an external collaborator: this
//! module never serializes itself to or from disk. Serializing VG-level
//! mutations against concurrent command invocations is likewise
//! external; this module only calls into `Flock` around each mutating
//! operation the way a consumer holding that contract would.

use crate::allocator;
use crate::config::DEFAULT_EXTENT_SIZE;
use crate::device_registry::DeviceRegistry;
use crate::error::{Error, Result};
use crate::flock::{Flock, LockScope};
use crate::lv::{AllocationPolicy, LogicalVolume};
use crate::pv::{PhysicalVolume, PvArea, PvMap};
use crate::types::{Device, PhysicalExtent};

/// A Volume Group: a pool of Physical Volumes and the Logical Volumes
/// carved from them.
#[derive(Debug)]
pub struct VolumeGroup {
    name: String,
    extent_size: u64,
    max_lv: u32,
    free_count: u64,
    pvs: Vec<PhysicalVolume>,
    lvs: Vec<LogicalVolume>,
}

impl VolumeGroup {
    pub fn new(name: impl Into<String>) -> VolumeGroup {
        VolumeGroup {
            name: name.into(),
            extent_size: DEFAULT_EXTENT_SIZE,
            max_lv: 0,
            free_count: 0,
            pvs: Vec::new(),
            lvs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    pub fn total_pe_count(&self) -> u64 {
        self.pvs.iter().map(|pv| u64::from(pv.pe_count)).sum()
    }

    pub fn pv_list(&self) -> impl Iterator<Item = (usize, &PhysicalVolume)> {
        self.pvs.iter().enumerate()
    }

    pub fn lv_get(&self, name: &str) -> Option<&LogicalVolume> {
        self.lvs.iter().find(|lv| lv.name == name)
    }

    fn lv_index(&self, name: &str) -> Result<usize> {
        self.lvs.iter().position(|lv| lv.name == name).ok_or(Error::NoDevice)
    }

    /// Add a PV backed by `device` to the pool. Refuses a device that
    /// is itself one of this registry's own mapped devices: stacking a
    /// PV on top of one of its own LVs is a dependency loop.
    pub fn pv_add(&mut self, id: impl Into<String>, pe_count: u32, device: Device, dr: &DeviceRegistry) -> Result<usize> {
        if dr.owns_major(device.major) {
            return Err(Error::BadParam(
                "device belongs to this process's own device-mapper major".to_string(),
            ));
        }
        let _lock = Flock::lock_exclusive(LockScope::VG(self.name.clone()))?;
        let index = self.pvs.len();
        self.pvs.push(PhysicalVolume::new(id, pe_count));
        self.free_count += u64::from(pe_count);
        Ok(index)
    }

    /// Remove a PV. It must be unused by any LV segment.
    pub fn pv_remove(&mut self, pv_index: usize) -> Result<()> {
        if pv_index >= self.pvs.len() {
            return Err(Error::NoDevice);
        }
        let in_use = self
            .lvs
            .iter()
            .any(|lv| lv.segments.iter().any(|seg| seg.areas.iter().any(|a| a.pv_index == pv_index)));
        if in_use {
            return Err(Error::Busy);
        }
        let _lock = Flock::lock_exclusive(LockScope::VG(self.name.clone()))?;
        let pv = self.pvs.remove(pv_index);
        self.free_count -= u64::from(pv.pe_count);
        // every segment's pv_index past this point shifts down by one;
        // no segment can reference pv_index (checked above) or anything
        // beyond it without also being invalidated, since indices are
        // assigned densely and never reused while referenced.
        for lv in &mut self.lvs {
            for seg in &mut lv.segments {
                for area in &mut seg.areas {
                    if area.pv_index > pv_index {
                        area.pv_index -= 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn used_ranges(&self, pv_index: usize) -> Vec<(u32, u32)> {
        let mut ranges = Vec::new();
        for lv in &self.lvs {
            for seg in &lv.segments {
                let area_len = seg.area_len();
                for area in &seg.areas {
                    if area.pv_index == pv_index {
                        ranges.push((area.start_pe.0, area_len));
                    }
                }
            }
        }
        ranges.sort_by_key(|r| r.0);
        ranges
    }

    /// Free areas on one PV, as a sorted-by-offset list. Adjacent free
    /// areas are not merged.
    fn free_areas_for(&self, pv_index: usize) -> Vec<PvArea> {
        let pv = &self.pvs[pv_index];
        let mut areas = Vec::new();
        let mut cursor = 0u32;
        for (start, len) in self.used_ranges(pv_index) {
            if cursor < start {
                areas.push(PvArea { pv_index, start_pe: PhysicalExtent(cursor), count: start - cursor });
            }
            cursor = (start + len).max(cursor);
        }
        if cursor < pv.pe_count {
            areas.push(PvArea { pv_index, start_pe: PhysicalExtent(cursor), count: pv.pe_count - cursor });
        }
        areas
    }

    fn build_pv_maps(&self, allocatable: &[usize]) -> Vec<PvMap> {
        allocatable.iter().map(|&idx| PvMap::new(idx, self.free_areas_for(idx))).collect()
    }

    /// Create a new LV with `le_count` extents under `policy`, drawing
    /// only from `allocatable_pvs`. `name` defaults to the next unused
    /// `lvol<N>` when `None`.
    pub fn lv_create(
        &mut self,
        name: Option<String>,
        le_count: u32,
        policy: AllocationPolicy,
        allocatable_pvs: &[usize],
    ) -> Result<&LogicalVolume> {
        let name = match name {
            Some(n) => {
                if self.lvs.iter().any(|lv| lv.name == n) {
                    return Err(Error::Duplicate);
                }
                n
            }
            None => {
                let existing: Vec<&str> = self.lvs.iter().map(|lv| lv.name.as_str()).collect();
                allocator::generate_name(&existing)
            }
        };
        if self.max_lv > 0 && self.lvs.len() as u32 >= self.max_lv {
            return Err(Error::InsufficientSpace);
        }

        let _lock = Flock::lock_exclusive(LockScope::VG(self.name.clone()))?;
        let mut lv = LogicalVolume::new(name.clone(), policy);
        let mut pv_maps = self.build_pv_maps(allocatable_pvs);
        allocator::extend(&mut lv, &mut self.pvs, &mut self.free_count, le_count, &mut pv_maps)?;

        self.lvs.push(lv);
        Ok(self.lvs.last().expect("just pushed"))
    }

    /// Extend an existing LV by `extents` logical extents.
    pub fn lv_extend(&mut self, name: &str, extents: u32, allocatable_pvs: &[usize]) -> Result<()> {
        let idx = self.lv_index(name)?;
        let _lock = Flock::lock_exclusive(LockScope::VG(self.name.clone()))?;
        let mut pv_maps = self.build_pv_maps(allocatable_pvs);
        let mut lv = self.lvs.remove(idx);
        let result = allocator::extend(&mut lv, &mut self.pvs, &mut self.free_count, extents, &mut pv_maps);
        self.lvs.insert(idx, lv);
        result
    }

    /// Remove `extents` logical extents from the tail of an LV.
    pub fn lv_reduce(&mut self, name: &str, extents: u32) -> Result<()> {
        let idx = self.lv_index(name)?;
        let _lock = Flock::lock_exclusive(LockScope::VG(self.name.clone()))?;
        let mut lv = self.lvs.remove(idx);
        let result = allocator::reduce(&mut lv, &mut self.pvs, &mut self.free_count, extents);
        self.lvs.insert(idx, lv);
        result
    }

    /// Destroy a logical volume, releasing all of its extents.
    pub fn lv_remove(&mut self, name: &str) -> Result<()> {
        let idx = self.lv_index(name)?;
        let _lock = Flock::lock_exclusive(LockScope::VG(self.name.clone()))?;
        let lv = self.lvs.remove(idx);
        allocator::remove(&lv, &mut self.pvs, &mut self.free_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_layer::NullBlockLayer;
    use crate::target::TargetRegistry;
    use std::sync::Arc;

    fn new_dr() -> DeviceRegistry {
        DeviceRegistry::new(254, Arc::new(TargetRegistry::new()), Arc::new(NullBlockLayer))
    }

    #[test]
    fn pv_add_refuses_own_dm_major() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let err = vg.pv_add("pv0", 100, Device { major: 254, minor: 0 }, &dr).unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
    }

    /// Scenario 2, run end to end through `VolumeGroup`.
    #[test]
    fn contiguous_exact_fit_end_to_end() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let a = vg.pv_add("pv-a", 50, Device { major: 8, minor: 1 }, &dr).unwrap();
        let b = vg.pv_add("pv-b", 50, Device { major: 8, minor: 2 }, &dr).unwrap();

        vg.lv_create(Some("data".to_string()), 50, AllocationPolicy::Contiguous, &[a, b])
            .unwrap();

        assert_eq!(vg.pvs[a].pe_alloc_count, 50);
        assert_eq!(vg.pvs[b].pe_alloc_count, 0);
        assert_eq!(vg.free_count, 50);
        assert_eq!(vg.lv_get("data").unwrap().segments.len(), 1);
    }

    #[test]
    fn duplicate_lv_name_rejected() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let a = vg.pv_add("pv-a", 50, Device { major: 8, minor: 1 }, &dr).unwrap();
        vg.lv_create(Some("data".to_string()), 10, AllocationPolicy::Contiguous, &[a]).unwrap();
        let err = vg
            .lv_create(Some("data".to_string()), 10, AllocationPolicy::Contiguous, &[a])
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate));
    }

    #[test]
    fn default_names_follow_lvol_sequence() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let a = vg.pv_add("pv-a", 100, Device { major: 8, minor: 1 }, &dr).unwrap();
        vg.lv_create(None, 10, AllocationPolicy::Contiguous, &[a]).unwrap();
        vg.lv_create(None, 10, AllocationPolicy::Contiguous, &[a]).unwrap();
        assert!(vg.lv_get("lvol0").is_some());
        assert!(vg.lv_get("lvol1").is_some());
    }

    /// Extending then reducing an LV by the same amount restores every
    /// counter.
    #[test]
    fn extend_then_reduce_round_trips_vg_counters() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let a = vg.pv_add("pv-a", 100, Device { major: 8, minor: 1 }, &dr).unwrap();
        vg.lv_create(Some("data".to_string()), 20, AllocationPolicy::Contiguous, &[a]).unwrap();
        let free_before = vg.free_count;
        let alloc_before = vg.pvs[a].pe_alloc_count;

        vg.lv_extend("data", 30, &[a]).unwrap();
        vg.lv_reduce("data", 30).unwrap();

        assert_eq!(vg.free_count, free_before);
        assert_eq!(vg.pvs[a].pe_alloc_count, alloc_before);
        assert_eq!(vg.lv_get("data").unwrap().le_count, 20);
    }

    #[test]
    fn lv_remove_frees_all_extents() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let a = vg.pv_add("pv-a", 100, Device { major: 8, minor: 1 }, &dr).unwrap();
        vg.lv_create(Some("data".to_string()), 40, AllocationPolicy::Contiguous, &[a]).unwrap();
        vg.lv_remove("data").unwrap();
        assert_eq!(vg.pvs[a].pe_alloc_count, 0);
        assert_eq!(vg.free_count, 100);
        assert!(vg.lv_get("data").is_none());
    }

    #[test]
    fn pv_remove_refuses_while_in_use() {
        let mut vg = VolumeGroup::new("vg0");
        let dr = new_dr();
        let a = vg.pv_add("pv-a", 50, Device { major: 8, minor: 1 }, &dr).unwrap();
        vg.lv_create(Some("data".to_string()), 10, AllocationPolicy::Contiguous, &[a]).unwrap();
        let err = vg.pv_remove(a).unwrap_err();
        assert!(matches!(err, Error::Busy));
    }
}
