// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Physical Volumes and the allocator's scratch free-space maps.

use crate::types::PhysicalExtent;

/// A Physical Volume: total extent count and how many are allocated.
/// Which extents are free is not tracked here directly, it is derived
/// on demand from the LV segments that reference this PV (see
/// `VolumeGroup::free_areas`) and handed to the allocator as an
/// externally-supplied free-space map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalVolume {
    pub id: String,
    pub pe_count: u32,
    pub pe_alloc_count: u32,
}

impl PhysicalVolume {
    pub fn new(id: impl Into<String>, pe_count: u32) -> PhysicalVolume {
        PhysicalVolume {
            id: id.into(),
            pe_count,
            pe_alloc_count: 0,
        }
    }

    pub fn pe_free(&self) -> u32 {
        self.pe_count - self.pe_alloc_count
    }
}

/// One contiguous run of free physical extents on a PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvArea {
    pub pv_index: usize,
    pub start_pe: PhysicalExtent,
    pub count: u32,
}

/// A PV's free-space map for a single allocation call: a list of
/// `PvArea`s kept sorted by count, descending. Dropped when the call
/// returns.
pub struct PvMap {
    pub pv_index: usize,
    areas: Vec<PvArea>,
}

impl PvMap {
    pub fn new(pv_index: usize, mut areas: Vec<PvArea>) -> PvMap {
        areas.sort_by(|a, b| b.count.cmp(&a.count));
        PvMap { pv_index, areas }
    }

    pub fn largest(&self) -> Option<&PvArea> {
        self.areas.first()
    }

    /// Consume `count` extents from the largest area, which must hold
    /// at least that many. Re-sorts to restore the largest-first
    /// invariant. Returns the consumed run's starting extent.
    pub fn consume_largest(&mut self, count: u32) -> Option<PhysicalExtent> {
        let area = self.areas.first_mut()?;
        if area.count < count {
            return None;
        }
        let start = area.start_pe;
        area.start_pe = PhysicalExtent(area.start_pe.0 + count);
        area.count -= count;
        if area.count == 0 {
            self.areas.remove(0);
        }
        self.areas.sort_by(|a, b| b.count.cmp(&a.count));
        Some(start)
    }
}
