// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical Volumes and their segments.

use crate::types::{LogicalExtent, PhysicalExtent};

/// How a fresh allocation (or extension) selects physical extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    Contiguous,
    NextFree,
    Striped { stripes: u32, stripe_size: u64 },
}

/// A segment's type. Non-exhaustive: only striped/linear are
/// implemented here (linear is the `area_count == 1` case of
/// `Striped`), and dispatch is by name, so a future variant (mirror,
/// say) is a non-breaking addition.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Striped,
}

/// One column of a segment: the PV area it draws extents from.
/// References a PV by its index into the owning `VolumeGroup`'s PV
/// list, never by ownership: segments borrow PVs, they don't own them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentArea {
    pub pv_index: usize,
    pub start_pe: PhysicalExtent,
}

/// A contiguous run of an LV's logical extents, bound to one or more
/// PV areas. `area_count == 1` is the linear case; `area_count >= 2`
/// is striped, with `le_len == area_len * area_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvSegment {
    pub le_start: LogicalExtent,
    pub le_len: u32,
    pub ty: SegmentType,
    pub stripe_size: u64,
    pub areas: Vec<SegmentArea>,
}

impl LvSegment {
    pub fn area_count(&self) -> u32 {
        self.areas.len() as u32
    }

    /// Extents consumed per column.
    pub fn area_len(&self) -> u32 {
        self.le_len / self.area_count()
    }
}

/// A Logical Volume: a named, policy-allocated span of extents carved
/// from a volume group's physical volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    pub allocation_policy: AllocationPolicy,
    pub le_count: u32,
    pub segments: Vec<LvSegment>,
    pub major: u32,
    pub minor: Option<u32>,
}

impl LogicalVolume {
    pub fn new(name: String, allocation_policy: AllocationPolicy) -> LogicalVolume {
        LogicalVolume {
            name,
            allocation_policy,
            le_count: 0,
            segments: Vec::new(),
            major: 0,
            minor: None,
        }
    }

    pub fn size_bytes(&self, extent_size_sectors: u64) -> u64 {
        self.le_count as u64 * extent_size_sectors * crate::config::SECTOR_SIZE
    }

    pub fn used_extents(&self) -> u32 {
        self.segments.iter().map(|s| s.le_len).sum()
    }
}
