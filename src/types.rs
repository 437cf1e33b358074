// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Small newtypes shared across the device-mapper core and the allocator.

use std::fmt;

/// A count or offset in 512-byte sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u64);

impl Sector {
    pub fn checked_add(self, other: Sector) -> Option<Sector> {
        self.0.checked_add(other.0).map(Sector)
    }

    pub fn checked_sub(self, other: Sector) -> Option<Sector> {
        self.0.checked_sub(other.0).map(Sector)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sector {
    fn from(v: u64) -> Sector {
        Sector(v)
    }
}

/// An underlying block device, identified the way the kernel identifies
/// block devices: a (major, minor) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Device {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// An index into an LV's extent space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalExtent(pub u32);

/// An index into a PV's extent space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalExtent(pub u32);
