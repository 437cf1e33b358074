// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Compile-time constants with no externally-mandated value.

/// Sector size in bytes. All `Sectors` values in this crate are counts
/// of this unit.
pub const SECTOR_SIZE: u64 = 512;

/// Maximum number of concurrently-registered mapped devices a
/// `DeviceRegistry` can hold.
pub const MAX_DEVICES: usize = 64;

/// Separator keys stored per node of a mapping table's levelled index.
/// Sized to fit a handful of `(u64, padding)` keys in a cache line.
pub const KEYS_PER_NODE: usize = 4;

/// Read-ahead, in sectors, a newly-initialized block-device major
/// starts with.
pub const DEFAULT_READ_AHEAD_SECTORS: u32 = 64;

/// Default VG extent size in sectors: 4 MiB at 512-byte sectors.
pub const DEFAULT_EXTENT_SIZE: u64 = 8192;

/// Bound on an MD's deferred-I/O queue while it is not ACTIVE. Past
/// this, a new submission fails with `NoMemory` rather than growing
/// the queue without limit.
pub const MAX_DEFERRED_PER_MD: usize = 1024;
