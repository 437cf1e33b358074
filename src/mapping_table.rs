// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Mapping Table: an immutable, sorted search structure over an
//! MD's logical address space.
//!
//! Construction builds a levelled index with branching factor
//! `KEYS_PER_NODE + 1` so lookup descends one level per step instead of
//! doing a binary search over the whole entry array; this is the same
//! sparse-index trick the kernel's device-mapper table uses.

use log::{debug, error};

use crate::config::KEYS_PER_NODE;
use crate::error::{Error, Result};
use crate::request::{IoRequest, MapOutcome};
use crate::target::{TargetInstance, TargetRegistry};
use crate::types::Sector;

/// One `(high_sector, target_kind_name, params)` input to `MappingTable::build`.
pub struct MtSpec<'a> {
    pub high_sector: Sector,
    pub target_kind: &'a str,
    pub params: &'a [u8],
}

struct MtEntry {
    high_sector: Sector,
    instance: Box<dyn TargetInstance>,
}

/// An immutable, built-once mapping table. Entries are destroyed in
/// reverse construction order when the table is dropped.
pub struct MappingTable {
    entries: Vec<MtEntry>,
    index: Vec<Vec<[Sector; KEYS_PER_NODE]>>,
}

impl std::fmt::Debug for MappingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl MappingTable {
    /// Build a table from an ordered list of entries. `high_sector`
    /// values must be strictly increasing; entry 0 covers `[0,
    /// high_0]`, entry i covers `(high_{i-1}, high_i]`.
    pub fn build(specs: &[MtSpec], registry: &TargetRegistry) -> Result<MappingTable> {
        if specs.is_empty() {
            return Err(Error::BadTable("mapping table must have one entry".to_string()));
        }

        let mut entries: Vec<MtEntry> = Vec::with_capacity(specs.len());
        let mut prev_high: Option<Sector> = None;

        for (idx, spec) in specs.iter().enumerate() {
            if let Some(prev) = prev_high {
                if spec.high_sector <= prev {
                    error!(
                        "mapping table build failed at entry {idx}: high_sector not increasing"
                    );
                    destroy_in_reverse(entries);
                    return Err(Error::BadTable(format!(
                        "entry {idx}: high_sector {} does not exceed previous {}",
                        spec.high_sector, prev
                    )));
                }
            }
            let range_start = prev_high
                .map(|p| Sector(p.0 + 1))
                .unwrap_or(Sector(0));

            let kind = match registry.lookup(spec.target_kind) {
                Ok(k) => k,
                Err(e) => {
                    error!("mapping table build failed at entry {idx}: unknown target kind");
                    destroy_in_reverse(entries);
                    return Err(e);
                }
            };

            let instance = match kind.construct(spec.params, range_start..=spec.high_sector) {
                Ok(i) => i,
                Err(e) => {
                    error!("mapping table build failed at entry {idx}: construct failed");
                    destroy_in_reverse(entries);
                    return Err(e);
                }
            };

            prev_high = Some(spec.high_sector);
            entries.push(MtEntry {
                high_sector: spec.high_sector,
                instance,
            });
        }

        let index = build_index(&entries);
        debug!(
            "mapping table built: {} entries, {} index levels, device_size {}",
            entries.len(),
            index.len(),
            entries.last().unwrap().high_sector.0 + 1
        );

        Ok(MappingTable { entries, index })
    }

    pub fn device_size(&self) -> Sector {
        Sector(self.entries.last().expect("non-empty by construction").high_sector.0 + 1)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The distinct underlying devices referenced by any entry, opened
    /// once at activation and closed once at suspension/removal.
    pub fn underlying_devices(&self) -> Vec<crate::types::Device> {
        let mut devices = Vec::new();
        for entry in &self.entries {
            for dev in entry.instance.underlying_devices() {
                if !devices.contains(&dev) {
                    devices.push(dev);
                }
            }
        }
        devices
    }

    /// Find the entry whose range contains `s` by descending the
    /// levelled index, then invoke its target's `map`.
    pub fn map(&self, request: &IoRequest) -> MapOutcome {
        let idx = self.lookup_index(request.sector);
        self.entries[idx].instance.map(request)
    }

    fn lookup_index(&self, s: Sector) -> usize {
        let k = KEYS_PER_NODE;
        let mut n = 0usize;
        let mut i = 0usize;
        for level in &self.index {
            n = (k + 1) * n + i;
            let node = &level[n];
            i = node
                .iter()
                .position(|&key| key >= s)
                .unwrap_or(k);
        }
        k * n + i
    }
}

impl Drop for MappingTable {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        destroy_in_reverse(entries);
    }
}

fn destroy_in_reverse(mut entries: Vec<MtEntry>) {
    while entries.pop().is_some() {
        // dropped here, in reverse construction order
    }
}

fn div_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Build the levelled index bottom-up: leaf nodes hold up to
/// `KEYS_PER_NODE` real keys (padded with the table's final high
/// sector), internal nodes hold the largest key of each child.
fn build_index(entries: &[MtEntry]) -> Vec<Vec<[Sector; KEYS_PER_NODE]>> {
    let k = KEYS_PER_NODE;
    let n = entries.len();
    let last_high = entries[n - 1].high_sector;

    // counts[0] = leaf node count, growing toward the root.
    let mut counts = vec![div_up(n, k)];
    while *counts.last().unwrap() > 1 {
        let prev = *counts.last().unwrap();
        counts.push(div_up(prev, k + 1));
    }
    counts.reverse(); // counts[0] = root (1 node), counts[last] = leaves

    let depth = counts.len();
    let mut index: Vec<Vec<[Sector; KEYS_PER_NODE]>> = counts
        .iter()
        .map(|&c| vec![[last_high; KEYS_PER_NODE]; c])
        .collect();

    let leaf_level = depth - 1;
    for node_n in 0..counts[leaf_level] {
        for key_k in 0..k {
            let entry_idx = k * node_n + key_k;
            if entry_idx < n {
                index[leaf_level][node_n][key_k] = entries[entry_idx].high_sector;
            }
        }
    }

    for level in (0..leaf_level).rev() {
        for node_n in 0..counts[level] {
            for key_k in 0..k {
                let child = (k + 1) * node_n + key_k;
                if child < counts[level + 1] {
                    index[level][node_n][key_k] = index[level + 1][child][k - 1];
                }
            }
        }
    }

    index
}
