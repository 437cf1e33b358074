// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Target Registry: a process-wide directory of target kinds.
//!
//! Kinds are registered once, at start, and looked up on every request
//! that passes through a mapping table. Readers never block each other
//! or a concurrent registration; registrations are rare and serialized.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::str;
use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::request::{IoRequest, MapOutcome, Remap};
use crate::types::{Device, Sector};

/// Per-target-range state produced by `TargetKind::construct`. Owned
/// exclusively by the mapping-table entry that holds it; dropped when
/// that entry's table is replaced or torn down, via `Drop` rather than
/// an explicit destructor method.
pub trait TargetInstance: Send + Sync {
    /// Map a single request. Must not sleep.
    fn map(&self, request: &IoRequest) -> MapOutcome;

    /// The underlying devices this instance depends on, opened at MD
    /// activation and closed at suspension/removal.
    fn underlying_devices(&self) -> Vec<Device>;
}

/// A named, constructible target type. Implementations are registered
/// once with a `TargetRegistry` and live for the life of the process.
pub trait TargetKind: Send + Sync {
    fn name(&self) -> &str;

    /// Build a `TargetInstance` covering `logical_range` of an MD's
    /// address space from `params`. May sleep.
    fn construct(
        &self,
        params: &[u8],
        logical_range: RangeInclusive<Sector>,
    ) -> Result<Box<dyn TargetInstance>>;
}

/// Process-wide directory of target kinds.
pub struct TargetRegistry {
    kinds: RwLock<HashMap<String, Arc<dyn TargetKind>>>,
}

impl TargetRegistry {
    /// Create a registry with the built-in target set installed.
    pub fn new() -> TargetRegistry {
        let reg = TargetRegistry {
            kinds: RwLock::new(HashMap::new()),
        };
        reg.register(Arc::new(LinearTargetKind))
            .expect("built-in linear target registers cleanly");
        reg
    }

    pub fn register(&self, kind: Arc<dyn TargetKind>) -> Result<()> {
        let mut kinds = self.kinds.write().expect("target registry lock poisoned");
        if kinds.contains_key(kind.name()) {
            warn!("target kind {:?} already registered", kind.name());
            return Err(Error::Duplicate);
        }
        debug!("registered target kind {:?}", kind.name());
        kinds.insert(kind.name().to_string(), kind);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut kinds = self.kinds.write().expect("target registry lock poisoned");
        if kinds.remove(name).is_none() {
            return Err(Error::NoDevice);
        }
        debug!("unregistered target kind {:?}", name);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn TargetKind>> {
        let kinds = self.kinds.read().expect("target registry lock poisoned");
        kinds.get(name).cloned().ok_or(Error::NoDevice)
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        TargetRegistry::new()
    }
}

/// The built-in `linear` target: `sector -> underlying, start + (sector
/// - range_start)`.
pub struct LinearTargetKind;

struct LinearTargetInstance {
    underlying: Device,
    start_sector: Sector,
    range_start: Sector,
}

impl TargetKind for LinearTargetKind {
    fn name(&self) -> &str {
        "linear"
    }

    fn construct(
        &self,
        params: &[u8],
        logical_range: RangeInclusive<Sector>,
    ) -> Result<Box<dyn TargetInstance>> {
        let text = str::from_utf8(params)
            .map_err(|_| Error::BadParam("linear params are not utf8".to_string()))?;
        let mut parts = text.split_whitespace();
        let devid = parts
            .next()
            .ok_or_else(|| Error::BadParam("linear: missing device".to_string()))?;
        let start = parts
            .next()
            .ok_or_else(|| Error::BadParam("linear: missing start sector".to_string()))?;

        let (major, minor) = devid
            .split_once(':')
            .ok_or_else(|| Error::BadParam("linear: device must be major:minor".to_string()))?;
        let major: u32 = major
            .parse()
            .map_err(|_| Error::BadParam("linear: bad major".to_string()))?;
        let minor: u32 = minor
            .parse()
            .map_err(|_| Error::BadParam("linear: bad minor".to_string()))?;
        let start: u64 = start
            .parse()
            .map_err(|_| Error::BadParam("linear: bad start sector".to_string()))?;

        Ok(Box::new(LinearTargetInstance {
            underlying: Device { major, minor },
            start_sector: Sector(start),
            range_start: *logical_range.start(),
        }))
    }
}

impl TargetInstance for LinearTargetInstance {
    fn map(&self, request: &IoRequest) -> MapOutcome {
        let offset = request.sector.0 - self.range_start.0;
        MapOutcome::Remapped(Remap {
            device: self.underlying,
            sector: Sector(self.start_sector.0 + offset),
        })
    }

    fn underlying_devices(&self) -> Vec<Device> {
        vec![self.underlying]
    }
}
