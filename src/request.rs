// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The shape of an I/O request as it travels through DM.

use crate::error::Error;
use crate::types::{Device, Sector};

/// Which way the I/O goes. The core never inspects this beyond passing
/// it along to the target and, on deferral, remembering it for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A request against a mapped device's logical address space.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    pub minor: u32,
    pub sector: Sector,
    pub len: Sector,
    pub direction: Direction,
}

/// Where a `Remapped` outcome says the request should now go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remap {
    pub device: Device,
    pub sector: Sector,
}

/// What a target's `map` call decided to do with a request: a positive
/// remap, a synchronous zero-cost completion, or a failure.
#[derive(Debug)]
pub enum MapOutcome {
    Remapped(Remap),
    Complete,
    Failed(Error),
}

/// What `DeviceRegistry::submit` tells the caller about a request it
/// was handed.
///
/// `Remapped` carries the rewritten `(device, sector)` and a
/// replacement completion: the caller must carry out that I/O itself
/// and invoke `completion` exactly once when it finishes. `Completed`
/// means the target already ran the original completion synchronously
/// (or failed it, see `Failed`); there is nothing further to do.
pub enum SubmitOutcome {
    Remapped {
        device: Device,
        sector: Sector,
        completion: Completion,
    },
    Completed,
    Deferred,
    Failed(Error),
}

impl std::fmt::Debug for SubmitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitOutcome::Remapped { device, sector, .. } => f
                .debug_struct("Remapped")
                .field("device", device)
                .field("sector", sector)
                .finish_non_exhaustive(),
            SubmitOutcome::Completed => write!(f, "Completed"),
            SubmitOutcome::Deferred => write!(f, "Deferred"),
            SubmitOutcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// A callback invoked exactly once when a remapped request's I/O
/// finishes, with the hook's shim interposed. Boxed so it can outlive
/// the call that created it and cross into whatever completes the
/// underlying I/O.
pub type Completion = Box<dyn FnOnce(Result<(), Error>) + Send + Sync>;
