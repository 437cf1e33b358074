// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The contract this core needs from the host block layer.
//!
//! Device registration, buffer-head plumbing, and the actual queueing
//! of I/O to hardware live outside this crate; only their interfaces
//! are contracted here. This trait is that interface: DM calls into it
//! to open/close underlying devices at activation/suspend and to
//! resubmit deferred I/O on resume.

use crate::error::Result;
use crate::request::{Completion, IoRequest, SubmitOutcome};
use crate::types::{Device, Sector};

pub trait BlockLayer: Send + Sync {
    /// Open an underlying device exactly once per MD activation.
    fn open(&self, device: Device) -> Result<()>;

    /// Close an underlying device exactly once per MD suspension or
    /// removal. Double-activation is a no-op at the MD layer, so this
    /// is never called twice without an intervening `open`.
    fn close(&self, device: Device);

    /// Hardware sector size of an underlying device, in bytes.
    fn hardware_sector_size(&self, device: Device) -> u64;

    /// Publish a newly-activated minor's geometry to the block layer.
    fn publish(&self, minor: u32, size_sectors: Sector, hardware_sector_size: u64);

    /// Resubmit a request exactly as a fresh submitter would, used to
    /// replay deferred I/O after a resume. Implementations should route
    /// this back through the same dispatch a real submitter uses.
    fn resubmit(&self, request: IoRequest, completion: Completion) -> SubmitOutcome;

    /// Sync and invalidate the host buffer cache for a minor.
    fn flush_buffers(&self, minor: u32) -> Result<()>;
}

/// A `BlockLayer` with no host behind it: opens/closes are no-ops,
/// hardware sector size is always the default, and resubmission is
/// left to the caller (used by unit tests exercising DM in isolation).
#[derive(Default)]
pub struct NullBlockLayer;

impl BlockLayer for NullBlockLayer {
    fn open(&self, _device: Device) -> Result<()> {
        Ok(())
    }

    fn close(&self, _device: Device) {}

    fn hardware_sector_size(&self, _device: Device) -> u64 {
        crate::config::SECTOR_SIZE
    }

    fn publish(&self, _minor: u32, _size_sectors: Sector, _hardware_sector_size: u64) {}

    fn resubmit(&self, _request: IoRequest, _completion: Completion) -> SubmitOutcome {
        SubmitOutcome::Completed
    }

    fn flush_buffers(&self, _minor: u32) -> Result<()> {
        Ok(())
    }
}
