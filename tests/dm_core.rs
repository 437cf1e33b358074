// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex};

use melvin_core::block_layer::BlockLayer;
use melvin_core::device_registry::DeviceRegistry;
use melvin_core::error::{Error, Result};
use melvin_core::mapping_table::MtSpec;
use melvin_core::request::{Completion, Direction, IoRequest, SubmitOutcome};
use melvin_core::target::TargetRegistry;
use melvin_core::types::{Device, Sector};

/// Records the sector of every request handed to `resubmit`, in the
/// order it arrived, so replay order can be asserted against.
#[derive(Default)]
struct RecordingBlockLayer {
    resubmitted: Mutex<Vec<u64>>,
}

impl BlockLayer for RecordingBlockLayer {
    fn open(&self, _device: Device) -> Result<()> {
        Ok(())
    }
    fn close(&self, _device: Device) {}
    fn hardware_sector_size(&self, _device: Device) -> u64 {
        512
    }
    fn publish(&self, _minor: u32, _size_sectors: Sector, _hardware_sector_size: u64) {}
    fn resubmit(&self, request: IoRequest, completion: Completion) -> SubmitOutcome {
        self.resubmitted.lock().unwrap().push(request.sector.0);
        completion(Ok(()));
        SubmitOutcome::Completed
    }
    fn flush_buffers(&self, _minor: u32) -> Result<()> {
        Ok(())
    }
}

fn linear_spec(high: u64, minor: u32) -> MtSpec<'static> {
    MtSpec {
        high_sector: Sector(high),
        target_kind: "linear",
        params: Box::leak(format!("8:{minor} 0").into_boxed_str()).as_bytes(),
    }
}

/// Scenario 6: requests submitted while LOADED are deferred, then
/// replayed via the block layer in the exact order they were enqueued
/// once the device activates.
#[test]
fn deferred_requests_replay_in_fifo_order_on_activate() {
    let block_layer = Arc::new(RecordingBlockLayer::default());
    let dr = DeviceRegistry::new(254, Arc::new(TargetRegistry::new()), block_layer.clone());

    let minor = dr.create("lv0", None).unwrap();
    dr.load(minor, &[linear_spec(999, 1)]).unwrap();

    for sector in [5u64, 50, 500] {
        let request = IoRequest { minor, sector: Sector(sector), len: Sector(1), direction: Direction::Read };
        assert!(matches!(dr.submit(request, Box::new(|_| {})), SubmitOutcome::Deferred));
    }

    dr.activate(minor).unwrap();

    assert_eq!(*block_layer.resubmitted.lock().unwrap(), vec![5, 50, 500]);
}

/// The full LOADED -> ACTIVE -> SUSPENDED -> ACTIVE -> EMPTY life cycle,
/// including a deferred-then-resumed request.
#[test]
fn full_lifecycle_transitions_succeed_in_order() {
    let block_layer = Arc::new(RecordingBlockLayer::default());
    let dr = DeviceRegistry::new(254, Arc::new(TargetRegistry::new()), block_layer);

    let minor = dr.create("lv1", None).unwrap();
    assert!(dr.find_by_name("lv1").is_ok());

    dr.load(minor, &[linear_spec(99, 1)]).unwrap();
    dr.activate(minor).unwrap();
    dr.activate(minor).unwrap(); // no-op when already active

    dr.suspend(minor).unwrap();

    let request = IoRequest { minor, sector: Sector(1), len: Sector(1), direction: Direction::Read };
    assert!(matches!(dr.submit(request, Box::new(|_| {})), SubmitOutcome::Deferred));

    dr.resume(minor).unwrap();
    dr.suspend(minor).unwrap();
    dr.unload(minor).unwrap();
    dr.remove("lv1").unwrap();

    assert!(matches!(dr.find_by_name("lv1").unwrap_err(), Error::NoDevice));
}
