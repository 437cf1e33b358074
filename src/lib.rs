// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The core of an LVM-style volume manager: a block-device mapper (DM)
//! and a logical-volume allocator (LVA) layered on top of it.
//!
//! [`Core`] wires the two process-wide singletons (the Target Registry
//! and the Device Registry) together, Target Registry first, since the
//! Device Registry's built-in targets must already be registered before
//! any device is loaded against it.

pub mod allocator;
pub mod block_layer;
pub mod config;
pub mod device_registry;
pub mod error;
pub mod flock;
pub mod lv;
pub mod mapped_device;
pub mod mapping_table;
pub mod pv;
pub mod request;
pub mod target;
pub mod types;
pub mod vg;

pub use error::{Error, Result};

use std::sync::Arc;

use block_layer::BlockLayer;
use device_registry::DeviceRegistry;
use target::TargetRegistry;

/// The device-mapper major this process registers with the block
/// layer. An arbitrary but fixed choice in the "253-254" experimental
/// range real device-mapper uses.
pub const DM_MAJOR: u32 = 254;

/// The two process-wide singletons (Target Registry, Device Registry),
/// held for the life of the process.
pub struct Core {
    pub targets: Arc<TargetRegistry>,
    pub devices: Arc<DeviceRegistry>,
}

impl Core {
    /// Bring up the core against a host `BlockLayer` implementation.
    /// Registers the built-in target kinds before constructing the
    /// device registry.
    pub fn init(block_layer: Arc<dyn BlockLayer>) -> Core {
        let targets = Arc::new(TargetRegistry::new());
        let devices = Arc::new(DeviceRegistry::new(DM_MAJOR, targets.clone(), block_layer));
        Core { targets, devices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_layer::NullBlockLayer;

    #[test]
    fn init_registers_builtin_linear_target() {
        let core = Core::init(Arc::new(NullBlockLayer));
        assert!(core.targets.lookup("linear").is_ok());
    }
}
