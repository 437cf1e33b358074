// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error kinds shared by every component of the core.

use std::io;

/// The error kinds a caller of this crate can observe.
///
/// Request submission, device registry management, mapping-table
/// construction, and LV allocation all fail through this single enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such device")]
    NoDevice,
    #[error("minor number already in use")]
    InUse,
    #[error("device is busy")]
    Busy,
    #[error("name already registered")]
    Duplicate,
    #[error("out of memory")]
    NoMemory,
    #[error("mapping table could not be built: {0}")]
    BadTable(String),
    #[error("bad target parameters: {0}")]
    BadParam(String),
    #[error("insufficient free space for allocation")]
    InsufficientSpace,
    #[error("device is not active")]
    NotActive,
    #[error("operation not supported")]
    NotSupported,
    #[error("permission denied")]
    Permission,
    #[error("interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    IoError(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
