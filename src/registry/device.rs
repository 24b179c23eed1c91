// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices owned by this daemon.

/// A device owned by the current daemon.
///
/// The device table is rebuilt by the daemon at every start; only the uuid
/// assignment survives restarts (see [`UuidMap`](super::UuidMap)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    internal_id: String,
    uuid: String,
    device_type: String,
    stale: bool,
}

impl Device {
    pub(crate) fn new(internal_id: String, uuid: String, device_type: String) -> Self {
        Self {
            internal_id,
            uuid,
            device_type,
            stale: false,
        }
    }

    /// Returns the driver-local identifier.
    #[must_use]
    pub fn internal_id(&self) -> &str {
        &self.internal_id
    }

    /// Returns the network-visible uuid.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns the device type tag (e.g. `switch`, `temperaturesensor`).
    #[must_use]
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Returns true while the device is known but unreachable.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn set_device_type(&mut self, device_type: String) {
        self.device_type = device_type;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }
}
