// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identity and the live device table.
//!
//! Every device a daemon controls has two identifiers:
//!
//! - an **internal id**, meaningful only to the daemon's driver (a bus
//!   address, a node number, ...);
//! - a **uuid**, generated once and used by the rest of the platform.
//!
//! The [`DeviceRegistry`] keeps the persistent [`UuidMap`] between the two
//! and the in-memory table of devices currently managed by the daemon. The
//! registry only tracks state; announcing changes on the bus is done by
//! [`AgoClient`](crate::AgoClient), which wraps these operations.
//!
//! # Examples
//!
//! ```
//! use agobus_lib::registry::{DeviceRegistry, UuidAssignment};
//!
//! let registry = DeviceRegistry::in_memory();
//! let device = registry
//!     .register("sensor-1", "temperaturesensor", UuidAssignment::Generate)
//!     .unwrap();
//!
//! assert_eq!(registry.resolve_internal_id(device.uuid()).as_deref(), Some("sensor-1"));
//! assert_eq!(registry.resolve_uuid("sensor-1").as_deref(), Some(device.uuid()));
//! ```

mod device;
mod uuid_map;

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::RegistryError;

pub use device::Device;
pub use uuid_map::UuidMap;

/// How the uuid of a newly registered internal id is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UuidAssignment {
    /// Generate a random v4 uuid.
    #[default]
    Generate,
    /// Use the given uuid, e.g. one chosen by a rule or event definition.
    Provided(String),
}

/// Uuid map plus the table of live devices, guarded together so lookups
/// in both directions are always consistent.
#[derive(Debug)]
struct RegistryState {
    uuids: UuidMap,
    devices: HashMap<String, Device>,
}

/// Registry of the devices owned by this daemon.
#[derive(Debug)]
pub struct DeviceRegistry {
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    /// Creates a registry over a loaded uuid map.
    #[must_use]
    pub fn new(uuids: UuidMap) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                uuids,
                devices: HashMap::new(),
            }),
        }
    }

    /// Creates a registry that never touches the filesystem.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(UuidMap::in_memory())
    }

    /// Registers or refreshes a device.
    ///
    /// If `internal_id` already has a uuid (from this run or from the
    /// persisted map) it is reused and `assignment` is ignored. Otherwise a
    /// uuid is assigned and the map is written to disk immediately. A write
    /// failure is logged and retried on the next change; the in-memory
    /// registration still succeeds.
    ///
    /// The device entry is inserted or updated with `stale = false`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UuidConflict`] if a provided uuid already
    /// belongs to another internal id.
    pub fn register(
        &self,
        internal_id: &str,
        device_type: &str,
        assignment: UuidAssignment,
    ) -> Result<Device, RegistryError> {
        let mut state = self.state.write();

        let uuid = if let Some(existing) = state.uuids.uuid_of(internal_id) {
            if let UuidAssignment::Provided(requested) = &assignment
                && requested != existing
            {
                tracing::warn!(
                    internal_id,
                    existing,
                    requested = %requested,
                    "Keeping previously assigned uuid"
                );
            }
            existing.to_string()
        } else {
            let uuid = match assignment {
                UuidAssignment::Generate => Uuid::new_v4().to_string(),
                UuidAssignment::Provided(uuid) => {
                    if let Some(owner) = state.uuids.internal_id_of(&uuid) {
                        return Err(RegistryError::UuidConflict {
                            uuid,
                            internal_id: owner.to_string(),
                        });
                    }
                    uuid
                }
            };
            state.uuids.insert_entry(uuid.clone(), internal_id.to_string());
            tracing::debug!(internal_id, uuid = %uuid, "Assigned uuid");
            uuid
        };

        if state.uuids.is_dirty()
            && let Err(e) = state.uuids.persist()
        {
            tracing::error!(error = %e, "Failed to store uuid map, keeping in-memory state");
        }

        let device = state
            .devices
            .entry(internal_id.to_string())
            .and_modify(|d| {
                d.set_device_type(device_type.to_string());
                d.set_stale(false);
            })
            .or_insert_with(|| {
                Device::new(internal_id.to_string(), uuid, device_type.to_string())
            });

        Ok(device.clone())
    }

    /// Removes a device from the live table.
    ///
    /// The uuid binding is kept, so the device gets the same uuid if it is
    /// registered again. Returns the removed device, or `None` if unknown.
    pub fn unregister(&self, internal_id: &str) -> Option<Device> {
        self.state.write().devices.remove(internal_id)
    }

    /// Sets the stale flag of a device.
    ///
    /// Returns the updated device, or `None` if unknown.
    pub fn set_stale(&self, internal_id: &str, stale: bool) -> Option<Device> {
        let mut state = self.state.write();
        let device = state.devices.get_mut(internal_id)?;
        device.set_stale(stale);
        Some(device.clone())
    }

    /// Returns the uuid bound to `internal_id`.
    #[must_use]
    pub fn resolve_uuid(&self, internal_id: &str) -> Option<String> {
        self.state
            .read()
            .uuids
            .uuid_of(internal_id)
            .map(str::to_string)
    }

    /// Returns the internal id bound to `uuid`.
    #[must_use]
    pub fn resolve_internal_id(&self, uuid: &str) -> Option<String> {
        self.state
            .read()
            .uuids
            .internal_id_of(uuid)
            .map(str::to_string)
    }

    /// Returns true if `internal_id` is in the live device table.
    #[must_use]
    pub fn contains(&self, internal_id: &str) -> bool {
        self.state.read().devices.contains_key(internal_id)
    }

    /// Returns a copy of a device.
    #[must_use]
    pub fn device(&self, internal_id: &str) -> Option<Device> {
        self.state.read().devices.get(internal_id).cloned()
    }

    /// Returns a snapshot of all live devices.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.state.read().devices.values().cloned().collect()
    }

    /// Returns a snapshot of the devices to announce on discovery.
    #[must_use]
    pub fn announceable(&self) -> Vec<Device> {
        self.state
            .read()
            .devices
            .values()
            .filter(|d| !d.is_stale())
            .cloned()
            .collect()
    }

    /// Returns the number of live devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    /// Returns true if no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }

    /// Writes the uuid map if it has unsaved changes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Persistence`] if the write fails.
    pub fn flush(&self) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if state.uuids.is_dirty() {
            state.uuids.persist()?;
        }
        Ok(())
    }
}
