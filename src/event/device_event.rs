// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lifecycle event types.

use crate::protocol::Envelope;
use crate::value::{Value, ValueMap, ValueMapExt};

/// Subject of the device announce event.
pub const ANNOUNCE: &str = "event.device.announce";

/// Subject of the device removal event.
pub const REMOVE: &str = "event.device.remove";

/// Subject of the device staleness event.
pub const STALE: &str = "event.device.stale";

/// Command name of a discovery request.
pub const DISCOVER_COMMAND: &str = "discover";

/// A device lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A daemon owns the device and it is reachable.
    Announce {
        /// Device type tag.
        device_type: String,
        /// Driver-local identifier.
        internal_id: String,
        /// Network-visible identifier.
        uuid: String,
        /// Name of the owning daemon.
        handled_by: String,
    },

    /// The device no longer exists.
    Remove {
        /// Network-visible identifier.
        uuid: String,
    },

    /// The device became unreachable, or reachable again.
    Stale {
        /// Driver-local identifier.
        internal_id: String,
        /// Network-visible identifier.
        uuid: String,
        /// Whether the device is now stale.
        stale: bool,
    },
}

impl DeviceEvent {
    /// Returns the bus subject of this event.
    #[must_use]
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Announce { .. } => ANNOUNCE,
            Self::Remove { .. } => REMOVE,
            Self::Stale { .. } => STALE,
        }
    }

    /// Returns the uuid of the device the event is about.
    #[must_use]
    pub fn uuid(&self) -> &str {
        match self {
            Self::Announce { uuid, .. } | Self::Remove { uuid } | Self::Stale { uuid, .. } => uuid,
        }
    }

    /// Builds the event content.
    #[must_use]
    pub fn into_content(self) -> ValueMap {
        let mut content = ValueMap::new();
        match self {
            Self::Announce {
                device_type,
                internal_id,
                uuid,
                handled_by,
            } => {
                content.insert("devicetype".into(), device_type.into());
                content.insert("internalid".into(), internal_id.into());
                content.insert("uuid".into(), uuid.into());
                content.insert("handled-by".into(), handled_by.into());
            }
            Self::Remove { uuid } => {
                content.insert("uuid".into(), uuid.into());
            }
            Self::Stale {
                internal_id,
                uuid,
                stale,
            } => {
                content.insert("internalid".into(), internal_id.into());
                content.insert("uuid".into(), uuid.into());
                content.insert("stale".into(), Value::Int32(i32::from(stale)));
            }
        }
        content
    }

    /// Builds the envelope to publish.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        let subject = self.subject();
        Envelope::new(subject, self.into_content())
    }

    /// Parses a lifecycle event received from the bus.
    ///
    /// Returns `None` for other subjects or when a field is missing.
    #[must_use]
    pub fn from_message(subject: &str, content: &ValueMap) -> Option<Self> {
        let text = |key: &str| content.get_str(key).map(str::to_string);

        match subject {
            ANNOUNCE => Some(Self::Announce {
                device_type: text("devicetype")?,
                internal_id: text("internalid")?,
                uuid: text("uuid")?,
                handled_by: text("handled-by").unwrap_or_default(),
            }),
            REMOVE => Some(Self::Remove { uuid: text("uuid")? }),
            STALE => Some(Self::Stale {
                internal_id: text("internalid").unwrap_or_default(),
                uuid: text("uuid")?,
                stale: content.get("stale")?.as_i64().ok()? != 0,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_content() {
        let event = DeviceEvent::Announce {
            device_type: "switch".to_string(),
            internal_id: "node-4".to_string(),
            uuid: "u-4".to_string(),
            handled_by: "zwave".to_string(),
        };
        let envelope = event.into_envelope();

        assert_eq!(envelope.subject(), ANNOUNCE);
        let content = envelope.content();
        assert_eq!(content.len(), 4);
        assert_eq!(content.get_str("devicetype"), Some("switch"));
        assert_eq!(content.get_str("internalid"), Some("node-4"));
        assert_eq!(content.get_str("uuid"), Some("u-4"));
        assert_eq!(content.get_str("handled-by"), Some("zwave"));
    }

    #[test]
    fn stale_flag_is_numeric() {
        let content = DeviceEvent::Stale {
            internal_id: "a".to_string(),
            uuid: "u".to_string(),
            stale: true,
        }
        .into_content();
        assert_eq!(content["stale"], Value::Int32(1));
    }

    #[test]
    fn parse_back() {
        let event = DeviceEvent::Stale {
            internal_id: "a".to_string(),
            uuid: "u".to_string(),
            stale: false,
        };
        let content = event.clone().into_content();
        assert_eq!(DeviceEvent::from_message(STALE, &content), Some(event));
    }

    #[test]
    fn other_subjects_are_ignored() {
        let mut content = ValueMap::new();
        content.insert("uuid".into(), "u".into());
        assert!(DeviceEvent::from_message("event.environment.temperaturechanged", &content).is_none());
        assert!(DeviceEvent::from_message(REMOVE, &ValueMap::new()).is_none());
    }
}
