// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus transport: envelopes, sessions and the shared connection.
//!
//! All daemons exchange [`Envelope`]s on one shared topic. Replies to a
//! request travel on a private per-request topic created through
//! [`Connection::reply_destination`].
//!
//! # Transports
//!
//! - [`MqttBrokerConfig`]: an external MQTT broker (feature `mqtt`)
//! - [`MemoryBroker`]: an embedded broker for daemons sharing a process

mod connection;
mod envelope;
mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;
mod reply;
mod session;

pub use connection::Connection;
pub use envelope::{Address, Envelope, MIN_ENCODED_LEN};
pub use memory::MemoryBroker;
#[cfg(feature = "mqtt")]
pub use mqtt::{DEFAULT_PORT, MqttBrokerConfig};
pub use reply::ReplyDestination;
pub use session::Inbox;

use serde::Deserialize;

/// Capacity of each subscription inbox. Messages beyond it are dropped.
pub(crate) const INBOX_CAPACITY: usize = 256;

/// Which broker a connection talks to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportConfig {
    /// An external MQTT broker.
    #[cfg(feature = "mqtt")]
    Mqtt(MqttBrokerConfig),

    /// An embedded broker shared inside this process.
    #[serde(skip_deserializing)]
    Memory(MemoryBroker),
}

impl Default for TransportConfig {
    #[cfg(feature = "mqtt")]
    fn default() -> Self {
        Self::Mqtt(MqttBrokerConfig::default())
    }

    #[cfg(not(feature = "mqtt"))]
    fn default() -> Self {
        Self::Memory(MemoryBroker::new())
    }
}

impl From<MemoryBroker> for TransportConfig {
    fn from(broker: MemoryBroker) -> Self {
        Self::Memory(broker)
    }
}

#[cfg(feature = "mqtt")]
impl From<MqttBrokerConfig> for TransportConfig {
    fn from(config: MqttBrokerConfig) -> Self {
        Self::Mqtt(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "mqtt")]
    #[test]
    fn deserialize_mqtt_transport() {
        let transport: TransportConfig =
            serde_json::from_str(r#"{"mqtt": {"host": "hub", "port": 1884}}"#).unwrap();
        let TransportConfig::Mqtt(config) = transport else {
            panic!("expected MQTT transport");
        };
        assert_eq!(config.host(), "hub");
        assert_eq!(config.port(), 1884);
    }

    #[test]
    fn memory_transport_is_not_deserializable() {
        assert!(serde_json::from_str::<TransportConfig>(r#"{"memory": null}"#).is_err());
    }
}
