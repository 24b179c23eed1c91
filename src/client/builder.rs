// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client builder.

use std::path::PathBuf;
use std::time::Duration;

use super::AgoClient;
use crate::config::{ClientConfig, ReconnectionPolicy, RetryPolicy};
use crate::error::Result;
#[cfg(feature = "mqtt")]
use crate::protocol::MqttBrokerConfig;
use crate::protocol::{Connection, MemoryBroker, TransportConfig};
use crate::registry::{DeviceRegistry, UuidMap};

impl AgoClient {
    /// Creates a builder for the daemon `app_name`.
    #[must_use]
    pub fn builder(app_name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(app_name)
    }

    /// Loads the uuid map and opens the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for an invalid
    /// configuration and [`Error::Connection`](crate::Error::Connection) if
    /// the broker cannot be reached. Daemons exit on either.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let uuids = match config.uuid_map_path() {
            Some(path) => UuidMap::load(path),
            None => UuidMap::in_memory(),
        };
        let registry = DeviceRegistry::new(uuids);

        let connection = Connection::open(config.transport.clone(), config.topic.clone()).await?;
        tracing::info!(
            app = %config.app_name,
            topic = %config.topic,
            filter_commands = config.filter_commands,
            "Bus client connected"
        );

        Ok(Self::from_parts(config, connection, registry))
    }
}

/// Builder for creating an [`AgoClient`].
///
/// # Examples
///
/// ```no_run
/// use agobus_lib::AgoClient;
/// use std::time::Duration;
///
/// # async fn example() -> agobus_lib::Result<()> {
/// let client = AgoClient::builder("zwave")
///     .mqtt("192.168.1.50", 1883)
///     .credentials("ago", "secret")
///     .inventory_timeout(Duration::from_secs(5))
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: ClientConfig,
    #[cfg(feature = "mqtt")]
    credentials: Option<(String, String)>,
}

impl ClientBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(app_name))
    }

    /// Starts from an existing configuration.
    #[must_use]
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "mqtt")]
            credentials: None,
        }
    }

    /// Sets the transport.
    ///
    /// Credentials given to [`credentials`](Self::credentials) are applied
    /// to an MQTT transport regardless of call order.
    #[must_use]
    pub fn transport(mut self, transport: impl Into<TransportConfig>) -> Self {
        self.config.transport = transport.into();
        #[cfg(feature = "mqtt")]
        self.apply_credentials();
        self
    }

    /// Connects through an MQTT broker.
    #[cfg(feature = "mqtt")]
    #[must_use]
    pub fn mqtt(self, host: impl Into<String>, port: u16) -> Self {
        self.transport(MqttBrokerConfig::new(host).with_port(port))
    }

    /// Sets MQTT credentials.
    ///
    /// Kept for any MQTT transport set before or after this call; ignored by
    /// the embedded broker.
    #[cfg(feature = "mqtt")]
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self.apply_credentials();
        self
    }

    #[cfg(feature = "mqtt")]
    fn apply_credentials(&mut self) {
        if let Some((username, password)) = &self.credentials
            && let TransportConfig::Mqtt(mqtt) = &mut self.config.transport
        {
            *mqtt = std::mem::take(mqtt).with_credentials(username.clone(), password.clone());
        }
    }

    /// Connects through an embedded broker.
    #[must_use]
    pub fn memory(self, broker: &MemoryBroker) -> Self {
        self.transport(broker.clone())
    }

    /// Sets the shared bus topic (default: `agocontrol`).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    /// Sets the directory holding the uuid map.
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self.config.persist_uuids = true;
        self
    }

    /// Keeps the uuid map in memory only.
    #[must_use]
    pub fn without_persistence(mut self) -> Self {
        self.config.persist_uuids = false;
        self
    }

    /// Enables or disables own-device filtering (default: enabled).
    #[must_use]
    pub fn filter_commands(mut self, enabled: bool) -> Self {
        self.config.filter_commands = enabled;
        self
    }

    /// Sets the dispatch loop's receive timeout (default: 1 second).
    #[must_use]
    pub fn receive_poll(mut self, timeout: Duration) -> Self {
        self.config.receive_poll = timeout;
        self
    }

    /// Sets the inventory reply timeout (default: 3 seconds).
    #[must_use]
    pub fn inventory_timeout(mut self, timeout: Duration) -> Self {
        self.config.inventory_timeout = timeout;
        self
    }

    /// Sets the session recreation policy.
    #[must_use]
    pub fn reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.config.reconnection = policy;
        self
    }

    /// Sets the controller lookup retries (default: 10 x 1 second).
    #[must_use]
    pub fn controller_lookup(mut self, policy: RetryPolicy) -> Self {
        self.config.controller_lookup = policy;
        self
    }

    /// Returns the configuration built so far.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds the client and connects.
    ///
    /// # Errors
    ///
    /// See [`AgoClient::connect`].
    pub async fn connect(self) -> Result<AgoClient> {
        AgoClient::connect(self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ConnectionError, Error};

    #[test]
    fn builder_chain() {
        let builder = AgoClient::builder("knx")
            .topic("bus")
            .state_dir("/tmp/ago")
            .filter_commands(false)
            .receive_poll(Duration::from_millis(250))
            .controller_lookup(RetryPolicy::new(3, Duration::from_millis(10)));

        let config = builder.config();
        assert_eq!(config.app_name, "knx");
        assert_eq!(config.topic, "bus");
        assert!(!config.filter_commands);
        assert_eq!(config.receive_poll, Duration::from_millis(250));
        assert_eq!(config.controller_lookup.attempts, 3);
        assert_eq!(
            config.uuid_map_path(),
            Some(PathBuf::from("/tmp/ago/uuidmap/knx.json"))
        );
    }

    #[cfg(feature = "mqtt")]
    #[test]
    fn credentials_apply_to_mqtt() {
        let builder = AgoClient::builder("knx")
            .mqtt("hub", 1884)
            .credentials("user", "pass");
        let TransportConfig::Mqtt(mqtt) = &builder.config().transport else {
            panic!("expected MQTT transport");
        };
        assert_eq!(mqtt.host(), "hub");
        assert_eq!(mqtt.port(), 1884);
        assert!(mqtt.has_credentials());
    }

    #[cfg(feature = "mqtt")]
    #[test]
    fn credentials_survive_later_transport() {
        let builder = AgoClient::builder("knx")
            .credentials("user", "pass")
            .mqtt("hub", 1884);
        let TransportConfig::Mqtt(mqtt) = &builder.config().transport else {
            panic!("expected MQTT transport");
        };
        assert_eq!(mqtt.host(), "hub");
        assert!(mqtt.has_credentials());
    }

    #[tokio::test]
    async fn connect_rejects_empty_app_name() {
        let broker = MemoryBroker::new();
        let result = AgoClient::builder("").memory(&broker).connect().await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::Missing("app_name")))
        ));
    }

    #[tokio::test]
    async fn connect_fails_when_broker_refuses() {
        let broker = MemoryBroker::new();
        broker.set_accepting(false);
        let result = AgoClient::builder("test")
            .memory(&broker)
            .without_persistence()
            .connect()
            .await;
        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Refused(_)))
        ));
    }

    #[tokio::test]
    async fn uuids_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();

        let first = AgoClient::builder("zwave")
            .memory(&broker)
            .state_dir(dir.path())
            .connect()
            .await
            .unwrap();
        let uuid = first.register_device("node-2", "switch").await.unwrap();
        first.shutdown().await;

        let second = AgoClient::builder("zwave")
            .memory(&broker)
            .state_dir(dir.path())
            .connect()
            .await
            .unwrap();
        assert_eq!(second.resolve_uuid("node-2").as_deref(), Some(uuid.as_str()));
        assert_eq!(second.register_device("node-2", "switch").await.unwrap(), uuid);
    }
}
