// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker transport.
//!
//! A session owns one `rumqttc` client and a background task polling its
//! event loop. Inbound publishes are routed by exact topic name to the
//! inbox registered for that topic. When the event loop fails the session
//! is marked dead and every inbox is closed, which the dispatch loop
//! observes as [`FetchError::SessionClosed`](crate::error::FetchError).
//!
//! # Examples
//!
//! ```
//! use agobus_lib::protocol::MqttBrokerConfig;
//! use std::time::Duration;
//!
//! let config = MqttBrokerConfig::new("192.168.1.50")
//!     .with_port(1884)
//!     .with_credentials("ago", "secret")
//!     .with_keep_alive(Duration::from_secs(60));
//! assert_eq!(config.port(), 1884);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{AsyncClient, ConnectReturnCode, EventLoop, MqttOptions, QoS};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use super::INBOX_CAPACITY;
use crate::config::serde_millis;
use crate::error::{ConnectionError, ProtocolError};

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Configuration for an MQTT broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttBrokerConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(rename = "keep_alive_ms", with = "serde_millis")]
    keep_alive: Duration,
    #[serde(rename = "connection_timeout_ms", with = "serde_millis")]
    connection_timeout: Duration,
}

impl Default for MqttBrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl MqttBrokerConfig {
    /// Creates a configuration for `host` with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Parses a broker address such as `mqtt://host:1883`, `tcp://host` or
    /// `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidAddress`] if the host is empty or
    /// the port is not a number.
    pub fn from_url(url: &str) -> Result<Self, ConnectionError> {
        let url = url
            .strip_prefix("mqtt://")
            .or_else(|| url.strip_prefix("tcp://"))
            .unwrap_or(url);

        let (host, port) = match url.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConnectionError::InvalidAddress(format!("invalid port: {port}")))?;
                (host, port)
            }
            None => (url, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(ConnectionError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        Ok(Self::new(host).with_port(port))
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn with_keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    #[must_use]
    pub fn with_connection_timeout(mut self, duration: Duration) -> Self {
        self.connection_timeout = duration;
        self
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns whether authentication is configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// Returns the keep-alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }
}

struct MqttSessionInner {
    client: AsyncClient,
    /// Inbox senders by exact topic.
    routes: RwLock<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
    alive: AtomicBool,
}

impl MqttSessionInner {
    fn route(&self, topic: &str, payload: Vec<u8>) {
        let routes = self.routes.read();
        let Some(senders) = routes.get(topic) else {
            tracing::trace!(topic, "No inbox for topic");
            return;
        };
        for tx in senders {
            match tx.try_send(payload.clone()) {
                Ok(()) => tracing::debug!(topic, "Routed MQTT message"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(topic, "Inbox full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Adds an inbox on `topic`. Returns true if it is the first one.
    fn add_route(&self, topic: &str, tx: mpsc::Sender<Vec<u8>>) -> bool {
        let mut routes = self.routes.write();
        let senders = routes.entry(topic.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        senders.len() == 1
    }

    fn remove_route(&self, topic: &str, tx: &mpsc::Sender<Vec<u8>>) {
        let mut routes = self.routes.write();
        if let Some(senders) = routes.get_mut(topic) {
            senders.retain(|s| !s.same_channel(tx));
            if senders.is_empty() {
                routes.remove(topic);
            }
        }
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        // Dropping the senders wakes every blocked inbox.
        self.routes.write().clear();
    }
}

/// A live MQTT client session.
#[derive(Clone)]
pub(crate) struct MqttSession {
    inner: Arc<MqttSessionInner>,
}

impl MqttSession {
    /// Connects to the broker and waits for its acknowledgement.
    pub(crate) async fn connect(config: &MqttBrokerConfig) -> Result<Self, ConnectionError> {
        if config.host.is_empty() {
            return Err(ConnectionError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        let client_id = format!(
            "agobus_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let session = Self {
            inner: Arc::new(MqttSessionInner {
                client,
                routes: RwLock::new(HashMap::new()),
                alive: AtomicBool::new(false),
            }),
        };

        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(handle_session_events(
            event_loop,
            Arc::clone(&session.inner),
            connack_tx,
        ));

        let timeout = config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(
                    host = %config.host,
                    port = config.port,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
                Ok(session)
            }
            Ok(Ok(Err(reason))) => Err(ConnectionError::Refused(reason)),
            Ok(Err(_)) => Err(ConnectionError::Refused(
                "MQTT event loop terminated unexpectedly".to_string(),
            )),
            Err(_) => {
                // Stop the background task from retrying forever.
                let _ = session.inner.client.try_disconnect();
                Err(ConnectionError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub(crate) async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_alive() {
            return Err(ProtocolError::SessionClosed);
        }
        self.inner
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    pub(crate) async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, ProtocolError> {
        if !self.is_alive() {
            return Err(ProtocolError::SessionClosed);
        }
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if !self.inner.add_route(topic, tx.clone()) {
            tracing::debug!(topic, "Added inbox to MQTT topic");
            return Ok(rx);
        }

        if let Err(e) = self.inner.client.subscribe(topic, QoS::AtMostOnce).await {
            self.inner.remove_route(topic, &tx);
            return Err(e.into());
        }
        tracing::debug!(topic, "Subscribed to MQTT topic");
        Ok(rx)
    }

    pub(crate) fn release(&self, topic: &str) {
        self.inner.routes.write().remove(topic);
        if self.is_alive()
            && let Err(e) = self.inner.client.try_unsubscribe(topic)
        {
            tracing::warn!(topic, error = %e, "Failed to unsubscribe");
        }
    }

    pub(crate) async fn close(&self) {
        let was_alive = self.inner.alive.swap(false, Ordering::AcqRel);
        self.inner.mark_dead();
        if was_alive && let Err(e) = self.inner.client.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect from MQTT broker");
        }
    }
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("alive", &self.is_alive())
            .field("topics", &self.inner.routes.read().len())
            .finish_non_exhaustive()
    }
}

/// Polls the event loop until the session fails or disconnects.
async fn handle_session_events(
    mut event_loop: EventLoop,
    session: Arc<MqttSessionInner>,
    connack_tx: oneshot::Sender<Result<(), String>>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker acknowledged connection");
                let outcome = if connack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("{:?}", connack.code))
                };
                let refused = outcome.is_err();
                if !refused {
                    session.alive.store(true, Ordering::Release);
                }
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(outcome);
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                session.route(&publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected the session");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if session.alive.load(Ordering::Acquire) {
                    tracing::error!(error = %e, "MQTT session event loop error");
                } else if connack_tx.is_some() {
                    tracing::debug!(error = %e, "MQTT connection attempt failed");
                    if let Some(tx) = connack_tx.take() {
                        let _ = tx.send(Err(e.to_string()));
                    }
                }
                break;
            }
        }
    }

    session.mark_dead();
}
