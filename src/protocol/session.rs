// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport sessions and inboxes.

use std::time::Duration;

use tokio::sync::mpsc;

use super::TransportConfig;
use super::memory::MemorySession;
#[cfg(feature = "mqtt")]
use super::mqtt::MqttSession;
use crate::error::{ConnectionError, FetchError, ProtocolError};

/// A session on one of the supported transports.
#[derive(Debug, Clone)]
pub(crate) enum Session {
    #[cfg(feature = "mqtt")]
    Mqtt(MqttSession),
    Memory(MemorySession),
}

impl Session {
    pub(crate) async fn open(config: &TransportConfig) -> Result<Self, ConnectionError> {
        match config {
            #[cfg(feature = "mqtt")]
            TransportConfig::Mqtt(mqtt) => Ok(Self::Mqtt(MqttSession::connect(mqtt).await?)),
            TransportConfig::Memory(broker) => {
                if let Some(delay) = broker.handshake_delay() {
                    tokio::time::sleep(delay).await;
                }
                Ok(Self::Memory(broker.connect()?))
            }
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(s) => s.is_alive(),
            Self::Memory(s) => s.is_alive(),
        }
    }

    pub(crate) async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(s) => s.publish(topic, payload).await,
            Self::Memory(s) => s.publish(topic, &payload),
        }
    }

    pub(crate) async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, ProtocolError> {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(s) => s.subscribe(topic).await,
            Self::Memory(s) => s.subscribe(topic),
        }
    }

    /// Drops the subscription on `topic`. Never blocks.
    pub(crate) fn release(&self, topic: &str) {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(s) => s.release(topic),
            Self::Memory(s) => s.release(topic),
        }
    }

    pub(crate) async fn close(&self) {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(s) => s.close().await,
            Self::Memory(s) => s.close(),
        }
    }
}

/// Receiving end of a subscription.
///
/// An inbox belongs to the session that created it; once that session is
/// gone every fetch returns [`FetchError::SessionClosed`].
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Vec<u8>>,
    generation: u64,
}

impl Inbox {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>, generation: u64) -> Self {
        Self { rx, generation }
    }

    /// Waits up to `timeout` for the next payload.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::NoMessageAvailable`] when nothing arrived in
    /// time and [`FetchError::SessionClosed`] when the session is gone.
    pub async fn fetch(&mut self, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(FetchError::SessionClosed),
            Err(_) => Err(FetchError::NoMessageAvailable),
        }
    }

    /// Returns the session generation this inbox was created on.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
