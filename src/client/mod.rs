// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bus client embedded by every daemon.
//!
//! [`AgoClient`] ties together the shared [`Connection`], the
//! [`DeviceRegistry`] and the dispatch loop. It is cheaply cloneable: the
//! dispatch loop, command handlers and any background task of the daemon
//! hold clones of the same client and share one serialized connection.
//!
//! # Examples
//!
//! ```no_run
//! use agobus_lib::{AgoClient, response};
//!
//! # async fn example() -> agobus_lib::Result<()> {
//! let client = AgoClient::builder("example")
//!     .mqtt("localhost", 1883)
//!     .connect()
//!     .await?;
//!
//! client.register_device("relay-1", "switch").await?;
//!
//! client.on_command(|client, content| async move {
//!     match content.get("command").and_then(|c| c.as_str().ok()) {
//!         Some("on") => {
//!             client.emit_event("relay-1", "event.device.statechanged", 255, "").await;
//!             Ok(response::success("switched on"))
//!         }
//!         _ => Err(response::CommandError::unknown(&content)),
//!     }
//! });
//!
//! // Runs until shutdown() is called from another task.
//! client.run().await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod dispatch;
mod request;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;

pub use builder::ClientBuilder;
pub use request::CONTROLLER_DEVICE_TYPE;

use crate::config::ClientConfig;
use crate::error::RegistryError;
use crate::event::DeviceEvent;
use crate::protocol::{Connection, Envelope};
use crate::registry::{Device, DeviceRegistry, UuidAssignment};
use crate::response::CommandError;
use crate::value::{Value, ValueMap};

/// Future returned by a command handler.
pub type CommandFuture = Pin<Box<dyn Future<Output = Result<ValueMap, CommandError>> + Send>>;

/// Type alias for command handlers.
type CommandHandler = Arc<dyn Fn(AgoClient, ValueMap) -> CommandFuture + Send + Sync>;

/// Type alias for event handlers.
type EventHandler = Arc<dyn Fn(&AgoClient, &str, &ValueMap) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    command: Option<CommandHandler>,
    event: Option<EventHandler>,
}

/// State of the dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchState {
    /// The loop is not running.
    #[default]
    Stopped,
    /// The loop is receiving and dispatching messages.
    Running,
    /// The loop observed shutdown and is exiting.
    ShuttingDown,
}

struct ClientInner {
    config: ClientConfig,
    connection: Connection,
    registry: DeviceRegistry,
    handlers: RwLock<Handlers>,
    filter_commands: AtomicBool,
    state: watch::Sender<DispatchState>,
    shutdown: watch::Sender<bool>,
}

/// A daemon's handle on the bus.
#[derive(Clone)]
pub struct AgoClient {
    inner: Arc<ClientInner>,
}

impl AgoClient {
    fn from_parts(config: ClientConfig, connection: Connection, registry: DeviceRegistry) -> Self {
        let filter_commands = AtomicBool::new(config.filter_commands);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                registry,
                handlers: RwLock::new(Handlers::default()),
                filter_commands,
                state: watch::Sender::new(DispatchState::Stopped),
                shutdown: watch::Sender::new(false),
            }),
        }
    }

    /// Returns the daemon name.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.inner.config.app_name
    }

    /// Returns the configuration the client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the shared connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Returns the device registry.
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    // ========== Handlers ==========

    /// Registers the command handler, replacing any previous one.
    ///
    /// The handler receives a clone of the client and the command content,
    /// with `internalid` injected when the target uuid is known. Its result
    /// is sent back to the requester when a reply is due; an `Err` becomes
    /// an error reply.
    pub fn on_command<F, Fut>(&self, handler: F)
    where
        F: Fn(AgoClient, ValueMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueMap, CommandError>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |client, content| -> CommandFuture {
            Box::pin(handler(client, content))
        });
        self.inner.handlers.write().command = Some(handler);
    }

    /// Registers the event handler, replacing any previous one.
    ///
    /// Called with the subject and content of every event on the bus. It
    /// runs on the dispatch loop and should not block.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&AgoClient, &str, &ValueMap) + Send + Sync + 'static,
    {
        self.inner.handlers.write().event = Some(Arc::new(handler));
    }

    /// Enables or disables own-device filtering of commands.
    pub fn set_filter_commands(&self, enabled: bool) {
        self.inner.filter_commands.store(enabled, Ordering::Release);
    }

    /// Returns whether commands for foreign devices are ignored.
    #[must_use]
    pub fn filters_commands(&self) -> bool {
        self.inner.filter_commands.load(Ordering::Acquire)
    }

    // ========== Lifecycle ==========

    /// Returns the current dispatch state.
    #[must_use]
    pub fn state(&self) -> DispatchState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver following the dispatch state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<DispatchState> {
        self.inner.state.subscribe()
    }

    /// Returns a receiver that turns `true` once shutdown was requested.
    ///
    /// Background tasks of the daemon select on it to stop with the
    /// dispatch loop.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Requests shutdown and closes the connection.
    ///
    /// A blocked dispatch loop returns promptly. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        tracing::info!(app = %self.app_name(), "Shutting down bus client");
        self.inner.connection.close().await;
    }

    // ========== Outbound messaging ==========

    /// Publishes an event or command on the bus.
    ///
    /// Returns false if the message could not be sent; the failure is
    /// logged and never fatal.
    pub async fn publish(&self, subject: &str, content: ValueMap) -> bool {
        self.send(&Envelope::new(subject, content)).await
    }

    pub(crate) async fn send(&self, envelope: &Envelope) -> bool {
        match self.inner.connection.publish(envelope).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(subject = envelope.subject(), error = %e, "Failed to publish");
                false
            }
        }
    }

    /// Emits a device event carrying a level and a unit.
    ///
    /// Publishes `{level, unit, uuid}` where `uuid` is resolved from
    /// `internal_id`. Returns false if the device has no uuid or the send
    /// failed.
    pub async fn emit_event(
        &self,
        internal_id: &str,
        subject: &str,
        level: impl Into<Value>,
        unit: &str,
    ) -> bool {
        let mut content = ValueMap::new();
        content.insert("level".to_string(), level.into());
        content.insert("unit".to_string(), Value::from(unit));
        self.emit_event_map(internal_id, subject, content).await
    }

    /// Emits a device event with arbitrary content.
    ///
    /// `uuid` is resolved from `internal_id` and added to `content`.
    pub async fn emit_event_map(&self, internal_id: &str, subject: &str, mut content: ValueMap) -> bool {
        let Some(uuid) = self.inner.registry.resolve_uuid(internal_id) else {
            tracing::warn!(internal_id, subject, "Cannot emit event for unknown device");
            return false;
        };
        content.insert("uuid".to_string(), Value::String(uuid));
        self.publish(subject, content).await
    }

    /// Announces a device.
    pub async fn announce(&self, internal_id: &str, device_type: &str) -> bool {
        let Some(uuid) = self.inner.registry.resolve_uuid(internal_id) else {
            tracing::warn!(internal_id, "Cannot announce device without uuid");
            return false;
        };
        let event = DeviceEvent::Announce {
            device_type: device_type.to_string(),
            internal_id: internal_id.to_string(),
            uuid,
            handled_by: self.app_name().to_string(),
        };
        self.send(&event.into_envelope()).await
    }

    /// Announces the removal of a device.
    pub async fn announce_removal(&self, internal_id: &str) -> bool {
        let Some(uuid) = self.inner.registry.resolve_uuid(internal_id) else {
            tracing::warn!(internal_id, "Cannot announce removal of device without uuid");
            return false;
        };
        self.send(&DeviceEvent::Remove { uuid }.into_envelope()).await
    }

    /// Announces a staleness change of a device.
    pub async fn announce_stale(&self, internal_id: &str, stale: bool) -> bool {
        let Some(uuid) = self.inner.registry.resolve_uuid(internal_id) else {
            tracing::warn!(internal_id, "Cannot announce staleness of device without uuid");
            return false;
        };
        let event = DeviceEvent::Stale {
            internal_id: internal_id.to_string(),
            uuid,
            stale,
        };
        self.send(&event.into_envelope()).await
    }

    /// Announces every non-stale device. Returns how many were sent.
    pub async fn announce_all(&self) -> usize {
        let mut sent = 0;
        for device in self.inner.registry.announceable() {
            if self.announce(device.internal_id(), device.device_type()).await {
                sent += 1;
            }
        }
        sent
    }

    // ========== Device registry ==========

    /// Registers a device with a generated uuid and announces it.
    ///
    /// Returns the device's uuid, which is stable across restarts.
    ///
    /// # Errors
    ///
    /// See [`DeviceRegistry::register`].
    pub async fn register_device(
        &self,
        internal_id: &str,
        device_type: &str,
    ) -> Result<String, RegistryError> {
        self.register_device_with(internal_id, device_type, UuidAssignment::Generate)
            .await
    }

    /// Registers a device with the given uuid assignment and announces it.
    ///
    /// # Errors
    ///
    /// See [`DeviceRegistry::register`].
    pub async fn register_device_with(
        &self,
        internal_id: &str,
        device_type: &str,
        assignment: UuidAssignment,
    ) -> Result<String, RegistryError> {
        let device = self
            .inner
            .registry
            .register(internal_id, device_type, assignment)?;
        tracing::debug!(internal_id, uuid = device.uuid(), device_type, "Registered device");
        self.announce(internal_id, device_type).await;
        Ok(device.uuid().to_string())
    }

    /// Removes a device and announces the removal.
    ///
    /// Returns false if the device was unknown.
    pub async fn unregister_device(&self, internal_id: &str) -> bool {
        let Some(device) = self.inner.registry.unregister(internal_id) else {
            return false;
        };
        tracing::debug!(internal_id, uuid = device.uuid(), "Unregistered device");
        self.announce_removal(internal_id).await;
        true
    }

    /// Flags a device as stale or reachable and announces it.
    ///
    /// Returns false if the device is unknown.
    pub async fn mark_stale(&self, internal_id: &str, stale: bool) -> bool {
        if self.inner.registry.set_stale(internal_id, stale).is_none() {
            return false;
        }
        self.announce_stale(internal_id, stale).await;
        true
    }

    /// Returns the uuid of `internal_id`.
    #[must_use]
    pub fn resolve_uuid(&self, internal_id: &str) -> Option<String> {
        self.inner.registry.resolve_uuid(internal_id)
    }

    /// Returns the internal id of `uuid`.
    #[must_use]
    pub fn resolve_internal_id(&self, uuid: &str) -> Option<String> {
        self.inner.registry.resolve_internal_id(uuid)
    }

    /// Returns a copy of a registered device.
    #[must_use]
    pub fn device(&self, internal_id: &str) -> Option<Device> {
        self.inner.registry.device(internal_id)
    }

    /// Returns a snapshot of the registered devices.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.inner.registry.devices()
    }
}

impl std::fmt::Debug for AgoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgoClient")
            .field("app_name", &self.app_name())
            .field("topic", &self.inner.connection.topic())
            .field("devices", &self.inner.registry.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
