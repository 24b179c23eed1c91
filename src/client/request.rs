// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/reply, inventory and controller resolution.

use std::time::Duration;

use super::AgoClient;
use crate::error::FetchError;
use crate::protocol::Envelope;
use crate::value::{Value, ValueMap, ValueMapExt};

/// Command name of an inventory request.
pub(crate) const INVENTORY_COMMAND: &str = "inventory";

/// Device type of the platform controller.
pub const CONTROLLER_DEVICE_TYPE: &str = "agocontroller";

impl AgoClient {
    /// Sends a message and waits up to `timeout` for the reply.
    ///
    /// The reply travels on a private destination created for this call and
    /// released when it returns, so concurrent requests never see each
    /// other's replies.
    ///
    /// An empty map means no answer: the request could not be sent, nothing
    /// came back in time, or the reply was unreadable. Callers apply their
    /// own retry policy.
    pub async fn send_and_wait(&self, subject: &str, content: ValueMap, timeout: Duration) -> ValueMap {
        let mut destination = match self.inner.connection.reply_destination().await {
            Ok(destination) => destination,
            Err(e) => {
                tracing::warn!(subject, error = %e, "Failed to create reply destination");
                return ValueMap::new();
            }
        };

        let envelope = Envelope::new(subject, content).with_reply_to(destination.address().clone());
        if let Err(e) = self.inner.connection.publish(&envelope).await {
            tracing::warn!(subject, error = %e, "Failed to send request");
            return ValueMap::new();
        }

        match destination.fetch(timeout).await {
            Ok(payload) => match Envelope::decode(&payload) {
                Ok(reply) => reply.into_content(),
                Err(e) => {
                    tracing::warn!(subject, error = %e, "Dropping undecodable reply");
                    ValueMap::new()
                }
            },
            Err(FetchError::NoMessageAvailable) => {
                tracing::debug!(
                    subject,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "No reply received"
                );
                ValueMap::new()
            }
            Err(FetchError::SessionClosed) => {
                tracing::warn!(subject, "Session closed while waiting for reply");
                ValueMap::new()
            }
        }
    }

    /// Requests the platform inventory.
    ///
    /// Only a daemon with command filtering disabled (the central resolver)
    /// answers this anonymous request. Returns an empty map when nobody
    /// answered within the configured inventory timeout.
    pub async fn inventory(&self) -> ValueMap {
        let mut content = ValueMap::new();
        content.insert("command".to_string(), Value::from(INVENTORY_COMMAND));
        self.send_and_wait("", content, self.inner.config.inventory_timeout)
            .await
    }

    /// Finds the uuid of the platform controller in the inventory.
    ///
    /// Retries the whole inventory round trip per the controller lookup
    /// policy. Returns `None` if no controller was found.
    pub async fn resolve_controller(&self) -> Option<String> {
        let policy = self.inner.config.controller_lookup;
        let attempts = policy.attempts.max(1);

        for attempt in 1..=attempts {
            let inventory = self.inventory().await;
            if let Some(uuid) = find_controller(&inventory) {
                tracing::info!(uuid = %uuid, attempt, "Resolved controller");
                return Some(uuid);
            }
            if attempt < attempts {
                tracing::debug!(attempt, "Controller not found in inventory, retrying");
                tokio::time::sleep(policy.delay).await;
            }
        }

        tracing::warn!(attempts, "Unable to resolve controller");
        None
    }
}

/// Returns the uuid of the first device of type `agocontroller`.
///
/// Accepts the device map at the top level or inside a `result` wrapper.
fn find_controller(inventory: &ValueMap) -> Option<String> {
    let devices = inventory
        .get("devices")
        .or_else(|| inventory.get("result")?.as_map().ok()?.get("devices"))?
        .as_map()
        .ok()?;

    devices
        .iter()
        .find(|(_, info)| {
            info.as_map()
                .is_ok_and(|info| info.get_str("devicetype") == Some(CONTROLLER_DEVICE_TYPE))
        })
        .map(|(uuid, _)| uuid.clone())
}
