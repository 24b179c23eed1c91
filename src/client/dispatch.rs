// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatch loop.
//!
//! Messages on the shared topic are handled in order:
//!
//! 1. undecodable payloads are dropped with a warning;
//! 2. a `discover` command is answered by announcing every non-stale
//!    device, and nothing else;
//! 3. commands (empty subject) go to the command handler when the target
//!    uuid belongs to this daemon or filtering is disabled. The result is
//!    sent to `reply-to` only for own devices, or for `inventory` requests
//!    when filtering is disabled;
//! 4. events go to the event handler and are never answered.

use std::panic::AssertUnwindSafe;

use tokio::sync::watch;

use super::request::INVENTORY_COMMAND;
use super::{AgoClient, CommandHandler, DispatchState};
use crate::error::FetchError;
use crate::event::DISCOVER_COMMAND;
use crate::protocol::{Address, Envelope, Inbox};
use crate::response::{self, CommandError};
use crate::value::{Value, ValueMap, ValueMapExt};

impl AgoClient {
    /// Runs the dispatch loop until shutdown.
    ///
    /// Moves the state from [`DispatchState::Stopped`] to
    /// [`DispatchState::Running`]; a call while the loop already runs
    /// returns immediately. Session failures are recovered by recreating
    /// the session according to the reconnection policy. The loop exits
    /// when [`shutdown`](Self::shutdown) is called or the connection is
    /// closed.
    pub async fn run(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == DispatchState::Stopped {
                *state = DispatchState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::warn!(app = %self.app_name(), "Dispatch loop already running");
            return;
        }

        tracing::info!(
            app = %self.app_name(),
            topic = %self.inner.connection.topic(),
            "Dispatch loop started"
        );

        let poll = self.inner.config.receive_poll;
        let mut shutdown = self.shutdown_signal();
        let mut inbox = self.subscribe_bus(None, &mut shutdown).await;

        while let Some(current) = inbox.as_mut() {
            if *shutdown.borrow() {
                break;
            }
            match current.fetch(poll).await {
                Ok(payload) => self.dispatch(&payload).await,
                Err(FetchError::NoMessageAvailable) => {}
                Err(FetchError::SessionClosed) => {
                    if self.is_shutting_down() || self.inner.connection.is_closed() {
                        break;
                    }
                    let observed = current.generation();
                    tracing::warn!(generation = observed, "Bus session lost, reconnecting");
                    inbox = self.subscribe_bus(Some(observed), &mut shutdown).await;
                }
            }
        }

        self.inner.state.send_replace(DispatchState::ShuttingDown);
        tracing::info!(app = %self.app_name(), "Dispatch loop stopped");
        self.inner.state.send_replace(DispatchState::Stopped);
    }

    /// Subscribes to the shared topic, recreating the session first if
    /// `observed` names a failed generation.
    ///
    /// Retries per the reconnection policy. Returns `None` on shutdown or
    /// when the policy gives up.
    async fn subscribe_bus(
        &self,
        mut observed: Option<u64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Inbox> {
        let connection = &self.inner.connection;
        let policy = &self.inner.config.reconnection;
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() || connection.is_closed() {
                return None;
            }

            let attempt_subscribe = async {
                match observed {
                    Some(generation) => match connection.ensure_session(generation).await {
                        Ok(_) => connection.receiver().await,
                        Err(e) => Err(e.into()),
                    },
                    None => connection.receiver().await,
                }
            };
            // A broker that never answers must not hold up shutdown.
            let result = tokio::select! {
                result = attempt_subscribe => result,
                _ = shutdown.wait_for(|stop| *stop) => return None,
            };

            let error = match result {
                Ok(inbox) => {
                    if observed.is_some() {
                        tracing::info!(
                            generation = inbox.generation(),
                            attempts = attempt + 1,
                            "Resubscribed to bus"
                        );
                    }
                    return Some(inbox);
                }
                Err(e) => e,
            };

            if connection.is_closed() {
                return None;
            }
            if !policy.should_retry(attempt) {
                tracing::error!(attempts = attempt, error = %error, "Giving up on bus session");
                return None;
            }

            let delay = policy.delay_for_attempt(attempt);
            tracing::warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Failed to subscribe to bus, retrying"
            );
            attempt += 1;
            observed = Some(connection.generation().await);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return None,
            }
        }
    }

    async fn dispatch(&self, payload: &[u8]) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(len = payload.len(), error = %e, "Dropping undecodable message");
                return;
            }
        };

        if envelope.command_name() == Some(DISCOVER_COMMAND) {
            let announced = self.announce_all().await;
            tracing::debug!(announced, "Answered discovery request");
            return;
        }

        if envelope.is_command() {
            self.dispatch_command(envelope).await;
        } else {
            self.dispatch_event(&envelope);
        }
    }

    async fn dispatch_command(&self, envelope: Envelope) {
        let (_, mut content, reply_to) = envelope.into_parts();

        let internal_id = content
            .get_str("uuid")
            .and_then(|uuid| self.inner.registry.resolve_internal_id(uuid));
        let is_own = internal_id
            .as_deref()
            .is_some_and(|id| self.inner.registry.contains(id));
        let filtering = self.filters_commands();

        if !is_own && filtering {
            tracing::trace!(uuid = ?content.get_str("uuid"), "Ignoring command for foreign device");
            return;
        }

        let Some(handler) = self.inner.handlers.read().command.clone() else {
            tracing::trace!("No command handler registered");
            return;
        };

        let is_inventory = content.get_str("command") == Some(INVENTORY_COMMAND);
        if let Some(internal_id) = internal_id {
            content.insert("internalid".to_string(), Value::String(internal_id));
        }

        let response = self.invoke_command(handler, content).await;

        match reply_to {
            Some(address) if is_own || (is_inventory && !filtering) => {
                self.reply(&address, response).await;
            }
            _ => tracing::trace!("Discarding command response"),
        }
    }

    async fn invoke_command(&self, handler: CommandHandler, content: ValueMap) -> ValueMap {
        let command = content
            .get("command")
            .map(Value::to_string)
            .unwrap_or_default();
        let client = self.clone();

        // Run in its own task so a panic is contained to this command.
        let outcome = tokio::spawn(async move { handler(client, content).await }).await;

        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::debug!(
                    command = %command,
                    identifier = err.identifier(),
                    error = %err,
                    "Command failed"
                );
                response::error(&err)
            }
            Err(e) => {
                tracing::error!(command = %command, error = %e, "Command handler panicked");
                response::error(&CommandError::internal("command handler panicked"))
            }
        }
    }

    async fn reply(&self, address: &Address, response: ValueMap) {
        let envelope = Envelope::new("", response);
        if let Err(e) = self.inner.connection.send_to(address, &envelope).await {
            tracing::warn!(address = %address, error = %e, "Failed to send reply");
        }
    }

    fn dispatch_event(&self, envelope: &Envelope) {
        let Some(handler) = self.inner.handlers.read().event.clone() else {
            return;
        };

        let subject = envelope.subject();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler(self, subject, envelope.content());
        }));
        if outcome.is_err() {
            tracing::error!(subject, "Event handler panicked");
        }
    }
}
