// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single serialized broker connection of a daemon.
//!
//! Every send and subscription goes through one async mutex, so the
//! dispatch loop and any number of background tasks can share the
//! connection without interleaving. A session that failed is discarded and
//! reopened on next use. The replacement is opened outside the mutex and
//! swapped in under it, so a slow broker never blocks [`Connection::close`].
//! Sessions are numbered; a replacement is only installed if the slot still
//! holds the generation it was opened for, so concurrent observers of one
//! failure install a single new session.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};

use super::TransportConfig;
use super::envelope::{Address, Envelope};
use super::reply::ReplyDestination;
use super::session::{Inbox, Session};
use crate::error::{ConnectionError, ProtocolError};

/// Segment between the bus topic and the reply id in reply addresses.
const REPLY_SEGMENT: &str = "reply";

#[derive(Debug)]
struct SessionSlot {
    session: Option<Session>,
    generation: u64,
}

/// A shared, self-healing connection to the bus.
#[derive(Debug)]
pub struct Connection {
    transport: TransportConfig,
    topic: String,
    slot: Mutex<SessionSlot>,
    closed: AtomicBool,
}

impl Connection {
    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the first session cannot be
    /// established. Daemons treat this as fatal.
    pub async fn open(
        transport: TransportConfig,
        topic: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        let topic = topic.into();
        let session = Session::open(&transport).await?;
        tracing::info!(topic = %topic, "Bus connection opened");

        Ok(Self {
            transport,
            topic,
            slot: Mutex::new(SessionSlot {
                session: Some(session),
                generation: 1,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the shared bus topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the generation of the current session.
    pub async fn generation(&self) -> u64 {
        self.slot.lock().await.generation
    }

    /// Publishes `envelope` on the shared topic.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if no session is available or the send
    /// failed. The failed session is discarded.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.send_raw(&self.topic, envelope).await
    }

    /// Sends `envelope` to a specific address (typically a reply-to).
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn send_to(&self, address: &Address, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.send_raw(address.as_str(), envelope).await
    }

    async fn send_raw(&self, topic: &str, envelope: &Envelope) -> Result<(), ProtocolError> {
        let payload = envelope.encode()?;
        let (mut slot, session) = self.live_session().await?;

        if let Err(e) = session.publish(topic, payload).await {
            tracing::warn!(topic, error = %e, "Send failed, discarding session");
            slot.session = None;
            drop(slot);
            session.close().await;
            return Err(e);
        }
        tracing::trace!(topic, subject = envelope.subject(), "Sent envelope");
        Ok(())
    }

    /// Subscribes to the shared topic.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if no session is available or the
    /// subscription failed.
    ///
    /// Every call returns a new inbox; inboxes created earlier on the same
    /// session keep receiving.
    pub async fn receiver(&self) -> Result<Inbox, ProtocolError> {
        let (slot, session) = self.live_session().await?;
        let rx = session.subscribe(&self.topic).await?;
        tracing::debug!(topic = %self.topic, generation = slot.generation, "Subscribed to bus");
        Ok(Inbox::new(rx, slot.generation))
    }

    /// Creates a uniquely named destination for one reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if no session is available or the
    /// subscription failed.
    pub async fn reply_destination(&self) -> Result<ReplyDestination, ProtocolError> {
        let (slot, session) = self.live_session().await?;

        let address = Address::new(format!(
            "{}/{REPLY_SEGMENT}/{}",
            self.topic,
            uuid::Uuid::new_v4()
        ));
        let rx = session.subscribe(address.as_str()).await?;
        let inbox = Inbox::new(rx, slot.generation);
        Ok(ReplyDestination::new(address, inbox, session))
    }

    /// Makes sure a live session newer than `observed` exists.
    ///
    /// Callers pass the generation on which they saw a failure. If another
    /// caller already replaced that session, nothing happens.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the connection is closed or a new
    /// session cannot be opened.
    pub async fn ensure_session(&self, observed: u64) -> Result<u64, ConnectionError> {
        let current = {
            let slot = self.slot.lock().await;
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            let healthy = slot.session.as_ref().is_some_and(Session::is_alive);
            if slot.generation != observed && healthy {
                return Ok(slot.generation);
            }
            slot.generation
        };
        self.reopen(current).await
    }

    /// Closes the connection. Idempotent.
    ///
    /// Inboxes of the current session observe
    /// [`FetchError::SessionClosed`](crate::error::FetchError) and no new
    /// session is opened afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = self.slot.lock().await.session.take();
        if let Some(session) = session {
            session.close().await;
        }
        tracing::info!(topic = %self.topic, "Bus connection closed");
    }

    /// Locks the slot and returns it with a live session, reopening the
    /// session first if needed.
    async fn live_session(
        &self,
    ) -> Result<(MutexGuard<'_, SessionSlot>, Session), ConnectionError> {
        loop {
            let slot = self.slot.lock().await;
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            if let Some(session) = slot.session.as_ref().filter(|s| s.is_alive()) {
                let session = session.clone();
                return Ok((slot, session));
            }
            let current = slot.generation;
            drop(slot);
            self.reopen(current).await?;
        }
    }

    /// Opens a session and installs it if the slot still holds generation
    /// `expected`. Returns the generation in the slot afterwards.
    async fn reopen(&self, expected: u64) -> Result<u64, ConnectionError> {
        let fresh = Session::open(&self.transport).await.inspect_err(|e| {
            tracing::error!(topic = %self.topic, error = %e, "Failed to open bus session");
        })?;

        let mut slot = self.slot.lock().await;
        if self.is_closed() {
            drop(slot);
            fresh.close().await;
            return Err(ConnectionError::Closed);
        }
        if slot.generation != expected {
            let current = slot.generation;
            drop(slot);
            tracing::debug!(generation = current, "Session already recreated");
            fresh.close().await;
            return Ok(current);
        }

        let old = slot.session.replace(fresh);
        slot.generation += 1;
        let generation = slot.generation;
        drop(slot);

        if let Some(old) = old {
            old.close().await;
        }
        tracing::info!(topic = %self.topic, generation, "Bus session recreated");
        Ok(generation)
    }
}
