// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded in-process broker.
//!
//! [`MemoryBroker`] lets several daemons share a bus inside one process
//! without an external broker. It routes payloads by exact topic name to
//! every subscribed session, at most once: a subscriber whose inbox is full
//! misses the message.
//!
//! # Examples
//!
//! ```
//! use agobus_lib::protocol::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! // Every clone refers to the same bus.
//! let shared = broker.clone();
//! assert_eq!(shared.session_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::INBOX_CAPACITY;
use crate::error::{ConnectionError, ProtocolError};

/// One subscription of one session.
struct Route {
    session: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

struct MemoryBrokerInner {
    /// Subscribers by topic.
    routes: RwLock<HashMap<String, Vec<Route>>>,
    /// Liveness flags of connected sessions.
    sessions: RwLock<HashMap<u64, Arc<AtomicBool>>>,
    next_session: AtomicU64,
    /// Whether new sessions are accepted.
    accepting: AtomicBool,
    /// Time a new session takes to be acknowledged, in milliseconds.
    handshake_delay_ms: AtomicU64,
}

/// An in-process publish/subscribe broker.
///
/// Cheaply cloneable; all clones share the same topics and sessions.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    /// Creates an empty broker that accepts sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBrokerInner {
                routes: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                handshake_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Controls whether new sessions are accepted.
    ///
    /// While not accepting, connecting fails with
    /// [`ConnectionError::Refused`]. Existing sessions are not affected.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::Release);
    }

    /// Delays the acknowledgement of every new session by `delay`, as an
    /// unresponsive broker would.
    pub fn set_handshake_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.handshake_delay_ms.store(millis, Ordering::Release);
    }

    pub(crate) fn handshake_delay(&self) -> Option<Duration> {
        match self.inner.handshake_delay_ms.load(Ordering::Acquire) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Drops every connected session, as a broker restart would.
    pub fn disconnect_all(&self) {
        let sessions: Vec<u64> = self.inner.sessions.read().keys().copied().collect();
        for id in &sessions {
            self.drop_session(*id);
        }
        tracing::info!(sessions = sessions.len(), "Embedded broker dropped all sessions");
    }

    /// Returns the number of connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Returns the number of open inboxes on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.routes.read().get(topic).map_or(0, |subscribers| {
            subscribers.iter().filter(|r| !r.tx.is_closed()).count()
        })
    }

    /// Opens a new session.
    pub(crate) fn connect(&self) -> Result<MemorySession, ConnectionError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(ConnectionError::Refused(
                "embedded broker is not accepting sessions".to_string(),
            ));
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        self.inner.sessions.write().insert(id, Arc::clone(&alive));
        tracing::debug!(session = id, "Embedded broker session opened");

        Ok(MemorySession {
            broker: self.clone(),
            id,
            alive,
        })
    }

    /// Delivers `payload` to every subscriber of `topic`.
    ///
    /// Returns the number of inboxes that accepted the message.
    fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let routes = self.inner.routes.read();
        let Some(subscribers) = routes.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for route in subscribers {
            match route.tx.try_send(payload.to_vec()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(topic, session = route.session, "Inbox full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn subscribe(&self, session: u64, topic: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut routes = self.inner.routes.write();
        let subscribers = routes.entry(topic.to_string()).or_default();
        // A session may hold several inboxes on one topic; only abandoned
        // ones are pruned.
        subscribers.retain(|r| !r.tx.is_closed());
        subscribers.push(Route { session, tx });
        rx
    }

    fn unsubscribe(&self, session: u64, topic: &str) {
        let mut routes = self.inner.routes.write();
        if let Some(subscribers) = routes.get_mut(topic) {
            subscribers.retain(|r| r.session != session);
            if subscribers.is_empty() {
                routes.remove(topic);
            }
        }
    }

    fn drop_session(&self, session: u64) {
        if let Some(alive) = self.inner.sessions.write().remove(&session) {
            alive.store(false, Ordering::Release);
        }
        let mut routes = self.inner.routes.write();
        for subscribers in routes.values_mut() {
            subscribers.retain(|r| r.session != session);
        }
        routes.retain(|_, subscribers| !subscribers.is_empty());
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("sessions", &self.session_count())
            .field("accepting", &self.inner.accepting.load(Ordering::Acquire))
            .finish()
    }
}

/// A session on a [`MemoryBroker`].
#[derive(Clone)]
pub(crate) struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    alive: Arc<AtomicBool>,
}

impl MemorySession {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        if !self.is_alive() {
            return Err(ProtocolError::SessionClosed);
        }
        let delivered = self.broker.deliver(topic, payload);
        tracing::trace!(topic, delivered, "Embedded broker delivered message");
        Ok(())
    }

    pub(crate) fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, ProtocolError> {
        if !self.is_alive() {
            return Err(ProtocolError::SessionClosed);
        }
        Ok(self.broker.subscribe(self.id, topic))
    }

    pub(crate) fn release(&self, topic: &str) {
        self.broker.unsubscribe(self.id, topic);
    }

    pub(crate) fn close(&self) {
        self.broker.drop_session(self.id);
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let broker = MemoryBroker::new();
        let a = broker.connect().unwrap();
        let b = broker.connect().unwrap();
        let mut rx_a = a.subscribe("bus").unwrap();
        let mut rx_b = b.subscribe("bus").unwrap();

        a.publish("bus", b"hello").unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), b"hello");
        assert_eq!(rx_b.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn topics_are_exact() {
        let broker = MemoryBroker::new();
        let session = broker.connect().unwrap();
        let mut rx = session.subscribe("bus/reply/1").unwrap();

        session.publish("bus", b"x").unwrap();
        session.publish("bus/reply/2", b"y").unwrap();
        session.publish("bus/reply/1", b"z").unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"z");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_session_fans_out_to_each_inbox() {
        let broker = MemoryBroker::new();
        let session = broker.connect().unwrap();
        let mut first = session.subscribe("bus").unwrap();
        let mut second = session.subscribe("bus").unwrap();
        assert_eq!(broker.subscriber_count("bus"), 2);

        session.publish("bus", b"hello").unwrap();

        assert_eq!(first.recv().await.unwrap(), b"hello");
        assert_eq!(second.recv().await.unwrap(), b"hello");
    }

    #[test]
    fn dropped_inbox_is_pruned_on_next_subscribe() {
        let broker = MemoryBroker::new();
        let session = broker.connect().unwrap();
        drop(session.subscribe("bus").unwrap());
        assert_eq!(broker.subscriber_count("bus"), 0);

        let _rx = session.subscribe("bus").unwrap();
        assert_eq!(broker.subscriber_count("bus"), 1);
        assert_eq!(broker.inner.routes.read()["bus"].len(), 1);
    }

    #[test]
    fn handshake_delay_round_trips() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.handshake_delay(), None);
        broker.set_handshake_delay(Duration::from_millis(250));
        assert_eq!(broker.handshake_delay(), Some(Duration::from_millis(250)));
        broker.set_handshake_delay(Duration::ZERO);
        assert_eq!(broker.handshake_delay(), None);
    }

    #[test]
    fn refuses_when_not_accepting() {
        let broker = MemoryBroker::new();
        broker.set_accepting(false);
        assert!(matches!(
            broker.connect(),
            Err(ConnectionError::Refused(_))
        ));
        broker.set_accepting(true);
        assert!(broker.connect().is_ok());
    }

    #[tokio::test]
    async fn disconnect_all_closes_inboxes() {
        let broker = MemoryBroker::new();
        let session = broker.connect().unwrap();
        let mut rx = session.subscribe("bus").unwrap();

        broker.disconnect_all();

        assert!(rx.recv().await.is_none());
        assert!(!session.is_alive());
        assert!(matches!(
            session.publish("bus", b"x"),
            Err(ProtocolError::SessionClosed)
        ));
        assert_eq!(broker.session_count(), 0);
    }

    #[test]
    fn release_removes_subscription() {
        let broker = MemoryBroker::new();
        let session = broker.connect().unwrap();
        let _rx = session.subscribe("bus/reply/1").unwrap();
        assert_eq!(broker.subscriber_count("bus/reply/1"), 1);

        session.release("bus/reply/1");
        assert_eq!(broker.subscriber_count("bus/reply/1"), 0);
    }

    #[test]
    fn full_inbox_drops_message() {
        let broker = MemoryBroker::new();
        let session = broker.connect().unwrap();
        let _rx = session.subscribe("bus").unwrap();

        for _ in 0..INBOX_CAPACITY {
            assert_eq!(broker.deliver("bus", b"x"), 1);
        }
        assert_eq!(broker.deliver("bus", b"x"), 0);
    }
}
