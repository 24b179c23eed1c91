// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `agobus` library.
//!
//! This module provides the error hierarchy for the bus client: connection
//! setup, transport operations, payload decoding, bounded receives, typed
//! value conversion, device registry persistence and configuration loading.
//!
//! Command handler failures are not part of this hierarchy. They are
//! described by [`CommandError`](crate::response::CommandError) and turned
//! into error replies at the dispatch boundary.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to the broker failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A transport operation failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An inbound payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A typed value could not be converted.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// The device registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while establishing a broker session.
///
/// At startup these are fatal: a daemon that cannot open its connection
/// should exit. Later on the dispatch loop recovers from them by recreating
/// the session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The broker address is missing or malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The broker refused or dropped the handshake.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The handshake did not complete in time.
    #[error("connection timed out after {0} ms")]
    Timeout(u64),

    /// The connection was closed and cannot be used anymore.
    #[error("connection closed")]
    Closed,

    /// MQTT client failure during setup.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// Errors related to publish and subscribe operations on a live session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MQTT client request failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The session backing this operation is gone.
    #[error("session closed")]
    SessionClosed,

    /// No session could be established for this operation.
    #[error("session unavailable: {0}")]
    SessionUnavailable(#[from] ConnectionError),

    /// An outbound message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors related to decoding inbound envelopes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is shorter than the smallest valid encoding.
    #[error("payload of {len} bytes is shorter than the minimum of {min}")]
    TooShort {
        /// Length of the received payload.
        len: usize,
        /// Minimum valid length.
        min: usize,
    },

    /// The payload is not valid JSON.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is JSON but not an envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Outcome of a bounded receive that produced no message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    /// Nothing arrived before the timeout. This is an expected outcome.
    #[error("no message available")]
    NoMessageAvailable,

    /// The session delivering messages was closed.
    #[error("session closed")]
    SessionClosed,
}

/// Errors related to typed value conversion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The value cannot be represented as the requested type.
    #[error("invalid conversion from {from} to {to}")]
    InvalidConversion {
        /// Kind of the stored value.
        from: &'static str,
        /// Requested target type.
        to: &'static str,
    },
}

/// Errors related to device registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested uuid is already bound to another internal id.
    #[error("uuid {uuid} is already assigned to {internal_id}")]
    UuidConflict {
        /// The contested uuid.
        uuid: String,
        /// The internal id currently holding it.
        internal_id: String,
    },

    /// The uuid map could not be written.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors raised while writing the uuid map to disk.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File being written.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The map could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid.
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A required setting is missing.
    #[error("missing setting: {0}")]
    Missing(&'static str),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
