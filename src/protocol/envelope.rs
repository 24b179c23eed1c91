// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message envelope and its wire encoding.
//!
//! On the wire an envelope is a JSON object:
//!
//! ```text
//! {"subject": "event.device.announce", "content": {...}, "reply-to": "agocontrol/reply/..."}
//! ```
//!
//! `reply-to` is omitted when absent. A missing `subject` or `content`
//! decodes as empty.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::value::{Value, ValueMap};

/// Smallest payload that can hold an envelope (`{}`).
pub const MIN_ENCODED_LEN: usize = 2;

/// Name of a destination messages can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Creates an address from a topic name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message travelling on the bus.
///
/// An empty subject marks a command addressed to the device named by
/// `content["uuid"]`; any other subject is a broadcast event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    content: ValueMap,
    #[serde(rename = "reply-to", default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address>,
}

impl Envelope {
    /// Creates an envelope with the given subject and content.
    #[must_use]
    pub fn new(subject: impl Into<String>, content: ValueMap) -> Self {
        Self {
            subject: subject.into(),
            content,
            reply_to: None,
        }
    }

    /// Creates a command envelope (empty subject).
    #[must_use]
    pub fn command(content: ValueMap) -> Self {
        Self::new("", content)
    }

    /// Attaches a reply destination.
    #[must_use]
    pub fn with_reply_to(mut self, address: Address) -> Self {
        self.reply_to = Some(address);
        self
    }

    /// Returns the subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns the content.
    #[must_use]
    pub fn content(&self) -> &ValueMap {
        &self.content
    }

    /// Returns the reply destination, if any.
    #[must_use]
    pub fn reply_to(&self) -> Option<&Address> {
        self.reply_to.as_ref()
    }

    /// Returns true for commands, false for events.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.subject.is_empty()
    }

    /// Returns the `command` entry of the content, if it is a string.
    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        self.content.get("command").and_then(|v| v.as_str().ok())
    }

    /// Splits the envelope into subject, content and reply destination.
    #[must_use]
    pub fn into_parts(self) -> (String, ValueMap, Option<Address>) {
        (self.subject, self.content, self.reply_to)
    }

    /// Consumes the envelope and returns its content.
    #[must_use]
    pub fn into_content(self) -> ValueMap {
        self.content
    }

    /// Encodes the envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::TooShort`] for payloads below
    /// [`MIN_ENCODED_LEN`], [`DecodeError::InvalidEnvelope`] if the payload
    /// is not a JSON object and [`DecodeError::Json`] for malformed JSON or
    /// a non-map `content`.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < MIN_ENCODED_LEN {
            return Err(DecodeError::TooShort {
                len: payload.len(),
                min: MIN_ENCODED_LEN,
            });
        }

        let json: serde_json::Value = serde_json::from_slice(payload)?;
        if !json.is_object() {
            return Err(DecodeError::InvalidEnvelope(format!(
                "expected an object, got {}",
                Value::from(json).kind()
            )));
        }

        Ok(serde_json::from_value(json)?)
    }
}
