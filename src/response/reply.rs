// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of answers received through request/reply.

use crate::value::{Value, ValueMap, ValueMapExt};

/// An answer received from another daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing came back before the timeout.
    NoAnswer,
    /// The answer was a success. Holds the `result` body, or the whole map
    /// for handlers that reply without the `result` wrapper.
    Success(ValueMap),
    /// The answer was an error.
    Failure {
        /// Error identifier.
        identifier: String,
        /// Error message.
        message: String,
    },
}

impl Reply {
    /// Classifies a raw reply map.
    #[must_use]
    pub fn from_map(mut map: ValueMap) -> Self {
        if map.is_empty() {
            return Self::NoAnswer;
        }

        if let Some(Value::Map(body)) = map.get("error") {
            return Self::Failure {
                identifier: body.get_str("identifier").unwrap_or_default().to_string(),
                message: body.get_str("message").unwrap_or_default().to_string(),
            };
        }

        match map.remove("result") {
            Some(Value::Map(body)) => Self::Success(body),
            Some(other) => {
                map.insert("result".to_string(), other);
                Self::Success(map)
            }
            None => Self::Success(map),
        }
    }

    /// Returns true if an answer arrived.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        !matches!(self, Self::NoAnswer)
    }
}
