// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command responses.
//!
//! Command handlers return a plain [`ValueMap`] which is sent back as the
//! reply content. The helpers here build the conventional shapes:
//!
//! - success: `{"result": {...}}`
//! - failure: `{"error": {"identifier": "...", "message": "..."}}`
//!
//! Callers of [`AgoClient::send_and_wait`](crate::AgoClient::send_and_wait)
//! can classify what came back with [`Reply::from_map`].
//!
//! # Examples
//!
//! ```
//! use agobus_lib::response::{self, CommandError, Reply};
//!
//! let ok = response::success("switched on");
//! assert!(matches!(Reply::from_map(ok), Reply::Success(_)));
//!
//! let err = response::error(&CommandError::ParameterMissing("level".into()));
//! let Reply::Failure { identifier, .. } = Reply::from_map(err) else {
//!     panic!("expected failure");
//! };
//! assert_eq!(identifier, "error.parameter.missing");
//! ```

mod command_error;
mod reply;

pub use command_error::{
    CommandError, INTERNAL_ERROR, PARAMETER_INVALID, PARAMETER_MISSING, UNKNOWN_COMMAND,
};
pub use reply::Reply;

use crate::value::{Value, ValueMap};

/// Identifier used in success results.
pub const SUCCESS: &str = "success";

/// Builds a success response with a message.
#[must_use]
pub fn success(message: impl Into<String>) -> ValueMap {
    let mut result = ValueMap::new();
    result.insert("identifier".to_string(), Value::from(SUCCESS));
    result.insert("message".to_string(), Value::String(message.into()));
    wrap("result", result)
}

/// Builds a success response carrying data.
#[must_use]
pub fn success_with(data: ValueMap) -> ValueMap {
    let mut result = data;
    result
        .entry("identifier".to_string())
        .or_insert_with(|| Value::from(SUCCESS));
    wrap("result", result)
}

/// Builds an error response from a handler failure.
#[must_use]
pub fn error(err: &CommandError) -> ValueMap {
    let mut body = ValueMap::new();
    body.insert("identifier".to_string(), Value::from(err.identifier()));
    body.insert("message".to_string(), Value::String(err.to_string()));
    if let Some(data) = err.data() {
        body.insert("data".to_string(), Value::Map(data.clone()));
    }
    wrap("error", body)
}

fn wrap(key: &str, body: ValueMap) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert(key.to_string(), Value::Map(body));
    map
}
