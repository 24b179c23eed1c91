// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Failures reported by command handlers.

use thiserror::Error;

use crate::value::{Value, ValueMap};

/// Identifier sent for unknown commands.
pub const UNKNOWN_COMMAND: &str = "error.command.unknown";
/// Identifier sent when a required parameter is absent.
pub const PARAMETER_MISSING: &str = "error.parameter.missing";
/// Identifier sent when a parameter has the wrong type or range.
pub const PARAMETER_INVALID: &str = "error.parameter.invalid";
/// Identifier sent when the handler failed for any other reason.
pub const INTERNAL_ERROR: &str = "error.internal";

/// Error returned by a command handler.
///
/// The dispatch loop converts it into an error reply carrying
/// [`identifier`](Self::identifier) and the display message, so the daemon
/// keeps running and the caller gets a structured answer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    /// The command is not supported by this daemon.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A required parameter is absent.
    #[error("missing parameter: {0}")]
    ParameterMissing(String),

    /// A parameter has the wrong type or is out of range.
    #[error("invalid parameter {name}: {message}")]
    ParameterInvalid {
        /// Parameter name.
        name: String,
        /// What was wrong with it.
        message: String,
    },

    /// The command failed with a custom identifier.
    #[error("{message}")]
    Failed {
        /// Dot-namespaced error identifier.
        identifier: String,
        /// Human readable message.
        message: String,
        /// Additional data returned to the caller.
        data: Option<ValueMap>,
    },
}

impl CommandError {
    /// Creates an `UnknownCommand` error for the given content.
    ///
    /// Uses the content's `command` entry as the name when present.
    #[must_use]
    pub fn unknown(content: &ValueMap) -> Self {
        let name = content
            .get("command")
            .map_or_else(|| "<none>".to_string(), Value::to_string);
        Self::UnknownCommand(name)
    }

    /// Creates a failure with a custom identifier.
    #[must_use]
    pub fn failed(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            identifier: identifier.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Creates an internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::failed(INTERNAL_ERROR, message)
    }

    /// Returns the wire identifier of this error.
    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Self::UnknownCommand(_) => UNKNOWN_COMMAND,
            Self::ParameterMissing(_) => PARAMETER_MISSING,
            Self::ParameterInvalid { .. } => PARAMETER_INVALID,
            Self::Failed { identifier, .. } => identifier,
        }
    }

    /// Returns the attached data, if any.
    #[must_use]
    pub fn data(&self) -> Option<&ValueMap> {
        match self {
            Self::Failed { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}
