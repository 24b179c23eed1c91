// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lifecycle events.
//!
//! Every daemon broadcasts the same three events about the devices it owns:
//! announcement (also the answer to a discovery request), removal and
//! staleness changes. [`DeviceEvent`] builds their content and parses them
//! back for daemons that track other daemons' devices.
//!
//! # Examples
//!
//! ```
//! use agobus_lib::event::DeviceEvent;
//!
//! let event = DeviceEvent::Remove { uuid: "6c2f...".to_string() };
//! let envelope = event.into_envelope();
//! assert_eq!(envelope.subject(), "event.device.remove");
//! ```

mod device_event;

pub use device_event::{ANNOUNCE, DISCOVER_COMMAND, DeviceEvent, REMOVE, STALE};
