// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `agobus` Lib - the shared messaging core of agocontrol daemons.
//!
//! Every daemon of the platform (one per device family or service) embeds
//! this library to talk on the shared publish/subscribe bus. It provides:
//!
//! - **Connection management**: one serialized, self-healing connection per
//!   process, over MQTT or an embedded in-process broker
//! - **Device registry**: stable uuids persisted per daemon, live device
//!   table with staleness
//! - **Dispatch loop**: command routing with own-device filtering, event
//!   delivery, discovery answers
//! - **Request/reply**: private reply destinations with timeouts, inventory
//!   queries and controller resolution
//! - **Typed values**: a closed value type with fallible conversions
//!
//! # Quick Start
//!
//! ```no_run
//! use agobus_lib::{AgoClient, response};
//!
//! #[tokio::main]
//! async fn main() -> agobus_lib::Result<()> {
//!     let client = AgoClient::builder("example")
//!         .mqtt("localhost", 1883)
//!         .connect()
//!         .await?;
//!
//!     let uuid = client.register_device("sensor-1", "temperaturesensor").await?;
//!     println!("sensor-1 is {uuid}");
//!
//!     client.on_command(|_, content| async move {
//!         Err::<agobus_lib::ValueMap, _>(response::CommandError::unknown(&content))
//!     });
//!
//!     let worker = client.clone();
//!     tokio::spawn(async move {
//!         worker
//!             .emit_event("sensor-1", "event.environment.temperaturechanged", 21.5, "degC")
//!             .await;
//!     });
//!
//!     client.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Several daemons in one process
//!
//! ```
//! use agobus_lib::{AgoClient, MemoryBroker};
//!
//! # #[tokio::main]
//! # async fn main() -> agobus_lib::Result<()> {
//! let broker = MemoryBroker::new();
//!
//! let zwave = AgoClient::builder("zwave")
//!     .memory(&broker)
//!     .without_persistence()
//!     .connect()
//!     .await?;
//! let knx = AgoClient::builder("knx")
//!     .memory(&broker)
//!     .without_persistence()
//!     .connect()
//!     .await?;
//!
//! assert_eq!(broker.session_count(), 2);
//! # zwave.shutdown().await;
//! # knx.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod registry;
pub mod response;
pub mod value;

pub use client::{AgoClient, CONTROLLER_DEVICE_TYPE, ClientBuilder, CommandFuture, DispatchState};
pub use config::{ClientConfig, ReconnectionPolicy, RetryPolicy};
pub use error::{
    ConfigError, ConnectionError, DecodeError, Error, FetchError, PersistenceError, ProtocolError,
    RegistryError, Result, ValueError,
};
pub use event::DeviceEvent;
#[cfg(feature = "mqtt")]
pub use protocol::MqttBrokerConfig;
pub use protocol::{Address, Envelope, MemoryBroker, TransportConfig};
pub use registry::{Device, DeviceRegistry, UuidAssignment};
pub use response::{CommandError, Reply};
pub use value::{Value, ValueMap, ValueMapExt};
