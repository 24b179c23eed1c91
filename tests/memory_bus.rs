// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of several daemons sharing an embedded broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use agobus_lib::event::{ANNOUNCE, DeviceEvent};
use agobus_lib::protocol::{Connection, Inbox};
use agobus_lib::response::{self, CommandError, Reply};
use agobus_lib::{
    AgoClient, DispatchState, Envelope, MemoryBroker, ReconnectionPolicy, RetryPolicy,
    TransportConfig, Value, ValueMap, ValueMapExt,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const TOPIC: &str = "agocontrol";

/// Creates a client on `broker` with a short receive poll.
async fn client(broker: &MemoryBroker, app: &str) -> AgoClient {
    AgoClient::builder(app)
        .memory(broker)
        .without_persistence()
        .receive_poll(Duration::from_millis(20))
        .connect()
        .await
        .unwrap()
}

fn spawn_run(client: &AgoClient) -> JoinHandle<()> {
    let client = client.clone();
    tokio::spawn(async move { client.run().await })
}

/// Waits until `count` sessions listen on the shared topic.
async fn wait_for_subscribers(broker: &MemoryBroker, count: usize) {
    timeout(Duration::from_secs(2), async {
        while broker.subscriber_count(TOPIC) < count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscribers did not appear");
}

/// Opens a raw connection that records everything on the shared topic.
async fn observer(broker: &MemoryBroker) -> (Connection, Inbox) {
    let connection = Connection::open(TransportConfig::Memory(broker.clone()), TOPIC)
        .await
        .unwrap();
    let inbox = connection.receiver().await.unwrap();
    (connection, inbox)
}

/// Collects envelopes until the topic stays quiet for `window`.
async fn drain(inbox: &mut Inbox, window: Duration) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    while let Ok(payload) = inbox.fetch(window).await {
        envelopes.push(Envelope::decode(&payload).unwrap());
    }
    envelopes
}

fn command(uuid: &str, name: &str) -> ValueMap {
    let mut content = ValueMap::new();
    content.insert("uuid".to_string(), Value::from(uuid));
    content.insert("command".to_string(), Value::from(name));
    content
}

fn anonymous(name: &str) -> ValueMap {
    let mut content = ValueMap::new();
    content.insert("command".to_string(), Value::from(name));
    content
}

// ============================================================================
// Command routing
// ============================================================================

mod commands {
    use super::*;

    #[tokio::test]
    async fn own_device_commands_are_handled_and_answered() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let requester = client(&broker, "ui").await;

        let uuid = daemon.register_device("node-3", "switch").await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        daemon.on_command(move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CommandError>(response::success("switched"))
            }
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        let reply = requester
            .send_and_wait("", command(&uuid, "on"), Duration::from_secs(1))
            .await;
        let Reply::Success(result) = Reply::from_map(reply) else {
            panic!("expected a success reply");
        };
        assert_eq!(result.get_str("message"), Some("switched"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_device_commands_are_ignored() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let requester = client(&broker, "ui").await;

        daemon.register_device("node-3", "switch").await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        daemon.on_command(move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CommandError>(response::success("switched"))
            }
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        let reply = requester
            .send_and_wait("", command("not-a-known-uuid", "on"), Duration::from_millis(200))
            .await;
        assert!(reply.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn no_handler_means_no_reply() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let requester = client(&broker, "ui").await;
        let uuid = daemon.register_device("node-3", "switch").await.unwrap();

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        let reply = requester
            .send_and_wait("", command(&uuid, "on"), Duration::from_millis(200))
            .await;
        assert!(reply.is_empty());

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn handler_errors_are_structured_replies() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let requester = client(&broker, "ui").await;
        let uuid = daemon.register_device("dimmer-1", "dimmer").await.unwrap();

        daemon.on_command(|_, content| async move {
            match content.get_str("command") {
                Some("setlevel") => {
                    let level = content.require_with("level", Value::as_u8)?;
                    Ok(response::success(format!("level {level}")))
                }
                _ => Err(CommandError::unknown(&content)),
            }
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        let mut content = command(&uuid, "setlevel");
        content.insert("level".to_string(), Value::from(300));
        let reply = requester
            .send_and_wait("", content, Duration::from_secs(1))
            .await;
        let Reply::Failure { identifier, .. } = Reply::from_map(reply) else {
            panic!("expected a failure reply");
        };
        assert_eq!(identifier, "error.parameter.invalid");

        let reply = requester
            .send_and_wait("", command(&uuid, "explode"), Duration::from_secs(1))
            .await;
        let Reply::Failure { identifier, .. } = Reply::from_map(reply) else {
            panic!("expected a failure reply");
        };
        assert_eq!(identifier, "error.command.unknown");

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn events_reach_event_handler() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "logger").await;
        let emitter = client(&broker, "zwave").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        daemon.on_event(move |_, subject, content| {
            let _ = tx.send((subject.to_string(), content.clone()));
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        let uuid = emitter.register_device("node-1", "switch").await.unwrap();
        assert!(emitter.emit_event("node-1", "event.device.statechanged", 255, "").await);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            seen.push(event);
        }
        assert_eq!(seen[0].0, ANNOUNCE);
        assert_eq!(seen[1].0, "event.device.statechanged");
        assert_eq!(seen[1].1.get_str("uuid"), Some(uuid.as_str()));

        daemon.shutdown().await;
        runner.await.unwrap();
    }
}

// ============================================================================
// Discovery and events
// ============================================================================

mod discovery {
    use super::*;

    #[tokio::test]
    async fn discover_announces_non_stale_devices() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let requester = client(&broker, "resolver").await;

        daemon.register_device("node-1", "switch").await.unwrap();
        daemon.register_device("node-2", "dimmer").await.unwrap();
        daemon.register_device("node-3", "switch").await.unwrap();
        assert!(daemon.mark_stale("node-2", true).await);

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;
        let (_observer, mut inbox) = observer(&broker).await;

        assert!(requester.publish("", anonymous("discover")).await);
        let announced: Vec<DeviceEvent> = drain(&mut inbox, Duration::from_millis(200))
            .await
            .into_iter()
            .filter_map(|e| DeviceEvent::from_message(e.subject(), e.content()))
            .collect();

        assert_eq!(announced.len(), 2);
        assert!(announced.iter().all(|e| matches!(
            e,
            DeviceEvent::Announce { internal_id, handled_by, .. }
                if internal_id != "node-2" && handled_by == "zwave"
        )));

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn discover_with_all_devices_stale_announces_nothing() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let requester = client(&broker, "resolver").await;

        daemon.register_device("node-1", "switch").await.unwrap();
        daemon.mark_stale("node-1", true).await;

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;
        let (_observer, mut inbox) = observer(&broker).await;

        // A reply-to on a discovery request is never answered.
        let reply = requester
            .send_and_wait("", anonymous("discover"), Duration::from_millis(200))
            .await;
        assert!(reply.is_empty());

        let announces = drain(&mut inbox, Duration::from_millis(100))
            .await
            .into_iter()
            .filter(|e| e.subject() == ANNOUNCE)
            .count();
        assert_eq!(announces, 0);

        // Stale devices stay addressable.
        let uuid = daemon.resolve_uuid("node-1").unwrap();
        assert_eq!(daemon.resolve_internal_id(&uuid).as_deref(), Some("node-1"));

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn emit_event_injects_uuid() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "enviro").await;
        let uuid = daemon
            .register_device("sensor-1", "temperaturesensor")
            .await
            .unwrap();
        let (_observer, mut inbox) = observer(&broker).await;

        assert!(
            daemon
                .emit_event("sensor-1", "event.environment.temperaturechanged", 21.5, "degC")
                .await
        );

        let envelopes = drain(&mut inbox, Duration::from_millis(100)).await;
        assert_eq!(envelopes.len(), 1);
        let event = &envelopes[0];
        assert_eq!(event.subject(), "event.environment.temperaturechanged");

        let mut expected = ValueMap::new();
        expected.insert("level".to_string(), Value::Float64(21.5));
        expected.insert("unit".to_string(), Value::from("degC"));
        expected.insert("uuid".to_string(), Value::String(uuid));
        assert_eq!(event.content(), &expected);
    }
}

// ============================================================================
// Request/reply
// ============================================================================

mod request_reply {
    use super::*;

    fn inventory_with_controller() -> ValueMap {
        let controller: Value = std::iter::once(("devicetype", "agocontroller")).collect();
        let switch: Value = std::iter::once(("devicetype", "switch")).collect();
        let devices: Value = [("u-switch", switch), ("u-ctrl", controller)]
            .into_iter()
            .collect();

        let mut inventory = ValueMap::new();
        inventory.insert("devices".to_string(), devices);
        inventory
    }

    /// A filter-disabled daemon answering inventory requests.
    async fn resolver(broker: &MemoryBroker, calls: Arc<AtomicUsize>) -> AgoClient {
        let resolver = AgoClient::builder("resolver")
            .memory(broker)
            .without_persistence()
            .filter_commands(false)
            .receive_poll(Duration::from_millis(20))
            .connect()
            .await
            .unwrap();

        resolver.on_command(move |_, content| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match content.get_str("command") {
                    Some("inventory") => Ok::<_, CommandError>(inventory_with_controller()),
                    _ => Ok(response::success("seen")),
                }
            }
        });
        resolver
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "echo").await;
        let requester = client(&broker, "ui").await;
        let uuid = daemon.register_device("echo-1", "echo").await.unwrap();

        daemon.on_command(|_, content| async move {
            let mut data = ValueMap::new();
            data.insert(
                "tag".to_string(),
                content.get("tag").cloned().unwrap_or_default(),
            );
            Ok::<_, CommandError>(response::success_with(data))
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        let mut first = command(&uuid, "echo");
        first.insert("tag".to_string(), Value::from("first"));
        let mut second = command(&uuid, "echo");
        second.insert("tag".to_string(), Value::from("second"));

        let (a, b) = tokio::join!(
            requester.send_and_wait("", first, Duration::from_secs(1)),
            requester.send_and_wait("", second, Duration::from_secs(1)),
        );

        let tag = |reply: ValueMap| match Reply::from_map(reply) {
            Reply::Success(result) => result.get_str("tag").map(str::to_string),
            _ => None,
        };
        assert_eq!(tag(a).as_deref(), Some("first"));
        assert_eq!(tag(b).as_deref(), Some("second"));

        // Reply destinations are released after each call.
        assert_eq!(broker.subscriber_count(TOPIC), 1);

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_request_returns_empty_map_after_timeout() {
        let broker = MemoryBroker::new();
        let requester = client(&broker, "ui").await;

        let started = Instant::now();
        let reply = requester
            .send_and_wait("", anonymous("inventory"), Duration::from_millis(100))
            .await;
        let elapsed = started.elapsed();

        assert!(reply.is_empty());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn only_filter_disabled_daemons_answer_inventory() {
        let broker = MemoryBroker::new();
        let ordinary = client(&broker, "zwave").await;
        ordinary.register_device("node-1", "switch").await.unwrap();
        ordinary.on_command(|_, _| async move {
            Ok::<_, CommandError>(response::success("ordinary"))
        });
        let requester = AgoClient::builder("ui")
            .memory(&broker)
            .without_persistence()
            .inventory_timeout(Duration::from_millis(200))
            .connect()
            .await
            .unwrap();

        let ordinary_runner = spawn_run(&ordinary);
        wait_for_subscribers(&broker, 1).await;
        assert!(requester.inventory().await.is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(&broker, Arc::clone(&calls)).await;
        let resolver_runner = spawn_run(&resolver);
        wait_for_subscribers(&broker, 2).await;

        let inventory = requester.inventory().await;
        assert!(inventory.get("devices").is_some_and(|d| d.as_map().is_ok()));

        // Anonymous commands other than inventory reach the resolver's
        // handler but are never answered.
        let before = calls.load(Ordering::SeqCst);
        let reply = requester
            .send_and_wait("", anonymous("status"), Duration::from_millis(200))
            .await;
        assert!(reply.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), before + 1);

        ordinary.shutdown().await;
        resolver.shutdown().await;
        ordinary_runner.await.unwrap();
        resolver_runner.await.unwrap();
    }

    #[tokio::test]
    async fn resolve_controller_finds_agocontroller() {
        let broker = MemoryBroker::new();
        let resolver = resolver(&broker, Arc::new(AtomicUsize::new(0))).await;
        let runner = spawn_run(&resolver);
        wait_for_subscribers(&broker, 1).await;

        let requester = AgoClient::builder("ui")
            .memory(&broker)
            .without_persistence()
            .inventory_timeout(Duration::from_millis(200))
            .controller_lookup(RetryPolicy::new(3, Duration::from_millis(10)))
            .connect()
            .await
            .unwrap();

        assert_eq!(requester.resolve_controller().await.as_deref(), Some("u-ctrl"));

        resolver.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn resolve_controller_gives_up() {
        let broker = MemoryBroker::new();
        let requester = AgoClient::builder("ui")
            .memory(&broker)
            .without_persistence()
            .inventory_timeout(Duration::from_millis(30))
            .controller_lookup(RetryPolicy::new(2, Duration::from_millis(10)))
            .connect()
            .await
            .unwrap();

        assert_eq!(requester.resolve_controller().await, None);
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn shutdown_unblocks_run() {
        let broker = MemoryBroker::new();
        let daemon = AgoClient::builder("zwave")
            .memory(&broker)
            .without_persistence()
            .receive_poll(Duration::from_secs(30))
            .connect()
            .await
            .unwrap();

        let mut state = daemon.subscribe_state();
        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;
        assert_eq!(daemon.state(), DispatchState::Running);

        let mut signal = daemon.shutdown_signal();
        daemon.shutdown().await;
        assert!(*signal.borrow_and_update());

        timeout(Duration::from_secs(1), runner)
            .await
            .expect("dispatch loop did not stop")
            .unwrap();
        state
            .wait_for(|s| *s == DispatchState::Stopped)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatch_survives_broker_restart() {
        let broker = MemoryBroker::new();
        let daemon = AgoClient::builder("zwave")
            .memory(&broker)
            .without_persistence()
            .receive_poll(Duration::from_millis(20))
            .reconnection(
                ReconnectionPolicy::new()
                    .with_initial_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(20)),
            )
            .connect()
            .await
            .unwrap();
        let uuid = daemon.register_device("node-1", "switch").await.unwrap();
        daemon.on_command(|_, _| async move {
            Ok::<_, CommandError>(response::success("still here"))
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        broker.set_accepting(false);
        broker.disconnect_all();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.subscriber_count(TOPIC), 0);
        assert_eq!(daemon.state(), DispatchState::Running);

        broker.set_accepting(true);
        wait_for_subscribers(&broker, 1).await;

        let requester = client(&broker, "ui").await;
        let reply = requester
            .send_and_wait("", command(&uuid, "on"), Duration::from_secs(1))
            .await;
        assert!(matches!(Reply::from_map(reply), Reply::Success(_)));

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn extra_receiver_leaves_dispatch_session_intact() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;
        let uuid = daemon.register_device("node-1", "switch").await.unwrap();
        daemon.on_command(|_, _| async move {
            Ok::<_, CommandError>(response::success("on"))
        });

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;
        let before = daemon.connection().generation().await;

        let _extra = daemon.connection().receiver().await.unwrap();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(daemon.connection().generation().await, before);
        assert_eq!(broker.subscriber_count(TOPIC), 2);

        let requester = client(&broker, "ui").await;
        let reply = requester
            .send_and_wait("", command(&uuid, "on"), Duration::from_secs(1))
            .await;
        assert!(matches!(Reply::from_map(reply), Reply::Success(_)));

        daemon.shutdown().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_prompt_while_broker_stalls() {
        let broker = MemoryBroker::new();
        let daemon = client(&broker, "zwave").await;

        let runner = spawn_run(&daemon);
        wait_for_subscribers(&broker, 1).await;

        broker.set_handshake_delay(Duration::from_secs(30));
        broker.disconnect_all();
        sleep(Duration::from_millis(100)).await;

        timeout(Duration::from_secs(1), daemon.shutdown())
            .await
            .expect("shutdown blocked behind the reconnect");
        timeout(Duration::from_secs(1), runner)
            .await
            .expect("dispatch loop did not stop")
            .unwrap();
        assert_eq!(daemon.state(), DispatchState::Stopped);
    }
}
