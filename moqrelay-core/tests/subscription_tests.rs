//! End-to-end subscription fulfillment through the worker pool

mod common;

use bytes::Bytes;
use common::{connection, decode, wait_until, MockTransport};
use moqrelay_core::moqt::{GroupObject, SubscribeErrorCode};
use moqrelay_core::*;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    store: Arc<MemoryContentStore>,
    arena: Arc<ConnectionArena>,
    manager: SubscriptionManager,
    track: moqrelay_core::moqt::TrackIdentifier,
}

fn relay() -> Relay {
    let store = Arc::new(MemoryContentStore::new());
    let track = store.register_track(TrackNamespace::from(["live", "cam"]), "video");
    let arena = Arc::new(ConnectionArena::new());
    let manager = SubscriptionManager::new(
        store.clone(),
        arena.clone(),
        SubscriptionConfig {
            worker_threads: 2,
            idle_backoff: Duration::from_millis(1),
            live_tail_timeout: Some(WAIT),
            ..Default::default()
        },
    )
    .unwrap();
    Relay {
        store,
        arena,
        manager,
        track,
    }
}

fn subscribe(subscribe_id: u64, filter: SubscriptionFilter) -> SubscribeMessage {
    SubscribeMessage {
        subscribe_id,
        track_alias: 100 + subscribe_id,
        track_namespace: TrackNamespace::from(["live", "cam"]),
        track_name: "video".to_string(),
        filter,
        parameters: vec![],
    }
}

fn delivered(transport: &MockTransport) -> Vec<(u64, u64, Bytes)> {
    transport
        .data_sends()
        .into_iter()
        .map(|(_, data)| match decode(data) {
            Message::ObjectStream(object) => (object.group_id, object.object_id, object.payload),
            other => panic!("expected OBJECT_STREAM, got {:?}", other),
        })
        .collect()
}

fn control_messages(transport: &MockTransport) -> Vec<Message> {
    transport.control_sends().into_iter().map(decode).collect()
}

#[test]
fn test_absolute_range_delivers_inclusive_range_in_order() {
    let relay = relay();
    for (group, object) in [(0, 0), (0, 1), (1, 0), (1, 1), (2, 0)] {
        relay
            .store
            .publish(relay.track, group, object, format!("{}/{}", group, object))
            .unwrap();
    }

    let (transport, connection) = connection(8);
    let handle = relay.arena.insert(connection);
    relay
        .manager
        .add_subscription(
            handle,
            subscribe(
                1,
                SubscriptionFilter::AbsoluteRange {
                    start: GroupObject::new(0, 1),
                    end: GroupObject::new(1, 1),
                },
            ),
        )
        .unwrap();

    assert!(wait_until(WAIT, || transport.data_sends().len() == 3));
    assert!(wait_until(WAIT, || relay.manager.active_subscriptions() == 0));

    let objects: Vec<(u64, u64)> = delivered(&transport)
        .into_iter()
        .map(|(g, o, _)| (g, o))
        .collect();
    assert_eq!(objects, vec![(0, 1), (1, 0), (1, 1)]);

    match &control_messages(&transport)[0] {
        Message::SubscribeOk(ok) => {
            assert_eq!(ok.subscribe_id, 1);
            assert_eq!(ok.largest, Some(GroupObject::new(2, 0)));
        }
        other => panic!("expected SUBSCRIBE_OK, got {:?}", other),
    }
}

#[test]
fn test_latest_group_without_content_fails() {
    let relay = relay();
    let (transport, connection) = connection(8);
    let handle = relay.arena.insert(connection);

    relay
        .manager
        .add_subscription(handle, subscribe(5, SubscriptionFilter::LatestGroup))
        .unwrap();

    assert!(wait_until(WAIT, || !transport.control_sends().is_empty()));
    match &control_messages(&transport)[0] {
        Message::SubscribeError(error) => {
            assert_eq!(error.subscribe_id, 5);
            assert_eq!(error.track_alias, 105);
            assert_eq!(error.error_code, SubscribeErrorCode::TrackDoesNotExist.code());
        }
        other => panic!("expected SUBSCRIBE_ERROR, got {:?}", other),
    }
    assert!(wait_until(WAIT, || relay.manager.active_subscriptions() == 0));
    assert!(transport.data_sends().is_empty());
}

#[test]
fn test_live_tail_follows_new_groups_until_finished() {
    let relay = relay();
    relay.store.publish(relay.track, 0, 0, &b"a"[..]).unwrap();

    let (transport, connection) = connection(8);
    let handle = relay.arena.insert(connection);
    relay
        .manager
        .add_subscription(
            handle,
            subscribe(
                2,
                SubscriptionFilter::AbsoluteStart {
                    start: GroupObject::new(0, 0),
                },
            ),
        )
        .unwrap();
    assert!(wait_until(WAIT, || transport.data_sends().len() == 1));

    relay.store.publish(relay.track, 0, 1, &b"b"[..]).unwrap();
    assert!(wait_until(WAIT, || transport.data_sends().len() == 2));

    relay.store.publish(relay.track, 1, 0, &b"c"[..]).unwrap();
    assert!(wait_until(WAIT, || transport.data_sends().len() == 3));

    relay.store.finish_track(relay.track).unwrap();
    assert!(wait_until(WAIT, || relay.manager.active_subscriptions() == 0));

    let payloads: Vec<Bytes> = delivered(&transport)
        .into_iter()
        .map(|(_, _, payload)| payload)
        .collect();
    assert_eq!(payloads, vec!["a", "b", "c"]);
}

#[test]
fn test_expired_connection_dropped_silently() {
    let relay = relay();
    relay.store.publish(relay.track, 0, 0, &b"a"[..]).unwrap();

    let (transport, connection) = connection(8);
    let handle = relay.arena.insert(connection);
    relay.arena.remove(handle);

    assert_eq!(
        relay
            .manager
            .add_subscription(handle, subscribe(3, SubscriptionFilter::LatestObject)),
        Err(MoqtError::ConnectionExpired)
    );

    assert_eq!(relay.manager.pending_requests(), 0);
    assert_eq!(relay.manager.active_subscriptions(), 0);
    std::thread::sleep(Duration::from_millis(20));
    assert!(transport.control_sends().is_empty());
    assert!(transport.data_sends().is_empty());
}

#[test]
fn test_connection_removed_mid_subscription() {
    let relay = relay();
    relay.store.publish(relay.track, 0, 0, &b"a"[..]).unwrap();

    let (transport, connection) = connection(8);
    let handle = relay.arena.insert(connection);
    relay
        .manager
        .add_subscription(handle, subscribe(4, SubscriptionFilter::LatestGroup))
        .unwrap();
    assert!(wait_until(WAIT, || transport.data_sends().len() == 1));

    relay.arena.remove(handle);
    relay.store.publish(relay.track, 0, 1, &b"b"[..]).unwrap();

    assert!(wait_until(WAIT, || relay.manager.active_subscriptions() == 0));
    assert_eq!(transport.data_sends().len(), 1);

    // Removal is silent: the only control message is the SUBSCRIBE_OK
    let messages = control_messages(&transport);
    assert_eq!(messages.len(), 1);
    assert!(matches!(
        &messages[0],
        Message::SubscribeOk(ok) if ok.subscribe_id == 4
    ));
}

#[test]
fn test_unsubscribe_stops_delivery_and_frees_the_id() {
    let relay = relay();
    relay.store.publish(relay.track, 0, 0, &b"a"[..]).unwrap();

    let (transport, connection) = connection(8);
    let handle = relay.arena.insert(connection.clone());
    let from_start = || {
        subscribe(
            6,
            SubscriptionFilter::AbsoluteStart {
                start: GroupObject::new(0, 0),
            },
        )
    };
    relay.manager.add_subscription(handle, from_start()).unwrap();
    assert!(wait_until(WAIT, || transport.data_sends().len() == 1));

    assert!(connection.cancel_subscription(6));
    assert!(wait_until(WAIT, || relay.manager.active_subscriptions() == 0));
    assert!(wait_until(WAIT, || connection.subscription_count() == 0));

    relay.store.publish(relay.track, 0, 1, &b"b"[..]).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(transport.data_sends().len(), 1);

    // Same id again after the cancel took effect
    relay.manager.add_subscription(handle, from_start()).unwrap();
    assert!(wait_until(WAIT, || transport.data_sends().len() == 3));
    let payloads: Vec<Bytes> = delivered(&transport)
        .into_iter()
        .map(|(_, _, payload)| payload)
        .collect();
    assert_eq!(payloads, vec!["a", "a", "b"]);
}
