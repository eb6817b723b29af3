//! Loopback tests: quinn clients and `MoqClient` talking to a served relay

use bytes::{Bytes, BytesMut};
use moqrelay::moqt::{
    ClientSetupMessage, GroupObject, Parameter, SubscribeErrorCode, TrackStatusCode,
    TrackStatusRequestMessage,
};
use moqrelay::*;
use quinn::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const VERSION: u64 = 0xff00_0005;
const WAIT: Duration = Duration::from_secs(10);

struct Loopback {
    relay: MoqRelay,
    client: quinn::Endpoint,
    server_addr: SocketAddr,
}

fn loopback(store: Arc<MemoryContentStore>) -> Loopback {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

    let server_config =
        quinn::ServerConfig::with_single_cert(vec![cert_der.clone()], key_der).unwrap();
    let server = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut roots = quinn::rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let mut client = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    client.set_default_client_config(
        quinn::ClientConfig::with_root_certificates(Arc::new(roots)).unwrap(),
    );

    let config = RelayConfig {
        supported_versions: vec![VERSION],
        worker_threads: 1,
        ..Default::default()
    };
    let relay = MoqRelay::new(config, store).unwrap();
    let serving = relay.clone();
    tokio::spawn(async move { serving.serve(server).await });

    Loopback {
        relay,
        client,
        server_addr,
    }
}

fn frame(message: Message) -> Bytes {
    let mut buf = BytesMut::new();
    message.serialize(&mut buf).unwrap();
    buf.freeze()
}

/// Read from the control stream until `count` messages are decoded
async fn read_control(recv: &mut quinn::RecvStream, count: usize) -> Vec<Message> {
    let mut pending = BytesMut::new();
    let mut messages = Vec::new();
    while messages.len() < count {
        let chunk = timeout(WAIT, recv.read_chunk(4096, true))
            .await
            .expect("control read timed out")
            .unwrap()
            .expect("control stream finished early");
        pending.extend_from_slice(&chunk.bytes);

        loop {
            let mut candidate = pending.clone().freeze();
            match WireFormat::deserialize_message(&mut candidate) {
                Ok(message) => {
                    let consumed = pending.len() - candidate.len();
                    let _ = pending.split_to(consumed);
                    messages.push(message);
                }
                Err(MoqtError::Truncated { .. }) => break,
                Err(e) => panic!("bad control message: {}", e),
            }
        }
    }
    messages
}

async fn setup(connection: &quinn::Connection) -> (quinn::SendStream, quinn::RecvStream) {
    let (mut send, mut recv) = connection.open_bi().await.unwrap();
    send.write_all(&frame(Message::ClientSetup(ClientSetupMessage {
        supported_versions: vec![1, VERSION],
        parameters: vec![Parameter::role(Role::Subscriber)],
    })))
    .await
    .unwrap();

    match &read_control(&mut recv, 1).await[0] {
        Message::ServerSetup(reply) => {
            assert_eq!(reply.selected_version, VERSION);
            assert_eq!(reply.role(), Some(Role::Publisher));
        }
        other => panic!("expected SERVER_SETUP, got {:?}", other),
    }
    (send, recv)
}

#[tokio::test]
async fn test_subscribe_over_quic() {
    let store = Arc::new(MemoryContentStore::new());
    let track = store.register_track(TrackNamespace::from(["live"]), "video");
    for object in 0..3 {
        store
            .publish(track, 0, object, format!("payload-{}", object))
            .unwrap();
    }
    store.finish_track(track).unwrap();

    let loopback = loopback(store);
    let connection = loopback
        .client
        .connect(loopback.server_addr, "localhost")
        .unwrap()
        .await
        .unwrap();
    let (mut send, mut recv) = setup(&connection).await;

    send.write_all(&frame(Message::Subscribe(SubscribeMessage {
        subscribe_id: 1,
        track_alias: 9,
        track_namespace: TrackNamespace::from(["live"]),
        track_name: "video".to_string(),
        filter: SubscriptionFilter::AbsoluteStart {
            start: GroupObject::new(0, 0),
        },
        parameters: vec![],
    })))
    .await
    .unwrap();

    match &read_control(&mut recv, 1).await[0] {
        Message::SubscribeOk(ok) => {
            assert_eq!(ok.subscribe_id, 1);
            assert_eq!(ok.largest, Some(GroupObject::new(0, 2)));
        }
        other => panic!("expected SUBSCRIBE_OK, got {:?}", other),
    }

    let mut objects = Vec::new();
    for _ in 0..3 {
        let mut data = timeout(WAIT, connection.accept_uni())
            .await
            .expect("data stream timed out")
            .unwrap();
        let body = data.read_to_end(64 * 1024).await.unwrap();
        match WireFormat::deserialize_message(&mut Bytes::from(body)).unwrap() {
            Message::ObjectStream(object) => {
                assert_eq!(object.track_alias, 9);
                objects.push((object.object_id, object.payload));
            }
            other => panic!("expected OBJECT_STREAM, got {:?}", other),
        }
    }
    objects.sort_by_key(|(id, _)| *id);
    assert_eq!(
        objects,
        vec![
            (0, Bytes::from("payload-0")),
            (1, Bytes::from("payload-1")),
            (2, Bytes::from("payload-2")),
        ]
    );

    assert_eq!(loopback.relay.connection_count(), 1);
    connection.close(0u32.into(), b"done");
    let deadline = tokio::time::Instant::now() + WAIT;
    while loopback.relay.connection_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(loopback.relay.connection_count(), 0);
}

#[tokio::test]
async fn test_track_status_over_quic() {
    let store = Arc::new(MemoryContentStore::new());
    let track = store.register_track(TrackNamespace::from(["live"]), "audio");
    store.publish(track, 4, 1, &b"x"[..]).unwrap();

    let loopback = loopback(store);
    let connection = loopback
        .client
        .connect(loopback.server_addr, "localhost")
        .unwrap()
        .await
        .unwrap();
    let (mut send, mut recv) = setup(&connection).await;

    send.write_all(&frame(Message::TrackStatusRequest(
        TrackStatusRequestMessage {
            track_namespace: TrackNamespace::from(["live"]),
            track_name: "audio".to_string(),
        },
    )))
    .await
    .unwrap();

    match &read_control(&mut recv, 1).await[0] {
        Message::TrackStatus(status) => {
            assert_eq!(status.status_code, TrackStatusCode::InProgress.code());
            assert_eq!((status.last_group_id, status.last_object_id), (4, 1));
        }
        other => panic!("expected TRACK_STATUS, got {:?}", other),
    }
}

#[tokio::test]
async fn test_version_mismatch_closes_connection() {
    let loopback = loopback(Arc::new(MemoryContentStore::new()));
    let connection = loopback
        .client
        .connect(loopback.server_addr, "localhost")
        .unwrap()
        .await
        .unwrap();

    let (mut send, _recv) = connection.open_bi().await.unwrap();
    send.write_all(&frame(Message::ClientSetup(ClientSetupMessage {
        supported_versions: vec![1],
        parameters: vec![],
    })))
    .await
    .unwrap();

    let reason = timeout(WAIT, connection.closed())
        .await
        .expect("relay did not close the connection");
    match reason {
        quinn::ConnectionError::ApplicationClosed(close) => {
            assert_eq!(
                close.error_code.into_inner(),
                TerminationCode::ProtocolViolation.code()
            );
        }
        other => panic!("unexpected close: {:?}", other),
    }
}

async fn client(loopback: &Loopback, versions: Vec<u64>) -> MoqClient {
    let config = ClientConfig {
        supported_versions: versions,
        path: Some("/relay".to_string()),
        ..Default::default()
    };
    MoqClient::connect(
        &loopback.client,
        loopback.server_addr,
        "localhost",
        config,
        ConnectionConfig::default(),
    )
    .await
    .unwrap()
}

async fn next_events(client: &mut MoqClient, count: usize) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        let event = timeout(WAIT, client.next_event())
            .await
            .expect("client event timed out")
            .expect("client connection ended early");
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_client_subscribes_through_relay() {
    let store = Arc::new(MemoryContentStore::new());
    let track = store.register_track(TrackNamespace::from(["live"]), "video");
    for object in 0..3 {
        store
            .publish(track, 0, object, format!("payload-{}", object))
            .unwrap();
    }
    store.finish_track(track).unwrap();

    let loopback = loopback(store);
    let mut client = client(&loopback, vec![1, VERSION]).await;
    let setup = timeout(WAIT, client.wait_for_setup())
        .await
        .expect("setup timed out")
        .unwrap();
    assert_eq!(setup.version, Some(VERSION));
    assert_eq!(setup.peer_role, Some(Role::Publisher));

    let request = |subscribe_id, track_alias, track_name: &str, filter| SubscribeMessage {
        subscribe_id,
        track_alias,
        track_namespace: TrackNamespace::from(["live"]),
        track_name: track_name.to_string(),
        filter,
        parameters: vec![],
    };
    client
        .subscribe(request(
            1,
            9,
            "video",
            SubscriptionFilter::AbsoluteStart {
                start: GroupObject::new(0, 0),
            },
        ))
        .unwrap();
    client
        .subscribe(request(2, 10, "missing", SubscriptionFilter::LatestGroup))
        .unwrap();
    client
        .request_track_status(TrackNamespace::from(["live"]), "video")
        .unwrap();

    // Control replies and object streams interleave freely
    let (mut acks, mut errors, mut statuses, mut objects) = (vec![], vec![], vec![], vec![]);
    for event in next_events(&mut client, 6).await {
        match event {
            ClientEvent::SubscribeOk(ok) => acks.push(ok),
            ClientEvent::SubscribeError(error) => errors.push(error),
            ClientEvent::TrackStatus(status) => statuses.push(status),
            ClientEvent::Object(object) => objects.push(object),
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].subscribe_id, 1);
    assert_eq!(acks[0].largest, Some(GroupObject::new(0, 2)));

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].subscribe_id, 2);
    assert_eq!(errors[0].error_code, SubscribeErrorCode::TrackDoesNotExist.code());

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status_code, TrackStatusCode::Finished.code());

    objects.sort_by_key(|object| object.object_id);
    let received: Vec<(u64, u64, Bytes)> = objects
        .into_iter()
        .map(|object| (object.track_alias, object.object_id, object.payload))
        .collect();
    assert_eq!(
        received,
        vec![
            (9, 0, Bytes::from("payload-0")),
            (9, 1, Bytes::from("payload-1")),
            (9, 2, Bytes::from("payload-2")),
        ]
    );
    assert_eq!(client.stats().objects_received, 3);

    assert_eq!(loopback.relay.connection_count(), 1);
    drop(client);
    let deadline = tokio::time::Instant::now() + WAIT;
    while loopback.relay.connection_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(loopback.relay.connection_count(), 0);
}

#[tokio::test]
async fn test_client_without_common_version_is_rejected() {
    let loopback = loopback(Arc::new(MemoryContentStore::new()));
    let mut client = client(&loopback, vec![1]).await;

    let result = timeout(WAIT, client.wait_for_setup())
        .await
        .expect("relay did not end the session");
    assert_eq!(result, Err(MoqtError::ConnectionExpired));
    assert!(client.next_event().await.is_none());
}
