use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::{PingreqPacket, VariablePacket};
use mqtt::QualityOfService;
use std::net::SocketAddr;
use std::time::Duration;
use tinymq::{server, Client, Connection, READ_TIMEOUT};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A connect followed by a ping round-trip: the handshake is accepted and
/// the session is alive.
#[tokio::test]
async fn handshake_and_ping() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr, "c1").await.unwrap();

    client.ping().await.unwrap();
}

/// One publication reaches every subscriber of the topic, and nobody else.
#[tokio::test]
async fn publish_fans_out_to_every_subscriber() {
    let (addr, _) = start_server().await;

    let mut s1 = Client::connect(addr, "s1").await.unwrap();
    let mut s2 = Client::connect(addr, "s2").await.unwrap();
    s1.subscribe(&["t/1"], QualityOfService::Level0)
        .await
        .unwrap();
    s2.subscribe(&["t/1"], QualityOfService::Level0)
        .await
        .unwrap();

    let mut p1 = Client::connect(addr, "p1").await.unwrap();
    p1.publish("t/1", vec![0xde, 0xad, 0xbe, 0xef])
        .await
        .unwrap();

    for subscriber in [&mut s1, &mut s2] {
        let publish = subscriber.next_publish().await.unwrap().unwrap();
        assert_eq!(publish.topic_name(), "t/1");
        assert_eq!(publish.payload().to_vec(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    // The publisher is not subscribed and receives nothing additional.
    assert!(timeout(Duration::from_millis(500), p1.next_publish())
        .await
        .is_err());
}

/// The first packet on the wire must be CONNECT; anything else ends the
/// connection with a plain socket close, no error frame.
#[tokio::test]
async fn non_connect_first_packet_is_fatal() {
    let (addr, _) = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection
        .write_packet(&VariablePacket::PingreqPacket(PingreqPacket::new()))
        .await
        .unwrap();

    let next = timeout(Duration::from_secs(2), connection.read_packet())
        .await
        .expect("socket was not closed");
    assert!(matches!(next, Ok(None) | Err(_)));
}

/// A QoS 2 subscription request is granted at most QoS 1.
#[tokio::test]
async fn subscribe_qos2_is_downgraded() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr, "c1").await.unwrap();

    let codes = client
        .subscribe(&["a"], QualityOfService::Level2)
        .await
        .unwrap();

    assert_eq!(codes, vec![SubscribeReturnCode::MaximumQoSLevel1]);
}

/// A QoS 1 publish into the void is still acknowledged, and the publisher's
/// connection stays healthy.
#[tokio::test]
async fn qos1_publish_to_unknown_topic_is_acked() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr, "p1").await.unwrap();

    client
        .publish_qos1("nobody", b"payload".to_vec())
        .await
        .unwrap();

    client.ping().await.unwrap();
}

/// No self-delivery suppression exists: a subscriber that publishes to its
/// own topic gets the message back.
#[tokio::test]
async fn subscriber_receives_its_own_publications() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr, "c1").await.unwrap();

    client
        .subscribe(&["loop"], QualityOfService::Level0)
        .await
        .unwrap();
    client.publish("loop", b"echo".to_vec()).await.unwrap();

    let publish = client.next_publish().await.unwrap().unwrap();
    assert_eq!(publish.topic_name(), "loop");
    assert_eq!(publish.payload().to_vec(), b"echo".to_vec());
}

/// One broadcast stamps one broker-assigned id: QoS 1 deliveries of the same
/// publication carry identical packet identifiers on every subscriber's wire.
#[tokio::test]
async fn qos1_deliveries_share_the_broker_assigned_id() {
    let (addr, _) = start_server().await;

    let mut s1 = Client::connect(addr, "s1").await.unwrap();
    let mut s2 = Client::connect(addr, "s2").await.unwrap();
    s1.subscribe(&["t/q"], QualityOfService::Level1)
        .await
        .unwrap();
    s2.subscribe(&["t/q"], QualityOfService::Level1)
        .await
        .unwrap();

    let mut p1 = Client::connect(addr, "p1").await.unwrap();
    p1.publish_qos1("t/q", b"x".to_vec()).await.unwrap();

    let first = s1.next_publish().await.unwrap().unwrap();
    let second = s2.next_publish().await.unwrap().unwrap();
    match (first.qos(), second.qos()) {
        (QoSWithPacketIdentifier::Level1(a), QoSWithPacketIdentifier::Level1(b)) => {
            assert_eq!(a, b)
        }
        other => panic!("expected two QoS 1 deliveries, got {other:?}"),
    }
}

/// After UNSUBSCRIBE, deliveries stop; other subscribers are unaffected.
#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (addr, _) = start_server().await;

    let mut fickle = Client::connect(addr, "fickle").await.unwrap();
    let mut steady = Client::connect(addr, "steady").await.unwrap();
    fickle
        .subscribe(&["t/1"], QualityOfService::Level0)
        .await
        .unwrap();
    steady
        .subscribe(&["t/1"], QualityOfService::Level0)
        .await
        .unwrap();

    let mut publisher = Client::connect(addr, "p1").await.unwrap();
    publisher.publish("t/1", b"one".to_vec()).await.unwrap();
    assert_eq!(
        fickle.next_publish().await.unwrap().unwrap().payload().to_vec(),
        b"one".to_vec()
    );
    assert_eq!(
        steady.next_publish().await.unwrap().unwrap().payload().to_vec(),
        b"one".to_vec()
    );

    fickle.unsubscribe(&["t/1"]).await.unwrap();
    publisher.publish("t/1", b"two".to_vec()).await.unwrap();

    assert_eq!(
        steady.next_publish().await.unwrap().unwrap().payload().to_vec(),
        b"two".to_vec()
    );
    assert!(timeout(Duration::from_millis(500), fickle.next_publish())
        .await
        .is_err());
}

/// A subscriber that stops reading is severed by the broker once its
/// bounded write queue fills; a healthy subscriber of the same topic keeps
/// receiving everything.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_subscriber_is_severed_without_hurting_others() {
    let (addr, _) = start_server().await;

    let mut stalled = Client::connect(addr, "stalled").await.unwrap();
    stalled
        .subscribe(&["t/flood"], QualityOfService::Level0)
        .await
        .unwrap();
    let mut healthy = Client::connect(addr, "healthy").await.unwrap();
    healthy
        .subscribe(&["t/flood"], QualityOfService::Level0)
        .await
        .unwrap();

    // From here on `stalled` never reads its socket again. The payload is
    // large enough that the kernel buffers on both sides fill long before
    // the broker's 256-slot write queue does, so the queue must overflow
    // within the flood.
    let payload = vec![0u8; 256 * 1024];
    let total = 320usize;

    let reader = tokio::spawn(async move {
        let mut received = 0usize;
        while received < total {
            match healthy.next_publish().await {
                Ok(Some(_)) => received += 1,
                _ => break,
            }
        }
        received
    });

    let mut publisher = Client::connect(addr, "p1").await.unwrap();
    for _ in 0..total {
        publisher.publish("t/flood", payload.clone()).await.unwrap();
    }

    // The healthy subscriber sees the entire flood.
    assert_eq!(reader.await.unwrap(), total);

    // The stalled one was cut off: draining its socket ends in a close well
    // short of the full flood.
    let mut drained = 0usize;
    loop {
        match timeout(Duration::from_secs(5), stalled.next_publish()).await {
            Ok(Ok(Some(_))) => drained += 1,
            _ => break,
        }
    }
    assert!(drained < total, "stalled subscriber got all {total} messages");
}

/// A connection with no peer activity is reaped within the read deadline.
#[tokio::test]
async fn idle_connection_is_reaped_by_the_read_deadline() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr, "idle").await.unwrap();

    // Stay silent past the deadline; the broker must close the socket.
    match timeout(READ_TIMEOUT + Duration::from_secs(2), client.next_publish()).await {
        Ok(Ok(None)) | Ok(Err(_)) => {}
        Ok(Ok(Some(publish))) => panic!("unexpected publish: {publish:?}"),
        Err(_) => panic!("connection outlived the read deadline"),
    }
}

/// Completing the shutdown future stops the listener and drains in-flight
/// connections cooperatively.
#[tokio::test]
async fn graceful_shutdown_severs_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server::run(listener, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    let mut client = Client::connect(addr, "c1").await.unwrap();
    client
        .subscribe(&["t/1"], QualityOfService::Level0)
        .await
        .unwrap();

    shutdown_tx.send(()).unwrap();

    // `run` returns once the connection has drained.
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not drain in time")
        .unwrap();

    // The client observes a clean socket close, no error frames.
    let next = timeout(Duration::from_secs(2), client.next_publish())
        .await
        .expect("socket was not closed");
    assert!(matches!(next, Ok(None) | Err(_)));
}

async fn start_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        server::run(listener, std::future::pending::<()>()).await;
    });

    (addr, handle)
}
