//! Integration tests for procbus.
//!
//! These tests run real workers against each other over loopback sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use procbus::codec::{Codec, JsonCodec, MsgPackCodec};
use procbus::protocol::{FrameBuffer, MessageBuilder, MessageType, WireMessage};
use procbus::{
    CancellationToken, Endpoint, HandlerError, HandlerRegistry, InMemoryBroker, IpcError,
    TcpOptions, TcpWorker, UdpOptions, UdpWorker,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn doubling_handlers() -> HandlerRegistry<MsgPackCodec> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(|n: i32| async move { Ok::<_, HandlerError>(n * 2) });
    handlers
}

fn tcp_worker(
    port: u16,
    server: bool,
    handlers: HandlerRegistry<MsgPackCodec>,
) -> TcpWorker {
    TcpWorker::new(
        TcpOptions::new(Endpoint::inet("127.0.0.1", port)).host_as_server(server),
        Arc::new(handlers),
        Arc::new(InMemoryBroker::new()),
    )
}

/// A request frame split across reads reassembles into the same header.
#[test]
fn test_fragmented_request_frame() {
    type Builder = MessageBuilder<MsgPackCodec>;

    let frame = Builder::request("Query", "Answer", 17, &vec![1u32, 2, 3]).unwrap();
    let mut buffer = FrameBuffer::new();

    let (head, tail) = frame.split_at(7);
    assert!(buffer.push(head).unwrap().is_empty());
    let payloads = buffer.push(tail).unwrap();
    assert_eq!(payloads.len(), 1);

    let message = WireMessage::decode(payloads[0].clone()).unwrap();
    assert_eq!(message.message_type, MessageType::RemoteRequest);

    let header = Builder::read_request_header(&message.key).unwrap();
    assert_eq!(header.id, 17);
    assert_eq!(header.request_type, "Query");
    assert_eq!(header.response_type, "Answer");

    let body: Vec<u32> = MsgPackCodec::decode(&message.value).unwrap();
    assert_eq!(body, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_udp_publish_delivered_once() {
    let endpoint = Endpoint::inet("127.0.0.1", free_udp_port());

    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = broker
        .subscribe::<MsgPackCodec, _, String, _>(&7i32, move |message| {
            let _ = tx.send(message);
        })
        .unwrap();

    let server: UdpWorker = UdpWorker::new(
        UdpOptions::new(endpoint.clone()).host_as_server(true),
        Arc::new(HandlerRegistry::new()),
        Arc::new(broker),
    );
    server.start().await.unwrap();

    let client: UdpWorker = UdpWorker::new(
        UdpOptions::new(endpoint),
        Arc::new(HandlerRegistry::new()),
        Arc::new(InMemoryBroker::new()),
    );
    client.publish(&7i32, "ping").await.unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, "ping");
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_tcp_request_response() {
    let port = free_tcp_port();
    let server = tcp_worker(port, true, doubling_handlers());
    server.start().await.unwrap();

    let client = tcp_worker(port, false, HandlerRegistry::new());
    let doubled: i32 = timeout(WAIT, client.request::<i32, i32>(&42))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(doubled, 84);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_tcp_request_from_server_to_client() {
    let port = free_tcp_port();
    let server = tcp_worker(port, true, HandlerRegistry::new());
    server.start().await.unwrap();

    let client = tcp_worker(port, false, doubling_handlers());
    client.start().await.unwrap();

    let doubled: i32 = timeout(WAIT, server.request::<i32, i32>(&21))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doubled, 42);
}

#[tokio::test]
async fn test_remote_failure_surfaces_diagnostic() {
    let port = free_tcp_port();
    let mut handlers = HandlerRegistry::new();
    handlers.register(|_: String| async move { Err::<String, HandlerError>("bad input".into()) });
    let server = tcp_worker(port, true, handlers);
    server.start().await.unwrap();

    let client = tcp_worker(port, false, HandlerRegistry::new());
    let result = timeout(WAIT, client.request::<String, String>(&"x".to_string()))
        .await
        .unwrap();

    match result {
        Err(IpcError::RemoteExecution(message)) => assert!(message.contains("bad input")),
        other => panic!("expected a remote execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_remote_handler_names_types() {
    let port = free_tcp_port();
    let server = tcp_worker(port, true, HandlerRegistry::new());
    server.start().await.unwrap();

    let client = tcp_worker(port, false, HandlerRegistry::new());
    let result = timeout(
        WAIT,
        client.request_named::<_, i32>("Ping", "Pong", &1i32, &CancellationToken::new()),
    )
    .await
    .unwrap();

    match result {
        Err(IpcError::RemoteExecution(message)) => assert!(message.contains("Ping -> Pong")),
        other => panic!("expected a remote execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_server_accepts_next_client() {
    let port = free_tcp_port();
    let server = tcp_worker(port, true, doubling_handlers());
    server.start().await.unwrap();

    let first = tcp_worker(port, false, HandlerRegistry::new());
    assert_eq!(timeout(WAIT, first.request::<i32, i32>(&1)).await.unwrap().unwrap(), 2);
    drop(first);

    let second = tcp_worker(port, false, HandlerRegistry::new());
    assert_eq!(timeout(WAIT, second.request::<i32, i32>(&2)).await.unwrap().unwrap(), 4);
}

#[cfg(unix)]
#[tokio::test]
async fn test_pipe_server_keeps_subscriptions_across_clients() {
    use procbus::{PipeOptions, PipeWorker};

    let dir = tempfile::tempdir().unwrap();
    let name = dir.path().join("bus.sock").to_string_lossy().into_owned();

    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = broker
        .subscribe::<MsgPackCodec, _, i32, _>("events", move |n| {
            let _ = tx.send(n);
        })
        .unwrap();

    let server: PipeWorker = PipeWorker::new(
        PipeOptions::new(name.clone()).host_as_server(true),
        Arc::new(HandlerRegistry::new()),
        Arc::new(broker),
    )
    .unwrap();
    server.start().await.unwrap();

    for n in [5, 6] {
        let client: PipeWorker = PipeWorker::new(
            PipeOptions::new(name.clone()),
            Arc::new(HandlerRegistry::new()),
            Arc::new(InMemoryBroker::new()),
        )
        .unwrap();
        client.publish("events", &n).await.unwrap();
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), n);
    }

    drop(server);
    timeout(WAIT, async {
        while std::path::Path::new(&name).exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("socket file removed after dispose");
}

fn udp_pair(port: u16, broker: InMemoryBroker) -> (UdpWorker, UdpWorker) {
    let server = UdpWorker::new(
        UdpOptions::new(Endpoint::inet("127.0.0.1", port)).host_as_server(true),
        Arc::new(HandlerRegistry::new()),
        Arc::new(broker),
    );
    let client = UdpWorker::new(
        UdpOptions::new(Endpoint::inet("127.0.0.1", port)),
        Arc::new(HandlerRegistry::new()),
        Arc::new(InMemoryBroker::new()),
    );
    (server, client)
}

#[tokio::test]
async fn test_forged_datagram_reported_once() {
    let port = free_udp_port();
    let reports = Arc::new(AtomicUsize::new(0));
    let counter = reports.clone();

    let server: UdpWorker = UdpWorker::new(
        UdpOptions::new(Endpoint::inet("127.0.0.1", port))
            .host_as_server(true)
            .unhandled_error_handler(move |context, error| {
                assert_eq!(context, "datagram framing");
                assert!(matches!(error, IpcError::DatagramLengthMismatch { .. }));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        Arc::new(HandlerRegistry::new()),
        Arc::new(InMemoryBroker::new()),
    );
    server.start().await.unwrap();

    // An unrelated pair on another port keeps working throughout.
    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = broker
        .subscribe::<MsgPackCodec, _, u32, _>("tick", move |n| {
            let _ = tx.send(n);
        })
        .unwrap();
    let (other_server, other_client) = udp_pair(free_udp_port(), broker);
    other_server.start().await.unwrap();
    other_client.publish("tick", &1u32).await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), 1);

    let mut forged = MessageBuilder::<MsgPackCodec>::pub_sub("k", "v").unwrap();
    forged[0] = forged[0].wrapping_add(3);
    let valid = MessageBuilder::<MsgPackCodec>::pub_sub("k", "v").unwrap();

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.send_to(&forged, ("127.0.0.1", port)).unwrap();
    socket.send_to(&forged, ("127.0.0.1", port)).unwrap();
    socket.send_to(&valid, ("127.0.0.1", port)).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(reports.load(Ordering::SeqCst), 1);

    // The broken worker refuses further traffic instead of queueing it.
    assert!(matches!(
        server.publish("k", "v").await,
        Err(IpcError::ConnectionClosed)
    ));
    assert!(matches!(
        timeout(WAIT, server.request::<i32, i32>(&1)).await.unwrap(),
        Err(IpcError::ConnectionClosed)
    ));
    assert_eq!(server.pending_requests(), 0);

    for n in 2..5u32 {
        other_client.publish("tick", &n).await.unwrap();
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), n);
    }
}

#[tokio::test]
async fn test_reply_never_reaches_next_client() {
    let port = free_tcp_port();
    let mut handlers = HandlerRegistry::new();
    handlers.register(|n: u64| async move {
        tokio::time::sleep(Duration::from_millis(n)).await;
        Ok::<_, HandlerError>(n * 2)
    });
    let server = tcp_worker(port, true, handlers);
    server.start().await.unwrap();

    let first = Arc::new(tcp_worker(port, false, HandlerRegistry::new()));
    let abandoned = {
        let first = first.clone();
        tokio::spawn(async move { first.request::<u64, u64>(&300).await })
    };
    timeout(WAIT, async {
        while first.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.dispose();
    assert!(matches!(
        timeout(WAIT, abandoned).await.unwrap().unwrap(),
        Err(IpcError::Cancelled)
    ));

    let second = tcp_worker(port, false, HandlerRegistry::new());
    let answer: u64 = timeout(WAIT, second.request::<u64, u64>(&1000))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, 2000);
}

#[tokio::test]
async fn test_concurrent_first_requests_share_connect_failure() {
    let client = Arc::new(tcp_worker(free_tcp_port(), false, HandlerRegistry::new()));

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.request::<i32, i32>(&i).await })
        })
        .collect();

    for call in calls {
        let result = timeout(WAIT, call).await.expect("request settles").unwrap();
        assert!(matches!(result, Err(IpcError::ConnectionFailed(_))));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_dispose_cancels_pending_request() {
    let port = free_tcp_port();
    let mut handlers = HandlerRegistry::new();
    handlers.register(|n: i32| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, HandlerError>(n)
    });
    let server = tcp_worker(port, true, handlers);
    server.start().await.unwrap();

    let client = Arc::new(tcp_worker(port, false, HandlerRegistry::new()));
    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.request::<i32, i32>(&1).await })
    };

    timeout(WAIT, async {
        while client.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client.dispose();
    let result = timeout(WAIT, waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(IpcError::Cancelled)));
    assert!(matches!(
        client.publish("k", "v").await,
        Err(IpcError::Disposed)
    ));
}

#[tokio::test]
async fn test_caller_cancellation_abandons_request() {
    let port = free_tcp_port();
    let mut handlers = HandlerRegistry::new();
    handlers.register(|n: i32| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, HandlerError>(n)
    });
    let server = tcp_worker(port, true, handlers);
    server.start().await.unwrap();

    let client = tcp_worker(port, false, HandlerRegistry::new());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = timeout(WAIT, client.request_with_cancel::<i32, i32>(&1, &cancel))
        .await
        .unwrap();
    assert!(matches!(result, Err(IpcError::Cancelled)));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_json_codec_peers() {
    let port = free_tcp_port();
    let mut handlers = HandlerRegistry::<JsonCodec>::new();
    handlers.register(|words: Vec<String>| async move { Ok::<_, HandlerError>(words.join(" ")) });

    let server: TcpWorker<JsonCodec> = TcpWorker::new(
        TcpOptions::new(Endpoint::inet("127.0.0.1", port)).host_as_server(true),
        Arc::new(handlers),
        Arc::new(InMemoryBroker::new()),
    );
    server.start().await.unwrap();

    let client: TcpWorker<JsonCodec> = TcpWorker::new(
        TcpOptions::new(Endpoint::inet("127.0.0.1", port)),
        Arc::new(HandlerRegistry::new()),
        Arc::new(InMemoryBroker::new()),
    );
    let joined: String = timeout(
        WAIT,
        client.request::<Vec<String>, String>(&vec!["a".to_string(), "b".to_string()]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(joined, "a b");
}

#[tokio::test]
async fn test_publish_before_peer_connects_is_delivered() {
    let port = free_tcp_port();
    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let _subscription = broker.subscribe_raw(
        Bytes::from(MsgPackCodec::encode("events").unwrap()),
        move |message| {
            let _ = tx.send(message.clone());
        },
    );

    let server = tcp_worker(port, true, HandlerRegistry::new());
    server.publish("events", &1u8).await.unwrap();
    server.publish("events", &2u8).await.unwrap();

    let client = TcpWorker::new(
        TcpOptions::new(Endpoint::inet("127.0.0.1", port)),
        Arc::new(HandlerRegistry::<MsgPackCodec>::new()),
        Arc::new(broker),
    );
    client.start().await.unwrap();

    for expected in [1u8, 2] {
        let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let value: u8 = MsgPackCodec::decode(&message).unwrap();
        assert_eq!(value, expected);
    }
}
