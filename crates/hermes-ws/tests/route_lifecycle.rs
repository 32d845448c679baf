//! End-to-end route tests over an in-memory duplex transport.
//!
//! Each test stands up a route, drives it through `WsRoute::handle` with one
//! half of a duplex pipe, and speaks the client side of the protocol through
//! a client-role `WebSocketStream` on the other half.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::{CloseFrame, Role};
use tungstenite::Message;

use hermes_ws::{
    AcceptDecision, EventSocket, HookKind, InitData, JsonValidator, SocketEvent, SocketState,
    StreamResponder, TextValidator, UpgradeResponder, WireValue, WsConfig, WsResult, WsRoute,
};

fn quiet_config() -> WsConfig {
    WsConfig::default().log_traffic(false)
}

/// Spawn `route.handle` on one end of a duplex pipe and return the client end.
async fn connect(route: &Arc<WsRoute>) -> WebSocketStream<DuplexStream> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let request = http::Request::builder()
        .uri(route.path())
        .body(())
        .expect("valid request");
    let route = Arc::clone(route);
    tokio::spawn(async move {
        let responder = StreamResponder::new(server_io, route.config().clone());
        route.handle(request, responder).await;
    });
    WebSocketStream::from_raw_socket(client_io, Role::Client, None).await
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for the connection")
}

async fn wait_for_count(route: &Arc<WsRoute>, expected: usize) {
    within(async {
        while route.socket_count() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Responder that records rejections instead of touching any transport.
struct RecordingResponder {
    rejected: Arc<StdMutex<Option<(Option<u16>, Option<String>)>>>,
}

impl UpgradeResponder for RecordingResponder {
    type Stream = DuplexStream;

    async fn accept(self) -> WsResult<WebSocketStream<DuplexStream>> {
        panic!("accept must not run for a rejected upgrade");
    }

    fn reject(self, status: Option<u16>, reason: Option<&str>) {
        *self.rejected.lock().unwrap() = Some((status, reason.map(str::to_owned)));
    }
}

#[tokio::test]
async fn accept_policy_rejection_never_upgrades() {
    let route = WsRoute::with_config("/guarded", quiet_config());
    route.accept_reject(|_request| async { AcceptDecision::reject_with(403, "nope") });

    let (reject_tx, mut reject_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Reject, move |event| {
        if let SocketEvent::Reject { status, reason, .. } = event {
            let _ = reject_tx.send((*status, reason.clone()));
        }
    });

    let rejected = Arc::new(StdMutex::new(None));
    let responder = RecordingResponder {
        rejected: Arc::clone(&rejected),
    };
    let request = http::Request::builder().uri("/guarded").body(()).unwrap();
    Arc::clone(&route).handle(request, responder).await;

    assert_eq!(
        *rejected.lock().unwrap(),
        Some((Some(403), Some("nope".to_owned())))
    );
    let (status, reason) = within(reject_rx.recv()).await.unwrap();
    assert_eq!(status, Some(403));
    assert_eq!(reason.as_deref(), Some("nope"));
    assert!(reject_rx.try_recv().is_err());
    assert_eq!(route.socket_count(), 0);
}

#[tokio::test]
async fn accept_policy_sees_the_request() {
    let route = WsRoute::with_config("/query", quiet_config());
    route.accept_reject(
        |request| async move { request.uri().query() == Some("token=secret") },
    );

    let (client_io, server_io) = tokio::io::duplex(8 * 1024);
    let request = http::Request::builder()
        .uri("/query?token=secret")
        .body(())
        .unwrap();
    let handler = {
        let route = Arc::clone(&route);
        tokio::spawn(async move {
            let responder = StreamResponder::new(server_io, route.config().clone());
            route.handle(request, responder).await;
        })
    };
    let _client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    assert_ok!(within(handler).await);
    wait_for_count(&route, 1).await;
}

#[tokio::test]
async fn typed_event_dispatch_and_reply() {
    let route = WsRoute::with_config("/live", quiet_config());
    route.event(
        "double",
        |value: i64, socket: &Arc<EventSocket>| {
            let _ = socket.emit("result", value * 2);
        },
        JsonValidator::<i64>::new(),
    );

    let mut client = connect(&route).await;
    assert_ok!(client.send(Message::Text("$double\n21".into())).await);

    let reply = within(client.next()).await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("$result\n42".into()));
}

#[tokio::test]
async fn handlers_registered_late_attach_to_live_sockets() {
    let route = WsRoute::with_config("/retro", quiet_config());
    // one handler up front so the socket is in event mode
    route.event_raw("noop", |_, _| {});

    let (unknown_tx, mut unknown_rx) = mpsc::unbounded_channel();
    route.on(HookKind::UnknownEvent, move |event| {
        if let SocketEvent::UnknownEvent { name, .. } = event {
            let _ = unknown_tx.send(name.clone());
        }
    });

    let mut client = connect(&route).await;
    assert_ok!(client.send(Message::Text("$late\nx".into())).await);
    assert_eq!(within(unknown_rx.recv()).await.unwrap(), "late");

    let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();
    route.event_raw("late", move |payload, _| {
        let _ = hit_tx.send(payload);
    });

    assert_ok!(client.send(Message::Text("$late\ny".into())).await);
    assert_eq!(within(hit_rx.recv()).await.unwrap(), Bytes::from_static(b"y"));
    assert!(unknown_rx.try_recv().is_err());
}

#[tokio::test]
async fn init_handshake_gates_and_stores_data() {
    let route = WsRoute::with_config("/init", quiet_config());
    route.require_init(TextValidator, |token: String, _sender| async move {
        (token == "letmein").then(|| Box::new(token) as InitData)
    });
    route.event_raw("ping", |_, socket| {
        let _ = socket.emit("pong", WireValue::Undefined);
    });

    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Accept, move |event| {
        if let SocketEvent::Accept { socket } = event {
            let stored = socket.init_data::<String>().map(String::as_str) == Some("letmein");
            let _ = accept_tx.send(stored);
        }
    });

    let mut client = connect(&route).await;
    assert_ok!(client.send(Message::Text("letmein".into())).await);

    assert!(within(accept_rx.recv()).await.unwrap(), "init data missing");
    wait_for_count(&route, 1).await;

    assert_ok!(client.send(Message::Text("$ping\n".into())).await);
    let reply = within(client.next()).await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("$pong\nundefined".into()));
}

#[tokio::test]
async fn init_validation_failure_leaves_connection_inert() {
    let route = WsRoute::with_config("/init-strict", quiet_config());
    route.require_init(JsonValidator::<u32>::new(), |_room: u32, _sender| async move {
        Some(Box::new(()) as InitData)
    });

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    route.on(HookKind::InitParsingFailed, move |event| {
        if let SocketEvent::InitParsingFailed { data, .. } = event {
            let _ = failed_tx.send(data.clone());
        }
    });

    let mut client = connect(&route).await;
    assert_ok!(client.send(Message::Text("not json".into())).await);

    let data = within(failed_rx.recv()).await.unwrap();
    assert_eq!(data, Bytes::from_static(b"not json"));
    assert_eq!(route.socket_count(), 0);

    // the connection stays upgraded but nothing is ever dispatched
    assert_ok!(client.send(Message::Text("$anything\nx".into())).await);
    let silent = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(silent.is_err(), "inert connection must not respond");
    assert_eq!(route.socket_count(), 0);
}

#[tokio::test]
async fn init_callback_refusal_fires_init_failed() {
    let route = WsRoute::with_config("/init-refuse", quiet_config());
    route.require_init(TextValidator, |_token: String, _sender| async move {
        None::<InitData>
    });

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    route.on(HookKind::InitFailed, move |event| {
        if let SocketEvent::InitFailed { path } = event {
            let _ = failed_tx.send(path.clone());
        }
    });

    let mut client = connect(&route).await;
    assert_ok!(client.send(Message::Text("whatever".into())).await);

    assert_eq!(within(failed_rx.recv()).await.unwrap(), "/init-refuse");
    assert_eq!(route.socket_count(), 0);
}

#[tokio::test]
async fn init_timeout_tears_the_connection_down() {
    let route = WsRoute::with_config(
        "/init-deadline",
        quiet_config().init_timeout(Duration::from_millis(50)),
    );
    route.require_init(TextValidator, |_token: String, _sender| async move {
        Some(Box::new(()) as InitData)
    });

    let mut client = connect(&route).await;
    // send nothing; the deadline passes and the server drops the transport
    let end = within(client.next()).await;
    assert!(
        !matches!(end, Some(Ok(_))),
        "expected the stream to end, got {end:?}"
    );
    assert_eq!(route.socket_count(), 0);
}

#[tokio::test]
async fn message_queued_behind_init_is_dispatched_normally() {
    let route = WsRoute::with_config("/init-slow", quiet_config());
    route.require_init(TextValidator, |_token: String, _sender| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Some(Box::new(()) as InitData)
    });
    let (hit_tx, mut hit_rx) = mpsc::unbounded_channel();
    route.event_raw("after", move |payload, _| {
        let _ = hit_tx.send(payload);
    });

    let mut client = connect(&route).await;
    assert_ok!(client.send(Message::Text("hello".into())).await);
    assert_ok!(client.send(Message::Text("$after\nqueued".into())).await);

    assert_eq!(
        within(hit_rx.recv()).await.unwrap(),
        Bytes::from_static(b"queued")
    );
}

#[tokio::test]
async fn plain_messages_pass_through_both_ways() {
    let route = WsRoute::with_config("/plain", quiet_config());

    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Accept, move |event| {
        if let SocketEvent::Accept { socket } = event {
            let _ = socket_tx.send(Arc::clone(socket));
        }
    });
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Message, move |event| {
        if let SocketEvent::Message { data, binary, .. } = event {
            let _ = msg_tx.send((data.clone(), *binary));
        }
    });

    let mut client = connect(&route).await;
    let socket = within(socket_rx.recv()).await.unwrap();
    assert_eq!(socket.state(), SocketState::Open);

    // client to server: binary stays binary, even with a leading marker
    assert_ok!(
        client
            .send(Message::Binary(Bytes::from_static(b"$raw\n\xf0\x9f\x92\x96")))
            .await
    );
    let (data, binary) = within(msg_rx.recv()).await.unwrap();
    assert!(binary);
    assert_eq!(data, Bytes::from_static(b"$raw\n\xf0\x9f\x92\x96"));

    // server to client: bytes go out as a binary frame, text as text
    assert_ok!(socket.send(Bytes::from_static(b"\x00\xff")));
    let reply = within(client.next()).await.unwrap().unwrap();
    assert_eq!(reply, Message::Binary(Bytes::from_static(b"\x00\xff")));

    assert_ok!(socket.send("plain text"));
    let reply = within(client.next()).await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("plain text".into()));
}

#[tokio::test]
async fn ping_is_answered_with_pong_and_fires_hook() {
    let route = WsRoute::with_config("/heartbeat", quiet_config());

    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Ping, move |event| {
        if let SocketEvent::Ping { data, .. } = event {
            let _ = ping_tx.send(data.clone());
        }
    });

    let mut client = connect(&route).await;
    wait_for_count(&route, 1).await;
    assert_ok!(client.send(Message::Ping(Bytes::from_static(b"beat"))).await);

    let reply = within(client.next()).await.unwrap().unwrap();
    assert_eq!(reply, Message::Pong(Bytes::from_static(b"beat")));
    assert_eq!(
        within(ping_rx.recv()).await.unwrap(),
        Bytes::from_static(b"beat")
    );
}

#[tokio::test]
async fn peer_close_fires_close_hook_and_unregisters() {
    let route = WsRoute::with_config("/closing", quiet_config());

    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Accept, move |event| {
        if let SocketEvent::Accept { socket } = event {
            let _ = socket_tx.send(Arc::clone(socket));
        }
    });
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    route.on(HookKind::Close, move |event| {
        if let SocketEvent::Close { code, reason, .. } = event {
            let _ = close_tx.send((*code, reason.clone()));
        }
    });

    let mut client = connect(&route).await;
    let socket = within(socket_rx.recv()).await.unwrap();
    wait_for_count(&route, 1).await;

    assert_ok!(
        client
            .send(Message::Close(Some(CloseFrame {
                code: 1000.into(),
                reason: "done".into(),
            })))
            .await
    );

    let (code, reason) = within(close_rx.recv()).await.unwrap();
    assert_eq!(code, 1000);
    assert_eq!(reason, Bytes::from_static(b"done"));
    wait_for_count(&route, 0).await;
    assert_eq!(socket.state(), SocketState::Closed);
    assert!(socket.send("too late").is_err());
}

#[tokio::test]
async fn emit_all_reaches_every_socket() {
    let route = WsRoute::with_config("/broadcast", quiet_config());
    let mut first = connect(&route).await;
    let mut second = connect(&route).await;
    wait_for_count(&route, 2).await;

    assert_eq!(route.emit_all("tick", &WireValue::from(7_i64)), 2);

    for client in [&mut first, &mut second] {
        let frame = within(client.next()).await.unwrap().unwrap();
        assert_eq!(frame, Message::Text("$tick\n7".into()));
    }
}
