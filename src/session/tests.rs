//! Session scenarios against a loopback stub server.

use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::*;
use crate::backoff::FixedBackoff;
use crate::extension::ExtensionInstance;
use crate::transport::{TcpTransport, TransportDescriptor};

const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' id='abc' from='example.com' version='1.0'>";
const CLIENT_HEADER_END: &str = "xmlns:stream='http://etherx.jabber.org/streams'>";
const SASL_FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>PLAIN</mechanism></mechanisms></stream:features>";
const BIND_FEATURES: &str =
    "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>";

/// Server side of one accepted connection.
struct Peer {
    socket: TcpStream,
    inbox: String,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Peer {
        let (socket, _) = listener.accept().await.expect("accept");
        Peer {
            socket,
            inbox: String::new(),
        }
    }

    /// Consume input up to and including `pattern`.
    async fn read_until(&mut self, pattern: &str) -> String {
        loop {
            if let Some(pos) = self.inbox.find(pattern) {
                return self.inbox.drain(..pos + pattern.len()).collect();
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), self.socket.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {pattern}"))
                .expect("read");
            assert!(n > 0, "client closed while waiting for {pattern}");
            self.inbox.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    async fn send(&mut self, data: &str) {
        self.socket.write_all(data.as_bytes()).await.expect("write");
    }

    /// Read the client's stream header and answer with ours.
    async fn open(&mut self, features: &str) {
        self.read_until(CLIENT_HEADER_END).await;
        self.send(SERVER_HEADER).await;
        self.send(features).await;
    }

    /// Keep the socket open until the client goes away.
    async fn drain(mut self) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = self.socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    }
}

fn iq_id(xml: &str) -> String {
    let start = xml.rfind("<iq").expect("iq in request");
    let rest = &xml[start..];
    let id_start = rest.find("id='").expect("iq id") + 4;
    let id_len = rest[id_start..].find('\'').expect("closing quote");
    rest[id_start..id_start + id_len].to_string()
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

async fn dead_port() -> u16 {
    let (listener, port) = listener().await;
    drop(listener);
    port
}

fn config() -> SessionConfig {
    SessionConfig {
        domain: "example.com".to_string(),
        security: SecurityMode::Disabled,
        send_initial_presence: false,
        sasl_wait_timeout: Duration::from_secs(2),
        bind_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

fn tcp(port: u16) -> Arc<dyn Transport> {
    Arc::new(TcpTransport::new(
        &format!("tcp://127.0.0.1:{port}"),
        None,
        Duration::from_secs(2),
        false,
    ))
}

fn session_with(config: SessionConfig, ports: &[u16], backoff: Duration) -> Session {
    let mut builder = Session::builder(config).backoff(Arc::new(FixedBackoff(backoff)));
    for port in ports {
        builder = builder.transport(tcp(*port));
    }
    builder.build().expect("session")
}

fn session(ports: &[u16]) -> Session {
    session_with(config(), ports, Duration::from_secs(60))
}

async fn wait_for_status(session: &Session, wanted: ConnectionStatus) {
    let mut rx = session.status_watch();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("status never became {wanted}"))
        .expect("status watch closed");
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn test_login_binds_resource() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open(SASL_FEATURES).await;

        let auth = peer.read_until("</auth>").await;
        assert!(auth.contains("mechanism='PLAIN'"), "{auth}");
        assert!(auth.contains("AHUAcA=="), "{auth}");
        peer.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;

        peer.open(BIND_FEATURES).await;
        let bind = peer.read_until("</iq>").await;
        assert!(bind.contains("urn:ietf:params:xml:ns:xmpp-bind"), "{bind}");
        let id = iq_id(&bind);
        peer.send(&format!(
            "<iq type='result' id='{id}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>u@example.com/res1</jid></bind></iq>"
        ))
        .await;
        peer.drain().await;
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    assert_eq!(session.status(), ConnectionStatus::Connected);

    let jid = session.login("u", "p").await.expect("login");
    assert_eq!(jid.to_string(), "u@example.com/res1");
    assert_eq!(session.connected_resource(), Some(jid));
    assert_eq!(session.stream_id().as_deref(), Some("abc"));
    assert_eq!(session.server_domain().as_deref(), Some("example.com"));
    assert!(session.features().expect("features").bind);

    session.close().await.expect("close");
    server.await.expect("server");
}

#[tokio::test]
async fn test_rejected_credentials_fail_login() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open(SASL_FEATURES).await;
        peer.read_until("</auth>").await;
        peer.send(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        )
        .await;
        peer.drain().await;
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    match session.login("u", "wrong").await {
        Err(Error::Login(LoginError::Sasl { condition, .. })) => {
            assert_eq!(condition, "not-authorized")
        }
        other => panic!("expected SASL failure, got {:?}", other),
    }
    assert_eq!(session.status(), ConnectionStatus::Connected);
    match session.last_error().as_deref() {
        Some(Error::Login(LoginError::Sasl { condition, .. })) => {
            assert_eq!(condition, "not-authorized")
        }
        other => panic!("expected the SASL failure to be recorded, got {:?}", other),
    }
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_read_error_schedules_one_reconnection() {
    let (listener, port) = listener().await;
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("").await;
        let _ = kill_rx.await;
        drop(peer);
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    eventually("stream header received", || session.stream_id().is_some()).await;
    assert_eq!(session.status(), ConnectionStatus::Connected);

    kill_tx.send(()).expect("kill");
    wait_for_status(&session, ConnectionStatus::Disconnected).await;
    eventually("reconnection scheduled", || {
        session.next_reconnection_attempt().is_some()
    })
    .await;

    let first = session.next_reconnection_attempt();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.next_reconnection_attempt(), first);
    assert_eq!(session.reconnection_manager().attempt(), 0);
    assert!(matches!(
        session.last_error().as_deref(),
        Some(Error::ConnectionClosed) | Some(Error::Io(_))
    ));

    session.close().await.expect("close");
    assert!(session.next_reconnection_attempt().is_none());
}

#[tokio::test]
async fn test_reconnects_after_drop() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut first = Peer::accept(&listener).await;
        first.open("").await;
        drop(first);

        let mut second = Peer::accept(&listener).await;
        second.read_until(CLIENT_HEADER_END).await;
        second
            .send(&SERVER_HEADER.replace("id='abc'", "id='second'"))
            .await;
        second.drain().await;
    });

    let session = session_with(config(), &[port], Duration::from_millis(50));
    session.connect().await.expect("connect");

    eventually("second stream opened", || {
        session.stream_id().as_deref() == Some("second")
    })
    .await;
    assert_eq!(session.status(), ConnectionStatus::Connected);
    eventually("schedule cleared", || session.next_reconnection_attempt().is_none()).await;
    session.close().await.expect("close");
}

/// Connects at once the first time and slowly afterwards.
#[derive(Debug)]
struct SlowTransport {
    inner: Arc<dyn Transport>,
    connects: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Transport for SlowTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        self.inner.descriptor()
    }

    async fn connect(&self) -> Result<BoxedStream> {
        if self.connects.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.connect().await
    }

    fn is_secure(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_manual_connect_during_pending_attempt_ends_retries() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut first = Peer::accept(&listener).await;
        first.open("").await;
        drop(first);
        loop {
            let mut peer = Peer::accept(&listener).await;
            tokio::spawn(async move {
                peer.open("").await;
                peer.drain().await;
            });
        }
    });

    let transport = Arc::new(SlowTransport {
        inner: tcp(port),
        connects: AtomicUsize::new(0),
        delay: Duration::from_millis(300),
    });
    let session = Session::builder(config())
        .transport(transport)
        .backoff(Arc::new(FixedBackoff(Duration::from_millis(100))))
        .build()
        .expect("session");
    session.connect().await.expect("connect");
    wait_for_status(&session, ConnectionStatus::Disconnected).await;
    eventually("reconnection scheduled", || {
        session.next_reconnection_attempt().is_some()
    })
    .await;

    // Whichever of the two gets the connection first, the other finds it up
    match session.connect().await {
        Ok(()) | Err(Error::IllegalState(_)) => {}
        Err(e) => panic!("manual connect failed: {e}"),
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(session.next_reconnection_attempt().is_none());
    assert_eq!(session.reconnection_manager().attempt(), 0);
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_panicking_predicate_leaves_reader_running() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("").await;
        peer.read_until("<presence").await;
        peer.send("<message><body>1</body></message>").await;
        peer.read_until("<message").await;
        peer.send("<message><body>2</body></message>").await;
        peer.drain().await;
    });

    let session = session(&[port]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.add_message_listener(move |message| {
        let _ = tx.send(message.get_child("body", ns::CLIENT).map(|b| b.text()));
    });
    session.connect().await.expect("connect");

    let result = session
        .send_and_await(
            Element::builder("presence", ns::CLIENT).build(),
            |_: &Element| -> bool { panic!("predicate bug") },
            Duration::from_millis(300),
            "broken predicate",
        )
        .await;
    assert!(matches!(result, Err(Error::NoResponse { .. })), "{:?}", result);
    assert_eq!(session.status(), ConnectionStatus::Connected);

    session
        .send(Element::builder("message", ns::CLIENT).build())
        .expect("send");
    for expected in ["1", "2"] {
        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message delivered")
            .expect("listener alive");
        assert_eq!(body.as_deref(), Some(expected));
    }
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_conflict_is_not_reconnected() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open(
            "<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        )
        .await;
        peer.drain().await;
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    wait_for_status(&session, ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.next_reconnection_attempt().is_none());
    match session.last_error().as_deref() {
        Some(Error::Stream(e)) => assert_eq!(e.condition, StreamErrorCondition::Conflict),
        other => panic!("expected conflict, got {:?}", other),
    }
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_query_without_answer_times_out() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("").await;
        peer.drain().await;
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");

    let started = Instant::now();
    let ping = Iq::get(None, Element::builder("ping", ns::PING).build());
    let result = session.query(ping, Some(Duration::from_millis(50))).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(Error::NoResponse { timeout_ms: 50, .. })), "{:?}", result);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
    assert_eq!(session.inner.correlator.pending_count(), 0);
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_first_candidate_failure_falls_through() {
    let dead = dead_port().await;
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("").await;
        peer.drain().await;
    });

    let session = session(&[dead, port]);
    session.connect().await.expect("second candidate connects");
    assert_eq!(session.status(), ConnectionStatus::Connected);

    match session.connect().await {
        Err(Error::IllegalState(_)) => {}
        other => panic!("expected illegal state, got {:?}", other),
    }
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_all_candidates_failing_is_fatal() {
    let session = session(&[dead_port().await, dead_port().await]);
    assert!(matches!(session.connect().await, Err(Error::Io(_))));
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(session.next_reconnection_attempt().is_none());
}

#[tokio::test]
async fn test_close_is_final() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("").await;
        peer.read_until("</stream:stream>").await;
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    session.close().await.expect("close");
    assert_eq!(session.status(), ConnectionStatus::Closed);
    server.await.expect("closing tag received");

    session.close().await.expect("second close");
    assert!(matches!(session.connect().await, Err(Error::IllegalState(_))));
    let presence = Element::new("presence", Some(ns::CLIENT));
    assert!(matches!(session.send(presence), Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_required_security_without_starttls_fails() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open(SASL_FEATURES).await;
        peer.drain().await;
    });

    let config = SessionConfig {
        security: SecurityMode::Required,
        ..config()
    };
    let session = session_with(config, &[port], Duration::from_secs(60));
    session.connect().await.expect("connect");

    // The failure may land before login checks the status
    assert!(matches!(
        session.login("u", "p").await,
        Err(Error::Disconnected(_)) | Err(Error::NotConnected)
    ));
    wait_for_status(&session, ConnectionStatus::Disconnected).await;
    assert!(matches!(session.last_error().as_deref(), Some(Error::Negotiation(_))));
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_message_listeners_are_isolated() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("<message from='romeo@example.com'><body>hi</body></message>")
            .await;
        peer.drain().await;
    });

    let session = session(&[port]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.add_message_listener(|_| panic!("broken listener"));
    session.add_message_listener(move |message| {
        let _ = tx.send(message.get_child("body", ns::CLIENT).map(|b| b.text()));
    });
    let removed = session.add_presence_listener(|_| {});
    assert!(session.remove_listener(removed));
    assert!(!session.remove_listener(removed));

    session.connect().await.expect("connect");
    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message delivered")
        .expect("listener alive");
    assert_eq!(body.as_deref(), Some("hi"));
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_inbound_iq_requests_are_answered() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("<iq type='get' id='p1' from='example.com'><ping xmlns='urn:xmpp:ping'/></iq>")
            .await;
        let mut pong = peer.read_until("id='p1'").await;
        pong.push_str(&peer.read_until(">").await);
        assert!(pong.contains("type='result'"), "{pong}");

        peer.send("<iq type='get' id='v1' from='example.com'><query xmlns='jabber:iq:version'/></iq>")
            .await;
        let refusal = peer.read_until("</iq>").await;
        assert!(refusal.contains("id='v1'"), "{refusal}");
        assert!(refusal.contains("service-unavailable"), "{refusal}");
        peer
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    let peer = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .expect("server assertions");
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session.close().await.expect("close");
    drop(peer);
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.open("").await;
        let request = peer.read_until("</iq>").await;
        assert!(request.contains("urn:xmpp:ping"), "{request}");
        assert!(request.contains("type='get'"), "{request}");
        let id = iq_id(&request);
        peer.send(&format!("<iq type='result' id='{id}' from='example.com'/>"))
            .await;
        peer.drain().await;
    });

    let session = session(&[port]);
    session.connect().await.expect("connect");
    let pings = session.ping_manager().expect("ping manager");
    let rtt = pings.ping(None).await.expect("pong");
    assert!(rtt < Duration::from_secs(5), "{:?}", rtt);
    assert_eq!(session.inner.correlator.pending_count(), 0);
    session.close().await.expect("close");
}

#[tokio::test]
async fn test_extensions_are_built_once() {
    struct Counter(u32);

    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let session = Session::builder(config())
        .transport(tcp(1))
        .extension(
            "test:counter",
            Arc::new(move |_: &Session| -> ExtensionInstance {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(Counter(7))
            }),
        )
        .build()
        .expect("session");

    let first = session.extension::<Counter>("test:counter").expect("extension");
    let second = session.extension::<Counter>("test:counter").expect("extension");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.0, 7);
    assert_eq!(built.load(Ordering::SeqCst), 1);

    assert!(session.extension::<String>("test:counter").is_none());
    assert!(session.extension::<Counter>("missing").is_none());
    assert!(session.ping_manager().is_some());
}

#[tokio::test]
async fn test_builder_rejects_empty_domain() {
    let config = SessionConfig {
        domain: String::new(),
        ..config()
    };
    let result = Session::builder(config).transport(tcp(1)).build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_builder_validates_config_with_explicit_transports() {
    let config = SessionConfig {
        keepalive_interval: Duration::ZERO,
        ..config()
    };
    let result = Session::builder(config).transport(tcp(1)).build();
    assert!(matches!(result, Err(Error::Config(_))));
}
