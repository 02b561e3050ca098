//! End-to-end scenarios over real sockets.
//!
//! Each test boots the broker plus the network module on an OS-assigned
//! port and drives it with `tokio-tungstenite` clients. The broker is
//! unique per process, so every test holds the serialization lock for its
//! whole duration and tears the instance down before releasing it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, Uri};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use herd_server::{
    Broker, BrokerConfig, BrokerOptions, Connection, Hook, NetworkConfig, NetworkModule,
    OfflineReason,
};

static SERIAL: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct TestHook {
    offline: Mutex<Vec<(String, OfflineReason)>>,
    received: Mutex<Vec<(String, Vec<u8>)>>,
}

impl TestHook {
    fn offline_events(&self) -> Vec<(String, OfflineReason)> {
        self.offline.lock().clone()
    }

    fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl Hook for TestHook {
    fn identify(&self, _headers: &HeaderMap, uri: &Uri) -> anyhow::Result<String> {
        for pair in uri.query().unwrap_or_default().split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
        }
        anyhow::bail!("missing token")
    }

    async fn validate(&self, _identity: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn validate_failed(&self, _err: anyhow::Error, conn: &Arc<Connection>) {
        conn.close(false);
    }

    async fn validate_success(&self, _conn: &Arc<Connection>) {}

    async fn handle_receive(&self, conn: &Arc<Connection>, payload: Bytes) {
        self.received
            .lock()
            .push((conn.identity().to_string(), payload.to_vec()));
    }

    async fn offline(&self, conn: &Arc<Connection>, reason: OfflineReason) {
        self.offline
            .lock()
            .push((conn.identity().to_string(), reason));
    }
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn boot(hook: Arc<TestHook>) -> (Arc<Broker>, u16, tokio::task::JoinHandle<()>) {
    let broker = Broker::new(
        hook as Arc<dyn Hook>,
        BrokerOptions {
            broker: BrokerConfig {
                bucket_count: 4,
                heartbeat_interval: Duration::from_secs(10),
                bucket_buffer: 0,
                ..BrokerConfig::default()
            },
            ..BrokerOptions::default()
        },
    )
    .expect("broker");
    broker.run().expect("run");

    let mut module = NetworkModule::new(
        Arc::clone(&broker),
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..NetworkConfig::default()
        },
    );
    let port = module.start().await.expect("bind");
    let signal = module.shutdown_controller().shutdown_signal();
    let server = tokio::spawn(async move {
        let _ = module.serve(signal).await;
    });
    (broker, port, server)
}

async fn teardown(broker: Arc<Broker>, server: tokio::task::JoinHandle<()>) {
    let _ = broker.stop().await;
    let _ = server.await;
    drop(broker);
}

async fn connect(port: u16, token: &str) -> Client {
    let (client, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws?token={token}"))
            .await
            .expect("websocket connect");
    client
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check(), "condition not reached in time");
}

async fn expect_text(client: &mut Client, expected: &str) {
    let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("frame timely")
        .expect("stream open")
        .expect("frame ok");
    match frame {
        Message::Text(text) => assert_eq!(text.as_str(), expected),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn expect_silence(client: &mut Client) {
    let verdict = tokio::time::timeout(Duration::from_millis(300), client.next()).await;
    assert!(verdict.is_err(), "unexpected frame: {verdict:?}");
}

#[tokio::test]
async fn connect_receive_disconnect() {
    let _serial = SERIAL.lock();
    let hook = Arc::new(TestHook::default());
    let (broker, port, server) = boot(Arc::clone(&hook)).await;

    let mut client = connect(port, "alice").await;
    wait_until(|| broker.online() == 1).await;

    // Inbound frames reach the embedder and refresh the heartbeat.
    client
        .send(Message::Text("ping".into()))
        .await
        .expect("client send");
    wait_until(|| {
        hook.received()
            .iter()
            .any(|(identity, payload)| identity == "alice" && payload == b"ping")
    })
    .await;
    let conn = broker.connection("alice").expect("registered");
    assert!(herd_core::now_unix() as i64 - conn.last_heartbeat() <= 2);

    client.close(None).await.expect("client close");
    wait_until(|| broker.online() == 0).await;

    teardown(broker, server).await;
}

#[tokio::test]
async fn displacement_squeezes_out_the_older_connection() {
    let _serial = SERIAL.lock();
    let hook = Arc::new(TestHook::default());
    let (broker, port, server) = boot(Arc::clone(&hook)).await;

    let mut first = connect(port, "bob").await;
    wait_until(|| broker.online() == 1).await;

    let _second = connect(port, "bob").await;
    wait_until(|| {
        hook.offline_events()
            .contains(&("bob".to_string(), OfflineReason::SqueezedOut))
    })
    .await;

    // The displaced socket is closed from the server side.
    let farewell = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .expect("close timely");
    match farewell {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }

    wait_until(|| broker.online() == 1).await;
    assert!(broker.connection("bob").expect("entry").is_running());

    teardown(broker, server).await;
}

#[tokio::test]
async fn targeted_send_reaches_one_client() {
    let _serial = SERIAL.lock();
    let hook = Arc::new(TestHook::default());
    let (broker, port, server) = boot(hook).await;

    let mut alice = connect(port, "alice").await;
    let mut carol = connect(port, "carol").await;
    wait_until(|| broker.online() == 2).await;

    broker
        .send(&Bytes::from_static(b"hello"), &["alice".to_string()])
        .expect("send");

    expect_text(&mut alice, "hello").await;
    expect_silence(&mut carol).await;

    teardown(broker, server).await;
}

#[tokio::test]
async fn inner_join_broadcast_hits_exactly_the_intersection() {
    let _serial = SERIAL.lock();
    let hook = Arc::new(TestHook::default());
    let (broker, port, server) = boot(hook).await;

    let mut a = connect(port, "A").await;
    let mut b = connect(port, "B").await;
    let mut c = connect(port, "C").await;
    wait_until(|| broker.online() == 3).await;

    for (identity, tags) in [
        ("A", vec!["v1", "room1"]),
        ("B", vec!["v1", "room2"]),
        ("C", vec!["v2", "room1"]),
    ] {
        let conn = broker.connection(identity).expect("registered");
        for tag in tags {
            broker.label_attach(&conn, tag).expect("attach");
        }
    }

    let failed = broker
        .broadcast_inner_join(
            &Bytes::from_static(b"both"),
            &["v1".to_string(), "room1".to_string()],
        )
        .expect("inner join");
    assert!(failed.is_empty());

    expect_text(&mut a, "both").await;
    expect_silence(&mut b).await;
    expect_silence(&mut c).await;

    teardown(broker, server).await;
}

#[tokio::test]
async fn upgrade_without_token_is_rejected() {
    let _serial = SERIAL.lock();
    let hook = Arc::new(TestHook::default());
    let (broker, port, server) = boot(hook).await;

    let refused =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws")).await;
    assert!(refused.is_err(), "upgrade without identity must fail");
    assert_eq!(broker.online(), 0);

    teardown(broker, server).await;
}

#[tokio::test]
async fn stopped_broker_refuses_upgrades() {
    let _serial = SERIAL.lock();
    let hook = Arc::new(TestHook::default());
    let (broker, port, server) = boot(hook).await;

    broker.stop().await.expect("stop");
    let refused =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws?token=late")).await;
    assert!(refused.is_err(), "stopped broker must refuse upgrades");

    let _ = server.await;
    drop(broker);
}
