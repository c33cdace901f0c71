use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemux::daemon::coordinator::DaemonCoordinator;
use telemux::daemon::pipeline::IngressSource;
use telemux::daemon::server::{AppState, ShutdownSignal, serve};
use telemux::daemon::snapshot::SnapshotBus;
use telemux::storage::RecordStore;
use telemux::storage::memory::MemoryStore;
use telemux::util::config::AppConfig;
use telemux_core::frame::Frame;
use telemux_core::records::{Category, SubRecord};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    state: AppState,
    stop: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    async fn start(store: Arc<MemoryStore>) -> Self {
        let config = AppConfig {
            replay_limit: 5,
            ..AppConfig::default()
        };
        let (stop, signal) = ShutdownSignal::new();
        let state = DaemonCoordinator::from_app_config(&config).assemble(
            store as Arc<dyn RecordStore>,
            Arc::new(SnapshotBus::new()),
            signal.clone(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = tokio::spawn(serve(listener, state.clone(), signal.wait()));
        Self {
            addr,
            state,
            stop,
            task,
        }
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .expect("websocket handshake");
        client
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stops")
            .expect("server task")
            .expect("server result");
    }
}

fn sensor_record(accel_x: f64) -> SubRecord {
    SubRecord::from_values(Category::Sensor, &[accel_x, 0.0, 9.8, 0.0, 0.0, 0.0])
        .expect("sensor arity")
}

async fn next_text(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("frame");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn wait_for_live(state: &AppState, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while state.fanout.live_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count settles");
}

#[tokio::test(flavor = "current_thread")]
async fn replay_arrives_before_live_broadcasts() {
    let store = Arc::new(MemoryStore::new());
    store.insert(sensor_record(1.0)).await.expect("seed");
    store.insert(sensor_record(2.0)).await.expect("seed");
    let server = Server::start(Arc::clone(&store)).await;

    let mut client = server.connect().await;
    let first = next_text(&mut client).await;
    let second = next_text(&mut client).await;
    assert_eq!(first["sensor"]["accel_x"], 1.0);
    assert_eq!(second["sensor"]["accel_x"], 2.0);

    let envelope = json!({"aggregate-status": {"voltage": 48.0, "current": 2.0, "power": 96.0, "temperature": 31.0, "state_of_charge": 0.8}});
    server
        .state
        .pipeline
        .submit(Frame::Text(envelope.to_string()), IngressSource::Http)
        .await
        .expect("admitted");

    let live = next_text(&mut client).await;
    assert_eq!(live["aggregate-status"]["voltage"], 48.0);
    assert!(live.get("sensor").is_none());

    client.close(None).await.expect("close");
    server.stop().await;
}

#[tokio::test(flavor = "current_thread")]
async fn client_messages_reach_the_other_subscribers() {
    let store = Arc::new(MemoryStore::new());
    // One replayed record per client shows its session is registered.
    store.insert(sensor_record(0.5)).await.expect("seed");
    let server = Server::start(Arc::clone(&store)).await;

    let mut sender = server.connect().await;
    let mut listener = server.connect().await;
    next_text(&mut sender).await;
    next_text(&mut listener).await;

    sender
        .send(Message::Text(r#"{"note":"hello"}"#.to_string()))
        .await
        .expect("send");
    let relayed = next_text(&mut listener).await;
    assert_eq!(relayed, json!({"note": "hello"}));
    assert_eq!(server.state.snapshot_bus.snapshot().counts.relayed_messages, 1);

    sender.close(None).await.expect("close");
    listener.close(None).await.expect("close");
    server.stop().await;
}

#[tokio::test(flavor = "current_thread")]
async fn closing_the_socket_unsubscribes() {
    let store = Arc::new(MemoryStore::new());
    store.insert(sensor_record(0.5)).await.expect("seed");
    let server = Server::start(Arc::clone(&store)).await;

    let mut stays = server.connect().await;
    let mut leaves = server.connect().await;
    next_text(&mut stays).await;
    next_text(&mut leaves).await;
    wait_for_live(&server.state, 2).await;

    leaves.close(None).await.expect("close");
    wait_for_live(&server.state, 1).await;
    assert_eq!(server.state.snapshot_bus.snapshot().subscribers, 1);

    stays.close(None).await.expect("close");
    server.stop().await;
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_ends_open_sessions() {
    let server = Server::start(Arc::new(MemoryStore::new())).await;
    let mut client = server.connect().await;
    wait_for_live(&server.state, 1).await;

    let _ = server.stop.send(true);
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "session outlived shutdown");
    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server stops")
        .expect("server task")
        .expect("server result");
}
