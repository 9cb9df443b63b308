//! End-to-end signaling tests over a live WebSocket server.
//!
//! Covers the room lifecycle (join, capacity, rejoin), the negotiation
//! sequence through start-produce with the agent pipeline on fake vendors,
//! reconnection continuity, and disconnect cleanup.

use async_trait::async_trait;
use callcoach_pipeline::{
    ChatMessage, ChatModel, PipelineError, SttAudioSink, SttConnector, SttEventSource, SttOptions,
    SttSession, SttVendorEvent,
};
use callcoach_server::config::Config;
use callcoach_server::{app, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// STT fake: accepts audio silently, reports closure when the sink closes.
struct QuietSession;

struct QuietSink {
    closed_tx: mpsc::UnboundedSender<SttVendorEvent>,
}

struct QuietSource {
    rx: mpsc::UnboundedReceiver<SttVendorEvent>,
}

impl SttSession for QuietSession {
    fn split(self: Box<Self>) -> (Box<dyn SttAudioSink>, Box<dyn SttEventSource>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SttVendorEvent::Open);
        (
            Box::new(QuietSink { closed_tx: tx }),
            Box::new(QuietSource { rx }),
        )
    }
}

#[async_trait]
impl SttAudioSink for QuietSink {
    async fn send_audio(&mut self, _pcm: &[u8]) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.closed_tx.send(SttVendorEvent::Closed);
    }
}

#[async_trait]
impl SttEventSource for QuietSource {
    async fn recv(&mut self) -> Option<SttVendorEvent> {
        self.rx.recv().await
    }
}

struct QuietConnector;

#[async_trait]
impl SttConnector for QuietConnector {
    async fn connect(&self, _options: &SttOptions) -> Result<Box<dyn SttSession>, PipelineError> {
        Ok(Box::new(QuietSession))
    }
}

/// Model fake: never invoked in these tests.
struct IdleModel;

#[async_trait]
impl ChatModel for IdleModel {
    async fn stream_chat(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

async fn spawn_server() -> (SocketAddr, AppState) {
    let mut config = Config::default();
    config.media.num_workers = Some(1);

    let state = AppState::new(config, Arc::new(QuietConnector), Arc::new(IdleModel));
    let router = app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server");
    });

    (addr, state)
}

fn percent_encode(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

async fn connect_client(addr: SocketAddr, name: &str, user_id: &str, role: &str) -> WsClient {
    let token = json!({"name": name, "userId": user_id, "role": role}).to_string();
    let url = format!("ws://{addr}/ws?token={}", percent_encode(&token));
    let (client, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    client
}

async fn recv_json(client: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("message within deadline")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("valid json");
        }
    }
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

/// Sends a request and waits for the matching response's payload.
async fn request(client: &mut WsClient, value: Value) -> Value {
    let id = value["id"].as_u64().expect("request id");
    send_json(client, value).await;
    loop {
        let message = recv_json(client).await;
        if message["type"] == "response" && message["id"] == id {
            return message["payload"].clone();
        }
    }
}

#[tokio::test]
async fn connect_requires_a_valid_token() {
    let (addr, _state) = spawn_server().await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err(), "missing token must reject the connection");

    let bad = format!("ws://{addr}/ws?token={}", percent_encode("{\"nope\":1}"));
    assert!(
        tokio_tungstenite::connect_async(bad).await.is_err(),
        "malformed token must reject the connection"
    );
}

#[tokio::test]
async fn connect_ack_carries_identity() {
    let (addr, _state) = spawn_server().await;
    let mut client = connect_client(addr, "Ada", "agent-1", "agent").await;

    let ack = recv_json(&mut client).await;
    assert_eq!(ack["type"], "connected");
    assert_eq!(ack["userId"], "agent-1");
    assert_eq!(ack["name"], "Ada");
    assert_eq!(ack["queueStatus"], "waiting");
}

#[tokio::test]
async fn first_join_creates_the_room() {
    let (addr, state) = spawn_server().await;
    let mut user = connect_client(addr, "Uma", "user-1", "user").await;
    let _ = recv_json(&mut user).await;

    let response = request(&mut user, json!({"type": "joinRoom", "id": 1, "roomId": "fresh"})).await;
    assert_eq!(response["success"], true);
    assert!(state.rooms.has_room("fresh").await);
}

#[tokio::test]
async fn room_capacity_and_lifecycle() {
    let (addr, state) = spawn_server().await;

    // The copilot side opens the room.
    let mut agent = connect_client(addr, "Coach", "agent-1", "agent").await;
    let _ = recv_json(&mut agent).await;
    let joined = request(&mut agent, json!({"type": "joinRoom", "id": 1, "roomId": "r1"})).await;
    assert_eq!(joined["success"], true);
    assert!(joined["routerRtpCap"]["codecs"].is_array());

    // The customer joins it.
    let mut customer = connect_client(addr, "Cara", "user-1", "user").await;
    let _ = recv_json(&mut customer).await;
    let joined = request(&mut customer, json!({"type": "joinRoom", "id": 1, "roomId": "r1"})).await;
    assert_eq!(joined["success"], true);

    // A third participant is refused softly.
    let mut third = connect_client(addr, "Eve", "user-2", "user").await;
    let _ = recv_json(&mut third).await;
    let refused = request(&mut third, json!({"type": "joinRoom", "id": 1, "roomId": "r1"})).await;
    assert_eq!(refused["success"], false);
    assert_eq!(refused["message"], "Room is full");

    // The customer leaves: the room retains the agent.
    drop(customer);
    wait_until(|| {
        let state = state.clone();
        async move { state.rooms.find_room_by_user("user-1").await.is_none() }
    })
    .await;
    assert!(state.rooms.has_room("r1").await, "room must retain the agent");

    // The agent leaves: the room is destroyed.
    drop(agent);
    wait_until(|| {
        let state = state.clone();
        async move { !state.rooms.has_room("r1").await }
    })
    .await;
}

#[tokio::test]
async fn negotiation_through_start_produce() {
    let (addr, state) = spawn_server().await;

    let mut agent = connect_client(addr, "Coach", "agent-1", "agent").await;
    let _ = recv_json(&mut agent).await;
    let joined = request(&mut agent, json!({"type": "joinRoom", "id": 1, "roomId": "r1"})).await;
    assert_eq!(joined["success"], true);

    // Producer transport negotiation.
    let created = request(
        &mut agent,
        json!({"type": "createProducerTransport", "id": 2, "roomId": "r1"}),
    )
    .await;
    assert_eq!(created["success"], true);
    let params = &created["clientTransportParams"];
    assert!(params["iceParameters"]["usernameFragment"].is_string());
    let dtls = params["dtlsParameters"].clone();

    let connected = request(
        &mut agent,
        json!({
            "type": "connect-producer-transport",
            "id": 3,
            "roomId": "r1",
            "dtlsParameters": dtls,
        }),
    )
    .await;
    assert_eq!(connected["success"], true);

    // Producing spins up the loopback pair and the agent pipeline.
    let produced = request(
        &mut agent,
        json!({
            "type": "start-produce",
            "id": 4,
            "roomId": "r1",
            "kind": "audio",
            "rtpParameters": {
                "codecs": [{
                    "mimeType": "audio/opus",
                    "payloadType": 100,
                    "clockRate": 48000,
                    "channels": 2
                }],
                "encodings": [{"ssrc": 4242}]
            }
        }),
    )
    .await;
    let producer_id = produced["id"].as_str().expect("producer id");
    assert!(!producer_id.is_empty(), "produce must return the producer id");
    assert!(state.agents.read().await.contains_key("r1"));

    // Consumer side: transport, connect, consume, unpause.
    let created = request(
        &mut agent,
        json!({"type": "createConsumerTransport", "id": 5, "roomId": "r1"}),
    )
    .await;
    assert_eq!(created["success"], true);
    let dtls = created["clientTransportParams"]["dtlsParameters"].clone();

    let connected = request(
        &mut agent,
        json!({
            "type": "connect-consumer-transport",
            "id": 6,
            "roomId": "r1",
            "dtlsParameters": dtls,
        }),
    )
    .await;
    assert_eq!(connected["success"], true);

    let caps = request(&mut agent, json!({"type": "getRtpCapabilities", "id": 7})).await;
    let rtp_capabilities = caps["rtpCapabilities"].clone();
    assert!(rtp_capabilities["codecs"].is_array());

    let consumed = request(
        &mut agent,
        json!({
            "type": "consume-media",
            "id": 8,
            "roomId": "r1",
            "rtpCapabilities": rtp_capabilities,
            "producerId": producer_id,
        }),
    )
    .await;
    let consumer_id = consumed["consumerParams"]["id"]
        .as_str()
        .expect("consumer id");

    let unpaused = request(
        &mut agent,
        json!({
            "type": "unpauseConsumer",
            "id": 9,
            "roomId": "r1",
            "consumerId": consumer_id,
        }),
    )
    .await;
    assert_eq!(unpaused["success"], true);

    // Exit closes the agent pipeline and the now-empty room.
    send_json(&mut agent, json!({"type": "exit-room", "roomId": "r1"})).await;
    wait_until(|| {
        let state = state.clone();
        async move { !state.rooms.has_room("r1").await }
    })
    .await;
    assert!(!state.agents.read().await.contains_key("r1"));
}

#[tokio::test]
async fn reconnection_rebinds_without_renegotiation() {
    let (addr, state) = spawn_server().await;

    let mut agent = connect_client(addr, "Coach", "agent-1", "agent").await;
    let _ = recv_json(&mut agent).await;
    request(&mut agent, json!({"type": "joinRoom", "id": 1, "roomId": "r1"})).await;

    let mut customer = connect_client(addr, "Cara", "user-1", "user").await;
    let _ = recv_json(&mut customer).await;
    request(&mut customer, json!({"type": "joinRoom", "id": 1, "roomId": "r1"})).await;

    // The same identity connects again: a reconnection, not a new user.
    let mut customer_again = connect_client(addr, "Cara", "user-1", "user").await;
    let ack = recv_json(&mut customer_again).await;
    assert_eq!(ack["type"], "reconnected");
    assert_eq!(ack["userId"], "user-1");

    // The other member is notified.
    let notice = recv_json(&mut agent).await;
    assert_eq!(notice["type"], "player-reconnected");
    assert_eq!(notice["userId"], "user-1");

    // Still exactly one participant entry for the user.
    let room = state.rooms.get("r1").await.expect("room");
    assert_eq!(room.participant_count(), 2);

    // The rebound socket keeps working.
    let rejoined = request(
        &mut customer_again,
        json!({"type": "joinRoom", "id": 2, "roomId": "r1"}),
    )
    .await;
    assert_eq!(rejoined["success"], true);
    assert_eq!(rejoined["message"], "Rejoined the room successfully");
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within deadline");
}
