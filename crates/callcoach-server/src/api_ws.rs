//! WebSocket signaling gateway and connection management.
//!
//! Each connection authenticates with an identity token before upgrade,
//! then exchanges tagged JSON requests carrying a correlation id. Handlers
//! resolve the room/user context, perform exactly one negotiation or media
//! operation, and answer with a typed result; any failure is normalized to
//! an application error, logged once with correlation fields, and returned
//! as a structured failure — a handler error never kills the connection.

use crate::prompt;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use callcoach_media::{
    ops, ClientTransportParams, ConsumeOutcome, ConsumerParams, DtlsParameters, MediaKind,
    RtpCapabilities, RtpParameters,
};
use callcoach_pipeline::AgentPipeline;
use callcoach_rooms::Room;
use callcoach_types::{AppError, ConnectToken, UserIdentity};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Per-session outbox depth. Beyond this the client is too slow and
/// messages are dropped.
const SESSION_OUTBOX_DEPTH: usize = 256;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// The identity token: JSON `{name, userId, role}`.
    pub token: Option<String>,
}

/// Incoming protocol messages. `id` correlates the response.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "joinRoom")]
    JoinRoom {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "createProducerTransport")]
    CreateProducerTransport {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "connect-producer-transport")]
    ConnectProducerTransport {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename = "getRtpCapabilities")]
    GetRtpCapabilities { id: u64 },
    #[serde(rename = "createConsumerTransport")]
    CreateConsumerTransport {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "connect-consumer-transport")]
    ConnectConsumerTransport {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename = "start-produce")]
    StartProduce {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
        kind: MediaKind,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: RtpParameters,
    },
    #[serde(rename = "consume-media")]
    ConsumeMedia {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "rtpCapabilities")]
        rtp_capabilities: RtpCapabilities,
        #[serde(rename = "producerId")]
        producer_id: String,
    },
    #[serde(rename = "unpauseConsumer")]
    UnpauseConsumer {
        id: u64,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "consumerId")]
        consumer_id: String,
    },
    #[serde(rename = "exit-room")]
    ExitRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

/// Server-initiated messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "connected")]
    Connected {
        message: String,
        name: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "socketId")]
        socket_id: String,
        #[serde(rename = "queueStatus")]
        queue_status: String,
    },
    #[serde(rename = "reconnected")]
    Reconnected {
        message: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "socketId")]
        socket_id: String,
    },
    #[serde(rename = "player-reconnected")]
    PlayerReconnected {
        #[serde(rename = "userId")]
        user_id: String,
        name: String,
    },
    #[serde(rename = "coaching-suggestion")]
    CoachingSuggestion {
        #[serde(rename = "roomId")]
        room_id: String,
        text: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Manages live WebSocket bindings: socket → outbox and user → socket.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>,
    user_sockets: Arc<RwLock<HashMap<String, String>>>,
}

impl ConnectionRegistry {
    /// Binds a new connection.
    pub async fn bind(&self, socket_id: String, user_id: String, tx: mpsc::Sender<String>) {
        self.sessions.write().await.insert(socket_id.clone(), tx);
        self.user_sockets.write().await.insert(user_id, socket_id);
    }

    /// Rebinds a user to a new socket, dropping the superseded session's
    /// outbox without touching any media state.
    pub async fn rebind(
        &self,
        user_id: &str,
        old_socket_id: &str,
        new_socket_id: String,
        tx: mpsc::Sender<String>,
    ) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(old_socket_id);
        sessions.insert(new_socket_id.clone(), tx);
        drop(sessions);
        self.user_sockets
            .write()
            .await
            .insert(user_id.to_string(), new_socket_id);
    }

    /// The socket currently bound to a user, if any.
    pub async fn socket_for_user(&self, user_id: &str) -> Option<String> {
        self.user_sockets.read().await.get(user_id).cloned()
    }

    /// Removes a socket's outbox. Unconditional on disconnect.
    pub async fn unbind_socket(&self, socket_id: &str) {
        self.sessions.write().await.remove(socket_id);
    }

    /// Removes a user's socket binding.
    pub async fn unbind_user(&self, user_id: &str) {
        self.user_sockets.write().await.remove(user_id);
    }

    /// Sends a message to a specific socket; slow consumers drop.
    pub async fn send_to_socket(&self, socket_id: &str, message_json: String) {
        let sessions = self.sessions.read().await;
        if let Some(tx) = sessions.get(socket_id) {
            if let Err(e) = tx.try_send(message_json) {
                tracing::warn!(socket_id, "dropping message for slow consumer: {}", e);
            }
        }
    }

    /// Sends a message to whatever socket a user is currently bound to.
    pub async fn send_to_user(&self, user_id: &str, message_json: String) {
        let socket_id = self.socket_for_user(user_id).await;
        if let Some(socket_id) = socket_id {
            self.send_to_socket(&socket_id, message_json).await;
        }
    }
}

/// Serializes an outgoing message, sending a best-effort error on failure.
fn to_json(message: &OutgoingMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("failed to serialize outgoing message: {}", e);
            None
        }
    }
}

fn send_now(tx: &mpsc::Sender<String>, message: &OutgoingMessage) {
    if let Some(json) = to_json(message) {
        if let Err(e) = tx.try_send(json) {
            tracing::warn!("failed to queue outgoing message: {}", e);
        }
    }
}

/// Builds a `{"type":"response","id":N,"payload":{...}}` envelope.
///
/// The payload is nested so its fields (notably `start-produce`'s `id`)
/// can never collide with the correlation id.
fn response_json(id: u64, payload: Value) -> String {
    json!({"type": "response", "id": id, "payload": payload}).to_string()
}

/// WebSocket handler: `GET /ws?token=<json identity>`.
///
/// The token must parse as `{name, userId, role}`; a missing or malformed
/// token rejects the connection before any state is created.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let Some(raw_token) = params.token else {
        tracing::warn!("websocket connect missing identity token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let token: ConnectToken = match serde_json::from_str(raw_token.trim()) {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!("websocket connect with malformed identity token: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Handles one WebSocket connection for its lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: ConnectToken) {
    let socket_id = Uuid::new_v4().to_string();
    let identity = UserIdentity::from_token(&token, &socket_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_OUTBOX_DEPTH);

    // Forward outbox messages to the wire.
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    // A live connection for the same userId means this is a reconnection.
    match state.connections.socket_for_user(&identity.user_id).await {
        Some(old_socket_id) => {
            tracing::info!(
                user_id = %identity.user_id,
                old_socket_id = %old_socket_id,
                new_socket_id = %socket_id,
                "detected reconnection attempt"
            );
            handle_reconnection(&state, &identity, &old_socket_id, tx.clone()).await;
        }
        None => {
            state
                .connections
                .bind(socket_id.clone(), identity.user_id.clone(), tx.clone())
                .await;
            send_now(
                &tx,
                &OutgoingMessage::Connected {
                    message: "Connected successfully".to_string(),
                    name: identity.name.clone(),
                    user_id: identity.user_id.clone(),
                    socket_id: socket_id.clone(),
                    queue_status: "waiting".to_string(),
                },
            );
            tracing::info!(
                user_id = %identity.user_id,
                socket_id = %socket_id,
                name = %identity.name,
                "user connected"
            );
        }
    }

    // Message dispatch loop: arrival order per connection is preserved.
    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                match serde_json::from_str::<IncomingMessage>(text.as_str()) {
                    Ok(incoming) => dispatch(&state, &identity, incoming, &tx).await,
                    Err(e) => {
                        tracing::warn!(
                            user_id = %identity.user_id,
                            socket_id = %socket_id,
                            "failed to parse incoming message: {}",
                            e
                        );
                        send_now(
                            &tx,
                            &OutgoingMessage::Error {
                                message: "invalid message format".to_string(),
                            },
                        );
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    handle_disconnect(&state, &identity, &socket_id).await;
    send_task.abort();
}

/// Rebinds the socket, rejoins the previous room without renegotiating
/// transports, and notifies the other member.
async fn handle_reconnection(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    old_socket_id: &str,
    tx: mpsc::Sender<String>,
) {
    state
        .connections
        .rebind(
            &identity.user_id,
            old_socket_id,
            identity.socket_id.clone(),
            tx.clone(),
        )
        .await;
    state.users.add_or_update(identity.clone()).await;

    match state.rooms.find_room_by_user(&identity.user_id).await {
        Some(room) => {
            // Rejoin updates the stored identity; media stays untouched.
            room.add_participant(identity.clone());
            tracing::info!(
                room_id = %room.room_id(),
                user_id = %identity.user_id,
                socket_id = %identity.socket_id,
                "user rejoined previous room"
            );

            if let Some(message) = to_json(&OutgoingMessage::PlayerReconnected {
                user_id: identity.user_id.clone(),
                name: identity.name.clone(),
            }) {
                for participant in room.participants() {
                    if participant.user_id != identity.user_id {
                        state
                            .connections
                            .send_to_user(&participant.user_id, message.clone())
                            .await;
                    }
                }
            }
        }
        None => {
            tracing::warn!(
                user_id = %identity.user_id,
                "reconnection attempted but room not found for user"
            );
        }
    }

    send_now(
        &tx,
        &OutgoingMessage::Reconnected {
            message: "Reconnected successfully".to_string(),
            user_id: identity.user_id.clone(),
            socket_id: identity.socket_id.clone(),
        },
    );
}

/// Unbinds the socket; when it was the user's last live binding, releases
/// the user's resources and their room membership.
async fn handle_disconnect(state: &Arc<AppState>, identity: &UserIdentity, socket_id: &str) {
    state.connections.unbind_socket(socket_id).await;

    let current = state.connections.socket_for_user(&identity.user_id).await;
    if current.as_deref() != Some(socket_id) {
        // Superseded by a reconnection; the user's resources live on.
        tracing::debug!(
            user_id = %identity.user_id,
            socket_id,
            "stale socket disconnected after reconnection"
        );
        return;
    }

    state.connections.unbind_user(&identity.user_id).await;

    if let Some(room) = state.rooms.find_room_by_user(&identity.user_id).await {
        state.close_agent(room.room_id()).await;
        state
            .rooms
            .remove_user_from_any_room(&identity.user_id)
            .await;
    } else {
        state.users.remove_by_user_id(&identity.user_id).await;
    }

    tracing::info!(
        user_id = %identity.user_id,
        socket_id,
        "user disconnected, resources released"
    );
}

/// Resolves a room or produces the canonical not-found error.
async fn require_room(
    state: &Arc<AppState>,
    room_id: &str,
    context: &str,
) -> Result<Arc<Room>, AppError> {
    state.rooms.get(room_id).await.ok_or_else(|| {
        AppError::not_found("ROOM_NOT_FOUND", format!("{context}: Room not found"))
    })
}

/// Resolves the calling user from their socket binding.
async fn require_user(
    state: &Arc<AppState>,
    identity: &UserIdentity,
) -> Result<Arc<callcoach_rooms::User>, AppError> {
    state
        .users
        .get_by_user_id(&identity.user_id)
        .await
        .ok_or_else(|| AppError::not_found("USER_NOT_FOUND", "User is not registered"))
}

/// Dispatches one request, normalizing every failure into a structured
/// response on the caller's correlation id.
async fn dispatch(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    message: IncomingMessage,
    tx: &mpsc::Sender<String>,
) {
    let dev_mode = state.config.server.dev_mode;

    match message {
        IncomingMessage::JoinRoom { id, room_id } => {
            let result = handle_join_room(state, identity, &room_id).await;
            let payload = match result {
                Ok(payload) => payload,
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "joinRoom");
                    json!({
                        "success": false,
                        "message": err.public_message(dev_mode),
                    })
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::CreateProducerTransport { id, room_id } => {
            let result = handle_create_transport(state, identity, &room_id, TransportSide::Producer)
                .await;
            let payload = match result {
                Ok(params) => json!({
                    "success": true,
                    "message": "Producer transport created",
                    "clientTransportParams": params,
                }),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "createProducerTransport");
                    json!({
                        "success": false,
                        "message": err.public_message(dev_mode),
                        "clientTransportParams": Value::Null,
                    })
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::ConnectProducerTransport {
            id,
            room_id,
            dtls_parameters,
        } => {
            let result = handle_connect_transport(
                state,
                identity,
                &room_id,
                TransportSide::Producer,
                dtls_parameters,
            )
            .await;
            let payload = match result {
                Ok(()) => json!({"success": true, "message": "Producer transport connected"}),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "connect-producer-transport");
                    json!({"success": false, "message": err.public_message(dev_mode)})
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::GetRtpCapabilities { id } => {
            let capabilities = state
                .rooms
                .find_room_by_user(&identity.user_id)
                .await
                .map(|room| room.router().rtp_capabilities().clone());
            let payload = json!({"rtpCapabilities": capabilities});
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::CreateConsumerTransport { id, room_id } => {
            let result = handle_create_transport(state, identity, &room_id, TransportSide::Consumer)
                .await;
            let payload = match result {
                Ok(params) => json!({
                    "success": true,
                    "message": "Consumer transport created",
                    "clientTransportParams": params,
                }),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "createConsumerTransport");
                    json!({
                        "success": false,
                        "message": err.public_message(dev_mode),
                        "clientTransportParams": Value::Null,
                    })
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::ConnectConsumerTransport {
            id,
            room_id,
            dtls_parameters,
        } => {
            let result = handle_connect_transport(
                state,
                identity,
                &room_id,
                TransportSide::Consumer,
                dtls_parameters,
            )
            .await;
            let payload = match result {
                Ok(()) => json!({"success": true}),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "connect-consumer-transport");
                    json!({"success": false})
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::StartProduce {
            id,
            room_id,
            kind,
            rtp_parameters,
        } => {
            let result = handle_start_produce(state, identity, &room_id, kind, rtp_parameters)
                .await;
            let payload = match result {
                Ok(producer_id) => json!({"id": producer_id}),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "start-produce");
                    json!({"id": "", "message": err.public_message(dev_mode)})
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::ConsumeMedia {
            id,
            room_id,
            rtp_capabilities,
            producer_id,
        } => {
            let result =
                handle_consume_media(state, identity, &room_id, rtp_capabilities, &producer_id)
                    .await;
            let payload = match result {
                Ok(Some(params)) => json!({"consumerParams": params}),
                Ok(None) => json!({"message": "Cannot consume"}),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "consume-media");
                    json!({"message": err.public_message(dev_mode)})
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::UnpauseConsumer {
            id,
            room_id,
            consumer_id,
        } => {
            let result = handle_unpause_consumer(state, identity, &consumer_id).await;
            let payload = match result {
                Ok(()) => json!({"success": true}),
                Err(err) => {
                    log_handler_error(&err, &room_id, identity, "unpauseConsumer");
                    json!({"success": false})
                }
            };
            let _ = tx.send(response_json(id, payload)).await;
        }
        IncomingMessage::ExitRoom { room_id } => {
            state.close_agent(&room_id).await;
            state
                .rooms
                .remove_participant(&room_id, &identity.user_id)
                .await;
            tracing::info!(
                room_id = %room_id,
                user_id = %identity.user_id,
                "user exited room"
            );
        }
    }
}

fn log_handler_error(err: &AppError, room_id: &str, identity: &UserIdentity, operation: &str) {
    tracing::error!(
        room_id,
        user_id = %identity.user_id,
        socket_id = %identity.socket_id,
        code = err.code(),
        operational = err.is_operational(),
        "{operation} failed: {}",
        err.message()
    );
}

async fn handle_join_room(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    room_id: &str,
) -> Result<Value, AppError> {
    // The first join attempt for a roomId creates the room; creation is
    // idempotent so concurrent joiners race safely.
    state
        .rooms
        .create_room(room_id, &identity.user_id)
        .await
        .map_err(AppError::from)?;

    let outcome = state
        .rooms
        .join_room(room_id, identity.clone())
        .await
        .map_err(AppError::from)?;
    serde_json::to_value(&outcome)
        .map_err(|e| AppError::internal(format!("failed to serialize join outcome: {e}")))
}

enum TransportSide {
    Producer,
    Consumer,
}

async fn handle_create_transport(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    room_id: &str,
    side: TransportSide,
) -> Result<ClientTransportParams, AppError> {
    let context = match side {
        TransportSide::Producer => "CreateProducerRequest",
        TransportSide::Consumer => "CreateConsumerRequest",
    };
    let room = require_room(state, room_id, context).await?;
    let user = require_user(state, identity).await?;

    let (transport, params) = ops::create_client_transport(room.router(), &state.config.media)
        .map_err(AppError::from)?;

    match side {
        TransportSide::Producer => user.set_producer_transport(transport),
        TransportSide::Consumer => user.set_consumer_transport(transport),
    }
    Ok(params)
}

async fn handle_connect_transport(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    room_id: &str,
    side: TransportSide,
    dtls_parameters: DtlsParameters,
) -> Result<(), AppError> {
    let context = match side {
        TransportSide::Producer => "ConnectProducerRequest",
        TransportSide::Consumer => "ConnectConsumerRequest",
    };
    require_room(state, room_id, context).await?;
    let user = require_user(state, identity).await?;

    let transport = match side {
        TransportSide::Producer => user.producer_transport(),
        TransportSide::Consumer => user.consumer_transport(),
    }
    .ok_or_else(|| AppError::not_found("TRANSPORT_NOT_FOUND", "Transport has not been created"))?;

    ops::connect_transport(&transport, dtls_parameters).map_err(AppError::from)
}

/// Creates the client producer track plus the internal loopback pair, and
/// starts the agent pipeline listening on the tapped stream.
async fn handle_start_produce(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    room_id: &str,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
) -> Result<String, AppError> {
    let room = require_room(state, room_id, "StartProducingRequest").await?;
    let user = require_user(state, identity).await?;

    let transport = user.producer_transport().ok_or_else(|| {
        AppError::not_found("TRANSPORT_NOT_FOUND", "Producer transport has not been created")
    })?;

    let producer =
        ops::create_producer_track(&transport, kind, rtp_parameters).map_err(AppError::from)?;
    user.set_producer_track(producer.clone());

    // The internal loopback pair feeding the agent from the same stream.
    let direct = ops::create_direct_transport(room.router()).map_err(AppError::from)?;
    let listener = ops::create_direct_consumer(&direct, producer.id()).map_err(AppError::from)?;
    let agent_producer =
        ops::create_direct_producer(&direct, &listener).map_err(AppError::from)?;

    let ssrc = listener
        .rtp_parameters()
        .primary_ssrc()
        .ok_or_else(|| AppError::validation("SSRC_MISSING", "Producer carries no encoding ssrc"))?;

    let (suggestions_tx, mut suggestions_rx) = mpsc::channel(64);
    let pipeline = AgentPipeline::start(
        prompt::COACHING_PERSONA,
        room.prompt(),
        direct,
        listener,
        agent_producer,
        ssrc,
        state.stt_connector.as_ref(),
        state.config.stt.clone(),
        state.chat_model.clone(),
        suggestions_tx,
    )
    .await
    .map_err(AppError::from)?;

    if let Some(previous) = state
        .agents
        .write()
        .await
        .insert(room_id.to_string(), pipeline)
    {
        previous.close();
    }

    // Surface coaching sentences on the producing user's socket.
    {
        let connections = state.connections.clone();
        let user_id = identity.user_id.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            while let Some(utterance) = suggestions_rx.recv().await {
                if let Some(message) = to_json(&OutgoingMessage::CoachingSuggestion {
                    room_id: room_id.clone(),
                    text: utterance.text,
                }) {
                    connections.send_to_user(&user_id, message).await;
                }
            }
        });
    }

    tracing::info!(
        room_id,
        user_id = %identity.user_id,
        producer_id = %producer.id(),
        "producer track created, agent pipeline listening"
    );
    Ok(producer.id().to_string())
}

async fn handle_consume_media(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    room_id: &str,
    rtp_capabilities: RtpCapabilities,
    producer_id: &str,
) -> Result<Option<ConsumerParams>, AppError> {
    let room = require_room(state, room_id, "ConsumeMediaRequest").await?;
    let user = require_user(state, identity).await?;

    let transport = user.consumer_transport().ok_or_else(|| {
        AppError::not_found("TRANSPORT_NOT_FOUND", "Consumer transport has not been created")
    })?;

    let outcome =
        ops::create_consumer_track(&transport, room.router(), &rtp_capabilities, producer_id)
            .map_err(AppError::from)?;

    match outcome {
        ConsumeOutcome::Consumed { consumer, params } => {
            user.add_consumer_track(consumer);
            Ok(Some(params))
        }
        ConsumeOutcome::CannotConsume => Ok(None),
    }
}

async fn handle_unpause_consumer(
    state: &Arc<AppState>,
    identity: &UserIdentity,
    consumer_id: &str,
) -> Result<(), AppError> {
    let user = require_user(state, identity).await?;
    let consumer = user
        .consumer_track(consumer_id)
        .ok_or_else(|| AppError::not_found("CONSUMER_NOT_FOUND", "Consumer instance not found"))?;
    ops::resume_consumer(&consumer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_messages_parse_wire_names() {
        let join: IncomingMessage =
            serde_json::from_str(r#"{"type":"joinRoom","id":1,"roomId":"r1"}"#).unwrap();
        assert!(matches!(join, IncomingMessage::JoinRoom { id: 1, ref room_id } if room_id == "r1"));

        let connect: IncomingMessage = serde_json::from_str(
            r#"{
                "type": "connect-producer-transport",
                "id": 2,
                "roomId": "r1",
                "dtlsParameters": {"role": "client", "fingerprints": []}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            connect,
            IncomingMessage::ConnectProducerTransport { id: 2, .. }
        ));

        let produce: IncomingMessage = serde_json::from_str(
            r#"{
                "type": "start-produce",
                "id": 3,
                "roomId": "r1",
                "kind": "audio",
                "rtpParameters": {
                    "codecs": [{"mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2}],
                    "encodings": [{"ssrc": 1234}]
                }
            }"#,
        )
        .unwrap();
        match produce {
            IncomingMessage::StartProduce {
                kind,
                rtp_parameters,
                ..
            } => {
                assert_eq!(kind, MediaKind::Audio);
                assert_eq!(rtp_parameters.primary_ssrc(), Some(1234));
            }
            other => panic!("expected start-produce, got {other:?}"),
        }
    }

    #[test]
    fn outgoing_messages_use_wire_names() {
        let connected = OutgoingMessage::Connected {
            message: "Connected successfully".to_string(),
            name: "Ada".to_string(),
            user_id: "u1".to_string(),
            socket_id: "s1".to_string(),
            queue_status: "waiting".to_string(),
        };
        let json = serde_json::to_value(&connected).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["queueStatus"], "waiting");

        let suggestion = OutgoingMessage::CoachingSuggestion {
            room_id: "r1".to_string(),
            text: "Acknowledge the concern.".to_string(),
        };
        let json = serde_json::to_value(&suggestion).unwrap();
        assert_eq!(json["type"], "coaching-suggestion");
        assert_eq!(json["roomId"], "r1");
    }

    #[test]
    fn response_envelope_carries_id_and_payload() {
        let json = response_json(7, json!({"success": true, "message": "ok", "id": "p-1"}));
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], 7, "payload fields must not clobber the correlation id");
        assert_eq!(value["payload"]["success"], true);
        assert_eq!(value["payload"]["message"], "ok");
        assert_eq!(value["payload"]["id"], "p-1");
    }

    #[tokio::test]
    async fn registry_rebind_replaces_the_old_session() {
        let registry = ConnectionRegistry::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);

        registry.bind("s1".to_string(), "u1".to_string(), tx1).await;
        registry.rebind("u1", "s1", "s2".to_string(), tx2).await;

        registry.send_to_user("u1", "hello".to_string()).await;
        assert_eq!(rx2.recv().await.as_deref(), Some("hello"));
        assert!(rx1.try_recv().is_err(), "old session must receive nothing");

        assert_eq!(registry.socket_for_user("u1").await.as_deref(), Some("s2"));
    }
}
