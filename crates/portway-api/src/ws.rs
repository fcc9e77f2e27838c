//! Node control channel over WebSocket
//!
//! Each socket gets a writer task fed by a bounded queue, so sends from the
//! control plane never block on the network. The reader loop decodes text
//! frames and hands them to the dispatcher until the socket closes or the
//! channel is replaced by a newer connection of the same node.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use portway_control::{send_frame, ChannelError, ChannelId, NodeChannel};
use portway_proto::{ControlMessage, Frame, FrameCodec, MAX_FRAME_SIZE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AppState;

/// Frames queued per channel before sends fail with backpressure
pub const OUTBOUND_QUEUE: usize = 256;

/// How long a socket without `nodeId` may take to send its register frame
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WsChannel {
    id: ChannelId,
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl WsChannel {
    pub fn new(tx: mpsc::Sender<Message>, closed: CancellationToken) -> Self {
        Self {
            id: ChannelId::new(),
            tx,
            closed,
        }
    }
}

impl NodeChannel for WsChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        match self.tx.try_send(Message::Text(text.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChannelError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }
}

#[derive(Debug, Deserialize)]
pub struct NodeSocketQuery {
    #[serde(rename = "nodeId")]
    pub node_id: Option<String>,
}

/// `GET /ws/node?nodeId=<id>`
pub async fn node_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeSocketQuery>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
) -> Response {
    let client_addr = connect_info.map(|Extension(ConnectInfo(addr))| addr.to_string());
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_session(socket, state, query.node_id, client_addr))
}

async fn run_session(
    socket: WebSocket,
    state: Arc<AppState>,
    node_id: Option<String>,
    client_addr: Option<String>,
) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let closed = CancellationToken::new();
    let channel = Arc::new(WsChannel::new(tx, closed.clone()));
    let writer = tokio::spawn(write_loop(sink, rx, closed.clone()));

    let node_id = match node_id {
        Some(id) => id,
        None => match await_register(&mut stream).await {
            Ok(id) => id,
            Err(reason) => {
                debug!(client = ?client_addr, "Node socket refused: {}", reason);
                let _ = send_frame(channel.as_ref(), &Frame::error(reason));
                channel.close();
                let _ = writer.await;
                return;
            }
        },
    };

    if let Err(e) = state
        .plane
        .dispatcher
        .on_connect(&node_id, channel.clone(), client_addr)
        .await
    {
        warn!(node_id = %node_id, "Node connection refused: {}", e);
        let _ = send_frame(channel.as_ref(), &Frame::error(e.to_string()));
        channel.close();
        let _ = writer.await;
        return;
    }

    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => {
                debug!(node_id = %node_id, "Channel closed by the control plane");
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let reply = state
                    .plane
                    .dispatcher
                    .handle_text(&node_id, text.as_str())
                    .await;
                if let Some(reply) = reply {
                    if let Err(e) = send_frame(channel.as_ref(), &reply) {
                        warn!(node_id = %node_id, "Reply not delivered: {}", e);
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let _ = send_frame(
                    channel.as_ref(),
                    &Frame::error("binary frames are not supported"),
                );
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(node_id = %node_id, "Socket read failed: {}", e);
                break;
            }
        }
    }

    state
        .plane
        .dispatcher
        .on_disconnect(&node_id, channel.id())
        .await;
    channel.close();
    let _ = writer.await;
    info!(node_id = %node_id, channel = %channel.id(), "Node socket closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    closed.cancel();
}

/// Wait for the `register` frame of a socket opened without `nodeId`
async fn await_register(stream: &mut SplitStream<WebSocket>) -> Result<String, String> {
    let first = tokio::time::timeout(REGISTER_TIMEOUT, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for register".to_string())?
    .ok_or_else(|| "socket closed before register".to_string())?;

    let frame = FrameCodec::decode(first.as_str()).map_err(|e| format!("invalid message: {}", e))?;
    match frame.body {
        ControlMessage::Register(payload) => Ok(payload.node_id),
        other => Err(format!(
            "first message must be register, got {}",
            other.message_type()
        )),
    }
}
