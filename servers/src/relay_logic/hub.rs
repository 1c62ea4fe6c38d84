use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// A text frame and the client it came from.
#[derive(Debug)]
struct Frame {
    sender: usize,
    text: String,
}

/// Shared state of the relay: one broadcast channel that every client both
/// publishes to and listens on.
#[derive(Clone)]
pub struct RelayState {
    frames: broadcast::Sender<Arc<Frame>>,
    clients: Arc<AtomicUsize>,
    next_client_id: Arc<AtomicUsize>,
    relayed: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity);
        Self {
            frames,
            clients: Arc::new(AtomicUsize::new(0)),
            next_client_id: Arc::new(AtomicUsize::new(1)),
            relayed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn relayed_frames(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: RelayState, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Relay listening on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Relay shutting down.");
        })
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "clients": state.client_count(),
        "relayed": state.relayed_frames(),
    }))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let mut frames = state.frames.subscribe();
    state.clients.fetch_add(1, Ordering::Relaxed);
    log::info!("Client {} connected", client_id);

    let (mut outbound, mut inbound) = socket.split();

    loop {
        tokio::select! {
            // Frames published by this client
            incoming = inbound.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.relayed.fetch_add(1, Ordering::Relaxed);
                    // No receivers is fine: nobody else is connected yet.
                    let _ = state.frames.send(Arc::new(Frame { sender: client_id, text: text.to_string() }));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("Client {} read error: {}", client_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            // Frames published by everybody else
            relayed = frames.recv() => match relayed {
                Ok(frame) if frame.sender == client_id => {}
                Ok(frame) => {
                    if outbound.send(Message::Text(frame.text.clone().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Client {} is too slow, skipped {} frame(s)", client_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    state.clients.fetch_sub(1, Ordering::Relaxed);
    log::info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

    #[tokio::test]
    async fn frames_reach_every_other_client_but_not_the_sender() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}/ws", addr);
        let root_url = format!("ws://{}", addr);
        let state = RelayState::new(16);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, state.clone(), shutdown.clone()));

        let (mut broker, _) = connect_async(url.as_str()).await.unwrap();
        let (mut display, _) = connect_async(root_url.as_str()).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while state.client_count() < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let frame = r#"{"timestamp":1000,"data":{"latitude":42.0}}"#;
        broker.send(WsMessage::Text(frame.to_string().into())).await.unwrap();

        let received = timeout(Duration::from_secs(5), display.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(received.into_text().unwrap().as_str(), frame);
        assert!(timeout(Duration::from_millis(200), broker.next()).await.is_err());
        assert_eq!(state.relayed_frames(), 1);

        shutdown.cancel();
        drop(broker);
        drop(display);
        timeout(Duration::from_secs(5), server).await.unwrap().unwrap().unwrap();
    }
}
