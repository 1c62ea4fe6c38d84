//! # Mock Telemetry Source
//!
//! A local WebSocket server standing in for the tracker relay. Tests accept
//! the adapter's connections one by one and push frames or drop the link at
//! will.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::protocol::Message};

pub struct MockSource {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<Peer>,
    acceptor: JoinHandle<()>,
}

/// One accepted connection from the adapter.
pub struct Peer {
    ws: WebSocketStream<TcpStream>,
}

impl MockSource {
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, peers) = mpsc::unbounded_channel();

        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                match accept_async(stream).await {
                    Ok(ws) => {
                        if tx.send(Peer { ws }).is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("mock source handshake failed: {}", e),
                }
            }
        });

        Ok(Self { addr, peers, acceptor })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Waits for the adapter to (re)connect.
    pub async fn next_peer(&mut self, wait: Duration) -> Option<Peer> {
        timeout(wait, self.peers.recv()).await.ok().flatten()
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl Peer {
    pub async fn send_text(&mut self, text: &str) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.ws.send(Message::Text(text.to_string().into())).await
    }

    pub async fn send_json(&mut self, value: serde_json::Value) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.send_text(&value.to_string()).await
    }

    /// Closes the connection with a close frame.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
