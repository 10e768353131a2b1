//! # WebSocket Transport
//!
//! Opens one Engine.IO websocket and turns it into a pair of packet channels.
//!
//! ## Link Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Socket Link Pump                                 │
//! │                                                                         │
//! │   SyncClient                    pump task                 server        │
//! │  ┌───────────┐  outgoing tx   ┌────────────┐  text frame  ┌────────┐   │
//! │  │           │ ─────────────► │  encode    │ ───────────► │        │   │
//! │  │           │                │            │              │        │   │
//! │  │           │  incoming rx   │  decode    │ ◄─────────── │        │   │
//! │  │           │ ◄───────────── │  "2" → "3" │  (engine     │        │   │
//! │  └───────────┘                └────────────┘   ping/pong) └────────┘   │
//! │                                                                         │
//! │  ENDING THE LINK                                                       │
//! │  ───────────────                                                       │
//! │  • client drops outgoing tx   → pump sends Close, exits                │
//! │  • server closes / errors     → pump exits, incoming rx yields None    │
//! │  • client drops incoming rx   → pump exits                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Packet, ENGINE_IO_VERSION};

// =============================================================================
// Endpoint
// =============================================================================

/// Builds `ws(s)://host/<path>?EIO=4&transport=websocket` from a base URL.
pub fn websocket_endpoint(base: &str, path: &str) -> SyncResult<Url> {
    let mut url = Url::parse(base)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "Socket URL must be http(s) or ws(s), got: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(format!("Cannot use scheme {} for {}", scheme, base)))?;

    url.set_path(path);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", &ENGINE_IO_VERSION.to_string())
        .append_pair("transport", "websocket");

    Ok(url)
}

// =============================================================================
// Socket Link
// =============================================================================

/// An open socket, seen as packet channels.
///
/// Dropping `outgoing` closes the socket. `incoming` yields `None` once the
/// socket is gone.
pub struct SocketLink {
    pub outgoing: mpsc::UnboundedSender<Packet>,
    pub incoming: mpsc::UnboundedReceiver<Packet>,
}

/// Opens socket links.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Url) -> SyncResult<SocketLink>;
}

// =============================================================================
// WebSocket Connector
// =============================================================================

/// Real connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &Url) -> SyncResult<SocketLink> {
        let (ws_stream, response) = connect_async(endpoint.as_str()).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(ws_stream, outgoing_rx, incoming_tx));

        Ok(SocketLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// Moves packets between the websocket and the link channels.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Packet>,
    incoming_tx: mpsc::UnboundedSender<Packet>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            // Handle outgoing packets
            outgoing = outgoing_rx.recv() => {
                let Some(packet) = outgoing else {
                    debug!("Link dropped by client, closing socket");
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                };
                let frame = match packet.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(?e, "Dropping unencodable packet");
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                    error!(?e, "WebSocket send failed");
                    break;
                }
            }

            // Handle incoming frames
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => match Packet::decode(text.as_str()) {
                        Ok(Packet::Ping) => {
                            if let Err(e) = write.send(WsMessage::Text("3".to_string().into())).await {
                                error!(?e, "Failed to answer engine ping");
                                break;
                            }
                        }
                        Ok(Packet::Open(info)) => {
                            debug!(sid = ?info.get("sid"), "Engine session opened");
                        }
                        Ok(Packet::Close) => {
                            info!("Server closed engine session");
                            break;
                        }
                        Ok(Packet::Pong) | Ok(Packet::Noop) => {}
                        Ok(packet) => {
                            if incoming_tx.send(packet).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(?e, "Failed to parse frame");
                        }
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("Received unexpected binary message");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(?e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }

            // Client no longer listening
            _ = incoming_tx.closed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    debug!("Socket pump stopped");
}

// =============================================================================
// In-Memory Connector (tests)
// =============================================================================

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use crate::protocol::SocketPacket;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted server side of one link.
    pub(crate) struct MemoryServer {
        pub to_client: mpsc::UnboundedSender<Packet>,
        pub from_client: mpsc::UnboundedReceiver<Packet>,
    }

    impl MemoryServer {
        /// Reads the CONNECT packet and returns its auth payload.
        pub async fn expect_connect(&mut self) -> Value {
            match self.from_client.recv().await {
                Some(Packet::Message(SocketPacket::Connect(Some(auth)))) => auth,
                other => panic!("expected CONNECT, got {:?}", other),
            }
        }

        pub fn accept(&self) {
            let _ = self
                .to_client
                .send(Packet::Message(SocketPacket::Connect(Some(json!({"sid": "mem"})))));
        }

        /// Reads CONNECT and accepts it.
        pub async fn handshake(&mut self) -> Value {
            let auth = self.expect_connect().await;
            self.accept();
            auth
        }

        pub fn emit(&self, name: &str, data: Value) {
            let _ = self.to_client.send(Packet::event(name, Some(data)));
        }

        pub fn send(&self, packet: Packet) {
            let _ = self.to_client.send(packet);
        }

        /// Next client event, skipping heartbeat pings.
        pub async fn next_event(&mut self) -> Option<(String, Option<Value>)> {
            loop {
                match self.from_client.recv().await? {
                    Packet::Message(SocketPacket::Event { name, .. }) if name == "ping" => continue,
                    Packet::Message(SocketPacket::Event { name, data }) => {
                        return Some((name, data))
                    }
                    _ => continue,
                }
            }
        }

        /// Client events already queued, without waiting.
        pub fn drain_events(&mut self) -> Vec<(String, Option<Value>)> {
            let mut events = Vec::new();
            while let Ok(packet) = self.from_client.try_recv() {
                if let Packet::Message(SocketPacket::Event { name, data }) = packet {
                    if name != "ping" {
                        events.push((name, data));
                    }
                }
            }
            events
        }
    }

    /// Connector whose every `open` hands the server side to the test.
    pub(crate) struct MemoryConnector {
        servers: mpsc::UnboundedSender<MemoryServer>,
        opens: AtomicUsize,
        refuse: AtomicBool,
    }

    impl MemoryConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryServer>) {
            let (servers, rx) = mpsc::unbounded_channel();
            let connector = MemoryConnector {
                servers,
                opens: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            };
            (Arc::new(connector), rx)
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        /// Makes every following `open` fail with a connection error.
        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self, _endpoint: &Url) -> SyncResult<SocketLink> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SyncError::ConnectionFailed("connection refused".into()));
            }

            let (client_out, server_in) = mpsc::unbounded_channel();
            let (server_out, client_in) = mpsc::unbounded_channel();
            let _ = self.servers.send(MemoryServer {
                to_client: server_out,
                from_client: server_in,
            });

            Ok(SocketLink {
                outgoing: client_out,
                incoming: client_in,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_http_base() {
        let url = websocket_endpoint("http://localhost:3001", "/socket.io/").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:3001/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_endpoint_from_https_base_keeps_host() {
        let url = websocket_endpoint("https://erp.example.com/app?x=1", "/socket.io/").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("erp.example.com"));
        assert_eq!(url.query(), Some("EIO=4&transport=websocket"));
    }

    #[test]
    fn test_endpoint_rejects_other_schemes() {
        assert!(matches!(
            websocket_endpoint("ftp://x", "/socket.io/"),
            Err(SyncError::InvalidUrl(_))
        ));
        assert!(websocket_endpoint("no scheme", "/").is_err());
    }

    #[tokio::test]
    async fn test_memory_link_carries_packets() {
        let (connector, mut servers) = memory::MemoryConnector::new();
        let endpoint = websocket_endpoint("http://localhost", "/socket.io/").unwrap();

        let mut link = connector.open(&endpoint).await.unwrap();
        let mut server = servers.recv().await.unwrap();

        link.outgoing.send(Packet::event("ping", None)).unwrap();
        assert_eq!(server.from_client.recv().await, Some(Packet::event("ping", None)));

        server.send(Packet::event("pong", None));
        assert_eq!(link.incoming.recv().await, Some(Packet::event("pong", None)));

        drop(server);
        assert_eq!(link.incoming.recv().await, None);
        assert_eq!(connector.opens(), 1);
    }
}
