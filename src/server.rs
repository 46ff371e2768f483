//! WebSocket transport
//!
//! Accept loop and the per-connection pump. Each accepted socket goes
//! through the token handshake inside the configured handshake window, is
//! registered with the gateway, and then runs a select loop that moves
//! outbound events onto the wire and inbound frames into the gateway. When
//! either side ends, or the gateway drops the connection's sender, the loop
//! exits and the connection is deregistered.

use crate::auth::{JwtVerifier, MemoryRevocationStore, RevocationStore, TokenVerifier};
use crate::config::FabricConfig;
use crate::errors::{FabricError, FabricResult};
use crate::gateway::Gateway;
use crate::heartbeat::HeartbeatMonitor;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Standalone WebSocket server around a [`Gateway`]
pub struct FabricServer {
    gateway: Arc<Gateway>,
    monitor: Option<HeartbeatMonitor>,
}

impl FabricServer {
    /// Build a server with a JWT verifier from the configuration
    pub fn new(config: FabricConfig) -> Self {
        let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::with_leeway(
            &config.jwt.secret,
            config.jwt.leeway_secs,
        ));
        Self::with_parts(config, verifier, Arc::new(MemoryRevocationStore::new()))
    }

    /// Build a server with explicit verifier and revocation store
    pub fn with_parts(
        config: FabricConfig,
        verifier: Arc<dyn TokenVerifier>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        let gateway = Arc::new(Gateway::new(config, verifier, revocations));
        Self {
            gateway,
            monitor: None,
        }
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    /// Bind the listener, start the heartbeat monitor, and accept forever
    pub async fn run(&mut self, addr: SocketAddr) -> FabricResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FabricError::transport(format!("Failed to bind {}: {}", addr, e)))?;
        info!(%addr, "WebSocket server listening");

        self.monitor = Some(HeartbeatMonitor::start(self.gateway.clone()));

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socket(gateway, stream, peer).await {
                            debug!(%peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                }
            }
        }
    }

    /// Stop the heartbeat monitor
    pub fn shutdown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
    }
}

/// Upgrade, authenticate, register, then pump frames until either side ends
async fn handle_socket(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    peer: SocketAddr,
) -> FabricResult<()> {
    // One deadline bounds the whole handshake: the WebSocket upgrade and
    // the token check, including the revocation-store round-trip.
    let deadline = Instant::now() + gateway.config().handshake_timeout;

    // The upgrade callback is the only place the HTTP request is visible,
    // so the token is captured there and read back after the upgrade.
    let token_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let slot = token_slot.clone();
    let callback = move |request: &Request, response: Response| {
        let token = extract_token(request);
        if let Ok(mut guard) = slot.lock() {
            *guard = token;
        }
        Ok(response)
    };

    let upgrade = tokio_tungstenite::accept_hdr_async(stream, callback);
    let mut socket = match timeout_at(deadline, upgrade).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            return Err(FabricError::transport(format!(
                "WebSocket upgrade failed: {}",
                e
            )));
        }
        Err(_) => {
            return Err(FabricError::transport("Handshake timed out"));
        }
    };

    let token = token_slot.lock().ok().and_then(|guard| guard.clone());
    let identity = match timeout_at(deadline, gateway.authenticate(token.as_deref())).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return Err(e);
        }
        Err(_) => {
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: "Handshake timed out".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return Err(FabricError::transport("Handshake timed out"));
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let id = gateway.connect(identity, outbound_tx).await;
    debug!(connection_id = %id, %peer, "Transport loop started");

    let mut close_reason = "connection closed";
    loop {
        tokio::select! {
            event = outbound_rx.recv() => {
                let Some(event) = event else {
                    // Gateway evicted this connection; close the socket.
                    close_reason = "evicted";
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            close_reason = "write failed";
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Dropping unserializable event");
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        gateway.handle_raw(id, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "Socket error");
                        close_reason = "socket error";
                        break;
                    }
                }
            }
        }
    }

    gateway.disconnect(id, close_reason).await;
    Ok(())
}

/// Pull the bearer token from the upgrade request
///
/// The `token` query parameter wins; the `Authorization: Bearer` header is
/// the fallback for clients that can set headers on the upgrade.
fn extract_token(request: &Request) -> Option<String> {
    if let Some(token) = query_token(request.uri().query()) {
        return Some(token);
    }
    request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

fn query_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn bearer_token(header: &str) -> Option<String> {
    let token = header.strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Claims, JwtVerifier, MemoryRevocationStore, RevocationStore};
    use crate::protocol::ServerEvent;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn sign_token(user_id: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: vec![],
            departments: vec![],
            exp: now + 3600,
            iat: now,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn test_gateway(
        handshake_timeout: Duration,
        revocations: Arc<dyn RevocationStore>,
    ) -> Arc<Gateway> {
        let config = FabricConfig::builder()
            .handshake_timeout(handshake_timeout)
            .jwt_secret(SECRET)
            .build()
            .unwrap();
        Arc::new(Gateway::new(
            config,
            Arc::new(JwtVerifier::new(SECRET)),
            revocations,
        ))
    }

    async fn spawn_acceptor(
        gateway: Arc<Gateway>,
    ) -> (SocketAddr, tokio::task::JoinHandle<FabricResult<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_socket(gateway, stream, peer).await
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn valid_token_completes_the_handshake() {
        let gateway = test_gateway(
            Duration::from_secs(2),
            Arc::new(MemoryRevocationStore::new()),
        );
        let (addr, server) = spawn_acceptor(gateway.clone()).await;

        let url = format!("ws://{}/?token={}", addr, sign_token("u1"));
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected a text frame, got {:?}", frame);
        };
        let event: ServerEvent = serde_json::from_str(&text).unwrap();
        assert!(matches!(event, ServerEvent::Connected { .. }));
        assert_eq!(gateway.online_clients_count().await, 1);

        drop(socket);
        server.await.unwrap().unwrap();
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[tokio::test]
    async fn hung_revocation_lookup_ends_at_the_handshake_deadline() {
        struct StalledStore;

        #[async_trait::async_trait]
        impl RevocationStore for StalledStore {
            async fn is_blacklisted(&self, _token: &str) -> FabricResult<bool> {
                std::future::pending().await
            }
        }

        let gateway = test_gateway(Duration::from_millis(200), Arc::new(StalledStore));
        let (addr, server) = spawn_acceptor(gateway.clone()).await;

        let url = format!("ws://{}/?token={}", addr, sign_token("u1"));
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        // The server must end the connection once the deadline passes
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match socket.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        })
        .await;
        assert!(
            closed.is_ok(),
            "socket still open past the handshake deadline"
        );

        assert!(server.await.unwrap().is_err());
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[test]
    fn query_token_is_extracted() {
        assert_eq!(
            query_token(Some("token=abc.def.ghi")),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(
            query_token(Some("v=1&token=abc&x=2")),
            Some("abc".to_string())
        );
    }

    #[test]
    fn missing_or_empty_query_token_is_none() {
        assert_eq!(query_token(None), None);
        assert_eq!(query_token(Some("v=1")), None);
        assert_eq!(query_token(Some("token=")), None);
    }

    #[test]
    fn bearer_header_is_parsed() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def".to_string()));
        assert_eq!(bearer_token("Basic dXNlcg=="), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
