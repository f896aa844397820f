//! Rendezvous server: session registry and message relay.

use super::protocol::{ClientMessage, ErrorCode, RendezvousError, ServerMessage};
use crate::peer::{PeerId, PeerRecord, now_millis};
use crate::region::RegionId;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

/// Rendezvous server configuration
#[derive(Debug, Clone)]
pub struct RendezvousServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// How long a new connection may take to send `register`
    pub register_timeout: Duration,
    /// Interval between unsolicited peer-list pushes and stale sweeps
    pub peer_list_interval: Duration,
    /// Connections silent for longer than this are dropped
    pub stale_after: Duration,
}

impl Default for RendezvousServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            register_timeout: Duration::from_secs(10),
            peer_list_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(60),
        }
    }
}

impl RendezvousServerConfig {
    /// Check configuration invariants
    ///
    /// # Errors
    ///
    /// Returns `RendezvousError::InvalidConfig` if any interval is zero.
    pub fn validate(&self) -> Result<(), RendezvousError> {
        if self.register_timeout.is_zero() {
            return Err(RendezvousError::InvalidConfig(
                "register_timeout must be non-zero".into(),
            ));
        }
        if self.peer_list_interval.is_zero() {
            return Err(RendezvousError::InvalidConfig(
                "peer_list_interval must be non-zero".into(),
            ));
        }
        if self.stale_after <= self.peer_list_interval {
            return Err(RendezvousError::InvalidConfig(
                "stale_after must exceed peer_list_interval".into(),
            ));
        }
        Ok(())
    }
}

/// A registered connection
struct ConnectedPeer {
    /// Outbound frames, drained by the connection's writer task
    tx: mpsc::UnboundedSender<Message>,
    last_seen: u64,
    region: Option<RegionId>,
}

type Sessions = Arc<DashMap<PeerId, ConnectedPeer>>;

/// Rendezvous server bound to a listening socket
pub struct RendezvousServer {
    config: RendezvousServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RendezvousServer {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the bind fails.
    pub async fn bind(config: RendezvousServerConfig) -> Result<Self, RendezvousError> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Rendezvous server listening on {}", local_addr);

        Ok(Self {
            config,
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections in the background
    #[must_use]
    pub fn spawn(self) -> RendezvousServerHandle {
        let sessions: Sessions = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let maintenance = tokio::spawn(maintenance_loop(
            sessions.clone(),
            self.config.clone(),
            shutdown_rx.clone(),
        ));
        let accept = tokio::spawn(accept_loop(
            self.listener,
            sessions.clone(),
            self.config,
            shutdown_rx,
        ));

        RendezvousServerHandle {
            local_addr: self.local_addr,
            sessions,
            shutdown_tx,
            tasks: vec![accept, maintenance],
        }
    }
}

/// Handle to a running rendezvous server
///
/// Dropping the handle stops the server.
pub struct RendezvousServerHandle {
    local_addr: SocketAddr,
    sessions: Sessions,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RendezvousServerHandle {
    /// Address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Number of registered sessions
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registered sessions, ordered by peer id
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        peer_snapshot(&self.sessions)
    }

    /// Stop accepting, close every session, and wait for the server tasks
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("Rendezvous server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Sessions,
    config: RendezvousServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let sessions = sessions.clone();
                    let config = config.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, sessions, config, shutdown_rx).await {
                            tracing::debug!("Connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Periodic peer-list push and stale-session sweep
async fn maintenance_loop(
    sessions: Sessions,
    config: RendezvousServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = time::interval(config.peer_list_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = now_millis();
                let threshold = config.stale_after.as_millis() as u64;
                let mut evicted = Vec::new();
                sessions.retain(|peer_id, peer| {
                    let stale = now.saturating_sub(peer.last_seen) > threshold;
                    if stale {
                        let _ = peer.tx.send(Message::Close(None));
                        evicted.push(peer_id.clone());
                    }
                    !stale
                });
                for peer_id in &evicted {
                    tracing::info!("Evicted stale peer {}", peer_id.short());
                }
                push_peer_list(&sessions);
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    sessions: Sessions,
    config: RendezvousServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), RendezvousError> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let first = time::timeout(config.register_timeout, next_text(&mut source))
        .await
        .map_err(|_| RendezvousError::Timeout)??;

    let region = match ClientMessage::from_text(&first) {
        Ok(ClientMessage::Register { region }) => region,
        _ => {
            let notice = ServerMessage::Error {
                code: ErrorCode::NotRegistered,
                message: "first message must be register".to_string(),
                to: None,
            };
            sink.send(Message::Text(notice.to_text()?)).await?;
            let _ = sink.close().await;
            return Err(RendezvousError::Registration(
                "first message was not register".to_string(),
            ));
        }
    };

    let peer_id = PeerId::generate();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let registered = ServerMessage::Registered {
        peer_id: peer_id.clone(),
    };
    let _ = tx.send(Message::Text(registered.to_text()?));
    sessions.insert(
        peer_id.clone(),
        ConnectedPeer {
            tx: tx.clone(),
            last_seen: now_millis(),
            region,
        },
    );
    tracing::info!("Peer {} registered (region {:?})", peer_id.short(), region);
    push_peer_list(&sessions);

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(mut peer) = sessions.get_mut(&peer_id) {
                        peer.last_seen = now_millis();
                    }
                    let handled = ClientMessage::from_text(&text)
                        .and_then(|msg| handle_client_message(&sessions, &peer_id, msg));
                    if let Err(e) = handled {
                        tracing::warn!("Dropping frame from {}: {}", peer_id.short(), e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Read error from {}: {}", peer_id.short(), e);
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
        }
    }

    if sessions.remove(&peer_id).is_some() {
        tracing::info!("Peer {} disconnected", peer_id.short());
        push_peer_list(&sessions);
    }
    drop(tx);
    let _ = writer.await;
    Ok(())
}

fn handle_client_message(
    sessions: &Sessions,
    from: &PeerId,
    msg: ClientMessage,
) -> Result<(), RendezvousError> {
    match msg {
        ClientMessage::Register { .. } => {
            tracing::debug!("Ignoring repeated register from {}", from.short());
        }
        ClientMessage::Heartbeat => {
            tracing::trace!("Heartbeat from {}", from.short());
        }
        ClientMessage::Directed { to, kind, data } => {
            let recipient = sessions.get(&to).map(|peer| peer.tx.clone());
            let frame = ServerMessage::Directed {
                from: from.clone(),
                kind,
                data,
            }
            .to_text()?;

            let delivered = recipient.is_some_and(|tx| tx.send(Message::Text(frame)).is_ok());
            if delivered {
                tracing::debug!("Relayed message {} -> {}", from.short(), to.short());
            } else {
                tracing::debug!(
                    "Recipient {} not connected, notifying {}",
                    to.short(),
                    from.short()
                );
                let notice = ServerMessage::Error {
                    code: ErrorCode::PeerNotFound,
                    message: format!("peer {to} is not connected"),
                    to: Some(to),
                };
                send_to(sessions, from, &notice)?;
            }
        }
        ClientMessage::Broadcast { kind, payload } => {
            let frame = ServerMessage::Broadcast {
                from: from.clone(),
                kind,
                payload,
            }
            .to_text()?;
            let recipients: Vec<_> = sessions
                .iter()
                .filter(|entry| entry.key() != from)
                .map(|entry| entry.value().tx.clone())
                .collect();
            tracing::debug!(
                "Broadcast from {} to {} peers",
                from.short(),
                recipients.len()
            );
            for tx in recipients {
                let _ = tx.send(Message::Text(frame.clone()));
            }
        }
    }
    Ok(())
}

fn send_to(sessions: &Sessions, peer_id: &PeerId, msg: &ServerMessage) -> Result<(), RendezvousError> {
    let text = msg.to_text()?;
    if let Some(tx) = sessions.get(peer_id).map(|peer| peer.tx.clone()) {
        let _ = tx.send(Message::Text(text));
    }
    Ok(())
}

fn peer_snapshot(sessions: &Sessions) -> Vec<PeerRecord> {
    let mut peers: Vec<_> = sessions
        .iter()
        .map(|entry| PeerRecord::new(entry.key().clone(), entry.last_seen, entry.region))
        .collect();
    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    peers
}

/// Push the current peer list to every session
fn push_peer_list(sessions: &Sessions) {
    let msg = ServerMessage::Peers {
        peers: peer_snapshot(sessions),
    };
    let text = match msg.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Failed to encode peer list: {}", e);
            return;
        }
    };
    let recipients: Vec<_> = sessions.iter().map(|entry| entry.tx.clone()).collect();
    for tx in recipients {
        let _ = tx.send(Message::Text(text.clone()));
    }
}

/// Next text frame, skipping control frames
async fn next_text(
    source: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> Result<String, RendezvousError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => return Err(RendezvousError::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RendezvousServerConfig {
        RendezvousServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..RendezvousServerConfig::default()
        }
    }

    #[test]
    fn test_config_validate() {
        assert!(RendezvousServerConfig::default().validate().is_ok());

        let config = RendezvousServerConfig {
            peer_list_interval: Duration::ZERO,
            ..RendezvousServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RendezvousError::InvalidConfig(_))
        ));

        let config = RendezvousServerConfig {
            stale_after: Duration::from_secs(1),
            peer_list_interval: Duration::from_secs(5),
            ..RendezvousServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_server_bind_ephemeral() {
        let server = RendezvousServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let handle = server.spawn();
        assert_eq!(handle.url(), format!("ws://{addr}"));
        assert_eq!(handle.peer_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_register_first_frame_rejected() {
        let handle = RendezvousServer::bind(local_config()).await.unwrap().spawn();
        let (mut ws, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();

        ws.send(Message::Text(r#"{"type":"heartbeat"}"#.to_string()))
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        let msg = ServerMessage::from_text(&reply).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: ErrorCode::NotRegistered,
                ..
            }
        ));
        assert_eq!(handle.peer_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_sessions_evicted() {
        let config = RendezvousServerConfig {
            peer_list_interval: Duration::from_millis(50),
            stale_after: Duration::from_millis(150),
            ..local_config()
        };
        let handle = RendezvousServer::bind(config).await.unwrap().spawn();
        let (mut ws, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();
        ws.send(Message::Text(r#"{"type":"register"}"#.to_string()))
            .await
            .unwrap();

        // Drain frames without sending heartbeats until the server closes
        let closed = time::timeout(Duration::from_secs(3), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(handle.peer_count(), 0);
        handle.shutdown().await;
    }
}
